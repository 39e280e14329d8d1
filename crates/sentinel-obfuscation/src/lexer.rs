//! Mode-tracking PowerShell lexer.
//!
//! PowerShell tokenizes differently in command position, argument mode and
//! expression mode: `-Group` is a parameter after a command but an operator
//! in `$a -eq $b`, and `[Math]` is a type literal in an expression but a
//! bare word in `Write-Host [Math]`. The lexer tracks enough of that state
//! to classify the tokens the rewriter cares about (`Type`, `Command`).

use crate::error::ObfuscationError;
use crate::quote::{self, QuoteStyle};
use crate::token::{Token, TokenKind, Tokenizer};

const KEYWORDS: &[&str] = &[
    "begin", "break", "catch", "class", "continue", "data", "do", "dynamicparam", "else",
    "elseif", "end", "enum", "exit", "filter", "finally", "for", "foreach", "function", "if",
    "in", "param", "process", "return", "switch", "throw", "trap", "try", "until", "while",
];

/// Characters that end a bare word in any mode.
fn ends_bareword(c: char) -> bool {
    c.is_whitespace()
        || matches!(c, ';' | '|' | '&' | '(' | ')' | '{' | '}' | ',')
        || QuoteStyle::from_char(c).is_some()
}

fn is_identifier_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn is_keyword(word: &str) -> bool {
    KEYWORDS.iter().any(|k| k.eq_ignore_ascii_case(word))
}

/// Default [`Tokenizer`] for PowerShell script text.
#[derive(Debug, Clone, Copy, Default)]
pub struct PsLexer;

impl Tokenizer for PsLexer {
    fn tokenize(&self, script: &str) -> Result<Vec<Token>, ObfuscationError> {
        Lexer::new(script).run()
    }
}

struct Lexer<'a> {
    src: &'a str,
    pos: usize,
    tokens: Vec<Token>,
    /// Next bare word names a command.
    expect_command: bool,
    /// Inside a command's argument list.
    args_mode: bool,
    /// Next identifier is a member name.
    pending_member: bool,
    /// Next bare word is a function name.
    after_function: bool,
    /// Saved `args_mode` for each open group.
    groups: Vec<bool>,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            pos: 0,
            tokens: Vec::new(),
            expect_command: true,
            args_mode: false,
            pending_member: false,
            after_function: false,
            groups: Vec::new(),
        }
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn peek_second(&self) -> Option<char> {
        self.rest().chars().nth(1)
    }

    fn error(&self, offset: usize, message: &str) -> ObfuscationError {
        ObfuscationError::Tokenize {
            offset,
            message: message.to_string(),
        }
    }

    fn push(&mut self, kind: TokenKind, start: usize, end: usize) {
        self.tokens.push(Token {
            kind,
            content: self.src[start..end].to_string(),
            start,
            length: end - start,
        });
        self.pos = end;
    }

    /// The previous token is a value that ends exactly here.
    fn follows_value(&self) -> bool {
        match self.tokens.last() {
            Some(t) if t.end() == self.pos => match t.kind {
                TokenKind::Variable
                | TokenKind::String
                | TokenKind::Number
                | TokenKind::Type
                | TokenKind::Member
                | TokenKind::GroupEnd => true,
                TokenKind::Operator => t.content == "]",
                _ => false,
            },
            _ => false,
        }
    }

    fn statement_boundary(&mut self) {
        self.expect_command = true;
        self.args_mode = false;
        self.pending_member = false;
    }

    fn value(&mut self) {
        if !self.args_mode {
            self.expect_command = false;
        }
        self.pending_member = false;
    }

    fn run(mut self) -> Result<Vec<Token>, ObfuscationError> {
        while let Some(c) = self.peek() {
            let start = self.pos;
            match c {
                '\r' | '\n' => {
                    let end = if self.rest().starts_with("\r\n") { start + 2 } else { start + 1 };
                    self.push(TokenKind::NewLine, start, end);
                    self.statement_boundary();
                }
                c if c.is_whitespace() => self.pos += c.len_utf8(),
                '`' if matches!(self.peek_second(), Some('\r' | '\n')) => {
                    // Line continuation.
                    self.pos += 1;
                    if self.rest().starts_with("\r\n") {
                        self.pos += 2;
                    } else {
                        self.pos += 1;
                    }
                }
                '#' => self.line_comment(start),
                '<' if self.rest().starts_with("<#") => self.block_comment(start)?,
                ';' => {
                    self.push(TokenKind::StatementSeparator, start, start + 1);
                    self.statement_boundary();
                }
                '|' | '&' if self.peek_second() == Some(c) => {
                    self.push(TokenKind::Operator, start, start + 2);
                    self.statement_boundary();
                }
                '|' => {
                    self.push(TokenKind::Operator, start, start + 1);
                    self.statement_boundary();
                }
                '&' => {
                    self.push(TokenKind::Operator, start, start + 1);
                    self.statement_boundary();
                }
                '(' | '{' => self.open_group(start, 1),
                '@' | '$' if matches!(self.peek_second(), Some('(')) => self.open_group(start, 2),
                '@' if matches!(self.peek_second(), Some('{')) => self.open_group(start, 2),
                '@' if self.peek_second().and_then(QuoteStyle::from_char).is_some() => {
                    self.here_string(start)?
                }
                '@' if self.peek_second().is_some_and(is_identifier_char) => self.variable(start),
                '$' => self.variable(start),
                ')' | '}' => {
                    self.push(TokenKind::GroupEnd, start, start + 1);
                    self.args_mode = self.groups.pop().unwrap_or(false);
                    self.expect_command = false;
                    self.pending_member = false;
                }
                '[' => self.open_bracket(start),
                ']' => {
                    self.push(TokenKind::Operator, start, start + 1);
                    self.value();
                }
                c if QuoteStyle::from_char(c).is_some() => {
                    let end = quote::skip_string(self.src, start)
                        .ok_or_else(|| self.error(start, "unterminated string"))?;
                    self.push(TokenKind::String, start, end);
                    self.value();
                }
                ',' => self.push(TokenKind::Operator, start, start + 1),
                '=' => {
                    let end = if self.peek_second() == Some('=') { start + 2 } else { start + 1 };
                    self.push(TokenKind::Operator, start, end);
                    self.statement_boundary();
                }
                ':' if self.peek_second() == Some(':') => {
                    self.push(TokenKind::Operator, start, start + 2);
                    self.pending_member = true;
                }
                '.' => self.dot(start),
                '-' => self.dash(start),
                c if c.is_ascii_digit() && !self.args_mode => self.number(start),
                '+' | '*' | '/' | '%' | '!' | '<' | '>' if !self.args_mode || c == '<' || c == '>' => {
                    let end = if self.peek_second() == Some('=') { start + 2 } else { start + 1 };
                    self.push(TokenKind::Operator, start, end);
                    if end == start + 2 {
                        // Compound assignment.
                        self.statement_boundary();
                    }
                }
                _ => self.bareword(start),
            }
        }
        Ok(self.tokens)
    }

    fn line_comment(&mut self, start: usize) {
        let len = self.rest().find(['\r', '\n']).unwrap_or(self.rest().len());
        self.push(TokenKind::Comment, start, start + len);
    }

    fn block_comment(&mut self, start: usize) -> Result<(), ObfuscationError> {
        let close = self.rest()[2..]
            .find("#>")
            .ok_or_else(|| self.error(start, "unterminated block comment"))?;
        self.push(TokenKind::Comment, start, start + 2 + close + 2);
        Ok(())
    }

    fn here_string(&mut self, start: usize) -> Result<(), ObfuscationError> {
        let quote = self.peek_second().unwrap_or('"');
        let body = start + 1 + quote.len_utf8();
        let closing = format!("\n{quote}@");
        let close = self.src[body..]
            .find(&closing)
            .ok_or_else(|| self.error(start, "unterminated here-string"))?;
        self.push(TokenKind::String, start, body + close + closing.len());
        self.value();
        Ok(())
    }

    fn open_group(&mut self, start: usize, len: usize) {
        self.push(TokenKind::GroupStart, start, start + len);
        self.groups.push(self.args_mode);
        self.statement_boundary();
    }

    fn variable(&mut self, start: usize) {
        let rest = &self.src[start + 1..];
        let len = if let Some(braced) = rest.strip_prefix('{') {
            braced.find('}').map_or(rest.len(), |i| i + 2)
        } else {
            let word: usize = rest
                .chars()
                .take_while(|&c| is_identifier_char(c) || c == ':')
                .map(char::len_utf8)
                .sum();
            match (word, rest.chars().next()) {
                (0, Some(c @ ('$' | '?' | '^'))) => c.len_utf8(),
                _ => word,
            }
        };
        self.push(TokenKind::Variable, start, start + 1 + len);
        self.value();
    }

    fn open_bracket(&mut self, start: usize) {
        let after_type = matches!(self.tokens.last(), Some(t) if t.kind == TokenKind::Type && t.end() == start);
        if self.follows_value() && !after_type {
            self.push(TokenKind::Operator, start, start + 1);
            self.expect_command = false;
            return;
        }
        if self.args_mode {
            self.bareword(start);
            return;
        }
        match self.type_literal_end(start) {
            Some(end) => {
                self.push(TokenKind::Type, start, end);
                self.value();
            }
            None => {
                self.push(TokenKind::Operator, start, start + 1);
                self.expect_command = false;
            }
        }
    }

    /// End of a balanced `[TypeName]` starting at `start`, if the brackets
    /// hold a type name rather than an attribute or index expression.
    fn type_literal_end(&self, start: usize) -> Option<usize> {
        let mut depth = 0usize;
        for (i, c) in self.src[start..].char_indices() {
            match c {
                '[' => depth += 1,
                ']' => {
                    depth -= 1;
                    if depth == 0 {
                        let inner = &self.src[start + 1..start + i];
                        let first = inner.trim_start().chars().next()?;
                        let valid = (first.is_alphabetic() || first == '_')
                            && inner.chars().all(|c| {
                                is_identifier_char(c)
                                    || matches!(c, '.' | '`' | '+' | ',' | '[' | ']' | ' ')
                            });
                        return valid.then_some(start + i + 1);
                    }
                }
                '\r' | '\n' => return None,
                _ => {}
            }
        }
        None
    }

    fn dot(&mut self, start: usize) {
        let next = self.peek_second();
        if self.follows_value() {
            self.push(TokenKind::Operator, start, start + 1);
            self.pending_member = true;
        } else if next == Some('.') {
            self.push(TokenKind::Operator, start, start + 2);
        } else if self.expect_command
            && next.map_or(true, |n| {
                n.is_whitespace() || matches!(n, '(' | '{' | '$') || QuoteStyle::from_char(n).is_some()
            })
        {
            // Dot-source invocation; the command follows.
            self.push(TokenKind::Operator, start, start + 1);
        } else if next.is_some_and(|n| n.is_ascii_digit()) && !self.args_mode {
            self.number(start);
        } else {
            self.bareword(start);
        }
    }

    fn dash(&mut self, start: usize) {
        let next = self.peek_second();
        match next {
            Some('-') => self.push(TokenKind::Operator, start, start + 2),
            Some(n) if n.is_alphabetic() => {
                let word: usize = self.src[start + 1..]
                    .chars()
                    .take_while(|&c| is_identifier_char(c) || c == '-')
                    .map(char::len_utf8)
                    .sum();
                if self.args_mode {
                    let mut end = start + 1 + word;
                    if self.src[end..].starts_with(':') {
                        end += 1;
                    }
                    self.push(TokenKind::CommandParameter, start, end);
                } else {
                    let word: usize = self.src[start + 1..]
                        .chars()
                        .take_while(|c| c.is_alphabetic())
                        .map(char::len_utf8)
                        .sum();
                    self.push(TokenKind::Operator, start, start + 1 + word);
                    self.expect_command = false;
                }
            }
            _ if self.args_mode => self.bareword(start),
            _ => {
                let end = if next == Some('=') { start + 2 } else { start + 1 };
                self.push(TokenKind::Operator, start, end);
                self.expect_command = false;
            }
        }
    }

    fn number(&mut self, start: usize) {
        let len: usize = self.src[start..]
            .char_indices()
            .take_while(|&(i, c)| {
                c.is_ascii_alphanumeric()
                    || (c == '.' && !self.src[start + i + 1..].starts_with('.'))
            })
            .map(|(_, c)| c.len_utf8())
            .sum();
        self.push(TokenKind::Number, start, start + len.max(1));
        self.value();
    }

    fn bareword(&mut self, start: usize) {
        if self.pending_member {
            let len: usize = self.rest().chars().take_while(|&c| is_identifier_char(c)).map(char::len_utf8).sum();
            if len > 0 {
                self.push(TokenKind::Member, start, start + len);
                self.pending_member = false;
                return;
            }
            self.pending_member = false;
        }

        let mut end = start;
        let mut chars = self.rest().chars().peekable();
        while let Some(c) = chars.next() {
            if c == '`' {
                end += c.len_utf8();
                if let Some(escaped) = chars.next() {
                    end += escaped.len_utf8();
                }
                continue;
            }
            if end > start && ends_bareword(c) || (end == start && c.is_whitespace()) {
                break;
            }
            if !self.args_mode && end > start && matches!(c, '=' | '[' | ']') {
                break;
            }
            end += c.len_utf8();
        }
        let end = end.max(start + self.peek().map_or(0, char::len_utf8));
        let word = &self.src[start..end];

        if self.after_function {
            self.after_function = false;
            self.push(TokenKind::CommandArgument, start, end);
        } else if self.expect_command {
            if is_keyword(word) {
                self.push(TokenKind::Keyword, start, end);
                self.after_function = word.eq_ignore_ascii_case("function")
                    || word.eq_ignore_ascii_case("filter");
            } else {
                self.push(TokenKind::Command, start, end);
                self.expect_command = false;
                self.args_mode = true;
            }
        } else if self.args_mode {
            self.push(TokenKind::CommandArgument, start, end);
        } else if is_keyword(word) {
            self.push(TokenKind::Keyword, start, end);
            self.expect_command = true;
        } else {
            self.push(TokenKind::CommandArgument, start, end);
        }
    }
}

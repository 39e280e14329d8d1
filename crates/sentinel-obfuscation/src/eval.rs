//! Evaluator for the expression subset the encoder emits.
//!
//! Supported: single/double-quoted literals, integer literals, parentheses,
//! `[String]`/`[Char]` casts, `+`, `.Replace(a, b)`, `-f` composite
//! formatting and `-replace`/`-ireplace`/`-creplace`. Precedence follows
//! PowerShell: postfix > cast > `-f` > `+` > `-replace`. Anything outside
//! the subset is an error, never a guess.

use crate::error::EvalError;
use crate::quote::{self, QuoteStyle};
use regex::{Captures, RegexBuilder};

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Str(String),
    Int(i64),
}

impl Value {
    fn into_string(self) -> String {
        match self {
            Self::Str(s) => s,
            Self::Int(n) => n.to_string(),
        }
    }
}

/// Evaluate `expr` to the string it produces.
pub fn evaluate(expr: &str) -> Result<String, EvalError> {
    let mut parser = Parser { src: expr, pos: 0 };
    let value = parser.replace_expr()?;
    parser.skip_ws();
    if parser.pos != expr.len() {
        return Err(EvalError::Unexpected(parser.pos));
    }
    Ok(value.into_string())
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn skip_ws(&mut self) {
        let trimmed = self.rest().trim_start();
        self.pos = self.src.len() - trimmed.len();
    }

    fn eat(&mut self, c: char) -> bool {
        self.skip_ws();
        if self.peek() == Some(c) {
            self.pos += c.len_utf8();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, c: char) -> Result<(), EvalError> {
        if self.eat(c) {
            Ok(())
        } else if self.pos >= self.src.len() {
            Err(EvalError::UnexpectedEnd)
        } else {
            Err(EvalError::Unexpected(self.pos))
        }
    }

    /// Consume `-name` if the next operator is one of `names` (case-insensitive).
    fn eat_operator(&mut self, names: &[&str]) -> Option<String> {
        self.skip_ws();
        let rest = self.rest();
        let body = rest.strip_prefix('-')?;
        let len = body
            .find(|c: char| !c.is_ascii_alphabetic())
            .unwrap_or(body.len());
        let word = body[..len].to_ascii_lowercase();
        if names.contains(&word.as_str()) {
            self.pos += 1 + len;
            Some(word)
        } else {
            None
        }
    }

    fn replace_expr(&mut self) -> Result<Value, EvalError> {
        let mut value = self.add_expr()?;
        while let Some(op) = self.eat_operator(&["replace", "ireplace", "creplace"]) {
            let pattern = self.format_expr()?.into_string();
            self.expect(',')?;
            let replacement = self.format_expr()?.into_string();
            let input = value.into_string();
            value = Value::Str(regex_replace(&input, &pattern, &replacement, op != "creplace")?);
        }
        Ok(value)
    }

    fn add_expr(&mut self) -> Result<Value, EvalError> {
        let mut value = self.format_expr()?;
        while self.eat('+') {
            let rhs = self.format_expr()?;
            value = match (value, rhs) {
                (Value::Int(a), Value::Int(b)) => Value::Int(a + b),
                (lhs, rhs) => Value::Str(lhs.into_string() + &rhs.into_string()),
            };
        }
        Ok(value)
    }

    fn format_expr(&mut self) -> Result<Value, EvalError> {
        let value = self.unary()?;
        if self.eat_operator(&["f"]).is_none() {
            return Ok(value);
        }
        let mut args = vec![self.unary()?.into_string()];
        while self.eat(',') {
            args.push(self.unary()?.into_string());
        }
        Ok(Value::Str(format_composite(&value.into_string(), &args)?))
    }

    fn unary(&mut self) -> Result<Value, EvalError> {
        self.skip_ws();
        if let Some(cast) = self.cast_name() {
            let inner = self.unary()?;
            return apply_cast(&cast, inner);
        }
        self.postfix()
    }

    /// Consume `[String]` or `[Char]`; anything else in brackets is left alone.
    fn cast_name(&mut self) -> Option<String> {
        let rest = self.rest().strip_prefix('[')?;
        let close = rest.find(']')?;
        let name = rest[..close].trim().to_ascii_lowercase();
        let name = name.strip_prefix("system.").unwrap_or(&name).to_string();
        if name == "string" || name == "char" {
            self.pos += close + 2;
            Some(name)
        } else {
            None
        }
    }

    fn postfix(&mut self) -> Result<Value, EvalError> {
        let mut value = self.primary()?;
        loop {
            let rest = self.rest();
            let Some(after_dot) = rest.strip_prefix('.') else {
                break;
            };
            if !after_dot.to_ascii_lowercase().starts_with("replace") {
                return Err(EvalError::Unexpected(self.pos));
            }
            self.pos += 1 + "replace".len();
            self.expect('(')?;
            let old = self.replace_expr()?.into_string();
            self.expect(',')?;
            let new = self.replace_expr()?.into_string();
            self.expect(')')?;
            if old.is_empty() {
                return Err(EvalError::Unexpected(self.pos));
            }
            value = Value::Str(value.into_string().replace(&old, &new));
        }
        Ok(value)
    }

    fn primary(&mut self) -> Result<Value, EvalError> {
        self.skip_ws();
        let start = self.pos;
        match self.peek() {
            None => Err(EvalError::UnexpectedEnd),
            Some('(') => {
                self.pos += 1;
                let value = self.replace_expr()?;
                self.expect(')')?;
                Ok(value)
            }
            Some(c) if c.is_ascii_digit() => {
                let len = self
                    .rest()
                    .find(|c: char| !c.is_ascii_digit())
                    .unwrap_or(self.rest().len());
                let digits = &self.rest()[..len];
                self.pos += len;
                digits
                    .parse()
                    .map(Value::Int)
                    .map_err(|_| EvalError::Unexpected(start))
            }
            Some(c) => match QuoteStyle::from_char(c) {
                Some(style) => {
                    let end = quote::skip_string(self.src, start)
                        .ok_or(EvalError::UnterminatedString(start))?;
                    self.pos = end;
                    let open = c.len_utf8();
                    let body = &self.src[start + open..end - last_char_len(&self.src[..end])];
                    decode_literal(body, style, start).map(Value::Str)
                }
                None => Err(EvalError::Unexpected(start)),
            },
        }
    }
}

fn last_char_len(s: &str) -> usize {
    s.chars().next_back().map(char::len_utf8).unwrap_or(0)
}

fn apply_cast(cast: &str, value: Value) -> Result<Value, EvalError> {
    match (cast, value) {
        ("char", Value::Int(n)) => {
            let code = u32::try_from(n).map_err(|_| EvalError::CharCode(u32::MAX))?;
            char::from_u32(code)
                .map(|c| Value::Str(c.to_string()))
                .ok_or(EvalError::CharCode(code))
        }
        ("char", Value::Str(s)) => {
            let mut chars = s.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Ok(Value::Str(c.to_string())),
                _ => Err(EvalError::CharCode(0)),
            }
        }
        (_, value) => Ok(Value::Str(value.into_string())),
    }
}

/// Decode the inside of a literal (quotes already removed).
fn decode_literal(body: &str, style: QuoteStyle, offset: usize) -> Result<String, EvalError> {
    let mut out = String::with_capacity(body.len());
    let mut chars = body.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        match style {
            QuoteStyle::Single => {
                out.push(c);
                if quote::is_single_quote(c) {
                    chars.next();
                }
            }
            QuoteStyle::Double => match c {
                '`' => {
                    let Some((_, e)) = chars.next() else {
                        return Err(EvalError::UnterminatedString(offset));
                    };
                    out.push(match e {
                        '0' => '\0',
                        'a' => '\u{7}',
                        'b' => '\u{8}',
                        'e' => '\u{1b}',
                        'f' => '\u{c}',
                        'n' => '\n',
                        'r' => '\r',
                        't' => '\t',
                        'v' => '\u{b}',
                        other => other,
                    });
                }
                '$' => {
                    let expands = matches!(
                        chars.peek(),
                        Some(&(_, n)) if n.is_alphanumeric() || matches!(n, '_' | '{' | '(' | ':' | '?' | '$' | '^')
                    );
                    if expands {
                        return Err(EvalError::Expansion(offset + 1 + i));
                    }
                    out.push('$');
                }
                c if quote::is_double_quote(c) => {
                    out.push(c);
                    chars.next();
                }
                c => out.push(c),
            },
        }
    }
    Ok(out)
}

/// .NET composite formatting restricted to `{N}`, `{{` and `}}`.
pub fn format_composite(template: &str, args: &[String]) -> Result<String, EvalError> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut digits = String::new();
                loop {
                    match chars.next() {
                        Some(d) if d.is_ascii_digit() => digits.push(d),
                        Some('}') if !digits.is_empty() => break,
                        _ => return Err(EvalError::FormatString(template.to_string())),
                    }
                }
                let index: usize = digits
                    .parse()
                    .map_err(|_| EvalError::FormatString(template.to_string()))?;
                let arg = args.get(index).ok_or(EvalError::FormatIndex {
                    index,
                    available: args.len(),
                })?;
                out.push_str(arg);
            }
            '}' => return Err(EvalError::FormatString(template.to_string())),
            c => out.push(c),
        }
    }
    Ok(out)
}

/// `-replace` with .NET substitution syntax (`$$`, `$&`, `$N`).
fn regex_replace(
    input: &str,
    pattern: &str,
    replacement: &str,
    case_insensitive: bool,
) -> Result<String, EvalError> {
    let re = RegexBuilder::new(pattern)
        .case_insensitive(case_insensitive)
        .build()
        .map_err(|e| EvalError::Pattern(e.to_string()))?;
    Ok(re
        .replace_all(input, |caps: &Captures| expand_substitution(replacement, caps))
        .into_owned())
}

fn expand_substitution(template: &str, caps: &Captures) -> String {
    let mut out = String::new();
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek().copied() {
            Some('$') => {
                chars.next();
                out.push('$');
            }
            Some('&') => {
                chars.next();
                out.push_str(&caps[0]);
            }
            Some(d) if d.is_ascii_digit() => {
                let group = d.to_digit(10).unwrap_or(0) as usize;
                match caps.get(group) {
                    Some(m) => {
                        chars.next();
                        out.push_str(m.as_str());
                    }
                    None => out.push('$'),
                }
            }
            _ => out.push('$'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_literal() {
        assert_eq!(evaluate("'it''s'").unwrap(), "it's");
    }

    #[test]
    fn double_literal_escapes() {
        assert_eq!(evaluate(r#""a`$b`"c""#).unwrap(), "a$b\"c");
    }

    #[test]
    fn double_literal_rejects_expansion() {
        assert!(matches!(evaluate(r#""$env:x""#), Err(EvalError::Expansion(_))));
    }

    #[test]
    fn concatenation_with_parens() {
        assert_eq!(evaluate("(('Get-'+'Pro')+\"cess\")").unwrap(), "Get-Process");
    }

    #[test]
    fn format_binds_tighter_than_plus() {
        assert_eq!(evaluate("'a'+'{0}' -f 'b'").unwrap(), "ab");
    }

    #[test]
    fn format_reorders() {
        assert_eq!(evaluate("('{1}{0}{2}' -F 'b','a','c')").unwrap(), "abc");
    }

    #[test]
    fn format_escaped_braces() {
        assert_eq!(evaluate("('{{{0}}}' -f 'x')").unwrap(), "{x}");
    }

    #[test]
    fn format_index_out_of_range() {
        assert_eq!(
            evaluate("('{3}' -f 'x')"),
            Err(EvalError::FormatIndex { index: 3, available: 1 })
        );
    }

    #[test]
    fn method_replace_is_case_sensitive() {
        assert_eq!(evaluate("('aXbx').rEpLaCe('x','$')").unwrap(), "aXb$");
    }

    #[test]
    fn operator_replace_case_modes() {
        assert_eq!(evaluate("('aXbx' -replace 'x','-')").unwrap(), "a-b-");
        assert_eq!(evaluate("('aXbx' -CReplace 'x','-')").unwrap(), "aXb-");
    }

    #[test]
    fn operator_replace_dollar_substitution() {
        assert_eq!(evaluate("('ab' -replace 'b','$$')").unwrap(), "a$");
    }

    #[test]
    fn char_casts() {
        assert_eq!(evaluate("[String][Char]39").unwrap(), "'");
        assert_eq!(evaluate("('a'+[char]36)").unwrap(), "a$");
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        assert!(evaluate("'a' b").is_err());
    }

    #[test]
    fn unsupported_method_is_rejected() {
        assert!(evaluate("('a').ToUpper()").is_err());
    }
}

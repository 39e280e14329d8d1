//! Quote handling for PowerShell string literals.
//!
//! PowerShell treats the typographic quotes as quote characters too, so
//! escaping and scanning use the full quote classes rather than ASCII only.

use serde::{Deserialize, Serialize};

/// Which literal form a string is emitted in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QuoteStyle {
    /// `'...'`: verbatim, the quote itself is escaped by doubling.
    Single,
    /// `"..."`: expandable; `$`, backtick and the quote need a backtick escape.
    Double,
}

impl QuoteStyle {
    pub fn as_char(self) -> char {
        match self {
            Self::Single => '\'',
            Self::Double => '"',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        if is_single_quote(c) {
            Some(Self::Single)
        } else if is_double_quote(c) {
            Some(Self::Double)
        } else {
            None
        }
    }
}

pub fn is_single_quote(c: char) -> bool {
    matches!(c, '\'' | '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{201B}')
}

pub fn is_double_quote(c: char) -> bool {
    matches!(c, '"' | '\u{201C}' | '\u{201D}' | '\u{201E}')
}

/// Escape `text` for the inside of a literal of the given style.
pub fn escape(text: &str, style: QuoteStyle) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    for c in text.chars() {
        match style {
            QuoteStyle::Single if is_single_quote(c) => {
                out.push(c);
                out.push(c);
            }
            QuoteStyle::Double if is_double_quote(c) || c == '`' || c == '$' => {
                out.push('`');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}

/// Escape and wrap `text` in quotes.
pub fn quote(text: &str, style: QuoteStyle) -> String {
    let q = style.as_char();
    format!("{q}{}{q}", escape(text, style))
}

/// Given `s[start]` is an opening quote, return the byte index just past the
/// closing quote, or `None` if the literal is unterminated.
pub fn skip_string(s: &str, start: usize) -> Option<usize> {
    let mut chars = s[start..].char_indices();
    let (_, open) = chars.next()?;
    let style = QuoteStyle::from_char(open)?;
    let mut chars = chars.peekable();
    while let Some((i, c)) = chars.next() {
        match style {
            QuoteStyle::Single if is_single_quote(c) => {
                // Doubled quote is an escaped quote.
                if matches!(chars.peek(), Some(&(_, n)) if is_single_quote(n)) {
                    chars.next();
                    continue;
                }
                return Some(start + i + c.len_utf8());
            }
            QuoteStyle::Double if c == '`' => {
                chars.next();
            }
            QuoteStyle::Double if is_double_quote(c) => {
                if matches!(chars.peek(), Some(&(_, n)) if is_double_quote(n)) {
                    chars.next();
                    continue;
                }
                return Some(start + i + c.len_utf8());
            }
            _ => {}
        }
    }
    None
}

/// Byte index of the `)` matching the `(` at `open`, skipping string literals.
pub fn matching_paren(s: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut i = open;
    while i < s.len() {
        let c = s[i..].chars().next()?;
        if QuoteStyle::from_char(c).is_some() {
            i = skip_string(s, i)?;
            continue;
        }
        match c {
            '(' => depth += 1,
            ')' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
        i += c.len_utf8();
    }
    None
}

/// Strip every pair of parentheses that encloses the whole expression.
pub fn strip_enclosing_parens(mut expr: &str) -> &str {
    loop {
        let trimmed = expr.trim();
        if trimmed.starts_with('(') && matching_paren(trimmed, 0) == Some(trimmed.len() - 1) {
            expr = &trimmed[1..trimmed.len() - 1];
        } else {
            return trimmed;
        }
    }
}

/// Ensure exactly one pair of parentheses encloses the expression.
pub fn parenthesize(expr: &str) -> String {
    format!("({})", strip_enclosing_parens(expr))
}

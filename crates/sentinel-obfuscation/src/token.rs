//! Token model and the tokenizer seam.

use crate::error::ObfuscationError;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Classification of a script token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenKind {
    /// Bracketed type literal such as `[System.Text.Encoding]`.
    Type,
    /// Name in command position, e.g. `Get-Process`.
    Command,
    CommandParameter,
    CommandArgument,
    String,
    Variable,
    /// Property or method name after `.` or `::`.
    Member,
    Number,
    Keyword,
    Operator,
    GroupStart,
    GroupEnd,
    StatementSeparator,
    NewLine,
    Comment,
}

/// One token. `content` is always the exact source slice
/// `script[start..start + length]` (byte offsets).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub kind: TokenKind,
    pub content: String,
    pub start: usize,
    pub length: usize,
}

impl Token {
    pub fn end(&self) -> usize {
        self.start + self.length
    }

    pub fn span(&self) -> Range<usize> {
        self.start..self.end()
    }
}

/// Splits script text into classified tokens in ascending offset order.
pub trait Tokenizer {
    fn tokenize(&self, script: &str) -> Result<Vec<Token>, ObfuscationError>;
}

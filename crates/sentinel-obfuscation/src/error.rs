//! Error types for the obfuscation core.

use thiserror::Error;

/// Errors raised by a single obfuscation invocation.
#[derive(Debug, Error)]
pub enum ObfuscationError {
    /// No non-colliding delimiter or identifier was found within the retry bound.
    #[error("could not generate a non-colliding {what} after {attempts} attempts")]
    CollisionExhaustion { what: &'static str, attempts: usize },

    /// The emitted expression did not evaluate back to the input.
    #[error("reconstruction could not be verified after {attempts} attempts: {detail}")]
    Unverifiable { attempts: usize, detail: String },

    /// The tokenizer rejected the script.
    #[error("tokenize failed at byte {offset}: {message}")]
    Tokenize { offset: usize, message: String },
}

/// Errors raised while evaluating an encoder expression.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvalError {
    #[error("unexpected end of expression")]
    UnexpectedEnd,

    #[error("unexpected input at byte {0}")]
    Unexpected(usize),

    #[error("unterminated string literal starting at byte {0}")]
    UnterminatedString(usize),

    #[error("variable expansion inside double-quoted string at byte {0}")]
    Expansion(usize),

    #[error("format index {index} out of range ({available} arguments)")]
    FormatIndex { index: usize, available: usize },

    #[error("malformed format string: {0}")]
    FormatString(String),

    #[error("invalid char code {0}")]
    CharCode(u32),

    #[error("invalid regex pattern: {0}")]
    Pattern(String),
}

/// Recipe shape violations, detected before any technique runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecipeError {
    /// A finisher appears somewhere other than the final position.
    #[error("finisher {layer} at position {index} must be the last layer")]
    FinisherNotLast { index: usize, layer: String },

    #[error("unknown technique {0:?}")]
    UnknownTechnique(String),

    #[error("invalid obfuscation level {level} for {technique} (expected 1 or 2)")]
    InvalidLevel { technique: String, level: String },
}

impl RecipeError {
    /// Index of the offending layer, when the error refers to one.
    pub fn layer_index(&self) -> Option<usize> {
        match self {
            Self::FinisherNotLast { index, .. } => Some(*index),
            _ => None,
        }
    }
}

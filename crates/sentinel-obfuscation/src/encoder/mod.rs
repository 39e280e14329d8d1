//! String encoders: stateless text mutations that stay re-evaluable.
//!
//! Every public encoder returns a PowerShell expression that evaluates back
//! to its input. Expressions are checked with [`crate::eval::evaluate`]
//! before they are returned; an expression that cannot be verified is an
//! error, never output.

mod delimiter;

pub use delimiter::{
    delimited_reversible, delimited_reversible_mapped, reorder_format, DelimiterMapping,
    SIGNIFICANT_CHARS,
};

use crate::error::ObfuscationError;
use crate::eval;
use crate::quote::{self, QuoteStyle};
use crate::random::Decisions;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Texts at or below this many characters are quoted without splitting.
const MIN_SPLIT_LEN: usize = 2;
/// Above this length the split density drops to 5–10 %.
const VERY_LONG_LEN: usize = 25_000;
/// Above this length a fixed 2–4 split points are used.
const LONG_LEN: usize = 1_000;
/// Longest piece allowed in the short tier.
const MAX_SHORT_PIECE: usize = 10;

/// Which string encoder a technique uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ObfuscationLevel {
    /// Level 1: split-concatenation.
    #[default]
    Concatenate,
    /// Level 2: delimiter substitution plus reordered format operands.
    Reorder,
}

impl ObfuscationLevel {
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Concatenate => 1,
            Self::Reorder => 2,
        }
    }
}

impl TryFrom<u8> for ObfuscationLevel {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Concatenate),
            2 => Ok(Self::Reorder),
            other => Err(format!("invalid obfuscation level {other}")),
        }
    }
}

impl From<ObfuscationLevel> for u8 {
    fn from(level: ObfuscationLevel) -> Self {
        level.as_u8()
    }
}

impl fmt::Display for ObfuscationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

/// Encode `text` with the encoder selected by `level`.
pub fn encode(
    text: &str,
    level: ObfuscationLevel,
    rng: &mut Decisions,
) -> Result<String, ObfuscationError> {
    match level {
        ObfuscationLevel::Concatenate => {
            let style = *rng.pick(&[QuoteStyle::Single, QuoteStyle::Double]);
            split_concatenate(text, style, rng)
        }
        ObfuscationLevel::Reorder => reorder_format(text, rng),
    }
}

/// Re-case every ASCII letter independently. Length and structure are unchanged.
pub fn randomize_case(text: &str, rng: &mut Decisions) -> String {
    text.chars()
        .map(|c| {
            if !c.is_ascii_alphabetic() {
                c
            } else if rng.coin() {
                c.to_ascii_uppercase()
            } else {
                c.to_ascii_lowercase()
            }
        })
        .collect()
}

/// Quoted, `+`-joined expression that evaluates to `text`.
///
/// Texts of two characters or fewer come back as a single literal.
pub fn split_concatenate(
    text: &str,
    style: QuoteStyle,
    rng: &mut Decisions,
) -> Result<String, ObfuscationError> {
    let expr = render_concat(&split_pieces(text, rng), style);
    verify(&expr, text, 1)?;
    Ok(expr)
}

/// Cut `text` into pieces at random character boundaries.
///
/// Split density is tiered by length; at least one cut is made whenever the
/// text is longer than two characters.
pub(crate) fn split_pieces(text: &str, rng: &mut Decisions) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let n = chars.len();
    if n <= MIN_SPLIT_LEN {
        return vec![text.to_string()];
    }

    let count = if n > VERY_LONG_LEN {
        n * rng.range(5..=10) / 100
    } else if n > LONG_LEN {
        rng.range(2..=4)
    } else {
        n * rng.range(15..=30) / 100
    }
    .clamp(1, n - 1);

    let mut cuts: Vec<usize> = rng
        .sample_indices(n - 1, count)
        .into_iter()
        .map(|i| i + 1)
        .collect();
    cuts.sort_unstable();

    if n <= LONG_LEN {
        cuts = cap_piece_length(&cuts, n, rng);
    }

    let mut pieces = Vec::with_capacity(cuts.len() + 1);
    let mut prev = 0;
    for cut in cuts.into_iter().chain(std::iter::once(n)) {
        let piece: String = chars[prev..cut].iter().collect();
        // Edge cuts would leave '' artifacts at either end.
        if !piece.is_empty() {
            pieces.push(piece);
        }
        prev = cut;
    }
    pieces
}

/// Insert extra cuts so no piece exceeds [`MAX_SHORT_PIECE`] characters.
fn cap_piece_length(cuts: &[usize], n: usize, rng: &mut Decisions) -> Vec<usize> {
    let mut out = Vec::with_capacity(cuts.len());
    let mut prev = 0;
    for &boundary in cuts.iter().chain(std::iter::once(&n)) {
        while boundary - prev > MAX_SHORT_PIECE {
            prev += rng.range(3..=MAX_SHORT_PIECE);
            out.push(prev);
        }
        if boundary < n {
            out.push(boundary);
        }
        prev = boundary;
    }
    out
}

/// Render pieces as a literal or a parenthesized concatenation.
pub(crate) fn render_concat(pieces: &[String], style: QuoteStyle) -> String {
    match pieces {
        [single] => quote::quote(single, style),
        _ => {
            let joined: Vec<String> = pieces.iter().map(|p| quote::quote(p, style)).collect();
            format!("({})", joined.join("+"))
        }
    }
}

/// Check that `expr` evaluates to `expected`.
pub(crate) fn verify(expr: &str, expected: &str, attempts: usize) -> Result<(), ObfuscationError> {
    match eval::evaluate(expr) {
        Ok(value) if value == expected => Ok(()),
        Ok(value) => Err(ObfuscationError::Unverifiable {
            attempts,
            detail: format!("evaluated to {value:?}"),
        }),
        Err(e) => Err(ObfuscationError::Unverifiable {
            attempts,
            detail: e.to_string(),
        }),
    }
}

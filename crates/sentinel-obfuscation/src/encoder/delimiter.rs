//! Delimiter substitution with reversible reconstruction.
//!
//! The six characters that carry meaning inside a command string
//! (`$ | ` \ " '`) are swapped for random alphanumeric delimiters, and the
//! emitted expression carries the instructions to put them back. Three
//! interchangeable reconstruction strategies exist:
//!
//! | Strategy | Shape |
//! |----------|-------|
//! | Chained replace | `(payload).Replace('d1','$').Replace('d0',"'")` |
//! | Pattern replace | `((payload) -creplace 'd1','$$' -replace 'd0',"'")` |
//! | Positional format | `((payload) -f '$',"'")` with `{N}` placeholders |

use super::{randomize_case, render_concat, split_pieces, verify};
use crate::error::ObfuscationError;
use crate::quote::{self, QuoteStyle};
use crate::random::Decisions;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Characters that are substituted before encoding.
pub const SIGNIFICANT_CHARS: [char; 6] = ['$', '|', '`', '\\', '"', '\''];

/// Candidates tried per delimiter before giving up.
const MAX_DELIMITER_ATTEMPTS: usize = 32;
/// Candidates tried at each length before the delimiter grows by one.
const ATTEMPTS_PER_LENGTH: usize = 4;
const MIN_DELIMITER_LEN: usize = 2;
/// Whole-expression rebuilds before the encoder reports failure.
const MAX_VERIFY_ATTEMPTS: usize = 8;

/// One substituted character and how it is restored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelimiterMapping {
    /// Text standing in for `original` inside the payload.
    pub delimiter: String,
    pub original: char,
    /// Quote style of the literal that supplies `original` on reconstruction.
    pub quote_style: QuoteStyle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    ChainedReplace,
    PatternReplace { case_sensitive: bool },
    Format,
}

/// Substituted payload text plus what is needed to reverse it.
struct Plan {
    payload: String,
    mappings: Vec<DelimiterMapping>,
    strategy: Strategy,
}

/// Replace significant characters with delimiters and emit a reconstruction.
///
/// Text without significant characters comes back as a plain (possibly
/// concatenated) literal.
pub fn delimited_reversible(text: &str, rng: &mut Decisions) -> Result<String, ObfuscationError> {
    delimited_reversible_mapped(text, rng).map(|(expr, _)| expr)
}

/// [`delimited_reversible`], also returning the mappings used.
pub fn delimited_reversible_mapped(
    text: &str,
    rng: &mut Decisions,
) -> Result<(String, Vec<DelimiterMapping>), ObfuscationError> {
    encode_with(text, rng, false)
}

/// Delimited encoding whose payload operands are supplied out of order
/// through a positional format expression.
///
/// The payload's top-level quoted operands are the concatenation pieces;
/// with fewer than two the delimited expression is returned unchanged.
pub fn reorder_format(text: &str, rng: &mut Decisions) -> Result<String, ObfuscationError> {
    encode_with(text, rng, true).map(|(expr, _)| expr)
}

fn encode_with(
    text: &str,
    rng: &mut Decisions,
    reorder: bool,
) -> Result<(String, Vec<DelimiterMapping>), ObfuscationError> {
    let mut last_error = None;
    for attempt in 1..=MAX_VERIFY_ATTEMPTS {
        let plan = plan(text, rng)?;
        let pieces = split_pieces(&plan.payload, rng);
        let style = *rng.pick(&[QuoteStyle::Single, QuoteStyle::Double]);
        let payload_expr = if reorder && pieces.len() >= 2 {
            render_reordered(&pieces, style, rng)
        } else {
            render_concat(&pieces, style)
        };
        let expr = plan.render(&payload_expr, rng);
        match verify(&expr, text, attempt) {
            Ok(()) => return Ok((expr, plan.mappings)),
            Err(e) => {
                debug!(attempt, error = %e, "delimited expression rejected, regenerating");
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or(ObfuscationError::Unverifiable {
        attempts: MAX_VERIFY_ATTEMPTS,
        detail: "no attempt made".to_string(),
    }))
}

/// Significant characters present in `text`, in order of first occurrence.
fn discover(text: &str) -> Vec<char> {
    let mut found = Vec::new();
    for c in text.chars() {
        if SIGNIFICANT_CHARS.contains(&c) && !found.contains(&c) {
            found.push(c);
        }
    }
    found
}

fn plan(text: &str, rng: &mut Decisions) -> Result<Plan, ObfuscationError> {
    let present = discover(text);
    if present.is_empty() {
        return Ok(Plan {
            payload: text.to_string(),
            mappings: Vec::new(),
            strategy: Strategy::ChainedReplace,
        });
    }

    let strategy = match rng.range(0..=2) {
        0 => Strategy::ChainedReplace,
        1 => Strategy::PatternReplace {
            case_sensitive: rng.coin(),
        },
        _ => Strategy::Format,
    };

    let delimiters = match strategy {
        Strategy::Format => (0..present.len()).map(|i| format!("{{{i}}}")).collect(),
        _ => generate_delimiters(text, present.len(), rng)?,
    };

    let mappings: Vec<DelimiterMapping> = present
        .iter()
        .zip(delimiters)
        .map(|(&original, delimiter)| DelimiterMapping {
            delimiter,
            original,
            quote_style: match original {
                '\'' => QuoteStyle::Double,
                _ => QuoteStyle::Single,
            },
        })
        .collect();

    let mut payload = String::with_capacity(text.len() * 2);
    for c in text.chars() {
        if let Some(m) = mappings.iter().find(|m| m.original == c) {
            payload.push_str(&m.delimiter);
        } else if strategy == Strategy::Format && (c == '{' || c == '}') {
            payload.push(c);
            payload.push(c);
        } else {
            payload.push(c);
        }
    }

    debug!(?strategy, count = mappings.len(), "delimiter plan built");
    Ok(Plan {
        payload,
        mappings,
        strategy,
    })
}

/// Fresh delimiters of minimal sufficient length that collide neither with
/// `text` nor with each other (compared case-insensitively, since the
/// pattern strategy may match without case).
fn generate_delimiters(
    text: &str,
    count: usize,
    rng: &mut Decisions,
) -> Result<Vec<String>, ObfuscationError> {
    let haystack = text.to_ascii_lowercase();
    let mut taken: Vec<String> = Vec::with_capacity(count);
    for _ in 0..count {
        let mut accepted = None;
        for attempt in 0..MAX_DELIMITER_ATTEMPTS {
            let len = MIN_DELIMITER_LEN + attempt / ATTEMPTS_PER_LENGTH;
            let candidate = rng.alphanumeric(len);
            let lower = candidate.to_ascii_lowercase();
            let collides = haystack.contains(&lower)
                || taken.iter().any(|t| {
                    let t = t.to_ascii_lowercase();
                    t.contains(&lower) || lower.contains(&t)
                });
            if !collides {
                accepted = Some(candidate);
                break;
            }
        }
        match accepted {
            Some(d) => taken.push(d),
            None => {
                return Err(ObfuscationError::CollisionExhaustion {
                    what: "delimiter",
                    attempts: MAX_DELIMITER_ATTEMPTS,
                })
            }
        }
    }
    Ok(taken)
}

impl Plan {
    /// Wrap `payload_expr` (an expression yielding the payload) with the
    /// reconstruction steps.
    fn render(&self, payload_expr: &str, rng: &mut Decisions) -> String {
        if self.mappings.is_empty() {
            return payload_expr.to_string();
        }
        let payload_expr = quote::parenthesize(payload_expr);
        match self.strategy {
            Strategy::ChainedReplace => {
                let mut out = payload_expr;
                for m in self.mappings.iter().rev() {
                    let method = randomize_case("Replace", rng);
                    let delim = delimiter_literal(&m.delimiter, rng);
                    let ws = if rng.coin() { " " } else { "" };
                    let original = char_literal(m, false, rng);
                    out.push_str(&format!(".{method}({delim},{ws}{original})"));
                }
                format!("({out})")
            }
            Strategy::PatternReplace { case_sensitive } => {
                let mut out = payload_expr;
                for m in self.mappings.iter().rev() {
                    let name = if case_sensitive {
                        "creplace"
                    } else {
                        *rng.pick(&["replace", "ireplace"])
                    };
                    let op = randomize_case(name, rng);
                    let delim = delimiter_literal(&m.delimiter, rng);
                    let ws = if rng.coin() { " " } else { "" };
                    let original = char_literal(m, true, rng);
                    out.push_str(&format!(" -{op} {delim},{ws}{original}"));
                }
                format!("({out})")
            }
            Strategy::Format => {
                let op = randomize_case("f", rng);
                let args: Vec<String> = self
                    .mappings
                    .iter()
                    .map(|m| char_literal(m, false, rng))
                    .collect();
                format!("({payload_expr} -{op} {})", args.join(","))
            }
        }
    }
}

fn delimiter_literal(delimiter: &str, rng: &mut Decisions) -> String {
    let style = *rng.pick(&[QuoteStyle::Single, QuoteStyle::Double]);
    quote::quote(delimiter, style)
}

/// Literal supplying the original character.
///
/// The single quote always travels in double quotes and everything else in
/// single quotes, or as a `[Char]` code cast. For `-replace`, `$` is
/// doubled since it is the substitution marker.
fn char_literal(m: &DelimiterMapping, substitution: bool, rng: &mut Decisions) -> String {
    if substitution && m.original == '$' {
        return "'$$'".to_string();
    }
    if rng.range(0..=3) == 0 {
        let string = randomize_case("String", rng);
        let chr = randomize_case("Char", rng);
        return format!("[{string}][{chr}]{}", m.original as u32);
    }
    quote::quote(&m.original.to_string(), m.quote_style)
}

/// `('{1}{0}' -f 'b','a')`: operands in a non-natural order.
fn render_reordered(pieces: &[String], style: QuoteStyle, rng: &mut Decisions) -> String {
    let n = pieces.len();
    let mut order: Vec<usize> = (0..n).collect();
    rng.shuffle(&mut order);
    if order.iter().enumerate().all(|(i, &o)| i == o) {
        order.rotate_left(1);
    }
    // order[j] = natural index of the j-th supplied operand.
    let mut slot = vec![0usize; n];
    for (j, &natural) in order.iter().enumerate() {
        slot[natural] = j;
    }
    let template: String = slot.iter().map(|j| format!("{{{j}}}")).collect();
    let template_style = *rng.pick(&[QuoteStyle::Single, QuoteStyle::Double]);
    let operands: Vec<String> = order.iter().map(|&i| quote::quote(&pieces[i], style)).collect();
    let op = randomize_case("f", rng);
    format!(
        "({} -{op} {})",
        quote::quote(&template, template_style),
        operands.join(",")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::evaluate;

    const SAMPLE: &str = r#"Get-Process | Where-Object { $_.Name -eq "svc`'s" } \ 'x'"#;

    #[test]
    fn plain_text_is_wrapped_without_mappings() {
        let mut rng = Decisions::seeded(10);
        let (expr, mappings) = delimited_reversible_mapped("whoami /all", &mut rng).unwrap();
        assert!(mappings.is_empty());
        assert_eq!(evaluate(&expr).unwrap(), "whoami /all");
    }

    #[test]
    fn every_significant_char_gets_a_mapping() {
        for seed in 0..40 {
            let mut rng = Decisions::seeded(seed);
            let (expr, mappings) = delimited_reversible_mapped(SAMPLE, &mut rng).unwrap();
            assert_ne!(expr, SAMPLE);
            let mut originals: Vec<char> = mappings.iter().map(|m| m.original).collect();
            originals.sort_unstable();
            let mut expected: Vec<char> = SIGNIFICANT_CHARS.to_vec();
            expected.sort_unstable();
            assert_eq!(originals, expected, "seed {seed}");
            assert_eq!(evaluate(&expr).unwrap(), SAMPLE, "seed {seed}: {expr}");
        }
    }

    #[test]
    fn discovery_order_is_first_occurrence() {
        assert_eq!(discover("a'b$c'|"), vec!['\'', '$', '|']);
    }

    #[test]
    fn quote_mappings_alternate_style() {
        let mut rng = Decisions::seeded(11);
        let (_, mappings) = delimited_reversible_mapped(r#"a'b"c"#, &mut rng).unwrap();
        for m in mappings {
            match m.original {
                '\'' => assert_eq!(m.quote_style, QuoteStyle::Double),
                '"' => assert_eq!(m.quote_style, QuoteStyle::Single),
                _ => {}
            }
        }
    }

    #[test]
    fn delimiters_do_not_occur_in_text() {
        let mut rng = Decisions::seeded(12);
        let text = "ab$cd|ef";
        let delims = generate_delimiters(text, 2, &mut rng).unwrap();
        for d in &delims {
            assert!(!text.to_ascii_lowercase().contains(&d.to_ascii_lowercase()));
            assert!(d.len() >= MIN_DELIMITER_LEN);
        }
        assert!(!delims[0].contains(&delims[1]) && !delims[1].contains(&delims[0]));
    }

    #[test]
    fn all_strategies_are_reachable() {
        let mut saw_replace = false;
        let mut saw_pattern = false;
        let mut saw_format = false;
        for seed in 0..60 {
            let expr = delimited_reversible("a$b", &mut Decisions::seeded(seed)).unwrap();
            let lower = expr.to_ascii_lowercase();
            saw_replace |= lower.contains(".replace(");
            saw_pattern |= lower.contains("replace '") || lower.contains("replace \"");
            saw_format |= lower.contains(" -f ");
            assert_eq!(evaluate(&expr).unwrap(), "a$b");
        }
        assert!(saw_replace && saw_pattern && saw_format);
    }

    #[test]
    fn reorder_supplies_operands_out_of_order() {
        let mut rng = Decisions::seeded(13);
        let text = "Get-LocalGroupMember";
        let expr = reorder_format(text, &mut rng).unwrap();
        assert!(expr.to_ascii_lowercase().contains(" -f "), "Got: {expr}");
        assert_eq!(evaluate(&expr).unwrap(), text);
    }

    #[test]
    fn reorder_on_tiny_text_is_plain_literal() {
        let mut rng = Decisions::seeded(14);
        assert_eq!(evaluate(&reorder_format("ab", &mut rng).unwrap()).unwrap(), "ab");
    }

    #[test]
    fn reorder_with_significant_chars_evaluates() {
        for seed in 0..40 {
            let expr = reorder_format(SAMPLE, &mut Decisions::seeded(seed)).unwrap();
            assert_eq!(evaluate(&expr).unwrap(), SAMPLE, "seed {seed}: {expr}");
        }
    }

    #[test]
    fn format_strategy_escapes_braces() {
        for seed in 0..30 {
            let text = "{ $x } | {0}";
            let expr = delimited_reversible(text, &mut Decisions::seeded(seed)).unwrap();
            assert_eq!(evaluate(&expr).unwrap(), text, "seed {seed}: {expr}");
        }
    }
}

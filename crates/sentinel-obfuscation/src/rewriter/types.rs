//! Type-literal rewriting: `[System.Math]::PI` becomes a read of a generated
//! variable that a preamble assigns from an encoded cast.

use super::{RewriteReport, RewriteState};
use crate::encoder::{self, randomize_case, ObfuscationLevel};
use crate::error::ObfuscationError;
use crate::quote;
use crate::random::Decisions;
use crate::token::{Token, TokenKind};
use tracing::debug;

/// Type names (lowercased prefixes) that do not survive a string cast.
const EXCLUDED_TYPES: &[&str] = &["directoryservices.accountmanagement.", "windows.clipboard"];

const MAX_IDENTIFIER_ATTEMPTS: usize = 32;

/// Automatic variables a generated name must not shadow.
const RESERVED: &[&str] = &[
    "args", "error", "event", "false", "home", "host", "input", "matches", "null", "pid",
    "profile", "psitem", "pwd", "this", "true",
];

pub(super) fn rewrite(
    script: &str,
    tokens: &[Token],
    level: ObfuscationLevel,
    rng: &mut Decisions,
) -> Result<RewriteReport, ObfuscationError> {
    let mut state = RewriteState::new(script);

    for token in tokens.iter().rev().filter(|t| t.kind == TokenKind::Type) {
        let name = type_name(&token.content);
        if !is_castable(name) {
            debug!(token = %token.content, "type not castable, skipped");
            continue;
        }
        let after = &state.script[state.current(token.end())..];
        if !(after.starts_with("::") || after.starts_with('.')) {
            continue;
        }

        let id = match state.ctx.binding(&token.content) {
            Some(id) => id.to_string(),
            None => {
                let id = fresh_identifier(&state.script, rng)?;
                let cast = cast_expression(name, level, rng)?;
                let preamble = assignment_idiom(&id, &cast, rng);
                state.prepend(&preamble);
                state.ctx.bind(&token.content, &id);
                id
            }
        };
        let read = read_idiom(&id, rng);
        state.replace(TokenKind::Type, token.span(), &read);
    }

    Ok(state.finish())
}

fn type_name(content: &str) -> &str {
    content
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(content)
        .trim()
}

/// Generic, array and excluded namespaces are left untouched.
pub(super) fn is_castable(name: &str) -> bool {
    if name.is_empty() || name.contains(['[', ']', ',', '`']) {
        return false;
    }
    let lower = name.to_lowercase();
    let bare = lower.strip_prefix("system.").unwrap_or(&lower);
    !EXCLUDED_TYPES.iter().any(|ex| bare.starts_with(ex))
}

/// `[Type](<encoded name>)`, with the name as a string expression.
fn cast_expression(
    name: &str,
    level: ObfuscationLevel,
    rng: &mut Decisions,
) -> Result<String, ObfuscationError> {
    let encoded = encoder::encode(name, level, rng)?;
    Ok(format!(
        "[{}]({})",
        randomize_case("Type", rng),
        quote::strip_enclosing_parens(&encoded)
    ))
}

/// Random variable name that occurs nowhere in `script`.
fn fresh_identifier(script: &str, rng: &mut Decisions) -> Result<String, ObfuscationError> {
    let haystack = script.to_lowercase();
    for _ in 0..MAX_IDENTIFIER_ATTEMPTS {
        let len = rng.range(4..=10);
        let candidate = rng.identifier(len);
        let lower = candidate.to_lowercase();
        if !haystack.contains(&lower) && !RESERVED.contains(&lower.as_str()) {
            return Ok(candidate);
        }
    }
    Err(ObfuscationError::CollisionExhaustion {
        what: "identifier",
        attempts: MAX_IDENTIFIER_ATTEMPTS,
    })
}

/// Statement assigning `cast` to `id`, terminated with `;`.
fn assignment_idiom(id: &str, cast: &str, rng: &mut Decisions) -> String {
    let ws = *rng.pick(&["", " "]);
    let statement = match rng.range(0..=2) {
        0 => format!("${id}{ws}={ws}{cast}"),
        1 => {
            let cmd = rng.pick(&["Set-Variable", "SV", "Set"]);
            format!("{} {id} ({cast})", randomize_case(cmd, rng))
        }
        _ => {
            let cmd = rng.pick(&["Set-Item", "SI"]);
            let drive = randomize_case("Variable", rng);
            format!("{} {drive}:{id} ({cast})", randomize_case(cmd, rng))
        }
    };
    format!("{statement};{}", rng.pick(&["", " "]))
}

/// Expression reading the value of `id`.
fn read_idiom(id: &str, rng: &mut Decisions) -> String {
    let expr = match rng.range(0..=3) {
        0 => format!("${id}"),
        1 => {
            let cmd = rng.pick(&["Get-Variable", "GV", "Variable"]);
            format!("({cmd} {id}).Value")
        }
        2 => {
            let cmd = rng.pick(&["Get-Variable", "GV"]);
            let flag = rng.pick(&["-ValueOnly", "-ValueOn", "-Val"]);
            format!("({cmd} {id} {flag})")
        }
        _ => {
            let cmd = rng.pick(&["Get-ChildItem", "ChildItem", "Dir", "GCI", "Get-Item", "GI"]);
            format!("({cmd} Variable:{id}).Value")
        }
    };
    randomize_case(&expr, rng)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::evaluate;
    use crate::lexer::PsLexer;
    use crate::rewriter::TokenRewriter;

    fn rewrite_types(script: &str, seed: u64) -> RewriteReport {
        TokenRewriter::new(&PsLexer)
            .obfuscate_type_tokens(script, ObfuscationLevel::Concatenate, &mut Decisions::seeded(seed))
            .unwrap()
    }

    #[test]
    fn castable_filters() {
        assert!(is_castable("System.Text.Encoding"));
        assert!(is_castable("Math"));
        assert!(!is_castable("System.DirectoryServices.AccountManagement.PrincipalContext"));
        assert!(!is_castable("Windows.Clipboard"));
        assert!(!is_castable("Collections.Generic.List[string]"));
        assert!(!is_castable("byte[]"));
    }

    #[test]
    fn preamble_casts_evaluate_to_the_type_name() {
        let script = "[System.Text.Encoding]::UTF8.GetBytes([Convert]::ToString(7))";
        for level in [ObfuscationLevel::Concatenate, ObfuscationLevel::Reorder] {
            for seed in 0..30 {
                let report = TokenRewriter::new(&PsLexer)
                    .obfuscate_type_tokens(script, level, &mut Decisions::seeded(seed))
                    .unwrap();
                let preamble = &report.script[..report.preamble_len];
                let lower = preamble.to_ascii_lowercase();
                let mut names = Vec::new();
                let mut from = 0;
                while let Some(at) = lower[from..].find("[type](") {
                    let open = from + at + "[type]".len();
                    let close = quote::matching_paren(preamble, open).unwrap();
                    names.push(evaluate(&preamble[open..=close]).unwrap());
                    from = close;
                }
                names.sort();
                assert_eq!(names, vec!["Convert", "System.Text.Encoding"], "{preamble}");
            }
        }
    }

    #[test]
    fn bare_cast_is_not_rewritten() {
        let script = "[int]'42'";
        let report = rewrite_types(script, 1);
        assert!(report.is_unchanged());
        assert_eq!(report.script, script);
    }

    #[test]
    fn member_access_type_is_replaced() {
        let script = "[Math]::Round(2.5)";
        for seed in 0..20 {
            let report = rewrite_types(script, seed);
            assert!(report.preamble_len > 0);
            assert!(!report.script.contains("[Math]"), "{}", report.script);
            assert!(report.script.ends_with("::Round(2.5)"), "{}", report.script);
            assert_eq!(report.edits.len(), 1);
            assert!(report.edits[0].rewritten.start >= report.preamble_len);
        }
    }

    #[test]
    fn repeated_type_reuses_binding() {
        let script = "[Console]::Write('a'); [Console]::Write('b')";
        let report = rewrite_types(script, 3);
        assert_eq!(report.edits.len(), 2);
        // One preamble statement for both occurrences.
        let preamble = &report.script[..report.preamble_len];
        assert_eq!(preamble.matches(';').count(), 1, "{preamble}");
    }

    #[test]
    fn untouched_spans_are_byte_identical() {
        let script = "$x = 1; [System.Text.Encoding]::UTF8.GetBytes('hi') | Out-Null; Write-Host done";
        let report = rewrite_types(script, 11);
        let edit = &report.edits[0];
        let before = &script[..edit.original.start];
        let after = &script[edit.original.end..];
        assert_eq!(&report.script[report.preamble_len..edit.rewritten.start], before);
        assert_eq!(&report.script[edit.rewritten.end..], after);
    }

    #[test]
    fn every_edit_sits_at_its_grown_offset() {
        // Each preamble shifts the tokens still to be processed.
        let script = "[IO.Path]::GetTempPath(); [Math]::Abs(-1); [Environment]::MachineName";
        let report = rewrite_types(script, 21);
        assert_eq!(report.edits.len(), 3);

        let (mut orig, mut new) = (0, report.preamble_len);
        for edit in &report.edits {
            assert_eq!(&report.script[new..edit.rewritten.start], &script[orig..edit.original.start]);
            orig = edit.original.end;
            new = edit.rewritten.end;
        }
        assert_eq!(&report.script[new..], &script[orig..]);
        assert_eq!(report.edits[0].rewritten.start, report.preamble_len);
    }

    #[test]
    fn identifiers_avoid_script_text() {
        let mut rng = Decisions::seeded(5);
        let script = "abcdefghijklmnopqrstuvwxyz";
        for _ in 0..20 {
            let id = fresh_identifier(script, &mut rng).unwrap();
            assert!(!script.contains(&id.to_lowercase()));
        }
    }
}

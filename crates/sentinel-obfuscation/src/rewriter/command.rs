//! Command-name rewriting: `Get-Process` becomes `&('Get-Pr'+'ocess')`.

use super::{RewriteReport, RewriteState};
use crate::encoder::{self, ObfuscationLevel};
use crate::error::ObfuscationError;
use crate::quote;
use crate::random::Decisions;
use crate::token::{Token, TokenKind};
use tracing::debug;

/// Bytes scanned before a command for an existing invocation operator.
const LOOKBEHIND: usize = 15;
/// Above this script length only the call operator is emitted.
const LONG_SCRIPT: usize = 10_000;

pub(super) fn rewrite(
    script: &str,
    tokens: &[Token],
    level: ObfuscationLevel,
    rng: &mut Decisions,
) -> Result<RewriteReport, ObfuscationError> {
    let mut state = RewriteState::new(script);

    // Only the last command is rewritten per invocation.
    let Some(token) = tokens.iter().rev().find(|t| t.kind == TokenKind::Command) else {
        debug!("no command token, script unchanged");
        return Ok(state.finish());
    };

    let name = token.content.replace('`', "");
    let encoded = quote::parenthesize(&encoder::encode(&name, level, rng)?);

    let operator = if has_invocation_operator(script, token.start) {
        ""
    } else if script.len() > LONG_SCRIPT {
        "&"
    } else {
        *rng.pick(&["&", "."])
    };
    let gap = if operator.is_empty() { "" } else { *rng.pick(&["", " "]) };
    // Keep a following argument a separate token.
    let trailing = match script[token.end()..].chars().next() {
        Some(c) if !c.is_whitespace() && !matches!(c, ';' | '|' | ')' | '}') => " ",
        _ => "",
    };

    let replacement = format!("{operator}{gap}{encoded}{trailing}");
    state.replace(TokenKind::Command, token.span(), &replacement);
    Ok(state.finish())
}

/// A `&` or `.` already invokes whatever starts at `at`.
fn has_invocation_operator(script: &str, at: usize) -> bool {
    let mut from = at.saturating_sub(LOOKBEHIND);
    while !script.is_char_boundary(from) {
        from += 1;
    }
    let window = script[from..at].trim_end();
    (window.ends_with('&') && !window.ends_with("&&")) || window.ends_with('.')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::evaluate;
    use crate::lexer::PsLexer;
    use crate::rewriter::TokenRewriter;

    fn rewrite_command(script: &str, seed: u64) -> RewriteReport {
        TokenRewriter::new(&PsLexer)
            .obfuscate_command_token(script, ObfuscationLevel::Concatenate, &mut Decisions::seeded(seed))
            .unwrap()
    }

    fn replaced_name(report: &RewriteReport) -> String {
        let edit = &report.edits[0];
        let text = report.script[edit.rewritten.clone()].trim();
        let expr = text.trim_start_matches(['&', '.', ' ']);
        evaluate(expr).unwrap()
    }

    #[test]
    fn last_command_only() {
        let script = "Get-Process | Select-Object -First 1";
        let report = rewrite_command(script, 1);
        assert_eq!(report.edits.len(), 1);
        assert!(report.script.starts_with("Get-Process | "));
        assert_eq!(replaced_name(&report), "Select-Object");
        assert!(report.script.ends_with(" -First 1"));
    }

    #[test]
    fn invocation_operator_is_added() {
        for seed in 0..20 {
            let report = rewrite_command("whoami /all", seed);
            assert!(report.script.starts_with('&') || report.script.starts_with('.'), "{}", report.script);
            assert_eq!(replaced_name(&report), "whoami");
        }
    }

    #[test]
    fn existing_operator_is_reused() {
        let report = rewrite_command("& Get-Date", 4);
        assert!(report.script.starts_with("& ("), "{}", report.script);
        assert_eq!(report.script.matches('&').count(), 1);
    }

    #[test]
    fn pipeline_chain_is_not_an_operator() {
        assert!(!has_invocation_operator("a && b", 5));
        assert!(has_invocation_operator("x; & b", 5));
        assert!(has_invocation_operator(". b", 2));
    }

    #[test]
    fn backticks_are_stripped_before_encoding() {
        let report = rewrite_command("I`E`X 'x'", 2);
        assert_eq!(replaced_name(&report), "IEX");
    }

    #[test]
    fn adjacent_argument_gets_separated() {
        let report = rewrite_command("IEX('x')", 8);
        let edit = &report.edits[0];
        assert!(report.script[edit.rewritten.clone()].ends_with(' '));
        assert!(report.script.ends_with(") ('x')"), "{}", report.script);
    }

    #[test]
    fn long_script_uses_call_operator() {
        let script = format!("Write-Output '{}'", "a".repeat(LONG_SCRIPT));
        for seed in 0..5 {
            assert!(rewrite_command(&script, seed).script.starts_with('&'));
        }
    }

    #[test]
    fn no_command_is_unchanged() {
        let report = rewrite_command("$x = 'a' + 'b'", 3);
        assert!(report.is_unchanged());
    }
}

//! Token-aware rewriting of whole scripts.
//!
//! A rewrite pass tokenizes once, then edits tokens in descending offset
//! order so a replacement never shifts the tokens still waiting to be
//! processed. The one exception is a preamble prepended at offset 0, which
//! shifts everything; [`RewriteContext::growth_offset`] tracks that growth
//! and every original token offset is read as `start + growth_offset`.

mod command;
mod types;

use crate::encoder::ObfuscationLevel;
use crate::error::ObfuscationError;
use crate::random::Decisions;
use crate::token::{TokenKind, Tokenizer};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::Range;
use tracing::trace;

/// Per-invocation rewrite state. Never shared between invocations.
#[derive(Debug, Default)]
pub struct RewriteContext {
    growth_offset: usize,
    bindings: HashMap<String, String>,
}

impl RewriteContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes prepended at offset 0 so far.
    pub fn growth_offset(&self) -> usize {
        self.growth_offset
    }

    /// Identifier already bound to `original` token text, if any.
    pub fn binding(&self, original: &str) -> Option<&str> {
        self.bindings.get(original).map(String::as_str)
    }

    fn bind(&mut self, original: &str, identifier: &str) {
        self.bindings.insert(original.to_string(), identifier.to_string());
    }
}

/// One token replacement. `original` is the span in the input script,
/// `rewritten` the span of its replacement in the output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewriteEdit {
    pub kind: TokenKind,
    pub original: Range<usize>,
    pub rewritten: Range<usize>,
}

/// Outcome of one rewrite pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewriteReport {
    pub script: String,
    /// Length of the prepended preamble, `0` if none.
    pub preamble_len: usize,
    /// Edits in ascending output order.
    pub edits: Vec<RewriteEdit>,
}

impl RewriteReport {
    pub fn is_unchanged(&self) -> bool {
        self.preamble_len == 0 && self.edits.is_empty()
    }
}

/// Script buffer plus the bookkeeping needed to keep edit spans current.
struct RewriteState {
    script: String,
    ctx: RewriteContext,
    edits: Vec<RewriteEdit>,
}

impl RewriteState {
    fn new(script: &str) -> Self {
        Self {
            script: script.to_string(),
            ctx: RewriteContext::new(),
            edits: Vec::new(),
        }
    }

    /// Current position of an original offset.
    fn current(&self, original: usize) -> usize {
        original + self.ctx.growth_offset
    }

    fn prepend(&mut self, text: &str) {
        self.script.insert_str(0, text);
        self.ctx.growth_offset += text.len();
        for edit in &mut self.edits {
            edit.rewritten = edit.rewritten.start + text.len()..edit.rewritten.end + text.len();
        }
    }

    /// Replace the token originally at `original` with `text`.
    fn replace(&mut self, kind: TokenKind, original: Range<usize>, text: &str) {
        let at = self.current(original.start);
        let old_end = at + original.len();
        self.script.replace_range(at..old_end, text);
        let new_end = at + text.len();
        for edit in &mut self.edits {
            if edit.rewritten.start >= old_end {
                edit.rewritten = edit.rewritten.start - old_end + new_end..edit.rewritten.end - old_end + new_end;
            }
        }
        trace!(?kind, ?original, replacement = text, "token rewritten");
        self.edits.push(RewriteEdit {
            kind,
            original,
            rewritten: at..new_end,
        });
    }

    fn finish(mut self) -> RewriteReport {
        self.edits.sort_by_key(|e| e.rewritten.start);
        RewriteReport {
            script: self.script,
            preamble_len: self.ctx.growth_offset,
            edits: self.edits,
        }
    }
}

/// Applies the token-level strategies to a script.
pub struct TokenRewriter<'t> {
    tokenizer: &'t dyn Tokenizer,
}

impl<'t> TokenRewriter<'t> {
    pub fn new(tokenizer: &'t dyn Tokenizer) -> Self {
        Self { tokenizer }
    }

    /// Route castable type literals through generated variables.
    ///
    /// Only types immediately followed by member access (`::` or `.`) are
    /// rewritten; a bare cast is left alone.
    pub fn obfuscate_type_tokens(
        &self,
        script: &str,
        level: ObfuscationLevel,
        rng: &mut Decisions,
    ) -> Result<RewriteReport, ObfuscationError> {
        let tokens = self.tokenizer.tokenize(script)?;
        types::rewrite(script, &tokens, level, rng)
    }

    /// Replace the last command name with an encoded, invoked expression.
    pub fn obfuscate_command_token(
        &self,
        script: &str,
        level: ObfuscationLevel,
        rng: &mut Decisions,
    ) -> Result<RewriteReport, ObfuscationError> {
        let tokens = self.tokenizer.tokenize(script)?;
        command::rewrite(script, &tokens, level, rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepend_shifts_recorded_edits() {
        let mut state = RewriteState::new("aaa bbb");
        state.replace(TokenKind::Command, 4..7, "XXXXX");
        state.prepend("P;");
        assert_eq!(state.current(0), 2);
        state.replace(TokenKind::Command, 0..3, "Y");
        let report = state.finish();
        assert_eq!(report.script, "P;Y XXXXX");
        assert_eq!(report.preamble_len, 2);
        assert_eq!(report.edits[0].rewritten, 2..3);
        assert_eq!(report.edits[1].rewritten, 4..9);
        assert_eq!(&report.script[report.edits[1].rewritten.clone()], "XXXXX");
    }

    #[test]
    fn context_bindings() {
        let mut ctx = RewriteContext::new();
        assert_eq!(ctx.binding("[Math]"), None);
        ctx.bind("[Math]", "abc");
        assert_eq!(ctx.binding("[Math]"), Some("abc"));
        assert_eq!(ctx.growth_offset(), 0);
    }
}

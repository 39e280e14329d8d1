//! Obfuscation techniques and the layer abstraction the chain runs.

use crate::encoder::{self, randomize_case, ObfuscationLevel};
use crate::error::{ObfuscationError, RecipeError};
use crate::quote::{self, QuoteStyle};
use crate::random::Decisions;
use crate::rewriter::TokenRewriter;
use crate::token::Tokenizer;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Substring an execution engine embeds in output it failed to produce.
pub const ERROR_MARKER: &str = "ENGINE_ERROR";

/// Prefix of a Base64Wrap launcher line.
pub const ENCODED_COMMAND_LAUNCHER: &str = "powershell.exe -EncodedCommand";

/// Argument layers may appear anywhere; a finisher must be last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LayerFamily {
    Argument,
    Finisher,
}

/// Everything a layer may draw on while running.
pub struct LayerContext<'a> {
    pub rng: &'a mut Decisions,
    pub tokenizer: &'a dyn Tokenizer,
}

/// One step of an obfuscation chain.
pub trait Layer {
    fn name(&self) -> String;
    fn family(&self) -> LayerFamily;
    fn apply(&self, input: &str, ctx: &mut LayerContext<'_>) -> Result<String, ObfuscationError>;
}

/// The built-in techniques.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Technique {
    /// Route type literals followed by member access through variables.
    TypeCast(ObfuscationLevel),
    /// Replace the last command name with an invoked encoded expression.
    CommandSplat(ObfuscationLevel),
    /// Wrap the whole script as a split-concatenated string passed to
    /// `Invoke-Expression`.
    ConcatEncode,
    /// Like `ConcatEncode`, with the delimiter-substitution and
    /// reordered-format encoder.
    ReorderEncode,
    /// UTF-16LE Base64 payload behind an `-EncodedCommand` launcher.
    Base64Wrap,
}

impl Technique {
    /// Every technique at every level, argument layers first.
    pub const ALL: [Technique; 7] = [
        Technique::TypeCast(ObfuscationLevel::Concatenate),
        Technique::TypeCast(ObfuscationLevel::Reorder),
        Technique::ConcatEncode,
        Technique::ReorderEncode,
        Technique::CommandSplat(ObfuscationLevel::Concatenate),
        Technique::CommandSplat(ObfuscationLevel::Reorder),
        Technique::Base64Wrap,
    ];

    pub fn base_name(&self) -> &'static str {
        match self {
            Self::TypeCast(_) => "TypeCast",
            Self::CommandSplat(_) => "CommandSplat",
            Self::ConcatEncode => "ConcatEncode",
            Self::ReorderEncode => "ReorderEncode",
            Self::Base64Wrap => "Base64Wrap",
        }
    }

    pub fn family(&self) -> LayerFamily {
        match self {
            Self::CommandSplat(_) | Self::Base64Wrap => LayerFamily::Finisher,
            _ => LayerFamily::Argument,
        }
    }

    pub fn level(&self) -> Option<ObfuscationLevel> {
        match self {
            Self::TypeCast(level) | Self::CommandSplat(level) => Some(*level),
            _ => None,
        }
    }

    pub fn argument_techniques() -> impl Iterator<Item = Technique> {
        Self::ALL.into_iter().filter(|t| t.family() == LayerFamily::Argument)
    }

    pub fn finisher_techniques() -> impl Iterator<Item = Technique> {
        Self::ALL.into_iter().filter(|t| t.family() == LayerFamily::Finisher)
    }
}

impl Layer for Technique {
    fn name(&self) -> String {
        self.to_string()
    }

    fn family(&self) -> LayerFamily {
        Technique::family(self)
    }

    fn apply(&self, input: &str, ctx: &mut LayerContext<'_>) -> Result<String, ObfuscationError> {
        match *self {
            Self::TypeCast(level) => TokenRewriter::new(ctx.tokenizer)
                .obfuscate_type_tokens(input, level, ctx.rng)
                .map(|report| report.script),
            Self::CommandSplat(level) => TokenRewriter::new(ctx.tokenizer)
                .obfuscate_command_token(input, level, ctx.rng)
                .map(|report| report.script),
            Self::ConcatEncode => {
                let style = *ctx.rng.pick(&[QuoteStyle::Single, QuoteStyle::Double]);
                let expr = encoder::split_concatenate(input, style, ctx.rng)?;
                Ok(invoke_expression(&expr, ctx.rng))
            }
            Self::ReorderEncode => {
                let expr = encoder::reorder_format(input, ctx.rng)?;
                Ok(invoke_expression(&expr, ctx.rng))
            }
            Self::Base64Wrap => Ok(encoded_command(input)),
        }
    }
}

impl fmt::Display for Technique {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.level() {
            Some(ObfuscationLevel::Reorder) => write!(f, "{}:2", self.base_name()),
            _ => f.write_str(self.base_name()),
        }
    }
}

impl FromStr for Technique {
    type Err = RecipeError;

    /// `Name` or `Name:level`, case-insensitive.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (name, level) = match s.split_once(':') {
            Some((name, level)) => (name.trim(), Some(level.trim())),
            None => (s, None),
        };
        let parsed_level = match level {
            None => ObfuscationLevel::default(),
            Some(raw) => raw
                .parse::<u8>()
                .ok()
                .and_then(|n| ObfuscationLevel::try_from(n).ok())
                .ok_or_else(|| RecipeError::InvalidLevel {
                    technique: name.to_string(),
                    level: raw.to_string(),
                })?,
        };
        let technique = match name.to_ascii_lowercase().as_str() {
            "typecast" => Self::TypeCast(parsed_level),
            "commandsplat" => Self::CommandSplat(parsed_level),
            "concatencode" => Self::ConcatEncode,
            "reorderencode" => Self::ReorderEncode,
            "base64wrap" => Self::Base64Wrap,
            _ => return Err(RecipeError::UnknownTechnique(s.to_string())),
        };
        if level.is_some() && technique.level().is_none() {
            return Err(RecipeError::InvalidLevel {
                technique: technique.base_name().to_string(),
                level: level.unwrap_or_default().to_string(),
            });
        }
        Ok(technique)
    }
}

impl TryFrom<String> for Technique {
    type Error = RecipeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Technique> for String {
    fn from(technique: Technique) -> Self {
        technique.to_string()
    }
}

/// `IEX(<expr>)` or `(<expr>)|IEX`, with the invoker name case-randomized.
fn invoke_expression(expr: &str, rng: &mut Decisions) -> String {
    let name = *rng.pick(&["Invoke-Expression", "IEX"]);
    let invoker = randomize_case(name, rng);
    if rng.coin() {
        format!("{invoker}({})", quote::strip_enclosing_parens(expr))
    } else {
        let pipe = rng.pick(&["|", " | "]);
        format!("{}{pipe}{invoker}", quote::parenthesize(expr))
    }
}

/// Launcher line carrying `script` as UTF-16LE Base64.
pub fn encoded_command(script: &str) -> String {
    let bytes: Vec<u8> = script.encode_utf16().flat_map(u16::to_le_bytes).collect();
    format!("{ENCODED_COMMAND_LAUNCHER} {}", STANDARD.encode(bytes))
}

/// Inverse of [`encoded_command`]; `None` if `command` is not a launcher
/// line or its payload does not decode.
pub fn decode_encoded_command(command: &str) -> Option<String> {
    let payload = command.strip_prefix(ENCODED_COMMAND_LAUNCHER)?.trim();
    let bytes = STANDARD.decode(payload).ok()?;
    if bytes.len() % 2 != 0 {
        return None;
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::evaluate;
    use crate::lexer::PsLexer;
    use std::collections::HashSet;

    fn apply(technique: Technique, input: &str, seed: u64) -> String {
        let mut rng = Decisions::seeded(seed);
        let mut ctx = LayerContext {
            rng: &mut rng,
            tokenizer: &PsLexer,
        };
        technique.apply(input, &mut ctx).unwrap()
    }

    /// The expression an IEX wrapper would evaluate.
    fn invoked(output: &str) -> String {
        let lower = output.to_ascii_lowercase();
        let expr = if let Some(i) = output.rfind('|').filter(|_| lower.ends_with("iex") || lower.ends_with("invoke-expression")) {
            &output[..i]
        } else {
            let open = output.find('(').unwrap();
            &output[open..]
        };
        evaluate(expr.trim()).unwrap()
    }

    #[test]
    fn names_round_trip() {
        for t in Technique::ALL {
            assert_eq!(t.to_string().parse::<Technique>().unwrap(), t);
        }
        assert_eq!("typecast:2".parse::<Technique>().unwrap(), Technique::TypeCast(ObfuscationLevel::Reorder));
        assert_eq!(Technique::CommandSplat(ObfuscationLevel::Concatenate).to_string(), "CommandSplat");
    }

    #[test]
    fn parse_errors() {
        assert!(matches!("Nope".parse::<Technique>(), Err(RecipeError::UnknownTechnique(_))));
        assert!(matches!("TypeCast:3".parse::<Technique>(), Err(RecipeError::InvalidLevel { .. })));
        assert!(matches!("Base64Wrap:2".parse::<Technique>(), Err(RecipeError::InvalidLevel { .. })));
    }

    #[test]
    fn families() {
        assert_eq!(Technique::argument_techniques().count(), 4);
        assert!(Technique::finisher_techniques().all(|t| t.family() == LayerFamily::Finisher));
    }

    #[test]
    fn serde_uses_display_form() {
        let json = serde_json::to_string(&Technique::TypeCast(ObfuscationLevel::Reorder)).unwrap();
        assert_eq!(json, "\"TypeCast:2\"");
        let back: Technique = serde_json::from_str("\"ReorderEncode\"").unwrap();
        assert_eq!(back, Technique::ReorderEncode);
    }

    #[test]
    fn string_layers_invoke_an_equivalent_expression() {
        let script = "Get-ChildItem -Path 'C:\\Users' | Where-Object { $_.Name -like \"*a*\" }";
        for seed in 0..25 {
            for t in [Technique::ConcatEncode, Technique::ReorderEncode] {
                let out = apply(t, script, seed);
                assert_eq!(invoked(&out), script, "{t}: {out}");
            }
        }
    }

    #[test]
    fn invoker_uses_both_aliases() {
        let mut names = HashSet::new();
        for seed in 0..40 {
            let out = invoke_expression("('a'+'b')", &mut Decisions::seeded(seed)).to_ascii_lowercase();
            let name = if out.contains("invoke-expression") { "invoke-expression" } else { "iex" };
            assert!(out.contains(name), "{out}");
            assert_eq!(invoked(&out), "ab");
            names.insert(name);
        }
        assert_eq!(names.len(), 2);
    }

    #[test]
    fn base64_wrap_is_utf16le() {
        let out = apply(Technique::Base64Wrap, "whoami", 0);
        assert_eq!(out, "powershell.exe -EncodedCommand dwBoAG8AYQBtAGkA");
        assert_eq!(decode_encoded_command(&out).unwrap(), "whoami");
    }

    #[test]
    fn decode_rejects_other_text() {
        assert_eq!(decode_encoded_command("whoami"), None);
        assert_eq!(decode_encoded_command("powershell.exe -EncodedCommand !!"), None);
    }
}

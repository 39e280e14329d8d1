//! Composable PowerShell obfuscation layers.
//!
//! - [`encoder`]: stateless string encoders whose output evaluates back to
//!   their input
//! - [`rewriter`]: token-aware rewriting of type literals and command names
//! - [`technique`] and [`recipe`]: the closed technique set and validated
//!   sequences of it
//! - [`chain`]: runs a recipe and reports the first failing layer
//!
//! All randomness comes from a caller-supplied [`Decisions`], so any output
//! can be reproduced from its seed.

pub mod chain;
pub mod encoder;
pub mod error;
pub mod eval;
pub mod lexer;
pub mod quote;
pub mod random;
pub mod recipe;
pub mod rewriter;
pub mod technique;
pub mod token;

pub use chain::{ChainComposer, ChainFailure, ChainResult, LayerFailure};
pub use encoder::ObfuscationLevel;
pub use error::{EvalError, ObfuscationError, RecipeError};
pub use lexer::PsLexer;
pub use random::Decisions;
pub use recipe::Recipe;
pub use rewriter::{RewriteContext, RewriteReport, TokenRewriter};
pub use technique::{Layer, LayerContext, LayerFamily, Technique, ERROR_MARKER};
pub use token::{Token, TokenKind, Tokenizer};

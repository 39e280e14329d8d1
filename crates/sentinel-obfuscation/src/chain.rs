//! Sequential execution of obfuscation layers.
//!
//! The composer checks the layer order first (a misplaced finisher is
//! rejected before anything runs), then feeds each layer's output into the
//! next and stops at the first layer that errors, returns nothing or returns
//! text carrying [`ERROR_MARKER`].

use crate::error::RecipeError;
use crate::lexer::PsLexer;
use crate::random::Decisions;
use crate::recipe::{check_order, Recipe};
use crate::technique::{Layer, LayerContext, ERROR_MARKER};
use crate::token::Tokenizer;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Why a single layer failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayerFailure {
    #[error("layer returned an empty result")]
    Empty,

    #[error("layer output contains the error marker")]
    ErrorMarker,

    #[error("{0}")]
    Technique(String),

    #[error("{0}")]
    Rejected(RecipeError),
}

/// A chain stopped at `index`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("layer {index} ({layer}) failed: {reason}")]
pub struct ChainFailure {
    pub index: usize,
    pub layer: String,
    pub reason: LayerFailure,
}

/// Serializable outcome of one chain run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failing_layer_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failing_layer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ChainResult {
    fn succeeded(output: String) -> Self {
        Self {
            success: true,
            output: Some(output),
            failing_layer_index: None,
            failing_layer: None,
            reason: None,
        }
    }

    fn failed(failure: &ChainFailure) -> Self {
        Self {
            success: false,
            output: None,
            failing_layer_index: Some(failure.index),
            failing_layer: Some(failure.layer.clone()),
            reason: Some(failure.reason.to_string()),
        }
    }
}

/// Runs recipes against command strings.
#[derive(Debug, Clone, Default)]
pub struct ChainComposer<T = PsLexer> {
    tokenizer: T,
}

impl ChainComposer<PsLexer> {
    pub fn new() -> Self {
        Self { tokenizer: PsLexer }
    }
}

impl<T: Tokenizer> ChainComposer<T> {
    pub fn with_tokenizer(tokenizer: T) -> Self {
        Self { tokenizer }
    }

    /// Run a validated recipe.
    pub fn compose(&self, input: &str, recipe: &Recipe, rng: &mut Decisions) -> ChainResult {
        let layers: Vec<&dyn Layer> = recipe.techniques().iter().map(|t| t as &dyn Layer).collect();
        self.run_layers(input, &layers, rng)
    }

    /// Run arbitrary layers; the order check happens here, so an unvalidated
    /// sequence is rejected the same way a bad recipe is.
    pub fn run_layers(&self, input: &str, layers: &[&dyn Layer], rng: &mut Decisions) -> ChainResult {
        match self.try_run(input, layers, rng) {
            Ok(output) => ChainResult::succeeded(output),
            Err(failure) => {
                warn!(index = failure.index, layer = %failure.layer, reason = %failure.reason, "chain aborted");
                ChainResult::failed(&failure)
            }
        }
    }

    /// Like [`run_layers`](Self::run_layers), returning the failure as an error.
    pub fn try_run(
        &self,
        input: &str,
        layers: &[&dyn Layer],
        rng: &mut Decisions,
    ) -> Result<String, ChainFailure> {
        if let Err(e) = check_order(layers.iter().map(|l| (l.family(), l.name()))) {
            let index = e.layer_index().unwrap_or(0);
            return Err(ChainFailure {
                index,
                layer: layers.get(index).map(|l| l.name()).unwrap_or_default(),
                reason: LayerFailure::Rejected(e),
            });
        }

        let mut current = input.to_string();
        for (index, layer) in layers.iter().enumerate() {
            let mut ctx = LayerContext {
                rng: &mut *rng,
                tokenizer: &self.tokenizer,
            };
            let reason = match layer.apply(&current, &mut ctx) {
                Ok(out) if out.is_empty() => LayerFailure::Empty,
                Ok(out) if out.contains(ERROR_MARKER) => LayerFailure::ErrorMarker,
                Ok(out) => {
                    debug!(index, layer = %layer.name(), len = out.len(), "layer applied");
                    current = out;
                    continue;
                }
                Err(e) => LayerFailure::Technique(e.to_string()),
            };
            return Err(ChainFailure {
                index,
                layer: layer.name(),
                reason,
            });
        }
        Ok(current)
    }
}

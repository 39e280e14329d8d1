//! Validated technique sequences.

use crate::error::RecipeError;
use crate::technique::{LayerFamily, Technique};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// An ordered technique sequence with at most one finisher, in last place.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<Technique>", into = "Vec<Technique>")]
pub struct Recipe(Vec<Technique>);

impl Recipe {
    pub fn new(techniques: Vec<Technique>) -> Result<Self, RecipeError> {
        check_order(techniques.iter().map(|t| (t.family(), t.to_string())))?;
        Ok(Self(techniques))
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn techniques(&self) -> &[Technique] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn finisher(&self) -> Option<Technique> {
        self.0.last().copied().filter(|t| t.family() == LayerFamily::Finisher)
    }
}

/// Reject any finisher that is not the final layer.
pub fn check_order(
    layers: impl IntoIterator<Item = (LayerFamily, String)>,
) -> Result<(), RecipeError> {
    let layers: Vec<_> = layers.into_iter().collect();
    let last = layers.len().saturating_sub(1);
    match layers
        .into_iter()
        .enumerate()
        .find(|(i, (family, _))| *family == LayerFamily::Finisher && *i != last)
    {
        Some((index, (_, layer))) => Err(RecipeError::FinisherNotLast { index, layer }),
        None => Ok(()),
    }
}

impl TryFrom<Vec<Technique>> for Recipe {
    type Error = RecipeError;

    fn try_from(techniques: Vec<Technique>) -> Result<Self, Self::Error> {
        Self::new(techniques)
    }
}

impl From<Recipe> for Vec<Technique> {
    fn from(recipe: Recipe) -> Self {
        recipe.0
    }
}

impl FromStr for Recipe {
    type Err = RecipeError;

    /// Comma-separated technique names; empty or `none` is the empty recipe.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("none") {
            return Ok(Self::empty());
        }
        let techniques = s
            .split(',')
            .map(str::parse)
            .collect::<Result<Vec<Technique>, _>>()?;
        Self::new(techniques)
    }
}

impl fmt::Display for Recipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("none");
        }
        let names: Vec<String> = self.0.iter().map(Technique::to_string).collect();
        f.write_str(&names.join(","))
    }
}

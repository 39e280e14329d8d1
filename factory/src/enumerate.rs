//! Candidate recipe enumeration.
//!
//! Argument-layer sequences (repetition allowed, shortest first) are crossed
//! with the finisher variants: none, CommandSplat and Base64Wrap. The first
//! recipe is always the empty one.

use crate::config::EnumerationConfig;
use anyhow::{bail, Result};
use sentinel_obfuscation::{LayerFamily, Recipe, Technique};

pub fn enumerate(config: &EnumerationConfig) -> Result<Vec<Recipe>> {
    if let Some(t) = config
        .argument_techniques
        .iter()
        .find(|t| t.family() != LayerFamily::Argument)
    {
        bail!("{t} is a finisher and cannot be an argument technique");
    }

    let finishers = [
        None,
        Some(Technique::CommandSplat(config.command_splat_level)),
        Some(Technique::Base64Wrap),
    ];

    let mut recipes = Vec::new();
    for sequence in argument_sequences(&config.argument_techniques, config.max_depth) {
        for finisher in finishers {
            let mut techniques = sequence.clone();
            techniques.extend(finisher);
            if config.limit.is_some_and(|limit| recipes.len() >= limit) {
                return Ok(recipes);
            }
            recipes.push(Recipe::new(techniques)?);
        }
    }
    Ok(recipes)
}

/// Every sequence over `techniques` of length `0..=max_depth`, by length.
fn argument_sequences(techniques: &[Technique], max_depth: usize) -> Vec<Vec<Technique>> {
    let mut all = vec![Vec::new()];
    let mut frontier: Vec<Vec<Technique>> = vec![Vec::new()];
    for _ in 0..max_depth {
        frontier = frontier
            .iter()
            .flat_map(|prefix| {
                techniques.iter().map(move |t| {
                    let mut next = prefix.clone();
                    next.push(*t);
                    next
                })
            })
            .collect();
        all.extend(frontier.iter().cloned());
    }
    all
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_obfuscation::ObfuscationLevel;

    #[test]
    fn default_counts() {
        let recipes = enumerate(&EnumerationConfig::default()).unwrap();
        // (1 + 4 + 16 + 64) argument sequences x 3 finisher variants
        assert_eq!(recipes.len(), 255);
        assert!(recipes[0].is_empty());
    }

    #[test]
    fn last_recipe_is_deepest_with_base64() {
        let recipes = enumerate(&EnumerationConfig::default()).unwrap();
        let last = recipes.last().unwrap();
        assert_eq!(last.len(), 4);
        assert_eq!(last.finisher(), Some(Technique::Base64Wrap));
        assert!(!last
            .techniques()
            .iter()
            .any(|t| matches!(t, Technique::CommandSplat(_))));
    }

    #[test]
    fn finishers_follow_each_sequence() {
        let config = EnumerationConfig {
            max_depth: 1,
            argument_techniques: vec![Technique::ConcatEncode],
            command_splat_level: ObfuscationLevel::Reorder,
            limit: None,
        };
        let names: Vec<String> = enumerate(&config).unwrap().iter().map(|r| r.to_string()).collect();
        assert_eq!(
            names,
            vec![
                "none",
                "CommandSplat:2",
                "Base64Wrap",
                "ConcatEncode",
                "ConcatEncode,CommandSplat:2",
                "ConcatEncode,Base64Wrap",
            ]
        );
    }

    #[test]
    fn limit_truncates() {
        let config = EnumerationConfig {
            limit: Some(5),
            ..EnumerationConfig::default()
        };
        assert_eq!(enumerate(&config).unwrap().len(), 5);
    }

    #[test]
    fn zero_limit_is_empty() {
        let config = EnumerationConfig {
            limit: Some(0),
            ..EnumerationConfig::default()
        };
        assert!(enumerate(&config).unwrap().is_empty());
    }

    #[test]
    fn finisher_as_argument_is_rejected() {
        let config = EnumerationConfig {
            argument_techniques: vec![Technique::Base64Wrap],
            ..EnumerationConfig::default()
        };
        assert!(enumerate(&config).is_err());
    }
}

//! Primitive library loading.
//!
//! A library file is a JSON array of primitives. Several files may be given
//! (paths or glob patterns); ids must be unique across all of them.

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, info, warn};

static PRIMITIVE_ID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^PS-\d{3}$").unwrap());

/// Log evidence a primitive is expected to leave behind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryRule {
    pub source: String,
    pub event_id: u32,
    pub details: String,
}

/// A known technique in its plain form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Primitive {
    pub primitive_id: String,
    pub primitive_command: String,
    #[serde(default)]
    pub intent: Vec<String>,
    #[serde(default)]
    pub mitre_ttps: Vec<String>,
    #[serde(default)]
    pub telemetry_rules: Vec<TelemetryRule>,
}

/// Load every usable primitive matched by `patterns`, sorted by id.
///
/// Excluded ids and primitives without telemetry rules are skipped.
pub fn load_library(patterns: &[String], exclusions: &[String]) -> Result<Vec<Primitive>> {
    let files = expand_globs(patterns)?;
    if files.is_empty() {
        bail!("no primitive library files matched: {}", patterns.join(", "));
    }

    let mut seen = HashSet::new();
    let mut library = Vec::new();
    for path in &files {
        for primitive in read_file(path)? {
            if !PRIMITIVE_ID.is_match(&primitive.primitive_id) {
                bail!(
                    "invalid primitive id {:?} in {} (expected PS-NNN)",
                    primitive.primitive_id,
                    path.display()
                );
            }
            if !seen.insert(primitive.primitive_id.clone()) {
                bail!("duplicate primitive id {} in {}", primitive.primitive_id, path.display());
            }
            if exclusions.contains(&primitive.primitive_id) {
                debug!(id = %primitive.primitive_id, "excluded");
                continue;
            }
            if primitive.telemetry_rules.is_empty() {
                debug!(id = %primitive.primitive_id, "no telemetry rules, skipped");
                continue;
            }
            library.push(primitive);
        }
    }
    library.sort_by(|a, b| a.primitive_id.cmp(&b.primitive_id));
    info!(files = files.len(), primitives = library.len(), "primitive library loaded");
    Ok(library)
}

fn read_file(path: &Path) -> Result<Vec<Primitive>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Expand paths and glob patterns into a sorted list of files.
fn expand_globs(patterns: &[String]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for pattern in patterns {
        let path = Path::new(pattern);
        if path.is_file() {
            files.push(path.to_path_buf());
            continue;
        }
        let matches: Vec<_> = glob::glob(pattern)
            .with_context(|| format!("invalid glob pattern: {}", pattern))?
            .filter_map(|r| r.ok())
            .filter(|p| p.is_file())
            .collect();
        if matches.is_empty() {
            warn!(pattern = %pattern, "no files matched");
        }
        files.extend(matches);
    }
    files.sort();
    files.dedup();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const RULE: &str = r#"[{"source": "Security", "event_id": 4688, "details": "process"}]"#;

    fn write(dir: &TempDir, name: &str, body: &str) -> String {
        let path = dir.path().join(name);
        fs::write(&path, body).unwrap();
        path.to_string_lossy().to_string()
    }

    fn entry(id: &str, command: &str, rules: &str) -> String {
        format!(
            r#"{{"primitive_id": "{id}", "primitive_command": "{command}", "intent": ["Discovery"],
                "mitre_ttps": ["T1033"], "telemetry_rules": {rules}}}"#
        )
    }

    #[test]
    fn loads_sorted_and_filters() {
        let dir = TempDir::new().unwrap();
        write(&dir, "b.json", &format!("[{}]", entry("PS-002", "hostname", RULE)));
        write(
            &dir,
            "a.json",
            &format!(
                "[{}, {}, {}]",
                entry("PS-003", "whoami", RULE),
                entry("PS-001", "Get-Date", "[]"),
                entry("PS-004", "ipconfig", RULE)
            ),
        );
        let pattern = format!("{}/*.json", dir.path().display());
        let library = load_library(&[pattern], &["PS-004".to_string()]).unwrap();
        let ids: Vec<_> = library.iter().map(|p| p.primitive_id.as_str()).collect();
        assert_eq!(ids, vec!["PS-002", "PS-003"]);
        assert_eq!(library[1].telemetry_rules[0].event_id, 4688);
    }

    #[test]
    fn rejects_bad_id() {
        let dir = TempDir::new().unwrap();
        let file = write(&dir, "lib.json", &format!("[{}]", entry("PS-12", "whoami", RULE)));
        let err = load_library(&[file], &[]).unwrap_err();
        assert!(err.to_string().contains("invalid primitive id"), "{err}");
    }

    #[test]
    fn rejects_duplicate_id_across_files() {
        let dir = TempDir::new().unwrap();
        let a = write(&dir, "a.json", &format!("[{}]", entry("PS-001", "whoami", RULE)));
        let b = write(&dir, "b.json", &format!("[{}]", entry("PS-001", "hostname", RULE)));
        let err = load_library(&[a, b], &[]).unwrap_err();
        assert!(err.to_string().contains("duplicate primitive id PS-001"), "{err}");
    }

    #[test]
    fn nothing_matched_is_an_error() {
        let dir = TempDir::new().unwrap();
        let pattern = format!("{}/*.json", dir.path().display());
        assert!(load_library(&[pattern], &[]).is_err());
    }
}

//! Append-only output files.
//!
//! Every record is one JSON line written with a single `write_all` under a
//! lock, so concurrent workers never interleave partial lines.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sentinel_obfuscation::Recipe;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

use crate::primitives::{Primitive, TelemetryRule};

pub const FAILURE_LOG: &str = "failures.jsonl";
pub const AUDIT_LOG: &str = "audit_log.jsonl";
pub const CORPUS: &str = "corpus.jsonl";
pub const TRAINING_PAIRS: &str = "training_pairs.jsonl";
pub const TELEMETRY_DIR: &str = "telemetry";

/// Hex SHA-256 of `bytes`.
pub fn fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    /// The chain aborted before anything was executed.
    Obfuscation,
    /// The sandbox rejected the command.
    Lab,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub timestamp: DateTime<Utc>,
    pub primitive_id: String,
    pub recipe: Recipe,
    pub stage: FailureStage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failing_layer_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failing_layer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broken_command: Option<String>,
    pub raw_error: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Success,
    FailureObfuscation,
    FailureLab,
    Duplicate,
}

impl AuditStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::FailureObfuscation => "failure_obfuscation",
            Self::FailureLab => "failure_lab",
            Self::Duplicate => "duplicate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub primitive_id: String,
    pub recipe: Recipe,
    pub status: AuditStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl AuditRecord {
    pub fn now(primitive_id: &str, recipe: &Recipe, status: AuditStatus, details: Option<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            primitive_id: primitive_id.to_string(),
            recipe: recipe.clone(),
            status,
            details,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorpusRecord {
    pub primitive_id: String,
    pub recipe: Recipe,
    pub obfuscated_command: String,
    pub success: bool,
    pub telemetry_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub intent: Vec<String>,
    pub mitre_ttps: Vec<String>,
    pub telemetry_signature: Vec<TelemetryRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairResponse {
    pub deobfuscated_command: String,
    pub analysis: Analysis,
}

/// Obfuscated command as the prompt, the primitive's analysis as the answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingPair {
    pub prompt: String,
    pub response: PairResponse,
}

impl TrainingPair {
    pub fn new(primitive: &Primitive, obfuscated_command: &str) -> Self {
        Self {
            prompt: obfuscated_command.to_string(),
            response: PairResponse {
                deobfuscated_command: primitive.primitive_command.clone(),
                analysis: Analysis {
                    intent: primitive.intent.clone(),
                    mitre_ttps: primitive.mitre_ttps.clone(),
                    telemetry_signature: primitive.telemetry_rules.clone(),
                },
            },
        }
    }
}

/// One append-only JSON-lines file.
pub struct JsonlLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlLog {
    pub fn open(path: PathBuf) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append<T: Serialize>(&self, record: &T) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = self
            .file
            .lock()
            .map_err(|_| anyhow::anyhow!("{} lock poisoned", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("Failed to write {}", self.path.display()))
    }
}

/// Read every record of a JSON-lines file. A missing file is empty;
/// malformed lines (e.g. a torn final line) are skipped with a warning.
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    };
    let mut records = Vec::new();
    for (number, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(record) => records.push(record),
            Err(e) => warn!(file = %path.display(), line = number + 1, error = %e, "skipping malformed record"),
        }
    }
    Ok(records)
}

/// Content-addressed telemetry documents.
pub struct TelemetryStore {
    dir: PathBuf,
}

impl TelemetryStore {
    pub fn open(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        Ok(Self { dir })
    }

    /// Persist `telemetry` and return its reference (the content hash).
    pub fn store(&self, telemetry: &Value) -> Result<String> {
        let bytes = serde_json::to_vec_pretty(telemetry)?;
        let reference = fingerprint(&bytes);
        let path = self.dir.join(format!("{reference}.json"));
        if !path.exists() {
            fs::write(&path, &bytes).with_context(|| format!("Failed to write {}", path.display()))?;
        }
        Ok(reference)
    }
}

/// All output files of one generation run.
pub struct Ledgers {
    pub failures: JsonlLog,
    pub audit: JsonlLog,
    pub corpus: JsonlLog,
    pub pairs: JsonlLog,
    pub telemetry: TelemetryStore,
}

impl Ledgers {
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
        Ok(Self {
            failures: JsonlLog::open(dir.join(FAILURE_LOG))?,
            audit: JsonlLog::open(dir.join(AUDIT_LOG))?,
            corpus: JsonlLog::open(dir.join(CORPUS))?,
            pairs: JsonlLog::open(dir.join(TRAINING_PAIRS))?,
            telemetry: TelemetryStore::open(dir.join(TELEMETRY_DIR))?,
        })
    }

    /// `(primitive_id, recipe)` jobs already recorded in the audit log.
    pub fn completed_jobs(&self) -> Result<HashSet<(String, Recipe)>> {
        Ok(read_jsonl::<AuditRecord>(self.audit.path())?
            .into_iter()
            .map(|r| (r.primitive_id, r.recipe))
            .collect())
    }

    /// Fingerprints of every command already in the corpus.
    pub fn corpus_fingerprints(&self) -> Result<HashSet<String>> {
        Ok(read_jsonl::<CorpusRecord>(self.corpus.path())?
            .iter()
            .map(|r| fingerprint(r.obfuscated_command.as_bytes()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn recipe(s: &str) -> Recipe {
        s.parse().unwrap()
    }

    #[test]
    fn fingerprint_is_sha256_hex() {
        assert_eq!(
            fingerprint(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn audit_log_round_trip_and_resume_set() {
        let dir = TempDir::new().unwrap();
        let ledgers = Ledgers::open(dir.path()).unwrap();
        ledgers
            .audit
            .append(&AuditRecord::now("PS-009", &recipe("ConcatEncode"), AuditStatus::Success, None))
            .unwrap();
        ledgers
            .audit
            .append(&AuditRecord::now(
                "PS-009",
                &recipe("TypeCast,Base64Wrap"),
                AuditStatus::FailureLab,
                Some("boom".to_string()),
            ))
            .unwrap();

        let line = fs::read_to_string(dir.path().join(AUDIT_LOG)).unwrap();
        let first: Value = serde_json::from_str(line.lines().next().unwrap()).unwrap();
        assert_eq!(first["primitive_id"], "PS-009");
        assert_eq!(first["status"], "success");
        assert_eq!(first["recipe"], serde_json::json!(["ConcatEncode"]));

        let done = ledgers.completed_jobs().unwrap();
        assert!(done.contains(&("PS-009".to_string(), recipe("TypeCast,Base64Wrap"))));
        assert_eq!(done.len(), 2);
    }

    #[test]
    fn torn_line_is_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x.jsonl");
        fs::write(&path, "{\"primitive_id\":\"PS-001\",\"recipe\":[],\"obfuscated_command\":\"a\",\"success\":true,\"telemetry_ref\":null}\n{\"prim").unwrap();
        let records: Vec<CorpusRecord> = read_jsonl(&path).unwrap();
        assert_eq!(records.len(), 1);
        assert!(read_jsonl::<CorpusRecord>(&dir.path().join("missing.jsonl")).unwrap().is_empty());
    }

    #[test]
    fn telemetry_is_content_addressed() {
        let dir = TempDir::new().unwrap();
        let store = TelemetryStore::open(dir.path().join(TELEMETRY_DIR)).unwrap();
        let a = store.store(&serde_json::json!({"events": [1, 2]})).unwrap();
        let b = store.store(&serde_json::json!({"events": [1, 2]})).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(dir.path().join(TELEMETRY_DIR).join(format!("{a}.json")).is_file());
    }

    #[test]
    fn training_pair_shape() {
        let primitive = Primitive {
            primitive_id: "PS-001".to_string(),
            primitive_command: "whoami".to_string(),
            intent: vec!["User Discovery".to_string()],
            mitre_ttps: vec!["T1033".to_string()],
            telemetry_rules: vec![TelemetryRule {
                source: "Security".to_string(),
                event_id: 4688,
                details: "whoami.exe".to_string(),
            }],
        };
        let json = serde_json::to_value(TrainingPair::new(&primitive, "&('who'+'ami')")).unwrap();
        assert_eq!(json["prompt"], "&('who'+'ami')");
        assert_eq!(json["response"]["deobfuscated_command"], "whoami");
        assert_eq!(json["response"]["analysis"]["mitre_ttps"][0], "T1033");
        assert_eq!(json["response"]["analysis"]["telemetry_signature"][0]["event_id"], 4688);
    }
}

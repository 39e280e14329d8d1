//! Summaries of a generation run, read back from its ledgers.
//!
//! Besides plain success rates, the report lists which layer transitions
//! (`previous -> failing`) break chains, which is how invalid layering
//! combinations show up in practice.

use anyhow::{bail, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write;
use std::path::Path;

use crate::ledger::{read_jsonl, AuditRecord, AuditStatus, FailureRecord, FailureStage, AUDIT_LOG, FAILURE_LOG};

const INPUT: &str = "<input>";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Tally {
    pub name: String,
    pub attempts: usize,
    pub successes: usize,
    pub success_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Count {
    pub name: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    pub attempts: usize,
    pub by_status: BTreeMap<AuditStatus, usize>,
    pub primitives: Vec<Tally>,
    pub techniques: Vec<Tally>,
    pub lab_errors: Vec<Count>,
    pub transitions: Vec<Count>,
}

#[derive(Default)]
struct Counter {
    attempts: usize,
    successes: usize,
}

impl Counter {
    fn add(&mut self, success: bool) {
        self.attempts += 1;
        self.successes += usize::from(success);
    }
}

fn tallies(counters: BTreeMap<String, Counter>) -> Vec<Tally> {
    counters
        .into_iter()
        .map(|(name, c)| Tally {
            name,
            attempts: c.attempts,
            successes: c.successes,
            success_rate: if c.attempts == 0 {
                0.0
            } else {
                c.successes as f64 / c.attempts as f64
            },
        })
        .collect()
}

/// Most frequent first, ties by name, at most `top`.
fn ranked(counts: BTreeMap<String, usize>, top: usize) -> Vec<Count> {
    let mut ranked: Vec<Count> = counts
        .into_iter()
        .map(|(name, count)| Count { name, count })
        .collect();
    ranked.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));
    ranked.truncate(top);
    ranked
}

impl Report {
    /// Build the report for the run stored in `dir`.
    pub fn build(dir: &Path, top: usize) -> Result<Self> {
        let audit_path = dir.join(AUDIT_LOG);
        if !audit_path.is_file() {
            bail!("no audit log found at {}", audit_path.display());
        }
        let audit: Vec<AuditRecord> = read_jsonl(&audit_path)?;
        let failures: Vec<FailureRecord> = read_jsonl(&dir.join(FAILURE_LOG))?;
        Ok(Self::from_records(&audit, &failures, top))
    }

    pub fn from_records(audit: &[AuditRecord], failures: &[FailureRecord], top: usize) -> Self {
        let mut by_status = BTreeMap::new();
        let mut primitives: BTreeMap<String, Counter> = BTreeMap::new();
        let mut techniques: BTreeMap<String, Counter> = BTreeMap::new();
        for record in audit {
            *by_status.entry(record.status).or_insert(0) += 1;
            // Duplicates say nothing about whether a recipe works.
            if record.status == AuditStatus::Duplicate {
                continue;
            }
            let success = record.status == AuditStatus::Success;
            primitives
                .entry(record.primitive_id.clone())
                .or_default()
                .add(success);
            let mut used: Vec<String> = record.recipe.techniques().iter().map(|t| t.to_string()).collect();
            used.sort();
            used.dedup();
            for name in used {
                techniques.entry(name).or_default().add(success);
            }
        }

        let mut lab_errors: BTreeMap<String, usize> = BTreeMap::new();
        let mut transitions: BTreeMap<String, usize> = BTreeMap::new();
        for failure in failures {
            match failure.stage {
                FailureStage::Lab => {
                    let first_line = failure.raw_error.lines().next().unwrap_or_default();
                    *lab_errors.entry(first_line.to_string()).or_insert(0) += 1;
                }
                FailureStage::Obfuscation => {
                    let Some(index) = failure.failing_layer_index else {
                        continue;
                    };
                    let layers = failure.recipe.techniques();
                    let previous = match index.checked_sub(1).and_then(|i| layers.get(i)) {
                        Some(t) => t.to_string(),
                        None => INPUT.to_string(),
                    };
                    let failing = failure
                        .failing_layer
                        .clone()
                        .or_else(|| layers.get(index).map(|t| t.to_string()))
                        .unwrap_or_default();
                    *transitions.entry(format!("{previous} -> {failing}")).or_insert(0) += 1;
                }
            }
        }

        Self {
            attempts: audit.len(),
            by_status,
            primitives: tallies(primitives),
            techniques: tallies(techniques),
            lab_errors: ranked(lab_errors, top),
            transitions: ranked(transitions, top),
        }
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Attempts: {}", self.attempts);
        for (status, count) in &self.by_status {
            let _ = writeln!(out, "  {:<20} {count}", status.as_str());
        }

        for (title, rows) in [("Primitives", &self.primitives), ("Techniques", &self.techniques)] {
            let _ = writeln!(out, "\n{title}:");
            for row in rows {
                let _ = writeln!(
                    out,
                    "  {:<20} {:>5}/{:<5} {:>6.1}%",
                    row.name,
                    row.successes,
                    row.attempts,
                    row.success_rate * 100.0
                );
            }
        }

        for (title, rows) in [
            ("Top lab errors", &self.lab_errors),
            ("Failing transitions", &self.transitions),
        ] {
            let _ = writeln!(out, "\n{title}:");
            if rows.is_empty() {
                let _ = writeln!(out, "  (none)");
            }
            for row in rows {
                let _ = writeln!(out, "  {:>5}  {}", row.count, row.name);
            }
        }
        out
    }
}

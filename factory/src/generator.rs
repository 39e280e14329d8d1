//! Corpus generation.
//!
//! Every `(primitive, recipe)` pair is a job. A job runs the recipe through
//! the chain composer, submits the result to the sandbox and appends the
//! outcome to the ledgers. Jobs already in the audit log are skipped, so an
//! interrupted run picks up where it stopped.

use anyhow::{anyhow, Result};
use chrono::Utc;
use sentinel_obfuscation::{ChainComposer, Decisions, Recipe};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use tracing::{debug, info, warn};

use crate::ledger::{
    fingerprint, AuditRecord, AuditStatus, CorpusRecord, FailureRecord, FailureStage, Ledgers,
    TrainingPair,
};
use crate::primitives::Primitive;
use crate::sandbox::{Sandbox, SandboxError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerateOptions {
    pub workers: usize,
    pub seed: u64,
    pub target_pairs: Option<usize>,
}

/// Counts for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub jobs: usize,
    /// Skipped because the audit log already has them.
    pub resumed: usize,
    pub success: usize,
    pub failure_obfuscation: usize,
    pub failure_lab: usize,
    pub duplicate: usize,
    /// Left over once the target count was reached.
    pub not_run: usize,
}

impl Summary {
    fn count(&mut self, status: AuditStatus) {
        match status {
            AuditStatus::Success => self.success += 1,
            AuditStatus::FailureObfuscation => self.failure_obfuscation += 1,
            AuditStatus::FailureLab => self.failure_lab += 1,
            AuditStatus::Duplicate => self.duplicate += 1,
        }
    }

    fn processed(&self) -> usize {
        self.success + self.failure_obfuscation + self.failure_lab + self.duplicate
    }
}

struct Job<'a> {
    /// Position in enumeration order; seeds the job's decisions.
    index: u64,
    primitive: &'a Primitive,
    recipe: &'a Recipe,
}

struct Progress {
    successes: usize,
    seen: HashSet<String>,
}

pub struct CorpusGenerator<'a> {
    sandbox: &'a dyn Sandbox,
    ledgers: &'a Ledgers,
    composer: ChainComposer,
    options: GenerateOptions,
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex.lock().map_err(|_| anyhow!("generator state poisoned"))
}

impl<'a> CorpusGenerator<'a> {
    pub fn new(sandbox: &'a dyn Sandbox, ledgers: &'a Ledgers, options: GenerateOptions) -> Self {
        Self {
            sandbox,
            ledgers,
            composer: ChainComposer::new(),
            options,
        }
    }

    pub fn run(&self, library: &[Primitive], recipes: &[Recipe]) -> Result<Summary> {
        let completed = self.ledgers.completed_jobs()?;
        let seen = self.ledgers.corpus_fingerprints()?;

        let mut summary = Summary::default();
        let mut jobs = Vec::new();
        for (p, primitive) in library.iter().enumerate() {
            for (r, recipe) in recipes.iter().enumerate() {
                summary.jobs += 1;
                if completed.contains(&(primitive.primitive_id.clone(), recipe.clone())) {
                    summary.resumed += 1;
                    continue;
                }
                jobs.push(Job {
                    index: (p * recipes.len() + r) as u64,
                    primitive,
                    recipe,
                });
            }
        }
        Decisions::seeded(self.options.seed).shuffle(&mut jobs);

        let stop = AtomicBool::new(self.target_reached(seen.len()));
        if stop.load(Ordering::Relaxed) {
            info!(existing = seen.len(), "target already reached, nothing to do");
        }
        info!(
            seed = self.options.seed,
            sandbox = self.sandbox.name(),
            pending = jobs.len(),
            resumed = summary.resumed,
            "generation started"
        );

        let progress = Mutex::new(Progress {
            successes: seen.len(),
            seen,
        });
        let counts = Mutex::new(summary);
        let cursor = AtomicUsize::new(0);
        let workers = self.options.workers.clamp(1, jobs.len().max(1));

        thread::scope(|scope| -> Result<()> {
            let mut handles = Vec::with_capacity(workers);
            for _ in 0..workers {
                handles.push(scope.spawn(|| {
                    let result = self.work(&jobs, &cursor, &stop, &progress, &counts);
                    if result.is_err() {
                        stop.store(true, Ordering::Relaxed);
                    }
                    result
                }));
            }
            for handle in handles {
                handle
                    .join()
                    .map_err(|_| anyhow!("generator worker panicked"))??;
            }
            Ok(())
        })?;

        let mut summary = counts
            .into_inner()
            .map_err(|_| anyhow!("generator state poisoned"))?;
        summary.not_run = jobs.len() - summary.processed();
        info!(
            success = summary.success,
            failure_obfuscation = summary.failure_obfuscation,
            failure_lab = summary.failure_lab,
            duplicate = summary.duplicate,
            not_run = summary.not_run,
            "generation finished"
        );
        Ok(summary)
    }

    fn target_reached(&self, successes: usize) -> bool {
        self.options.target_pairs.is_some_and(|target| successes >= target)
    }

    fn work(
        &self,
        jobs: &[Job<'_>],
        cursor: &AtomicUsize,
        stop: &AtomicBool,
        progress: &Mutex<Progress>,
        counts: &Mutex<Summary>,
    ) -> Result<()> {
        while !stop.load(Ordering::Relaxed) {
            let Some(job) = jobs.get(cursor.fetch_add(1, Ordering::Relaxed)) else {
                break;
            };
            if let Some(status) = self.process(job, stop, progress)? {
                lock(counts)?.count(status);
            }
        }
        Ok(())
    }

    /// Run one job. `None` means it was dropped because the target was hit.
    fn process(
        &self,
        job: &Job<'_>,
        stop: &AtomicBool,
        progress: &Mutex<Progress>,
    ) -> Result<Option<AuditStatus>> {
        let primitive = job.primitive;
        let mut rng = Decisions::for_job(self.options.seed, job.index);
        let result = self
            .composer
            .compose(&primitive.primitive_command, job.recipe, &mut rng);

        if !result.success {
            let reason = result.reason.unwrap_or_default();
            self.ledgers.failures.append(&FailureRecord {
                timestamp: Utc::now(),
                primitive_id: primitive.primitive_id.clone(),
                recipe: job.recipe.clone(),
                stage: FailureStage::Obfuscation,
                failing_layer_index: result.failing_layer_index,
                failing_layer: result.failing_layer,
                broken_command: None,
                raw_error: reason.clone(),
            })?;
            return self.audit(job, AuditStatus::FailureObfuscation, Some(reason));
        }
        let command = result.output.unwrap_or_default();
        let digest = fingerprint(command.as_bytes());

        if lock(progress)?.seen.contains(&digest) {
            debug!(id = %primitive.primitive_id, recipe = %job.recipe, "duplicate command");
            return self.audit(job, AuditStatus::Duplicate, Some(digest));
        }
        if stop.load(Ordering::Relaxed) {
            return Ok(None);
        }

        let execution = match self.sandbox.execute(&command) {
            Ok(execution) => execution,
            // The lab itself is gone; recording the job would mark it done.
            Err(e @ SandboxError::Fatal(_)) => {
                stop.store(true, Ordering::Relaxed);
                return Err(anyhow::Error::new(e).context(format!(
                    "{} sandbox failed on {} [{}]",
                    self.sandbox.name(),
                    primitive.primitive_id,
                    job.recipe
                )));
            }
            Err(e) => {
                warn!(id = %primitive.primitive_id, recipe = %job.recipe, error = %e, "sandbox rejected command");
                self.ledgers.failures.append(&FailureRecord {
                    timestamp: Utc::now(),
                    primitive_id: primitive.primitive_id.clone(),
                    recipe: job.recipe.clone(),
                    stage: FailureStage::Lab,
                    failing_layer_index: None,
                    failing_layer: None,
                    broken_command: Some(command),
                    raw_error: e.to_string(),
                })?;
                return self.audit(job, AuditStatus::FailureLab, Some(e.to_string()));
            }
        };
        let mut progress = lock(progress)?;
        if self.target_reached(progress.successes) {
            stop.store(true, Ordering::Relaxed);
            return Ok(None);
        }
        if !progress.seen.insert(digest.clone()) {
            drop(progress);
            return self.audit(job, AuditStatus::Duplicate, Some(digest));
        }
        let telemetry_ref = execution
            .telemetry
            .as_ref()
            .map(|telemetry| self.ledgers.telemetry.store(telemetry))
            .transpose()?;
        progress.successes += 1;
        if self.target_reached(progress.successes) {
            stop.store(true, Ordering::Relaxed);
        }

        self.ledgers.corpus.append(&CorpusRecord {
            primitive_id: primitive.primitive_id.clone(),
            recipe: job.recipe.clone(),
            obfuscated_command: command.clone(),
            success: true,
            telemetry_ref,
        })?;
        self.ledgers.pairs.append(&TrainingPair::new(primitive, &command))?;
        debug!(id = %primitive.primitive_id, recipe = %job.recipe, "pair recorded");
        self.audit(job, AuditStatus::Success, None)
    }

    fn audit(
        &self,
        job: &Job<'_>,
        status: AuditStatus,
        details: Option<String>,
    ) -> Result<Option<AuditStatus>> {
        self.ledgers.audit.append(&AuditRecord::now(
            &job.primitive.primitive_id,
            job.recipe,
            status,
            details,
        ))?;
        Ok(Some(status))
    }
}

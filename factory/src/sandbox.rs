//! Execution sandbox clients.
//!
//! A sandbox runs one obfuscated command and reports success plus whatever
//! telemetry it captured. Implementations are picked by [`create_sandbox`].

use crate::config::{RetryConfig, SandboxConfig};
use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use std::io::Read;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Error)]
pub enum SandboxError {
    /// Worth retrying: connection resets, 5xx responses.
    #[error("transient sandbox error: {0}")]
    Transient(String),

    #[error("execution timed out after {0:?}")]
    Timeout(Duration),

    /// The command ran and failed.
    #[error("execution failed: {0}")]
    Rejected(String),

    /// The sandbox itself is unusable.
    #[error("sandbox unavailable: {0}")]
    Fatal(String),
}

/// Result of a successful execution.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Execution {
    pub telemetry: Option<Value>,
}

pub trait Sandbox: Send + Sync {
    fn name(&self) -> &str;
    fn execute(&self, command: &str) -> Result<Execution, SandboxError>;
}

/// Build the configured sandbox, wrapped in the retry policy.
pub fn create_sandbox(config: &SandboxConfig, retry: &RetryConfig) -> Result<Box<dyn Sandbox>> {
    let inner: Box<dyn Sandbox> = match config {
        SandboxConfig::DryRun => Box::new(DryRun),
        SandboxConfig::Process {
            program,
            args,
            timeout_secs,
        } => Box::new(ProcessSandbox {
            program: program.clone(),
            args: args.clone(),
            timeout: Duration::from_secs(*timeout_secs),
        }),
        SandboxConfig::Http {
            url,
            token_env,
            timeout_secs,
        } => Box::new(HttpSandbox::new(url, token_env, Duration::from_secs(*timeout_secs))?),
    };
    Ok(Box::new(Retrying {
        inner,
        attempts: retry.attempts.max(1),
        backoff: retry.backoff(),
    }))
}

/// Accepts every command; no telemetry.
pub struct DryRun;

impl Sandbox for DryRun {
    fn name(&self) -> &str {
        "dry-run"
    }

    fn execute(&self, _command: &str) -> Result<Execution, SandboxError> {
        Ok(Execution::default())
    }
}

/// Runs the command through a local interpreter, e.g.
/// `pwsh -NoProfile -NonInteractive -Command <command>`.
///
/// Success is exit status 0 with nothing on stderr.
pub struct ProcessSandbox {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl Sandbox for ProcessSandbox {
    fn name(&self) -> &str {
        "process"
    }

    fn execute(&self, command: &str) -> Result<Execution, SandboxError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SandboxError::Fatal(format!("failed to spawn {}: {e}", self.program)))?;

        // Drain both pipes concurrently so a chatty child cannot block.
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let started = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if started.elapsed() >= self.timeout => {
                    // Already-exited races are harmless here.
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(SandboxError::Timeout(self.timeout));
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(e) => return Err(SandboxError::Fatal(format!("wait failed: {e}"))),
            }
        };

        let stdout = stdout.map(join_output).transpose()?.unwrap_or_default();
        let stderr = stderr.map(join_output).transpose()?.unwrap_or_default();
        if !status.success() || !stderr.trim().is_empty() {
            let detail = if stderr.trim().is_empty() {
                format!("exit status {}", status.code().unwrap_or(-1))
            } else {
                stderr.trim().to_string()
            };
            return Err(SandboxError::Rejected(detail));
        }
        Ok(Execution {
            telemetry: Some(json!({
                "stdout": stdout,
                "stderr": stderr,
                "return_code": status.code().unwrap_or(0),
            })),
        })
    }
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<std::io::Result<String>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        pipe.read_to_end(&mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    })
}

/// Partial output is never passed on as telemetry.
fn join_output(handle: thread::JoinHandle<std::io::Result<String>>) -> Result<String, SandboxError> {
    match handle.join() {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(SandboxError::Fatal(format!("failed to read child output: {e}"))),
        Err(_) => Err(SandboxError::Fatal("output reader panicked".to_string())),
    }
}

/// POSTs `{"command": ...}` to a lab endpoint.
///
/// The endpoint answers `{"success": bool, "telemetry"?: any, "error"?: string}`.
pub struct HttpSandbox {
    url: String,
    token: Option<String>,
    agent: ureq::Agent,
    timeout: Duration,
}

#[derive(Deserialize)]
struct LabReply {
    success: bool,
    #[serde(default)]
    telemetry: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

impl HttpSandbox {
    pub fn new(url: &str, token_env: &str, timeout: Duration) -> Result<Self> {
        let parsed: Option<&str> = url.split_once("://").map(|(scheme, _)| scheme);
        if !matches!(parsed, Some("http" | "https")) {
            anyhow::bail!("invalid lab URL: {url}");
        }
        let token = std::env::var(token_env).ok().filter(|t| !t.is_empty());
        if token.is_none() {
            warn!(variable = %token_env, "no lab token set, sending unauthenticated requests");
        }
        Ok(Self {
            url: url.to_string(),
            token,
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
            timeout,
        })
    }
}

impl Sandbox for HttpSandbox {
    fn name(&self) -> &str {
        "http"
    }

    fn execute(&self, command: &str) -> Result<Execution, SandboxError> {
        let mut request = self.agent.post(&self.url);
        if let Some(token) = &self.token {
            request = request.set("Authorization", &format!("Bearer {token}"));
        }
        let response = match request.send_json(json!({ "command": command })) {
            Ok(response) => response,
            Err(ureq::Error::Status(code, response)) => {
                let body = response.into_string().unwrap_or_default();
                let detail = format!("HTTP {code}: {}", body.trim());
                return Err(if code >= 500 {
                    SandboxError::Transient(detail)
                } else {
                    SandboxError::Fatal(detail)
                });
            }
            Err(ureq::Error::Transport(transport)) => {
                let message = transport.to_string();
                return Err(if message.contains("timed out") {
                    SandboxError::Timeout(self.timeout)
                } else {
                    SandboxError::Transient(message)
                });
            }
        };
        let reply: LabReply = response
            .into_json()
            .map_err(|e| SandboxError::Fatal(format!("malformed lab reply: {e}")))?;
        if reply.success {
            Ok(Execution {
                telemetry: reply.telemetry,
            })
        } else {
            Err(SandboxError::Rejected(
                reply.error.unwrap_or_else(|| "lab reported failure".to_string()),
            ))
        }
    }
}

/// Retries [`SandboxError::Transient`] with linear backoff. Timeouts and
/// rejections are final.
pub struct Retrying {
    inner: Box<dyn Sandbox>,
    attempts: u32,
    backoff: Duration,
}

impl Sandbox for Retrying {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn execute(&self, command: &str) -> Result<Execution, SandboxError> {
        let mut attempt = 1;
        loop {
            match self.inner.execute(command) {
                Err(SandboxError::Transient(detail)) if attempt < self.attempts => {
                    debug!(attempt, %detail, "transient sandbox error, retrying");
                    thread::sleep(self.backoff * attempt);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

/// Checks the sandbox answers before a long run starts.
pub fn probe(sandbox: &dyn Sandbox) -> Result<()> {
    match sandbox.execute("Write-Output 'sentinel-probe'") {
        Ok(_) | Err(SandboxError::Rejected(_)) => Ok(()),
        Err(e) => Err(e).with_context(|| format!("{} sandbox is not usable", sandbox.name())),
    }
}

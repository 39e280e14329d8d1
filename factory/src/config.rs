//! Factory configuration: an optional JSON file, overridden by CLI flags.
//!
//! Secrets never live here; the HTTP sandbox reads its bearer token from
//! the environment variable named by `token_env`.

use anyhow::{Context, Result};
use sentinel_obfuscation::{ObfuscationLevel, Technique};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FactoryConfig {
    /// Primitive library files (glob patterns or paths).
    pub primitives: Vec<String>,
    pub output_dir: PathBuf,
    /// Primitive ids never used.
    pub exclusions: Vec<String>,
    pub enumeration: EnumerationConfig,
    pub sandbox: SandboxConfig,
    pub retry: RetryConfig,
    pub workers: usize,
    /// Base seed; a random one is drawn and logged when absent.
    pub seed: Option<u64>,
    /// Stop once this many successful pairs exist.
    pub target_pairs: Option<usize>,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            primitives: vec!["data/primitives/*.json".to_string()],
            output_dir: PathBuf::from("data/generated"),
            exclusions: Vec::new(),
            enumeration: EnumerationConfig::default(),
            sandbox: SandboxConfig::default(),
            retry: RetryConfig::default(),
            workers: 4,
            seed: None,
            target_pairs: None,
        }
    }
}

impl FactoryConfig {
    /// Read `path`, or return the defaults when no file is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))
    }
}

/// Which recipes are enumerated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EnumerationConfig {
    /// Longest argument-layer sequence.
    pub max_depth: usize,
    pub argument_techniques: Vec<Technique>,
    pub command_splat_level: ObfuscationLevel,
    /// Cap on the number of recipes, in enumeration order.
    pub limit: Option<usize>,
}

impl Default for EnumerationConfig {
    fn default() -> Self {
        Self {
            max_depth: 3,
            argument_techniques: Technique::argument_techniques().collect(),
            command_splat_level: ObfuscationLevel::Concatenate,
            limit: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case", deny_unknown_fields)]
pub enum SandboxConfig {
    DryRun,
    Process {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default = "default_timeout_secs")]
        timeout_secs: u64,
    },
    Http {
        url: String,
        #[serde(default = "default_token_env")]
        token_env: String,
        #[serde(default = "default_timeout_secs")]
        timeout_secs: u64,
    },
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self::DryRun
    }
}

impl SandboxConfig {
    pub fn default_process() -> Self {
        Self::Process {
            program: "pwsh".to_string(),
            args: ["-NoProfile", "-NonInteractive", "-Command"]
                .map(String::from)
                .to_vec(),
            timeout_secs: default_timeout_secs(),
        }
    }

    pub fn default_http() -> Self {
        Self::Http {
            url: "http://127.0.0.1:8080/execute".to_string(),
            token_env: default_token_env(),
            timeout_secs: default_timeout_secs(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::DryRun => "dry-run",
            Self::Process { .. } => "process",
            Self::Http { .. } => "http",
        }
    }
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_token_env() -> String {
    "SENTINEL_LAB_TOKEN".to_string()
}

/// Retries for transient sandbox errors, with linear backoff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_ms: 500,
        }
    }
}

impl RetryConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

//! Obfuscated PowerShell corpus generator.
//!
//! Subcommands:
//!
//! - **generate**: run every candidate recipe against every primitive,
//!   execute the results in a sandbox and append outcomes to the ledgers
//! - **obfuscate**: apply one recipe to one command
//! - **recipes**: list the candidate recipes
//! - **report**: summarize the ledgers of a previous run
//!
//! Logs go to stderr; stdout carries only command output.

mod config;
mod enumerate;
mod generator;
mod ledger;
mod primitives;
mod report;
mod sandbox;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use config::{FactoryConfig, SandboxConfig};
use generator::{CorpusGenerator, GenerateOptions};
use ledger::Ledgers;
use report::Report;
use sentinel_obfuscation::{ChainComposer, Decisions, Recipe};
use std::io::Read;
use std::path::PathBuf;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(
    name = "sentinel-factory",
    version,
    about = "Generate and validate obfuscated PowerShell command corpora"
)]
struct Cli {
    /// JSON config file; flags override its values
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log filter, e.g. "debug" (default: $RUST_LOG, then "info")
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every recipe against every primitive and record the outcomes
    Generate(GenerateArgs),

    /// Apply one recipe to one command
    Obfuscate {
        /// Comma-separated techniques, e.g. "TypeCast,ConcatEncode,CommandSplat:2"
        #[arg(short, long)]
        recipe: Recipe,

        /// Seed for reproducible output
        #[arg(long)]
        seed: Option<u64>,

        /// Print the full chain result as JSON
        #[arg(long)]
        json: bool,

        /// Command to obfuscate (read from stdin when omitted)
        command: Option<String>,
    },

    /// List the candidate recipes
    Recipes {
        /// Longest argument-layer sequence
        #[arg(long)]
        max_depth: Option<usize>,

        /// Print only the number of recipes
        #[arg(long)]
        count: bool,
    },

    /// Summarize the ledgers of a generation run
    Report {
        /// Run directory (default: the configured output directory)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,

        /// Rows in the ranked sections
        #[arg(long, default_value_t = 10)]
        top: usize,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SandboxKind {
    DryRun,
    Process,
    Http,
}

#[derive(Args)]
struct GenerateArgs {
    /// Primitive library files or glob patterns (repeatable)
    #[arg(short, long)]
    primitives: Vec<String>,

    /// Output directory for the ledgers
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Worker threads
    #[arg(short, long)]
    workers: Option<usize>,

    /// Base seed (random and logged when omitted)
    #[arg(long)]
    seed: Option<u64>,

    /// Stop after this many successful pairs
    #[arg(short = 'n', long)]
    target: Option<usize>,

    /// Sandbox backend; the config file's settings apply when the kind matches
    #[arg(long, value_enum)]
    sandbox: Option<SandboxKind>,

    /// Longest argument-layer sequence
    #[arg(long)]
    max_depth: Option<usize>,

    /// Cap on the number of recipes
    #[arg(long)]
    limit: Option<usize>,
}

impl GenerateArgs {
    fn apply(self, config: &mut FactoryConfig) {
        if !self.primitives.is_empty() {
            config.primitives = self.primitives;
        }
        if let Some(output) = self.output {
            config.output_dir = output;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        if self.target.is_some() {
            config.target_pairs = self.target;
        }
        if let Some(max_depth) = self.max_depth {
            config.enumeration.max_depth = max_depth;
        }
        if self.limit.is_some() {
            config.enumeration.limit = self.limit;
        }
        if let Some(kind) = self.sandbox {
            let wanted = match kind {
                SandboxKind::DryRun => SandboxConfig::DryRun,
                SandboxKind::Process => SandboxConfig::default_process(),
                SandboxKind::Http => SandboxConfig::default_http(),
            };
            if wanted.kind() != config.sandbox.kind() {
                config.sandbox = wanted;
            }
        }
    }
}

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).without_time())
        .init();
}

fn generate(mut config: FactoryConfig, args: GenerateArgs) -> Result<()> {
    args.apply(&mut config);

    let library = primitives::load_library(&config.primitives, &config.exclusions)?;
    if library.is_empty() {
        bail!("no usable primitives (all excluded or without telemetry rules)");
    }
    let recipes = enumerate::enumerate(&config.enumeration)?;
    let sandbox = sandbox::create_sandbox(&config.sandbox, &config.retry)?;
    if config.sandbox != SandboxConfig::DryRun {
        sandbox::probe(sandbox.as_ref())?;
    }
    let ledgers = Ledgers::open(&config.output_dir)?;

    let options = GenerateOptions {
        workers: config.workers,
        seed: config.seed.unwrap_or_else(rand::random),
        target_pairs: config.target_pairs,
    };
    let summary = CorpusGenerator::new(sandbox.as_ref(), &ledgers, options).run(&library, &recipes)?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn obfuscate(recipe: &Recipe, seed: Option<u64>, json: bool, command: Option<String>) -> Result<()> {
    let input = match command {
        Some(command) => command,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("Failed to read stdin")?;
            buf.trim_end_matches(['\r', '\n']).to_string()
        }
    };
    if input.trim().is_empty() {
        bail!("nothing to obfuscate");
    }

    let mut rng = seed.map_or_else(Decisions::from_entropy, Decisions::seeded);
    let result = ChainComposer::new().compose(&input, recipe, &mut rng);
    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else if let Some(output) = &result.output {
        println!("{output}");
    }
    if !result.success {
        bail!(
            "layer {} ({}) failed: {}",
            result.failing_layer_index.unwrap_or_default(),
            result.failing_layer.unwrap_or_default(),
            result.reason.unwrap_or_default()
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());
    let mut config = FactoryConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Generate(args) => generate(config, args),
        Commands::Obfuscate {
            recipe,
            seed,
            json,
            command,
        } => obfuscate(&recipe, seed, json, command),
        Commands::Recipes { max_depth, count } => {
            if let Some(max_depth) = max_depth {
                config.enumeration.max_depth = max_depth;
            }
            let recipes = enumerate::enumerate(&config.enumeration)?;
            if count {
                println!("{}", recipes.len());
            } else {
                for recipe in &recipes {
                    println!("{recipe}");
                }
            }
            Ok(())
        }
        Commands::Report { output, json, top } => {
            let dir = output.unwrap_or(config.output_dir);
            let report = Report::build(&dir, top)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", report.render_text());
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("sentinel-factory").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn generate_flags_override_config() {
        let Commands::Generate(args) = parse(&["generate", "-p", "a.json", "-p", "b/*.json", "-n", "5", "--max-depth", "1"]).command else {
            panic!("expected generate");
        };
        let mut config = FactoryConfig::default();
        args.apply(&mut config);
        assert_eq!(config.primitives, vec!["a.json", "b/*.json"]);
        assert_eq!(config.target_pairs, Some(5));
        assert_eq!(config.enumeration.max_depth, 1);
        assert_eq!(config.workers, 4);
    }

    #[test]
    fn sandbox_flag_keeps_matching_config() {
        let custom = SandboxConfig::Process {
            program: "powershell".to_string(),
            args: vec!["-Command".to_string()],
            timeout_secs: 5,
        };
        let mut config = FactoryConfig {
            sandbox: custom.clone(),
            ..FactoryConfig::default()
        };
        let Commands::Generate(args) = parse(&["generate", "--sandbox", "process"]).command else {
            panic!("expected generate");
        };
        args.apply(&mut config);
        assert_eq!(config.sandbox, custom);

        let Commands::Generate(args) = parse(&["generate", "--sandbox", "http"]).command else {
            panic!("expected generate");
        };
        args.apply(&mut config);
        assert_eq!(config.sandbox, SandboxConfig::default_http());
    }

    #[test]
    fn misplaced_finisher_is_a_parse_error() {
        let err = Cli::try_parse_from(["sentinel-factory", "obfuscate", "-r", "Base64Wrap,TypeCast", "x"])
            .err()
            .unwrap();
        assert!(err.to_string().contains("must be the last layer"), "{err}");
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = parse(&["recipes", "--count", "--log-level", "debug", "-c", "f.json"]);
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert_eq!(cli.config, Some(PathBuf::from("f.json")));
    }
}

//! `flowctl` CLI entry-point.
//!
//! Available sub-commands:
//! - `validate`: validate a workflow JSON file and print its execution order.
//! - `run`: dry-run a workflow against an echoing registry, printing
//!   every run event as a JSON line.

mod dry_run;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;

use engine::{EngineConfig, ExecutionMode, RunRequest, RunScheduler, WorkflowDefinition};
use store::{MemoryStore, RunStatus};

use crate::dry_run::EchoRegistry;

#[derive(Parser)]
#[command(name = "flowctl", about = "Validate and dry-run workflow definitions", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a workflow definition JSON file.
    Validate {
        /// Path to the workflow JSON file.
        path: PathBuf,
    },
    /// Execute a workflow against a registry that echoes its parameters.
    Run {
        /// Path to the workflow JSON file.
        path: PathBuf,
        /// Run variable; the value is parsed as JSON, falling back to a string.
        #[arg(long = "var", value_name = "KEY=VALUE", value_parser = parse_var)]
        vars: Vec<(String, Value)>,
        /// Engine configuration (TOML).
        #[arg(long, env = "FLOWCTL_CONFIG")]
        config: Option<PathBuf>,
        /// Overrides `max_in_flight` from the configuration file.
        #[arg(long, env = "FLOWCTL_MAX_IN_FLIGHT")]
        max_in_flight: Option<usize>,
        #[arg(long, value_enum, default_value_t = Mode::Full)]
        mode: Mode,
        /// Target node for `up-to` and `single` modes.
        #[arg(long, required_if_eq_any = [("mode", "up-to"), ("mode", "single")])]
        target: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Full,
    UpTo,
    Single,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Validate { path } => {
            let definition = load_definition(&path)?;
            match engine::validate_dag(&definition) {
                Ok(order) => {
                    println!("✅ Workflow is valid. Execution order: {order:?}");
                }
                Err(e) => {
                    eprintln!("❌ Validation failed: {e}");
                    std::process::exit(1);
                }
            }
        }
        Command::Run {
            path,
            vars,
            config,
            max_in_flight,
            mode,
            target,
        } => {
            let definition = Arc::new(load_definition(&path)?);
            let mut config = load_config(config.as_deref())?;
            if let Some(n) = max_in_flight {
                config.max_in_flight = n;
            }

            let mut request = RunRequest::default().with_mode(execution_mode(mode, target)?);
            for (key, value) in vars {
                request = request.with_variable(key, value);
            }

            let scheduler = RunScheduler::new(Arc::new(EchoRegistry), Arc::new(MemoryStore::new()), config);
            let prepared = scheduler.prepare(definition, request).await?;
            let mut events = prepared.subscribe();
            let printer = tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    match serde_json::to_string(&event) {
                        Ok(line) => println!("{line}"),
                        Err(e) => eprintln!("cannot encode event: {e}"),
                    }
                }
            });

            let handle = prepared.start().await?;
            let cancel = handle.cancellation_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("interrupt received, cancelling run");
                    cancel.cancel();
                }
            });

            let summary = handle.wait().await?;
            printer.await.context("event printer task failed")?;

            if summary.run.status != RunStatus::Succeeded {
                bail!("run {} finished as {}", summary.run.id, summary.run.status);
            }
        }
    }

    Ok(())
}

fn load_definition(path: &Path) -> anyhow::Result<WorkflowDefinition> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("cannot read file {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("invalid workflow JSON in {}", path.display()))
}

fn load_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig::default());
    };
    let content =
        std::fs::read_to_string(path).with_context(|| format!("cannot read config {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("invalid engine config in {}", path.display()))
}

fn execution_mode(mode: Mode, target: Option<String>) -> anyhow::Result<ExecutionMode> {
    Ok(match (mode, target) {
        (Mode::Full, _) => ExecutionMode::Full,
        (Mode::UpTo, Some(node_id)) => ExecutionMode::UpTo { node_id },
        (Mode::Single, Some(node_id)) => ExecutionMode::Single { node_id },
        (_, None) => bail!("--target is required for this mode"),
    })
}

fn parse_var(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    if key.is_empty() {
        return Err(format!("empty variable name in '{raw}'"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_owned()));
    Ok((key.to_owned(), value))
}

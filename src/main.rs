//! `warmfork-agent`: worker agent binary.
//!
//! Started by a coordinator with the master descriptor in
//! `WARMFORK_MASTER_FD`. Boots the given identifier (default `boot`) using
//! the actions of the configuration file, then serves fork requests.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use warmfork::agent::WorkerAgent;
use warmfork::channel::ControlChannel;
use warmfork::plan::command::CommandPlan;
use warmfork::{AgentConfig, AgentError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "warmfork-agent", about = "Preloading worker agent", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Identifier to boot; defaults to the configured `default_identifier`.
    identifier: Option<String>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    let config = match &args.config {
        Some(path) => AgentConfig::load_from_path(path)?,
        None => AgentConfig::default(),
    };
    let identifier = config.initial_identifier(args.identifier.as_deref())?;
    let master = ControlChannel::from_inherited_fd(config.master_fd()?)?;

    info!(%identifier, config = %config.source_label(), "warmfork agent starting");

    let config = Arc::new(config);
    let plan = CommandPlan::new(Arc::clone(&config));
    WorkerAgent::new(plan, master, &config).go(identifier)
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AgentError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AgentError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # rulefleet CLI
//!
//! The `rulefleet` binary runs the orchestration daemon and talks to it.
//!
//! ## Architecture
//!
//! - **Daemon mode**: `rulefleet --daemon` hosts the HTTP API, the registry
//!   and the background reconciliation sweep
//! - **CLI mode**: every other command delegates to a running daemon over HTTP
//! - **Detection**: PID file + HTTP health check
//!
//! ## Commands
//!
//! - `rulefleet container list|show|history|delete|resolve` - Registry operations
//! - `rulefleet deploy` - Push a rule artifact
//! - `rulefleet evaluate` - Run facts through a tenant's rule set
//! - `rulefleet reconcile` - Run one reconciliation sweep
//! - `rulefleet config show|validate|generate` - Configuration management
//! - `rulefleet update` - Apply registry migrations

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use tracing::info;

use rulefleet::commands::{self, ConfigCommand, ContainerCommand, DeployArgs, EvaluateArgs, UpdateCommand};
use rulefleet::daemon::{self, server::BindOptions, DEFAULT_PORT};
use rulefleet_core::domain::node_config::FleetConfigManifest;

/// rulefleet - per-tenant rule environment orchestration
#[derive(Parser)]
#[command(name = "rulefleet")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Run as daemon service
    #[arg(long, global = true)]
    daemon: bool,

    /// Path to configuration file (overrides discovery)
    #[arg(short, long, global = true, env = "RULEFLEET_CONFIG_PATH", value_name = "FILE")]
    config: Option<PathBuf>,

    /// HTTP API port (default: spec.network.port, 8000)
    #[arg(long, global = true, env = "RULEFLEET_PORT")]
    port: Option<u16>,

    /// HTTP API host. The daemon binds it, the CLI connects to it.
    #[arg(long, global = true, env = "RULEFLEET_HOST")]
    host: Option<String>,

    /// Log level (trace, debug, info, warn, error). Default: spec.observability.logging.level
    #[arg(long, global = true, env = "RULEFLEET_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log format (text, json). Default: spec.observability.logging.format
    #[arg(long, global = true, env = "RULEFLEET_LOG_FORMAT")]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect and manage rule containers
    #[command(name = "container")]
    Container {
        #[command(subcommand)]
        command: ContainerCommand,
    },

    /// Deploy a rule artifact
    #[command(name = "deploy")]
    Deploy(DeployArgs),

    /// Evaluate facts against a rule set
    #[command(name = "evaluate")]
    Evaluate(EvaluateArgs),

    /// Compare the registry with live environments now
    #[command(name = "reconcile")]
    Reconcile {
        /// Print the raw report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },

    /// Update the registry database schema
    #[command(name = "update")]
    Update {
        #[command(flatten)]
        command: UpdateCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // The daemon takes its logging defaults from the config file
    let configured = if cli.daemon {
        FleetConfigManifest::load_or_default(cli.config.clone())
            .ok()
            .map(|c| c.spec.observability.logging)
    } else {
        None
    };
    let level = cli
        .log_level
        .clone()
        .or_else(|| configured.as_ref().map(|l| l.level.clone()))
        .unwrap_or_else(|| "info".to_string());
    let format = cli
        .log_format
        .clone()
        .or_else(|| configured.map(|l| l.format))
        .unwrap_or_else(|| "text".to_string());
    init_logging(&level, &format)?;

    if cli.daemon {
        info!("Starting rulefleet in daemon mode");
        return daemon::start_daemon(
            cli.config,
            BindOptions {
                host: cli.host,
                port: cli.port,
            },
        )
        .await;
    }

    let host = cli.host.unwrap_or_else(|| "127.0.0.1".to_string());
    let port = cli.port.unwrap_or(DEFAULT_PORT);

    match cli.command {
        Some(Commands::Container { command }) => commands::container::handle_command(command, &host, port).await,
        Some(Commands::Deploy(args)) => commands::deploy::execute(args, &host, port).await,
        Some(Commands::Evaluate(args)) => commands::evaluate::execute(args, &host, port).await,
        Some(Commands::Reconcile { json }) => commands::reconcile::execute(json, &host, port).await,
        Some(Commands::Config { command }) => commands::config::handle_command(command, cli.config).await,
        Some(Commands::Update { command }) => commands::update::execute(command, cli.config).await,
        None => {
            eprintln!("{}", "No command specified. Use --help for usage.".yellow());
            std::process::exit(1);
        }
    }
}

/// Initialize tracing subscriber for logging. `RUST_LOG` wins over `--log-level`.
fn init_logging(level: &str, format: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    match format {
        "json" => builder.json().init(),
        "text" => builder.compact().init(),
        other => anyhow::bail!("Invalid log format '{}'. Expected text or json", other),
    }

    Ok(())
}

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for rulefleet CLI
//!
//! Every command except `config` and `update` talks to a running daemon.

pub mod config;
pub mod container;
pub mod deploy;
pub mod evaluate;
pub mod reconcile;
pub mod update;

pub use self::config::ConfigCommand;
pub use self::container::ContainerCommand;
pub use self::deploy::DeployArgs;
pub use self::evaluate::EvaluateArgs;
pub use self::update::UpdateCommand;

use anyhow::Result;
use colored::Colorize;
use tracing::debug;

use crate::daemon::{check_daemon_running, DaemonClient, DaemonStatus};
use rulefleet_core::domain::deployment::{DeploymentStatus, StepReport, StepStatus};

/// Connect to the daemon, failing with a hint when it is not reachable.
pub async fn connect(host: &str, port: u16) -> Result<DaemonClient> {
    match check_daemon_running(host, port).await? {
        DaemonStatus::Running { pid, uptime } => {
            debug!(pid, uptime = ?uptime, "Delegating to daemon API");
            DaemonClient::new(host, port)
        }
        DaemonStatus::Unhealthy { pid, error } => {
            anyhow::bail!("Daemon (PID {}) is unhealthy: {}", pid, error)
        }
        DaemonStatus::Stopped => anyhow::bail!(
            "No daemon reachable at {}:{}. Start one with `rulefleet --daemon`.",
            host,
            port
        ),
    }
}

pub(crate) fn colored_status(status: DeploymentStatus) -> colored::ColoredString {
    match status {
        DeploymentStatus::Success => status.as_str().green(),
        DeploymentStatus::NoOp => status.as_str().dimmed(),
        DeploymentStatus::Partial | DeploymentStatus::InProgress => status.as_str().yellow(),
        DeploymentStatus::Failed => status.as_str().red(),
    }
}

pub(crate) fn print_step(name: &str, step: &StepReport) {
    let marker = match step.status {
        StepStatus::Success => "✓".green(),
        StepStatus::Skipped => "-".dimmed(),
        StepStatus::Failed => "✗".red(),
    };
    match &step.detail {
        Some(detail) => println!("  {} {:<16} {}", marker, name, detail.dimmed()),
        None => println!("  {} {}", marker, name),
    }
}

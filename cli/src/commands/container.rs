// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Container registry commands
//!
//! Commands: list, show, history, delete, resolve

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;

use rulefleet_core::domain::container::{ContainerId, ContainerRecord, ContainerStatus};
use rulefleet_core::domain::deployment::RouteTarget;

use super::{colored_status, connect};

#[derive(Subcommand)]
pub enum ContainerCommand {
    /// List containers
    List {
        /// Include torn down and failed containers
        #[arg(short, long)]
        all: bool,

        /// Print raw JSON
        #[arg(long)]
        json: bool,
    },

    /// Show one container record
    Show {
        #[arg(value_name = "CONTAINER_ID")]
        container_id: String,
    },

    /// Show deployment history, oldest first
    History {
        #[arg(value_name = "CONTAINER_ID")]
        container_id: String,
    },

    /// Tear down a container's dedicated environment
    Delete {
        #[arg(value_name = "CONTAINER_ID")]
        container_id: String,
    },

    /// Show where evaluation traffic for a container is routed
    Resolve {
        #[arg(value_name = "CONTAINER_ID")]
        container_id: String,
    },
}

pub async fn handle_command(command: ContainerCommand, host: &str, port: u16) -> Result<()> {
    let client = connect(host, port).await?;

    match command {
        ContainerCommand::List { all, json } => {
            let records = client.list_containers(all).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
                return Ok(());
            }
            if records.is_empty() {
                println!("{}", "No containers".dimmed());
                return Ok(());
            }
            println!(
                "{:<44} {:<10} {:<10} {:>6} {:>8}  {}",
                "CONTAINER".bold(),
                "PLATFORM".bold(),
                "STATUS".bold(),
                "PORT".bold(),
                "VERSION".bold(),
                "ENDPOINT".bold()
            );
            for record in &records {
                println!(
                    "{:<44} {:<10} {:<10} {:>6} {:>8}  {}",
                    record.container_id.as_str(),
                    record.platform.as_str(),
                    colored_container_status(record),
                    record.port,
                    record.artifact_version,
                    record.endpoint
                );
            }
        }
        ContainerCommand::Show { container_id } => {
            let id = parse(&container_id)?;
            match client.get_container(&id).await? {
                Some(record) => print_record(&record),
                None => {
                    println!("{}", format!("No container {}", id).yellow());
                }
            }
        }
        ContainerCommand::History { container_id } => {
            let id = parse(&container_id)?;
            let entries = client.history(&id).await?;
            if entries.is_empty() {
                println!("{}", format!("No history for {}", id).dimmed());
            }
            for entry in entries {
                println!(
                    "{}  {:<10} v{:<4} {:<10} {}",
                    entry.recorded_at.format("%Y-%m-%d %H:%M:%S"),
                    entry.action.as_str().bold(),
                    entry.artifact_version,
                    entry.status.as_str(),
                    entry.detail.unwrap_or_default().dimmed()
                );
            }
        }
        ContainerCommand::Delete { container_id } => {
            let id = parse(&container_id)?;
            let report = client.teardown(&id).await?;
            println!("{} {}", "Teardown:".bold(), colored_status(report.status));
            if let Some(message) = report.message {
                println!("  {}", message.dimmed());
            }
        }
        ContainerCommand::Resolve { container_id } => {
            let id = parse(&container_id)?;
            let resolution = client.resolve(&id).await?;
            let target = match resolution.target {
                RouteTarget::Dedicated => resolution.target.as_str().green(),
                RouteTarget::Fallback => resolution.target.as_str().yellow(),
            };
            println!("{} → {} ({})", resolution.container_id, resolution.endpoint, target);
        }
    }

    Ok(())
}

fn parse(raw: &str) -> Result<ContainerId> {
    ContainerId::parse(raw).with_context(|| format!("Invalid container id '{}'", raw))
}

fn colored_container_status(record: &ContainerRecord) -> colored::ColoredString {
    let label = if record.is_active {
        record.status.as_str().to_string()
    } else {
        format!("{}*", record.status.as_str())
    };
    match record.status {
        ContainerStatus::Running => label.green(),
        ContainerStatus::Deploying => label.cyan(),
        ContainerStatus::Unhealthy => label.yellow(),
        ContainerStatus::Failed => label.red(),
        ContainerStatus::Stopped => label.dimmed(),
    }
}

fn print_record(record: &ContainerRecord) {
    println!("{}", record.container_id.as_str().bold());
    println!("  Tenant:       {}", record.tenant_id.as_str());
    println!("  Rule set:     {}", record.ruleset_id.as_str());
    println!("  Platform:     {}", record.platform.as_str());
    println!("  Environment:  {}", record.environment_name);
    println!("  Endpoint:     {}", record.endpoint);
    println!("  Port:         {}", record.port);
    println!("  Status:       {}", colored_container_status(record));
    println!("  Health:       {}", record.health_status.as_str());
    println!("  Version:      {}", record.artifact_version);
    if let Some(release) = &record.release_id {
        println!("  Release:      {}", release);
    }
    if let Some(hash) = &record.document_hash {
        println!("  Document:     {}", hash);
    }
    println!("  Active:       {}", record.is_active);
    println!("  Updated:      {}", record.updated_at.to_rfc3339());
}

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::{Path, PathBuf};

use rulefleet_core::domain::container::Platform;
use rulefleet_core::domain::node_config::FleetConfigManifest;

const EXAMPLE_CONFIG: &str = include_str!("../../templates/config-with-examples.yaml");

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate sample configuration
    Generate {
        /// Output path (default: ./rulefleet-config.yaml)
        #[arg(short, long, default_value = "./rulefleet-config.yaml")]
        output: PathBuf,

        /// Include examples and comments
        #[arg(long)]
        examples: bool,
    },
}

pub async fn handle_command(command: ConfigCommand, config_override: Option<PathBuf>) -> Result<()> {
    match command {
        ConfigCommand::Show { paths } => show(config_override, paths),
        ConfigCommand::Validate { file } => validate(file.or(config_override)),
        ConfigCommand::Generate { output, examples } => generate(&output, examples),
    }
}

fn show(config_override: Option<PathBuf>, show_paths: bool) -> Result<()> {
    let config = FleetConfigManifest::load_or_default(config_override.clone()).context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        match &config_override {
            Some(path) => println!("  1. --config flag: {}", path.display()),
            None => println!("  1. --config flag: {}", "(not set)".dimmed()),
        }
        println!(
            "  2. RULEFLEET_CONFIG_PATH: {}",
            std::env::var("RULEFLEET_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./rulefleet-config.yaml");
        println!("  4. ~/.rulefleet/config.yaml");
        println!("  5. /etc/rulefleet/config.yaml");
        println!();
    }

    let spec = &config.spec;
    println!("{}", "Current configuration:".bold());
    println!();

    println!("{}", "Node:".bold());
    println!("  Name: {}", config.metadata.name);
    println!();

    println!("{}", "Platform:".bold());
    println!("  Kind: {}", spec.platform.kind);
    match spec.platform.kind {
        Platform::Local => {
            let docker = &spec.platform.docker;
            println!("  Network: {}", docker.network);
            println!("  Image: {}", docker.image);
            if let Some(host) = &docker.advertise_host {
                println!("  Advertise host: {}", host);
            }
        }
        Platform::Cluster => {
            let cluster = &spec.platform.cluster;
            println!("  API: {}", cluster.api_url);
            println!("  Namespace: {}", cluster.namespace);
            println!("  Image: {}", cluster.image);
        }
    }
    println!(
        "  Ports: {}-{} ({} allocation retries)",
        spec.ports.base_port, spec.ports.max_port, spec.ports.max_allocation_retries
    );
    println!();

    println!("{}", "Default environment:".bold());
    println!("  {} → {}", spec.default_environment.name, spec.default_environment.endpoint);
    println!();

    println!("{}", "Deployment:".bold());
    println!("  Create timeout: {:?}", spec.deployment.create_timeout);
    println!("  Activation timeout: {:?}", spec.deployment.activation_timeout);
    println!("  Step attempts: {}", spec.deployment.step_attempts);
    if spec.reconciliation.enabled {
        println!("  Reconcile every: {:?}", spec.reconciliation.interval);
    } else {
        println!("  Reconcile: {}", "disabled".dimmed());
    }
    println!();

    println!("{}", "Registry:".bold());
    match &spec.database {
        Some(db) => println!("  PostgreSQL: {}", redact_url(&db.url)),
        None => println!("  {}", "in-memory".yellow()),
    }
    println!();

    println!("{}", "API:".bold());
    println!("  Listen: {}:{}", spec.network.bind_address, spec.network.port);
    println!(
        "  Logging: {} ({})",
        spec.observability.logging.level, spec.observability.logging.format
    );
    if spec.observability.metrics.enabled {
        println!("  Metrics: :{}", spec.observability.metrics.port);
    }

    Ok(())
}

/// Hide the password of a connection URL
fn redact_url(url: &str) -> String {
    match reqwest::Url::parse(url) {
        Ok(mut parsed) if parsed.password().is_some() => {
            let _ = parsed.set_password(Some("****"));
            parsed.to_string()
        }
        _ => url.to_string(),
    }
}

fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = FleetConfigManifest::load_or_default(config_path).context("Failed to load configuration")?;
    config.validate().context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());
    Ok(())
}

fn generate(output: &Path, with_examples: bool) -> Result<()> {
    if with_examples {
        std::fs::write(output, EXAMPLE_CONFIG).with_context(|| format!("Failed to write config to {:?}", output))?;
    } else {
        FleetConfigManifest::default()
            .to_yaml_file(output)
            .with_context(|| format!("Failed to write config to {:?}", output))?;
    }

    println!("{}", format!("✓ Configuration generated: {}", output.display()).green());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_configs_validate() {
        let dir = tempfile::tempdir().unwrap();

        for examples in [false, true] {
            let path = dir.path().join(format!("config-{}.yaml", examples));
            generate(&path, examples).unwrap();
            let manifest = FleetConfigManifest::from_yaml_file(&path).unwrap();
            manifest.validate().unwrap();
        }
    }

    #[test]
    fn test_example_config_enables_postgres() {
        let manifest = FleetConfigManifest::from_yaml_str(EXAMPLE_CONFIG).unwrap();
        assert!(manifest.spec.database.is_some());
        assert!(manifest.spec.observability.metrics.enabled);
    }

    #[test]
    fn test_redact_url_hides_password() {
        assert_eq!(
            redact_url("postgres://rulefleet:secret@db:5432/rulefleet"),
            "postgres://rulefleet:****@db:5432/rulefleet"
        );
        assert_eq!(redact_url("not a url"), "not a url");
    }

    #[test]
    fn test_validate_rejects_bad_kind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, "apiVersion: rulefleet.io/v1\nkind: Other\nmetadata:\n  name: n\n").unwrap();
        assert!(validate(Some(path)).is_err());
    }
}

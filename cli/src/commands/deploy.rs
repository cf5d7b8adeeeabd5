// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `rulefleet deploy`: push a rule artifact to a tenant's rule set.

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use clap::Args;
use colored::Colorize;
use std::path::{Path, PathBuf};

use rulefleet_core::domain::container::ReleaseId;
use rulefleet_core::domain::deployment::{DeploymentReport, DeploymentStatus, TargetRole};
use rulefleet_core::presentation::api::{ArtifactSourceKind, DeployBody};

use super::{colored_status, connect, print_step};

#[derive(Args)]
pub struct DeployArgs {
    /// Tenant the rule set belongs to
    #[arg(long)]
    tenant: String,

    /// Rule set (policy type) name
    #[arg(long)]
    ruleset: String,

    /// Maven group id of the KJAR
    #[arg(long)]
    group_id: String,

    /// Maven artifact id of the KJAR
    #[arg(long)]
    artifact_id: String,

    /// Release version
    #[arg(long)]
    version: String,

    /// Compiled KJAR to upload
    #[arg(long, value_name = "FILE", required_unless_present = "from_default")]
    jar: Option<PathBuf>,

    /// POM matching the KJAR
    #[arg(long, value_name = "FILE", required_unless_present = "from_default")]
    pom: Option<PathBuf>,

    /// Copy an artifact already installed in the default environment instead of uploading
    #[arg(long, conflicts_with_all = ["jar", "pom"])]
    from_default: bool,

    /// Hash of the source rule document; redeploying the same hash is a no-op
    #[arg(long)]
    document_hash: Option<String>,

    /// Print the raw report as JSON
    #[arg(long)]
    json: bool,
}

impl DeployArgs {
    fn into_body(self) -> Result<DeployBody> {
        let release = ReleaseId::new(self.group_id, self.artifact_id, self.version);
        let (source, jar, pom) = if self.from_default {
            (ArtifactSourceKind::DefaultEnvironment, None, None)
        } else {
            let jar = self.jar.as_deref().map(read_base64).transpose()?;
            let pom = self.pom.as_deref().map(read_base64).transpose()?;
            (ArtifactSourceKind::Inline, jar, pom)
        };
        Ok(DeployBody {
            tenant_id: self.tenant,
            ruleset_id: self.ruleset,
            release,
            document_hash: self.document_hash,
            source,
            jar,
            pom,
        })
    }
}

fn read_base64(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(BASE64.encode(bytes))
}

pub async fn execute(args: DeployArgs, host: &str, port: u16) -> Result<()> {
    let json = args.json;
    let body = args.into_body()?;
    let client = connect(host, port).await?;

    println!(
        "Deploying {} to {}/{}...",
        body.release.to_string().bold(),
        body.tenant_id,
        body.ruleset_id
    );
    let report = client.deploy(&body).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    if report.status == DeploymentStatus::Failed {
        anyhow::bail!(
            "Deployment failed: {}",
            report.message.unwrap_or_else(|| "no detail".to_string())
        );
    }
    Ok(())
}

fn print_report(report: &DeploymentReport) {
    println!();
    println!("{} {}", "Status:".bold(), colored_status(report.status));
    println!("  Container: {}", report.container_id);
    if let Some(endpoint) = &report.endpoint {
        println!("  Endpoint:  {}", endpoint);
    }
    println!("  Version:   {}", report.version);
    println!();

    println!("{}", "Steps:".bold());
    print_step("create", &report.steps.create);
    print_step("copy", &report.steps.copy);
    print_step("activate", &report.steps.activate);
    print_step("registry_update", &report.steps.registry_update);

    if !report.targets.is_empty() {
        println!();
        println!("{}", "Targets:".bold());
        for target in &report.targets {
            let role = match target.role {
                TargetRole::Default => "default",
                TargetRole::Dedicated => "dedicated",
            };
            println!("  {} ({})", target.environment, role.dimmed());
            print_step("  copy", &target.copy);
            print_step("  activate", &target.activate);
        }
    }

    if report.status == DeploymentStatus::Partial {
        println!();
        println!(
            "{}",
            "Some targets did not take the new release; traffic for this rule set falls back where needed."
                .yellow()
        );
    }
}

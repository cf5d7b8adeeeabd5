// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `rulefleet reconcile`: run one reconciliation sweep now.

use anyhow::Result;
use colored::Colorize;

use rulefleet_core::domain::deployment::DiscrepancyKind;

use super::connect;

pub async fn execute(json: bool, host: &str, port: u16) -> Result<()> {
    let client = connect(host, port).await?;
    let report = client.reconcile().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!(
        "{} {} active record(s), {} live environment(s) on {}",
        "Checked".bold(),
        report.registry_active,
        report.live,
        report.platform
    );
    if report.skipped_deploying > 0 {
        println!("  {} skipped while deploying", report.skipped_deploying);
    }

    if report.is_consistent() {
        println!("{}", "✓ Registry matches live environments".green());
        return Ok(());
    }

    for discrepancy in &report.discrepancies {
        let kind = match discrepancy.kind {
            DiscrepancyKind::MissingEnvironment => discrepancy.kind.as_str().red(),
            DiscrepancyKind::OrphanedEnvironment | DiscrepancyKind::PortMismatch => {
                discrepancy.kind.as_str().yellow()
            }
        };
        println!("  {:<22} {:<44} {}", kind, discrepancy.subject, discrepancy.detail.dimmed());
    }
    if !report.marked_failed.is_empty() {
        println!("{} {} record(s) marked failed", "!".red(), report.marked_failed.len());
    }
    if !report.orphaned.is_empty() {
        println!(
            "{} {} orphaned environment(s) left running for manual review",
            "!".yellow(),
            report.orphaned.len()
        );
    }
    Ok(())
}

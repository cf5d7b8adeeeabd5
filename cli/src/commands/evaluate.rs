// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `rulefleet evaluate`: run an applicant through a tenant's rule set.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde_json::Value;

use rulefleet_core::domain::container::{ContainerId, RulesetId, TenantId};
use rulefleet_core::domain::deployment::RouteTarget;
use rulefleet_core::presentation::api::EvaluateBody;

use super::connect;

#[derive(Args)]
pub struct EvaluateArgs {
    /// Tenant the rule set belongs to
    #[arg(long)]
    tenant: String,

    /// Rule set (policy type) name
    #[arg(long)]
    ruleset: String,

    /// Applicant fact as JSON, or @file.json
    #[arg(long, value_name = "JSON", conflicts_with = "commands")]
    applicant: Option<String>,

    /// Raw KIE batch commands as a JSON array, or @file.json
    #[arg(long, value_name = "JSON", required_unless_present = "applicant")]
    commands: Option<String>,
}

/// Parse inline JSON or load it from `@path`
fn parse_json(raw: &str) -> Result<Value> {
    let text = match raw.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path))?,
        None => raw.to_string(),
    };
    serde_json::from_str(&text).context("Input is not valid JSON")
}

impl EvaluateArgs {
    fn into_body(self) -> Result<(ContainerId, EvaluateBody)> {
        let container_id = ContainerId::for_ruleset(&TenantId::new(self.tenant), &RulesetId::new(self.ruleset));
        let body = match (self.applicant, self.commands) {
            (Some(applicant), None) => EvaluateBody {
                applicant: Some(parse_json(&applicant)?),
                commands: None,
            },
            (None, Some(commands)) => {
                let commands = match parse_json(&commands)? {
                    Value::Array(commands) => commands,
                    _ => anyhow::bail!("--commands must be a JSON array"),
                };
                EvaluateBody {
                    applicant: None,
                    commands: Some(commands),
                }
            }
            _ => anyhow::bail!("Provide exactly one of --applicant or --commands"),
        };
        Ok((container_id, body))
    }
}

pub async fn execute(args: EvaluateArgs, host: &str, port: u16) -> Result<()> {
    let (container_id, body) = args.into_body()?;
    let client = connect(host, port).await?;

    let outcome = client.evaluate(&container_id, &body).await?;

    let route = match outcome.target {
        Some(RouteTarget::Dedicated) => "dedicated".green(),
        Some(RouteTarget::Fallback) => "fallback".yellow(),
        None => "unknown".dimmed(),
    };
    eprintln!(
        "{} {} via {} ({})",
        "Evaluated".bold(),
        container_id,
        outcome.endpoint.as_deref().unwrap_or("?"),
        route
    );
    println!("{}", serde_json::to_string_pretty(&outcome.payload)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_applicant_targets_derived_container() {
        let args = EvaluateArgs {
            tenant: "chase".into(),
            ruleset: "insurance".into(),
            applicant: Some(r#"{"age": 30}"#.into()),
            commands: None,
        };
        let (id, body) = args.into_body().unwrap();
        assert_eq!(id.as_str(), "chase-insurance-underwriting-rules");
        assert_eq!(body.applicant, Some(json!({ "age": 30 })));
    }

    #[test]
    fn test_commands_must_be_array() {
        let args = EvaluateArgs {
            tenant: "chase".into(),
            ruleset: "insurance".into(),
            applicant: None,
            commands: Some(r#"{"fire-all-rules": {}}"#.into()),
        };
        assert!(args.into_body().is_err());
    }

    #[test]
    fn test_applicant_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("applicant.json");
        std::fs::write(&path, r#"{"income": 85000}"#).unwrap();
        let value = parse_json(&format!("@{}", path.display())).unwrap();
        assert_eq!(value["income"], 85000);
    }
}

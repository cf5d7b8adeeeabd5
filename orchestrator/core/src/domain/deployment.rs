// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Deployment Reports
//!
//! Orchestration results are structured reports with a status field.
//! Callers branch on `status` and `failure`, never on message text.

use crate::domain::artifact::Artifact;
use crate::domain::container::{ContainerId, Platform, RulesetId, TenantId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Deploy trigger coming from the build pipeline
#[derive(Debug, Clone)]
pub struct DeploymentRequest {
    pub tenant_id: TenantId,
    pub ruleset_id: RulesetId,
    pub artifact: Artifact,
    /// Hash of the source rule document; equal hashes make redeploy a no-op
    pub document_hash: Option<String>,
}

impl DeploymentRequest {
    pub fn container_id(&self) -> ContainerId {
        ContainerId::for_ruleset(&self.tenant_id, &self.ruleset_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Success,
    Partial,
    Failed,
    NoOp,
    InProgress,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
            Self::NoOp => "no_op",
            Self::InProgress => "in_progress",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Failed,
    Skipped,
}

/// Failure taxonomy shared by every report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    PortConflict,
    EnvironmentCreateTimeout,
    CopyFailed,
    ActivationFailed,
    RegistryInconsistency,
    DeploymentInProgress,
    PlatformError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepReport {
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
}

impl StepReport {
    pub fn success() -> Self {
        Self {
            status: StepStatus::Success,
            detail: None,
            failure: None,
        }
    }

    pub fn success_with(detail: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Success,
            detail: Some(detail.into()),
            failure: None,
        }
    }

    pub fn skipped(detail: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Skipped,
            detail: Some(detail.into()),
            failure: None,
        }
    }

    pub fn failed(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Failed,
            detail: Some(detail.into()),
            failure: Some(kind),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == StepStatus::Failed
    }

    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Success
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetRole {
    Default,
    Dedicated,
}

/// Outcome of installing the artifact into one environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetReport {
    pub environment: String,
    pub role: TargetRole,
    pub copy: StepReport,
    pub activate: StepReport,
}

impl TargetReport {
    pub fn activated(&self) -> bool {
        self.activate.is_success()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentSteps {
    pub create: StepReport,
    pub copy: StepReport,
    pub activate: StepReport,
    pub registry_update: StepReport,
}

impl DeploymentSteps {
    fn skipped(detail: &str) -> Self {
        Self {
            create: StepReport::skipped(detail),
            copy: StepReport::skipped(detail),
            activate: StepReport::skipped(detail),
            registry_update: StepReport::skipped(detail),
        }
    }

    fn all(&self) -> [&StepReport; 4] {
        [&self.create, &self.copy, &self.activate, &self.registry_update]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentReport {
    pub status: DeploymentStatus,
    pub container_id: ContainerId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub version: i64,
    pub steps: DeploymentSteps,
    pub targets: Vec<TargetReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl DeploymentReport {
    pub fn in_progress(container_id: ContainerId) -> Self {
        let mut steps = DeploymentSteps::skipped("another operation holds this container");
        steps.create = StepReport::failed(
            FailureKind::DeploymentInProgress,
            "another operation holds this container",
        );
        Self {
            status: DeploymentStatus::InProgress,
            container_id,
            endpoint: None,
            port: None,
            version: 0,
            steps,
            targets: Vec::new(),
            message: Some("deployment already in progress".to_string()),
        }
    }

    pub fn no_op(container_id: ContainerId, endpoint: String, port: u16, version: i64) -> Self {
        Self {
            status: DeploymentStatus::NoOp,
            container_id,
            endpoint: Some(endpoint),
            port: Some(port),
            version,
            steps: DeploymentSteps::skipped("document unchanged"),
            targets: Vec::new(),
            message: Some("document hash unchanged".to_string()),
        }
    }

    /// Build a report whose status follows from the steps and targets.
    ///
    /// `success`: every step and target succeeded. `partial`: the registry
    /// was updated and at least one create, copy or activate step
    /// succeeded somewhere. `failed`: nothing but bookkeeping succeeded.
    pub fn from_steps(
        container_id: ContainerId,
        endpoint: Option<String>,
        port: Option<u16>,
        version: i64,
        steps: DeploymentSteps,
        targets: Vec<TargetReport>,
    ) -> Self {
        let any_failed = steps.all().iter().any(|s| s.is_failed())
            || targets.iter().any(|t| t.copy.is_failed() || t.activate.is_failed());
        let any_work_done = [&steps.create, &steps.copy, &steps.activate]
            .into_iter()
            .chain(targets.iter().flat_map(|t| [&t.copy, &t.activate]))
            .any(StepReport::is_success);

        let status = if !any_failed {
            DeploymentStatus::Success
        } else if steps.registry_update.is_success() && any_work_done {
            DeploymentStatus::Partial
        } else {
            DeploymentStatus::Failed
        };

        let message = steps
            .all()
            .iter()
            .copied()
            .chain(targets.iter().flat_map(|t| [&t.copy, &t.activate]))
            .find(|s| s.is_failed())
            .and_then(|s| s.detail.clone());

        Self {
            status,
            container_id,
            endpoint,
            port,
            version,
            steps,
            targets,
            message,
        }
    }

    /// The registry reflects the outcome, whatever the status.
    pub fn is_recorded(&self) -> bool {
        self.status == DeploymentStatus::NoOp || self.steps.registry_update.is_success()
    }

    /// First failure kind recorded in the report.
    pub fn failure(&self) -> Option<FailureKind> {
        self.steps
            .all()
            .iter()
            .copied()
            .chain(self.targets.iter().flat_map(|t| [&t.copy, &t.activate]))
            .find_map(|s| s.failure)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownReport {
    pub status: DeploymentStatus,
    pub container_id: ContainerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl TeardownReport {
    pub fn new(status: DeploymentStatus, container_id: ContainerId, message: Option<String>) -> Self {
        Self {
            status,
            container_id,
            failure: None,
            message,
        }
    }

    pub fn failed(container_id: ContainerId, kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            status: DeploymentStatus::Failed,
            container_id,
            failure: Some(kind),
            message: Some(detail.into()),
        }
    }
}

// ============================================================================
// Reconciliation
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscrepancyKind {
    /// Active record whose environment is gone
    MissingEnvironment,
    /// Live environment without an active record
    OrphanedEnvironment,
    /// Record and environment disagree on the port
    PortMismatch,
}

impl DiscrepancyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingEnvironment => "missing_environment",
            Self::OrphanedEnvironment => "orphaned_environment",
            Self::PortMismatch => "port_mismatch",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discrepancy {
    /// Container id, or the environment name for unlabelled orphans
    pub subject: String,
    pub kind: DiscrepancyKind,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub checked_at: DateTime<Utc>,
    pub platform: Platform,
    pub registry_active: usize,
    pub live: usize,
    pub skipped_deploying: usize,
    pub marked_failed: Vec<ContainerId>,
    pub orphaned: Vec<String>,
    pub health_refreshed: usize,
    pub discrepancies: Vec<Discrepancy>,
}

impl ReconciliationReport {
    pub fn new(platform: Platform) -> Self {
        Self {
            checked_at: Utc::now(),
            platform,
            registry_active: 0,
            live: 0,
            skipped_deploying: 0,
            marked_failed: Vec::new(),
            orphaned: Vec::new(),
            health_refreshed: 0,
            discrepancies: Vec::new(),
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.discrepancies.is_empty()
    }

    pub fn count(&self, kind: DiscrepancyKind) -> usize {
        self.discrepancies.iter().filter(|d| d.kind == kind).count()
    }
}

// ============================================================================
// Routing
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteTarget {
    Dedicated,
    Fallback,
}

impl RouteTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dedicated => "dedicated",
            Self::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub container_id: ContainerId,
    pub endpoint: String,
    pub target: RouteTarget,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(activate: StepReport) -> TargetReport {
        TargetReport {
            environment: "drools".into(),
            role: TargetRole::Default,
            copy: StepReport::success(),
            activate,
        }
    }

    fn steps(registry_update: StepReport) -> DeploymentSteps {
        DeploymentSteps {
            create: StepReport::success(),
            copy: StepReport::success(),
            activate: StepReport::success(),
            registry_update,
        }
    }

    fn id() -> ContainerId {
        ContainerId::for_ruleset(&TenantId::new("chase"), &RulesetId::new("insurance"))
    }

    #[test]
    fn test_all_success() {
        let report = DeploymentReport::from_steps(
            id(),
            None,
            None,
            1,
            steps(StepReport::success()),
            vec![target(StepReport::success())],
        );
        assert_eq!(report.status, DeploymentStatus::Success);
        assert!(report.message.is_none());
        assert!(report.failure().is_none());
    }

    #[test]
    fn test_partial_requires_registry_update_and_activation() {
        let mut s = steps(StepReport::success());
        s.activate = StepReport::failed(FailureKind::ActivationFailed, "unit FAILED");
        let report = DeploymentReport::from_steps(
            id(),
            None,
            None,
            1,
            s.clone(),
            vec![target(StepReport::success())],
        );
        assert_eq!(report.status, DeploymentStatus::Partial);
        assert_eq!(report.failure(), Some(FailureKind::ActivationFailed));
        assert_eq!(report.message.as_deref(), Some("unit FAILED"));

        s.registry_update = StepReport::failed(FailureKind::RegistryInconsistency, "conflict");
        let report = DeploymentReport::from_steps(id(), None, None, 1, s, vec![target(StepReport::success())]);
        assert_eq!(report.status, DeploymentStatus::Failed);
    }

    #[test]
    fn test_registry_update_with_any_successful_step_is_partial() {
        // Provisioned and copied, but no runtime accepted the unit
        let report = DeploymentReport::from_steps(
            id(),
            None,
            None,
            0,
            steps(StepReport::success()),
            vec![target(StepReport::failed(FailureKind::ActivationFailed, "down"))],
        );
        assert_eq!(report.status, DeploymentStatus::Partial);
        assert!(report.is_recorded());
    }

    #[test]
    fn test_only_bookkeeping_succeeded_is_failed() {
        let s = DeploymentSteps {
            create: StepReport::failed(FailureKind::EnvironmentCreateTimeout, "not healthy"),
            copy: StepReport::skipped("not provisioned"),
            activate: StepReport::skipped("not provisioned"),
            registry_update: StepReport::success_with("marked failed"),
        };
        let report = DeploymentReport::from_steps(id(), None, None, 0, s, Vec::new());
        assert_eq!(report.status, DeploymentStatus::Failed);
        assert!(report.is_recorded());

        let mut s = steps(StepReport::failed(FailureKind::RegistryInconsistency, "conflict"));
        s.copy = StepReport::failed(FailureKind::CopyFailed, "tar exited 2");
        let report = DeploymentReport::from_steps(id(), None, None, 0, s, Vec::new());
        assert_eq!(report.status, DeploymentStatus::Failed);
        assert!(!report.is_recorded());
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(serde_json::to_string(&DeploymentStatus::NoOp).unwrap(), "\"no_op\"");
        assert_eq!(
            serde_json::to_string(&FailureKind::EnvironmentCreateTimeout).unwrap(),
            "\"environment_create_timeout\""
        );
    }
}

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use crate::domain::container::{ContainerId, ReleaseId};
use crate::domain::deployment::FailureKind;

/// Container lifecycle events
///
/// Published on the event bus by the orchestrator and the reconciliation
/// sweep, and streamed to API clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContainerEvent {
    ContainerDeployed {
        container_id: ContainerId,
        endpoint: String,
        port: u16,
        artifact_version: i64,
        release: ReleaseId,
        deployed_at: DateTime<Utc>,
    },
    ContainerUpdated {
        container_id: ContainerId,
        previous_version: i64,
        artifact_version: i64,
        release: ReleaseId,
        updated_at: DateTime<Utc>,
    },
    DeploymentFailed {
        container_id: ContainerId,
        failure: Option<FailureKind>,
        reason: String,
        failed_at: DateTime<Utc>,
    },
    ContainerStopped {
        container_id: ContainerId,
        stopped_at: DateTime<Utc>,
    },
    /// Reconciliation found the environment gone
    ContainerMarkedFailed {
        container_id: ContainerId,
        reason: String,
        marked_at: DateTime<Utc>,
    },
    OrphanDetected {
        environment: String,
        container_id: Option<ContainerId>,
        port: Option<u16>,
        detected_at: DateTime<Utc>,
    },
    HealthChanged {
        container_id: ContainerId,
        healthy: bool,
        observed_at: DateTime<Utc>,
    },
}

impl ContainerEvent {
    /// Container the event concerns, when there is one
    pub fn container_id(&self) -> Option<&ContainerId> {
        match self {
            Self::ContainerDeployed { container_id, .. }
            | Self::ContainerUpdated { container_id, .. }
            | Self::DeploymentFailed { container_id, .. }
            | Self::ContainerStopped { container_id, .. }
            | Self::ContainerMarkedFailed { container_id, .. }
            | Self::HealthChanged { container_id, .. } => Some(container_id),
            Self::OrphanDetected { container_id, .. } => container_id.as_ref(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ContainerDeployed { .. } => "container_deployed",
            Self::ContainerUpdated { .. } => "container_updated",
            Self::DeploymentFailed { .. } => "deployment_failed",
            Self::ContainerStopped { .. } => "container_stopped",
            Self::ContainerMarkedFailed { .. } => "container_marked_failed",
            Self::OrphanDetected { .. } => "orphan_detected",
            Self::HealthChanged { .. } => "health_changed",
        }
    }
}

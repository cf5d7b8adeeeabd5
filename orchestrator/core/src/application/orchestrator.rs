// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Container Orchestrator
//!
//! Application service owning the lifecycle of per-rule-set environments.
//!
//! # DDD Pattern: Application Service
//!
//! - **Layer:** Application
//! - **Responsibility:** allocate, provision, install, persist; teardown; reconcile
//! - **Collaborators:**
//!   - Domain: `ContainerRecord` aggregate, `DeploymentHistoryEntry`
//!   - Application: `PortAllocator`, `ArtifactDeployer`
//!   - Infrastructure: `ContainerRegistry`, `PlatformDriver`, `EventBus`
//!
//! # Lifecycle
//!
//! ```text
//! absent ──deploy──▶ deploying ──healthy + loaded──▶ running ◀─┐
//!                       │                              │       │
//!                       ▼                              ▼       │
//!                    failed ◀──env missing──────── (reconcile) │
//!                       └────────retry─────▶ deploying ────────┘
//! running ──teardown──▶ stopped (inactive)
//! ```
//!
//! Operations on one container id are serialized: a second deploy or
//! teardown arriving while one is in flight is answered with
//! `in_progress` instead of queueing. Different ids proceed in parallel.

use crate::application::artifact_deployer::{ArtifactDeployer, DeployTarget};
use crate::application::port_allocator::{AllocationError, PortAllocator};
use crate::domain::artifact::{Artifact, RuleRuntimeClient};
use crate::domain::container::{
    ContainerId, ContainerRecord, ContainerStatus, DeploymentAction, DeploymentHistoryEntry, HealthStatus,
};
use crate::domain::deployment::{
    DeploymentReport, DeploymentRequest, DeploymentStatus, DeploymentSteps, Discrepancy, DiscrepancyKind,
    FailureKind, ReconciliationReport, StepReport, TargetReport, TargetRole, TeardownReport,
};
use crate::domain::events::ContainerEvent;
use crate::domain::node_config::{DefaultEnvironment, FleetConfigSpec};
use crate::domain::platform::{EnvironmentHandle, EnvironmentSpec, PlatformDriver, PlatformError};
use crate::domain::repository::{ContainerRegistry, RepositoryError};
use crate::infrastructure::event_bus::EventBus;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use metrics::{counter, gauge};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Registry error: {0}")]
    Registry(#[from] RepositoryError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),
}

#[async_trait]
pub trait ContainerOrchestrator: Send + Sync {
    /// Deploy or redeploy the rule set named in `request`.
    ///
    /// Never errors: every outcome, including registry failures, is a
    /// report with a status.
    async fn deploy(&self, request: DeploymentRequest) -> DeploymentReport;

    /// Remove the environment and soft-delete the record.
    async fn teardown(&self, container_id: &ContainerId) -> Result<TeardownReport, OrchestratorError>;

    /// Compare active records against live environments.
    async fn reconcile(&self) -> Result<ReconciliationReport, OrchestratorError>;

    async fn get(&self, container_id: &ContainerId) -> Result<Option<ContainerRecord>, OrchestratorError>;

    async fn list(&self, include_inactive: bool) -> Result<Vec<ContainerRecord>, OrchestratorError>;

    /// Audit trail for one container, oldest first.
    async fn history(&self, container_id: &ContainerId) -> Result<Vec<DeploymentHistoryEntry>, OrchestratorError>;
}

/// Held for the duration of one operation on a container id. Dropping it
/// releases the id and forgets its mutex once nobody else refers to it.
struct OperationGuard<'a> {
    locks: &'a DashMap<ContainerId, Arc<Mutex<()>>>,
    container_id: ContainerId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.container_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

pub struct StandardContainerOrchestrator {
    registry: Arc<dyn ContainerRegistry>,
    driver: Arc<dyn PlatformDriver>,
    allocator: PortAllocator,
    deployer: ArtifactDeployer,
    event_bus: Arc<EventBus>,
    default_environment: DefaultEnvironment,
    max_allocation_retries: u32,
    locks: DashMap<ContainerId, Arc<Mutex<()>>>,
}

impl StandardContainerOrchestrator {
    pub fn new(
        registry: Arc<dyn ContainerRegistry>,
        driver: Arc<dyn PlatformDriver>,
        runtime: Arc<dyn RuleRuntimeClient>,
        event_bus: Arc<EventBus>,
        spec: &FleetConfigSpec,
    ) -> Self {
        let allocator = PortAllocator::new(registry.clone(), driver.clone(), spec.ports.clone());
        let deployer = ArtifactDeployer::new(
            driver.clone(),
            runtime,
            &spec.runtime,
            &spec.default_environment,
            &spec.deployment,
        );
        Self {
            registry,
            driver,
            allocator,
            deployer,
            event_bus,
            default_environment: spec.default_environment.clone(),
            max_allocation_retries: spec.ports.max_allocation_retries.max(1),
            locks: DashMap::new(),
        }
    }

    fn try_lock(&self, container_id: &ContainerId) -> Option<OperationGuard<'_>> {
        let lock = self
            .locks
            .entry(container_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.try_lock_owned().ok()?;
        Some(OperationGuard {
            locks: &self.locks,
            container_id: container_id.clone(),
            guard: Some(guard),
        })
    }

    /// Update a record, retrying once against a fresh revision.
    ///
    /// Health refreshes may bump the revision while a deployment holds the
    /// id; the deployment's view wins.
    async fn persist(&self, record: &ContainerRecord) -> Result<ContainerRecord, RepositoryError> {
        match self.registry.update(record).await {
            Err(e) if e.is_conflict() => {
                let current = self
                    .registry
                    .find_by_id(&record.container_id)
                    .await?
                    .ok_or_else(|| RepositoryError::NotFound(record.container_id.to_string()))?;
                debug!(
                    container_id = %record.container_id,
                    stale = record.revision,
                    current = current.revision,
                    "Retrying update against fresh revision"
                );
                let mut retry = record.clone();
                retry.revision = current.revision;
                self.registry.update(&retry).await
            }
            other => other,
        }
    }

    async fn record_history(&self, record: &ContainerRecord, action: DeploymentAction, detail: Option<String>) {
        let entry = DeploymentHistoryEntry::snapshot(record, action, detail);
        if let Err(e) = self.registry.append_history(&entry).await {
            error!(container_id = %record.container_id, action = %action, error = %e, "Failed to append history");
        }
    }

    fn failed_before_create(container_id: ContainerId, kind: FailureKind, detail: String) -> DeploymentReport {
        let steps = DeploymentSteps {
            create: StepReport::failed(kind, detail),
            copy: StepReport::skipped("not provisioned"),
            activate: StepReport::skipped("not provisioned"),
            registry_update: StepReport::skipped("not provisioned"),
        };
        DeploymentReport::from_steps(container_id, None, None, 0, steps, Vec::new())
    }

    /// Install into the default environment first, then the dedicated one.
    /// A failure in one never rolls back the other.
    async fn deploy_targets(&self, record: &ContainerRecord, artifact: &Artifact) -> Vec<TargetReport> {
        let default = DeployTarget::default_environment(&self.default_environment);
        let dedicated = DeployTarget::dedicated(&record.environment_name, &record.endpoint);

        let mut targets = Vec::with_capacity(2);
        targets.push(self.deployer.deploy(&default, &record.container_id, artifact).await);
        targets.push(self.deployer.deploy(&dedicated, &record.container_id, artifact).await);
        targets
    }

    /// Close a deployment cycle: settle the record from the dedicated
    /// target's outcome, persist it, and write history and events.
    async fn complete(
        &self,
        mut record: ContainerRecord,
        request: &DeploymentRequest,
        create: StepReport,
        targets: Vec<TargetReport>,
        success_action: DeploymentAction,
    ) -> DeploymentReport {
        let previous_version = record.artifact_version;
        let dedicated = targets.iter().find(|t| t.role == TargetRole::Dedicated);
        let (copy, activate) = match dedicated {
            Some(t) => (t.copy.clone(), t.activate.clone()),
            None => (StepReport::skipped("no dedicated target"), StepReport::skipped("no dedicated target")),
        };

        let succeeded = activate.is_success();
        let mut outcome_detail = None;
        if succeeded {
            if let Err(e) = record.mark_running(request.artifact.release.clone(), request.document_hash.clone()) {
                outcome_detail = Some(e.to_string());
            }
        } else if success_action == DeploymentAction::Updated {
            // Keep serving the previously loaded version
            record.abandon_deployment();
        } else {
            record.mark_failed();
        }

        let registry_update = match self.persist(&record).await {
            Ok(stored) => {
                record = stored;
                match outcome_detail {
                    Some(detail) => StepReport::failed(FailureKind::RegistryInconsistency, detail),
                    None => StepReport::success(),
                }
            }
            Err(e) => {
                error!(container_id = %record.container_id, error = %e, "Failed to persist deployment outcome");
                StepReport::failed(FailureKind::RegistryInconsistency, e.to_string())
            }
        };

        let steps = DeploymentSteps {
            create,
            copy,
            activate,
            registry_update,
        };
        let report = DeploymentReport::from_steps(
            record.container_id.clone(),
            Some(record.endpoint.clone()),
            Some(record.port),
            record.artifact_version,
            steps,
            targets,
        );

        let release = request.artifact.release.clone();
        if succeeded && report.steps.registry_update.is_success() {
            let action = if previous_version == 0 {
                DeploymentAction::Deployed
            } else {
                success_action
            };
            self.record_history(&record, action, Some(release.to_string())).await;
            let event = if previous_version == 0 || action == DeploymentAction::Restarted {
                ContainerEvent::ContainerDeployed {
                    container_id: record.container_id.clone(),
                    endpoint: record.endpoint.clone(),
                    port: record.port,
                    artifact_version: record.artifact_version,
                    release,
                    deployed_at: Utc::now(),
                }
            } else {
                ContainerEvent::ContainerUpdated {
                    container_id: record.container_id.clone(),
                    previous_version,
                    artifact_version: record.artifact_version,
                    release,
                    updated_at: Utc::now(),
                }
            };
            self.event_bus.publish(event);
            info!(
                container_id = %record.container_id,
                version = record.artifact_version,
                endpoint = %record.endpoint,
                status = report.status.as_str(),
                "Deployment complete"
            );
        } else {
            let reason = report.message.clone().unwrap_or_else(|| "deployment failed".to_string());
            self.record_history(&record, DeploymentAction::Failed, Some(reason.clone())).await;
            self.event_bus.publish(ContainerEvent::DeploymentFailed {
                container_id: record.container_id.clone(),
                failure: report.failure(),
                reason: reason.clone(),
                failed_at: Utc::now(),
            });
            warn!(
                container_id = %record.container_id,
                status = report.status.as_str(),
                %reason,
                "Deployment did not complete"
            );
        }

        report
    }

    async fn redeploy(&self, mut record: ContainerRecord, request: &DeploymentRequest) -> DeploymentReport {
        let container_id = record.container_id.clone();
        // A record left in deploying by an interrupted run is taken over as is
        if record.status != ContainerStatus::Deploying {
            if let Err(e) = record.begin_redeploy() {
                return Self::failed_before_create(container_id, FailureKind::RegistryInconsistency, e.to_string());
            }
        }
        let record = match self.persist(&record).await {
            Ok(stored) => stored,
            Err(e) => {
                return Self::failed_before_create(container_id, FailureKind::RegistryInconsistency, e.to_string())
            }
        };

        info!(container_id = %container_id, version = record.artifact_version, "Redeploying into existing environment");
        let targets = self.deploy_targets(&record, &request.artifact).await;
        self.complete(
            record,
            request,
            StepReport::skipped("environment already provisioned"),
            targets,
            DeploymentAction::Updated,
        )
        .await
    }

    /// Reserve `port` in the registry for this deployment attempt.
    async fn reserve(
        &self,
        request: &DeploymentRequest,
        reserved: Option<ContainerRecord>,
        inactive: &mut Option<ContainerRecord>,
        port: u16,
    ) -> Result<ContainerRecord, RepositoryError> {
        let platform = self.driver.platform();
        if let Some(mut record) = reserved {
            record.rebind(String::new(), port);
            return self.persist(&record).await;
        }
        if let Some(previous) = inactive.as_ref() {
            let mut record = previous.clone();
            record
                .reactivate(platform, String::new(), port)
                .map_err(RepositoryError::from)?;
            let stored = self.registry.update(&record).await?;
            *inactive = None;
            return Ok(stored);
        }
        let record = ContainerRecord::new_deploying(
            request.tenant_id.clone(),
            request.ruleset_id.clone(),
            platform,
            String::new(),
            port,
        );
        self.registry.insert(&record).await
    }

    /// Give up on a provisioning attempt: remove whatever exists and leave
    /// the record failed and inactive.
    async fn abandon_provisioning(&self, mut record: ContainerRecord, kind: FailureKind, detail: String) -> DeploymentReport {
        let container_id = record.container_id.clone();
        if let Err(e) = self.driver.delete(&container_id).await {
            warn!(container_id = %container_id, error = %e, "Best-effort cleanup of environment failed");
        }

        let mut report = Self::failed_before_create(container_id.clone(), kind, detail.clone());
        record.mark_failed_inactive();
        match self.persist(&record).await {
            Ok(stored) => {
                report.steps.registry_update = StepReport::success_with("marked failed");
                report.port = Some(stored.port);
                report.version = stored.artifact_version;
                self.record_history(&stored, DeploymentAction::Failed, Some(detail.clone())).await;
            }
            Err(e) => {
                report.steps.registry_update = StepReport::failed(FailureKind::RegistryInconsistency, e.to_string());
            }
        }
        self.event_bus.publish(ContainerEvent::DeploymentFailed {
            container_id,
            failure: Some(kind),
            reason: detail,
            failed_at: Utc::now(),
        });
        report
    }

    /// A teardown step failed. `record` is the registry's view before the
    /// attempt; reconciliation settles whatever is left.
    async fn teardown_failed(&self, record: &ContainerRecord, kind: FailureKind, detail: String) -> TeardownReport {
        error!(container_id = %record.container_id, failure = ?kind, %detail, "Teardown failed");
        self.record_history(record, DeploymentAction::Failed, Some(detail.clone())).await;
        counter!("rulefleet_teardowns_total", "status" => DeploymentStatus::Failed.as_str()).increment(1);
        TeardownReport::failed(record.container_id.clone(), kind, detail)
    }

    /// Provision an environment, then install. `existing` is either an
    /// inactive record to reactivate or an active one that never finished
    /// provisioning; the latter keeps its port and goes through the
    /// idempotent `create` again.
    async fn fresh_deploy(&self, existing: Option<ContainerRecord>, request: &DeploymentRequest) -> DeploymentReport {
        let container_id = request.container_id();
        let (mut inactive, mut reserved) = match existing {
            Some(mut record) if record.is_active => {
                if record.status != ContainerStatus::Deploying {
                    if let Err(e) = record.begin_redeploy() {
                        return Self::failed_before_create(container_id, FailureKind::RegistryInconsistency, e.to_string());
                    }
                }
                (None, Some(record))
            }
            other => (other, None),
        };
        let reactivating = inactive.is_some();
        let mut preferred_port = reserved.as_ref().map(|r| r.port).filter(|port| *port != 0);
        let mut excluded: HashSet<u16> = HashSet::new();
        let mut last_conflict = String::new();

        let mut provisioned: Option<(ContainerRecord, EnvironmentHandle)> = None;
        for attempt in 1..=self.max_allocation_retries {
            let allocated = match preferred_port.take() {
                Some(port) => Ok(port),
                None => self.allocator.allocate_port_excluding(&excluded).await,
            };
            let port = match allocated {
                Ok(port) => port,
                Err(e) => {
                    let kind = match &e {
                        AllocationError::Exhausted { .. } => FailureKind::PortConflict,
                        _ => FailureKind::PlatformError,
                    };
                    return match reserved {
                        Some(record) => self.abandon_provisioning(record, kind, e.to_string()).await,
                        None => Self::failed_before_create(container_id, kind, e.to_string()),
                    };
                }
            };

            let record = match self.reserve(request, reserved.take(), &mut inactive, port).await {
                Ok(record) => record,
                Err(e) if e.is_conflict() => {
                    warn!(container_id = %container_id, port, attempt, error = %e, "Port reservation conflict, re-allocating");
                    excluded.insert(port);
                    last_conflict = e.to_string();
                    reserved = self.registry.find_by_id(&container_id).await.ok().flatten().filter(|r| r.is_active);
                    continue;
                }
                Err(e) => {
                    return Self::failed_before_create(container_id, FailureKind::RegistryInconsistency, e.to_string());
                }
            };

            let spec = EnvironmentSpec {
                container_id: container_id.clone(),
                port,
            };
            match self.driver.create(&spec).await {
                Ok(handle) => {
                    provisioned = Some((record, handle));
                    break;
                }
                Err(PlatformError::PortConflict { port }) => {
                    warn!(container_id = %container_id, port, attempt, "Port conflict on create, re-allocating");
                    excluded.insert(port);
                    last_conflict = format!("port {} already allocated", port);
                    reserved = Some(record);
                }
                Err(e @ PlatformError::CreateTimeout { .. }) => {
                    error!(container_id = %container_id, error = %e, "Environment did not become healthy");
                    return self
                        .abandon_provisioning(record, FailureKind::EnvironmentCreateTimeout, e.to_string())
                        .await;
                }
                Err(e) => {
                    error!(container_id = %container_id, error = %e, "Environment creation failed");
                    return self
                        .abandon_provisioning(record, FailureKind::PlatformError, e.to_string())
                        .await;
                }
            }
        }

        let Some((mut record, handle)) = provisioned else {
            let detail = format!(
                "no bindable port after {} attempts: {}",
                self.max_allocation_retries, last_conflict
            );
            return match reserved {
                Some(record) => self.abandon_provisioning(record, FailureKind::PortConflict, detail).await,
                None => Self::failed_before_create(container_id, FailureKind::PortConflict, detail),
            };
        };

        record.rebind(handle.endpoint.clone(), handle.port);
        record.environment_name = handle.name.clone();
        let record = match self.persist(&record).await {
            Ok(stored) => stored,
            Err(e) => {
                error!(container_id = %container_id, error = %e, "Failed to record provisioned environment");
                let detail = format!("environment {} provisioned but not recorded: {}", handle.name, e);
                return self
                    .abandon_provisioning(record, FailureKind::RegistryInconsistency, detail)
                    .await;
            }
        };

        info!(
            container_id = %container_id,
            environment = %handle.name,
            endpoint = %handle.endpoint,
            port = handle.port,
            "Environment provisioned"
        );

        let targets = self.deploy_targets(&record, &request.artifact).await;
        let action = if reactivating {
            DeploymentAction::Restarted
        } else {
            DeploymentAction::Deployed
        };
        self.complete(
            record,
            request,
            StepReport::success_with(format!("{} on port {}", handle.name, handle.port)),
            targets,
            action,
        )
        .await
    }
}

#[async_trait]
impl ContainerOrchestrator for StandardContainerOrchestrator {
    async fn deploy(&self, request: DeploymentRequest) -> DeploymentReport {
        let container_id = request.container_id();
        let Some(_guard) = self.try_lock(&container_id) else {
            warn!(container_id = %container_id, "Deployment already in progress");
            counter!("rulefleet_deployments_total", "status" => DeploymentStatus::InProgress.as_str()).increment(1);
            return DeploymentReport::in_progress(container_id);
        };

        let report = match self.registry.find_by_id(&container_id).await {
            Err(e) => Self::failed_before_create(container_id, FailureKind::RegistryInconsistency, e.to_string()),
            Ok(Some(record)) if !record.owned_by(&request.tenant_id, &request.ruleset_id) => {
                let detail = format!(
                    "container id {} already belongs to tenant '{}' rule set '{}'",
                    container_id, record.tenant_id, record.ruleset_id
                );
                warn!(
                    container_id = %container_id,
                    tenant_id = %request.tenant_id,
                    ruleset_id = %request.ruleset_id,
                    %detail,
                    "Refusing deployment into another pair's container"
                );
                Self::failed_before_create(container_id, FailureKind::RegistryInconsistency, detail)
            }
            Ok(Some(record)) if record.is_current(request.document_hash.as_deref()) => {
                info!(container_id = %container_id, version = record.artifact_version, "Document unchanged, nothing to deploy");
                DeploymentReport::no_op(container_id, record.endpoint, record.port, record.artifact_version)
            }
            Ok(Some(record)) if record.is_active && record.is_provisioned() => self.redeploy(record, &request).await,
            Ok(existing) => self.fresh_deploy(existing, &request).await,
        };

        counter!("rulefleet_deployments_total", "status" => report.status.as_str()).increment(1);
        report
    }

    async fn teardown(&self, container_id: &ContainerId) -> Result<TeardownReport, OrchestratorError> {
        let Some(_guard) = self.try_lock(container_id) else {
            return Ok(TeardownReport::new(
                DeploymentStatus::InProgress,
                container_id.clone(),
                Some("another operation holds this container".to_string()),
            ));
        };

        let record = match self.registry.find_by_id(container_id).await {
            Ok(record) => record,
            Err(e) => {
                error!(container_id = %container_id, error = %e, "Teardown could not read the registry");
                return Ok(TeardownReport::failed(
                    container_id.clone(),
                    FailureKind::RegistryInconsistency,
                    e.to_string(),
                ));
            }
        };
        let Some(record) = record.filter(|r| r.is_active) else {
            debug!(container_id = %container_id, "Teardown of inactive or unknown container");
            return Ok(TeardownReport::new(
                DeploymentStatus::NoOp,
                container_id.clone(),
                Some("no active container".to_string()),
            ));
        };

        if let Err(e) = self.driver.delete(container_id).await {
            let detail = format!("delete of {} failed: {}", record.environment_name, e);
            return Ok(self.teardown_failed(&record, FailureKind::PlatformError, detail).await);
        }

        let mut stopped = record.clone();
        stopped.mark_stopped();
        let stopped = match self.persist(&stopped).await {
            Ok(stored) => stored,
            Err(e) => {
                let detail = format!("environment deleted but record not updated: {}", e);
                return Ok(self.teardown_failed(&record, FailureKind::RegistryInconsistency, detail).await);
            }
        };
        self.record_history(&stopped, DeploymentAction::Stopped, None).await;
        self.event_bus.publish(ContainerEvent::ContainerStopped {
            container_id: container_id.clone(),
            stopped_at: Utc::now(),
        });
        counter!("rulefleet_teardowns_total", "status" => DeploymentStatus::Success.as_str()).increment(1);
        info!(container_id = %container_id, port = stopped.port, "Container torn down");

        Ok(TeardownReport::new(DeploymentStatus::Success, container_id.clone(), None))
    }

    async fn reconcile(&self) -> Result<ReconciliationReport, OrchestratorError> {
        let platform = self.driver.platform();
        let records = self.registry.list_active(platform).await?;
        let live = self.driver.list().await?;

        let mut report = ReconciliationReport::new(platform);
        report.registry_active = records.len();
        report.live = live.len();
        let mut claimed: HashSet<String> = HashSet::new();

        for mut record in records {
            let environment = live.iter().find(|env| {
                env.container_id.as_ref() == Some(&record.container_id) || env.name == record.environment_name
            });
            if let Some(env) = environment {
                claimed.insert(env.name.clone());
            }

            let Some(_guard) = self.try_lock(&record.container_id) else {
                report.skipped_deploying += 1;
                continue;
            };
            if record.status == ContainerStatus::Deploying {
                report.skipped_deploying += 1;
                continue;
            }

            let Some(env) = environment else {
                let detail = format!("environment {} not found on {}", record.environment_name, platform);
                warn!(container_id = %record.container_id, %detail, "Registry record has no environment");
                report.discrepancies.push(Discrepancy {
                    subject: record.container_id.to_string(),
                    kind: DiscrepancyKind::MissingEnvironment,
                    detail: detail.clone(),
                });

                record.mark_failed_inactive();
                match self.registry.update(&record).await {
                    Ok(stored) => {
                        self.record_history(&stored, DeploymentAction::Failed, Some(detail.clone())).await;
                        self.event_bus.publish(ContainerEvent::ContainerMarkedFailed {
                            container_id: stored.container_id.clone(),
                            reason: detail,
                            marked_at: Utc::now(),
                        });
                        report.marked_failed.push(stored.container_id);
                    }
                    Err(e) if e.is_conflict() => {
                        debug!(container_id = %record.container_id, "Record changed during sweep, leaving for next run");
                    }
                    Err(e) => return Err(e.into()),
                }
                continue;
            };

            if let Some(port) = env.port.filter(|p| *p != record.port) {
                let detail = format!("registry has port {}, environment publishes {}", record.port, port);
                warn!(container_id = %record.container_id, %detail, "Port mismatch");
                report.discrepancies.push(Discrepancy {
                    subject: record.container_id.to_string(),
                    kind: DiscrepancyKind::PortMismatch,
                    detail,
                });
            }

            let observed = self.driver.health_check(&record.endpoint).await;
            report.health_refreshed += 1;
            if record.observe_health(observed) {
                match self.registry.update(&record).await {
                    Ok(stored) => {
                        self.event_bus.publish(ContainerEvent::HealthChanged {
                            container_id: stored.container_id,
                            healthy: observed == HealthStatus::Healthy,
                            observed_at: Utc::now(),
                        });
                    }
                    Err(e) if e.is_conflict() => {
                        debug!(container_id = %record.container_id, "Record changed during sweep, leaving for next run");
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }

        for env in live.iter().filter(|env| !claimed.contains(&env.name)) {
            warn!(environment = %env.name, port = ?env.port, "Live environment without an active record");
            report.discrepancies.push(Discrepancy {
                subject: env
                    .container_id
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| env.name.clone()),
                kind: DiscrepancyKind::OrphanedEnvironment,
                detail: format!("environment {} is not tracked by an active record", env.name),
            });
            report.orphaned.push(env.name.clone());
            self.event_bus.publish(ContainerEvent::OrphanDetected {
                environment: env.name.clone(),
                container_id: env.container_id.clone(),
                port: env.port,
                detected_at: Utc::now(),
            });
        }

        for discrepancy in &report.discrepancies {
            counter!("rulefleet_reconcile_discrepancies_total", "kind" => discrepancy.kind.as_str()).increment(1);
        }
        gauge!("rulefleet_active_containers", "platform" => platform.as_str())
            .set((report.registry_active - report.marked_failed.len()) as f64);

        info!(
            platform = %platform,
            active = report.registry_active,
            live = report.live,
            marked_failed = report.marked_failed.len(),
            orphaned = report.orphaned.len(),
            skipped = report.skipped_deploying,
            "Reconciliation finished"
        );
        Ok(report)
    }

    async fn get(&self, container_id: &ContainerId) -> Result<Option<ContainerRecord>, OrchestratorError> {
        Ok(self.registry.find_by_id(container_id).await?)
    }

    async fn list(&self, include_inactive: bool) -> Result<Vec<ContainerRecord>, OrchestratorError> {
        Ok(self.registry.list_all(include_inactive).await?)
    }

    async fn history(&self, container_id: &ContainerId) -> Result<Vec<DeploymentHistoryEntry>, OrchestratorError> {
        Ok(self.registry.history(container_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::artifact::Artifact;
    use crate::domain::container::{Platform, ReleaseId, RulesetId, TenantId};
    use crate::domain::node_config::DeploymentConfig;
    use crate::infrastructure::kie_server::MockRuleRuntime;
    use crate::infrastructure::platform::MockPlatformDriver;
    use crate::infrastructure::repositories::InMemoryContainerRegistry;
    use std::time::Duration;

    fn orchestrator() -> StandardContainerOrchestrator {
        let mut spec = FleetConfigSpec::default();
        spec.deployment = DeploymentConfig {
            activation_timeout: Duration::from_millis(200),
            probe_base_delay: Duration::from_millis(1),
            probe_max_delay: Duration::from_millis(5),
            ..DeploymentConfig::default()
        };
        let driver = Arc::new(
            MockPlatformDriver::new(Platform::Local)
                .with_static_environment(&spec.default_environment.name, &spec.default_environment.endpoint),
        );
        StandardContainerOrchestrator::new(
            Arc::new(InMemoryContainerRegistry::new()),
            driver,
            Arc::new(MockRuleRuntime::new()),
            Arc::new(EventBus::with_default_capacity()),
            &spec,
        )
    }

    fn request(ruleset: &str) -> DeploymentRequest {
        DeploymentRequest {
            tenant_id: TenantId::new("chase"),
            ruleset_id: RulesetId::new(ruleset),
            artifact: Artifact::inline(
                ReleaseId::new("com.underwriting", format!("chase-{}", ruleset), "1.0.0"),
                b"jar".to_vec(),
                b"<project/>".to_vec(),
            ),
            document_hash: Some("h1".into()),
        }
    }

    #[test]
    fn test_guard_holds_id_until_dropped() {
        let orchestrator = orchestrator();
        let id = request("insurance").container_id();

        let guard = orchestrator.try_lock(&id).unwrap();
        assert!(orchestrator.try_lock(&id).is_none());
        assert_eq!(orchestrator.locks.len(), 1);

        drop(guard);
        assert!(orchestrator.locks.is_empty());
        assert!(orchestrator.try_lock(&id).is_some());
    }

    #[tokio::test]
    async fn test_locks_are_released_after_operations() {
        let orchestrator = orchestrator();
        for ruleset in ["insurance", "auto", "life"] {
            let report = orchestrator.deploy(request(ruleset)).await;
            assert_eq!(report.status, DeploymentStatus::Success);
        }
        orchestrator.teardown(&request("auto").container_id()).await.unwrap();
        orchestrator.reconcile().await.unwrap();

        assert!(orchestrator.locks.is_empty());
    }
}

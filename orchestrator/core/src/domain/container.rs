// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Container Aggregate
//!
//! One `ContainerRecord` exists per (tenant, rule-set) execution environment.
//! The record is the aggregate root of the registry: every lifecycle
//! transition goes through the methods below so the state machine
//!
//! ```text
//! absent ──> deploying ──> running ──> deploying ──> running
//!               │             │
//!               └──> failed   └──> stopped (inactive)
//! ```
//!
//! is enforced in one place. Records are soft-deleted (`is_active = false`)
//! and never removed, so `DeploymentHistoryEntry` rows stay attributable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Prefix shared by every environment this system manages.
pub const ENVIRONMENT_PREFIX: &str = "rulefleet";

/// DNS-1123 label limit (Kubernetes object names, Docker hostnames).
const MAX_ENVIRONMENT_NAME_LEN: usize = 63;

// ============================================================================
// Value Objects
// ============================================================================

/// Tenant identifier as supplied by the build pipeline (e.g. "chase")
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantId(pub String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Rule-set identifier, usually the policy type (e.g. "insurance")
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RulesetId(pub String);

impl RulesetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RulesetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Deterministic identifier of a rule-set container.
///
/// The same id names the unit loaded into the rule runtime, the registry row
/// and (through [`ContainerId::environment_name`]) the platform environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(String);

impl ContainerId {
    /// Derive the container id for a (tenant, rule-set) pair.
    pub fn for_ruleset(tenant_id: &TenantId, ruleset_id: &RulesetId) -> Self {
        Self(format!(
            "{}-{}-underwriting-rules",
            normalize_segment(tenant_id.as_str()),
            normalize_segment(ruleset_id.as_str())
        ))
    }

    /// Wrap an id received from a caller. Ids are case-insensitive.
    pub fn parse(raw: &str) -> Result<Self, ContainerError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ContainerError::InvalidId("container id cannot be empty".to_string()));
        }
        Ok(Self(normalize_segment(trimmed)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the environment backing this container on any platform.
    ///
    /// Names longer than a DNS label are truncated and suffixed with a short
    /// hash of the full id so two long ids never collide.
    pub fn environment_name(&self) -> String {
        let full = format!("{}-{}", ENVIRONMENT_PREFIX, self.0);
        if full.len() <= MAX_ENVIRONMENT_NAME_LEN {
            return full;
        }

        let digest = Sha256::digest(self.0.as_bytes());
        let suffix = &hex::encode(digest)[..8];
        let keep = MAX_ENVIRONMENT_NAME_LEN - suffix.len() - 1;
        let head = full[..keep].trim_end_matches('-');
        format!("{}-{}", head, suffix)
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn normalize_segment(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_matches('-').to_string()
}

/// Infrastructure backend hosting an environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// Local container runtime (Docker)
    Local,
    /// Cluster orchestrator (Kubernetes)
    Cluster,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Cluster => "cluster",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = ContainerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" | "docker" => Ok(Self::Local),
            "cluster" | "kubernetes" | "k8s" => Ok(Self::Cluster),
            other => Err(ContainerError::InvalidValue(format!("unknown platform '{}'", other))),
        }
    }
}

/// Lifecycle status of a container record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Deploying,
    Running,
    Stopped,
    Failed,
    Unhealthy,
}

impl ContainerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deploying => "deploying",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
            Self::Unhealthy => "unhealthy",
        }
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContainerStatus {
    type Err = ContainerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deploying" => Ok(Self::Deploying),
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "failed" => Ok(Self::Failed),
            "unhealthy" => Ok(Self::Unhealthy),
            other => Err(ContainerError::InvalidValue(format!("unknown status '{}'", other))),
        }
    }
}

/// Last observed health of an environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HealthStatus {
    type Err = ContainerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "healthy" => Ok(Self::Healthy),
            "unhealthy" => Ok(Self::Unhealthy),
            "unknown" => Ok(Self::Unknown),
            other => Err(ContainerError::InvalidValue(format!("unknown health status '{}'", other))),
        }
    }
}

/// Maven-style coordinates of a rule artifact
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReleaseId {
    pub group_id: String,
    pub artifact_id: String,
    pub version: String,
}

impl ReleaseId {
    pub fn new(
        group_id: impl Into<String>,
        artifact_id: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            group_id: group_id.into(),
            artifact_id: artifact_id.into(),
            version: version.into(),
        }
    }

    /// Repository-relative directory holding this release
    /// (`com/underwriting/chase-insurance/1.0.0`).
    pub fn repository_dir(&self) -> String {
        format!(
            "{}/{}/{}",
            self.group_id.replace('.', "/"),
            self.artifact_id,
            self.version
        )
    }

    /// File stem shared by the jar and pom (`chase-insurance-1.0.0`).
    pub fn file_stem(&self) -> String {
        format!("{}-{}", self.artifact_id, self.version)
    }
}

impl fmt::Display for ReleaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.group_id, self.artifact_id, self.version)
    }
}

// ============================================================================
// Aggregate Root
// ============================================================================

/// Registry entry for one rule-set execution environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub container_id: ContainerId,
    pub tenant_id: TenantId,
    pub ruleset_id: RulesetId,
    pub platform: Platform,
    pub environment_name: String,
    pub endpoint: String,
    pub port: u16,
    pub status: ContainerStatus,
    pub health_status: HealthStatus,
    /// 0 until the first artifact is loaded
    pub artifact_version: i64,
    pub release_id: Option<ReleaseId>,
    pub document_hash: Option<String>,
    pub is_active: bool,
    /// Optimistic concurrency token, bumped by the registry on every update
    pub revision: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ContainerRecord {
    /// Start a new deployment cycle for a pair that has no record yet.
    pub fn new_deploying(
        tenant_id: TenantId,
        ruleset_id: RulesetId,
        platform: Platform,
        endpoint: impl Into<String>,
        port: u16,
    ) -> Self {
        let container_id = ContainerId::for_ruleset(&tenant_id, &ruleset_id);
        let environment_name = container_id.environment_name();
        let now = Utc::now();
        Self {
            container_id,
            tenant_id,
            ruleset_id,
            platform,
            environment_name,
            endpoint: endpoint.into(),
            port,
            status: ContainerStatus::Deploying,
            health_status: HealthStatus::Unknown,
            artifact_version: 0,
            release_id: None,
            document_hash: None,
            is_active: true,
            revision: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Bring an inactive (torn down or failed) record back for a fresh
    /// environment. The artifact version continues from where it stopped.
    pub fn reactivate(&mut self, platform: Platform, endpoint: impl Into<String>, port: u16) -> Result<(), ContainerError> {
        if self.is_active {
            return Err(ContainerError::InvalidTransition {
                container_id: self.container_id.clone(),
                from: self.status,
                action: "reactivate",
            });
        }
        self.platform = platform;
        self.endpoint = endpoint.into();
        self.port = port;
        self.status = ContainerStatus::Deploying;
        self.health_status = HealthStatus::Unknown;
        self.is_active = true;
        self.touch();
        Ok(())
    }

    /// Whether this record belongs to exactly this (tenant, rule set) pair.
    ///
    /// Distinct pairs can normalize to the same container id.
    pub fn owned_by(&self, tenant_id: &TenantId, ruleset_id: &RulesetId) -> bool {
        &self.tenant_id == tenant_id && &self.ruleset_id == ruleset_id
    }

    /// An environment was recorded for this record and has loaded an
    /// artifact at least once.
    pub fn is_provisioned(&self) -> bool {
        !self.endpoint.is_empty() && self.artifact_version > 0
    }

    /// Enter a redeploy cycle on an active record.
    pub fn begin_redeploy(&mut self) -> Result<(), ContainerError> {
        match self.status {
            ContainerStatus::Running | ContainerStatus::Unhealthy | ContainerStatus::Failed if self.is_active => {
                self.status = ContainerStatus::Deploying;
                self.touch();
                Ok(())
            }
            from => Err(ContainerError::InvalidTransition {
                container_id: self.container_id.clone(),
                from,
                action: "redeploy",
            }),
        }
    }

    /// Move the environment to a new port after a bind conflict.
    pub fn rebind(&mut self, endpoint: impl Into<String>, port: u16) {
        self.endpoint = endpoint.into();
        self.port = port;
        self.touch();
    }

    /// Complete a deployment cycle: the artifact is loaded and healthy.
    pub fn mark_running(&mut self, release_id: ReleaseId, document_hash: Option<String>) -> Result<(), ContainerError> {
        if self.status != ContainerStatus::Deploying {
            return Err(ContainerError::InvalidTransition {
                container_id: self.container_id.clone(),
                from: self.status,
                action: "mark running",
            });
        }
        self.status = ContainerStatus::Running;
        self.health_status = HealthStatus::Healthy;
        self.artifact_version += 1;
        self.release_id = Some(release_id);
        self.document_hash = document_hash;
        self.touch();
        Ok(())
    }

    /// End a failed update without regressing a previously loaded version.
    ///
    /// Records that never loaded an artifact become `failed`.
    pub fn abandon_deployment(&mut self) {
        self.status = if self.artifact_version > 0 {
            ContainerStatus::Running
        } else {
            ContainerStatus::Failed
        };
        self.touch();
    }

    /// The environment exists but holds nothing usable. Stays active so a
    /// retry reuses it.
    pub fn mark_failed(&mut self) {
        self.status = ContainerStatus::Failed;
        self.touch();
    }

    /// Provisioning failed unrecoverably; the environment is gone.
    pub fn mark_failed_inactive(&mut self) {
        self.status = ContainerStatus::Failed;
        self.health_status = HealthStatus::Unknown;
        self.is_active = false;
        self.touch();
    }

    /// Explicit teardown.
    pub fn mark_stopped(&mut self) {
        self.status = ContainerStatus::Stopped;
        self.health_status = HealthStatus::Unknown;
        self.is_active = false;
        self.touch();
    }

    /// Apply a health observation. Returns true when anything changed.
    pub fn observe_health(&mut self, observed: HealthStatus) -> bool {
        let previous = (self.status, self.health_status);
        self.health_status = observed;
        match (self.status, observed) {
            (ContainerStatus::Running, HealthStatus::Unhealthy) => self.status = ContainerStatus::Unhealthy,
            (ContainerStatus::Unhealthy, HealthStatus::Healthy) => self.status = ContainerStatus::Running,
            _ => {}
        }
        let changed = previous != (self.status, self.health_status);
        if changed {
            self.touch();
        }
        changed
    }

    /// Whether evaluation traffic may be sent to this environment.
    pub fn is_routable(&self) -> bool {
        self.is_active
            && self.artifact_version > 0
            && self.health_status != HealthStatus::Unhealthy
            && matches!(self.status, ContainerStatus::Running | ContainerStatus::Deploying)
    }

    /// Whether a deploy carrying `document_hash` would change nothing.
    pub fn is_current(&self, document_hash: Option<&str>) -> bool {
        self.is_active
            && self.artifact_version > 0
            && matches!(self.status, ContainerStatus::Running | ContainerStatus::Unhealthy)
            && document_hash.is_some()
            && self.document_hash.as_deref() == document_hash
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

// ============================================================================
// Deployment History
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentAction {
    Deployed,
    Updated,
    Stopped,
    Restarted,
    Failed,
}

impl DeploymentAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deployed => "deployed",
            Self::Updated => "updated",
            Self::Stopped => "stopped",
            Self::Restarted => "restarted",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for DeploymentAction {
    type Err = ContainerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deployed" => Ok(Self::Deployed),
            "updated" => Ok(Self::Updated),
            "stopped" => Ok(Self::Stopped),
            "restarted" => Ok(Self::Restarted),
            "failed" => Ok(Self::Failed),
            other => Err(ContainerError::InvalidValue(format!("unknown deployment action '{}'", other))),
        }
    }
}

impl fmt::Display for DeploymentAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only audit row; a snapshot of the record at a transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentHistoryEntry {
    pub id: Uuid,
    pub container_id: ContainerId,
    pub action: DeploymentAction,
    pub artifact_version: i64,
    pub endpoint: String,
    pub port: u16,
    pub status: ContainerStatus,
    pub detail: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl DeploymentHistoryEntry {
    pub fn snapshot(record: &ContainerRecord, action: DeploymentAction, detail: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            container_id: record.container_id.clone(),
            action,
            artifact_version: record.artifact_version,
            endpoint: record.endpoint.clone(),
            port: record.port,
            status: record.status,
            detail,
            recorded_at: Utc::now(),
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("Invalid container id: {0}")]
    InvalidId(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Container {container_id} cannot {action} from status {from}")]
    InvalidTransition {
        container_id: ContainerId,
        from: ContainerStatus,
        action: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ContainerRecord {
        ContainerRecord::new_deploying(
            TenantId::new("chase"),
            RulesetId::new("insurance"),
            Platform::Local,
            "http://localhost:8081",
            8081,
        )
    }

    fn release(version: &str) -> ReleaseId {
        ReleaseId::new("com.underwriting", "chase-insurance", version)
    }

    #[test]
    fn test_container_id_is_deterministic() {
        let a = ContainerId::for_ruleset(&TenantId::new("chase"), &RulesetId::new("insurance"));
        let b = ContainerId::for_ruleset(&TenantId::new("Chase"), &RulesetId::new(" insurance "));
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "chase-insurance-underwriting-rules");
    }

    #[test]
    fn test_container_id_normalizes_separators() {
        let id = ContainerId::for_ruleset(&TenantId::new("Bank of X"), &RulesetId::new("auto_loan"));
        assert_eq!(id.as_str(), "bank-of-x-auto-loan-underwriting-rules");
    }

    #[test]
    fn test_colliding_pairs_are_told_apart_by_ownership() {
        let record = ContainerRecord::new_deploying(
            TenantId::new("a-b"),
            RulesetId::new("c"),
            Platform::Local,
            "http://localhost:8081",
            8081,
        );
        let other_tenant = TenantId::new("a");
        let other_ruleset = RulesetId::new("b-c");
        assert_eq!(record.container_id, ContainerId::for_ruleset(&other_tenant, &other_ruleset));
        assert!(record.owned_by(&TenantId::new("a-b"), &RulesetId::new("c")));
        assert!(!record.owned_by(&other_tenant, &other_ruleset));
        assert!(!record.owned_by(&TenantId::new("A-B"), &RulesetId::new("c")));
    }

    #[test]
    fn test_is_provisioned_needs_endpoint_and_loaded_version() {
        let mut record = record();
        assert!(!record.is_provisioned());
        record.mark_running(release("1.0.0"), None).unwrap();
        assert!(record.is_provisioned());
        record.rebind(String::new(), 8081);
        assert!(!record.is_provisioned());
    }

    #[test]
    fn test_environment_name_fits_dns_label() {
        let short = ContainerId::for_ruleset(&TenantId::new("chase"), &RulesetId::new("loan"));
        assert_eq!(short.environment_name(), "rulefleet-chase-loan-underwriting-rules");

        let long_tenant = "a".repeat(80);
        let long = ContainerId::for_ruleset(&TenantId::new(&long_tenant), &RulesetId::new("loan"));
        let other = ContainerId::for_ruleset(&TenantId::new(&long_tenant), &RulesetId::new("life"));
        assert!(long.environment_name().len() <= 63);
        assert_ne!(long.environment_name(), other.environment_name());
    }

    #[test]
    fn test_parse_rejects_empty() {
        assert!(ContainerId::parse("  ").is_err());
        assert_eq!(ContainerId::parse("ABC-def").unwrap().as_str(), "abc-def");
    }

    #[test]
    fn test_first_deployment_cycle() {
        let mut record = record();
        assert_eq!(record.status, ContainerStatus::Deploying);
        assert!(!record.is_routable());

        record.mark_running(release("1.0.0"), Some("h1".into())).unwrap();
        assert_eq!(record.status, ContainerStatus::Running);
        assert_eq!(record.artifact_version, 1);
        assert!(record.is_routable());
        assert!(record.is_current(Some("h1")));
        assert!(!record.is_current(Some("h2")));
        assert!(!record.is_current(None));
    }

    #[test]
    fn test_failed_update_keeps_running_version() {
        let mut record = record();
        record.mark_running(release("1.0.0"), Some("h1".into())).unwrap();
        record.begin_redeploy().unwrap();
        assert!(record.is_routable(), "previous version keeps serving during redeploy");

        record.abandon_deployment();
        assert_eq!(record.status, ContainerStatus::Running);
        assert_eq!(record.artifact_version, 1);
    }

    #[test]
    fn test_failed_first_deploy_is_failed() {
        let mut record = record();
        record.abandon_deployment();
        assert_eq!(record.status, ContainerStatus::Failed);
        assert!(record.is_active);
        assert!(record.begin_redeploy().is_ok());
    }

    #[test]
    fn test_mark_running_requires_deploying() {
        let mut record = record();
        record.mark_running(release("1.0.0"), None).unwrap();
        assert!(record.mark_running(release("1.0.1"), None).is_err());
    }

    #[test]
    fn test_stopped_record_cannot_redeploy_until_reactivated() {
        let mut record = record();
        record.mark_running(release("1.0.0"), None).unwrap();
        record.mark_stopped();
        assert!(!record.is_active);
        assert!(record.begin_redeploy().is_err());

        record.reactivate(Platform::Local, "http://localhost:8090", 8090).unwrap();
        assert_eq!(record.status, ContainerStatus::Deploying);
        assert_eq!(record.port, 8090);
        assert_eq!(record.artifact_version, 1);
    }

    #[test]
    fn test_health_observation_toggles_unhealthy() {
        let mut record = record();
        record.mark_running(release("1.0.0"), None).unwrap();

        assert!(record.observe_health(HealthStatus::Unhealthy));
        assert_eq!(record.status, ContainerStatus::Unhealthy);
        assert!(!record.is_routable());

        assert!(record.observe_health(HealthStatus::Healthy));
        assert_eq!(record.status, ContainerStatus::Running);
        assert!(!record.observe_health(HealthStatus::Healthy));
    }

    #[test]
    fn test_release_repository_layout() {
        let release = release("1.2.3");
        assert_eq!(release.repository_dir(), "com/underwriting/chase-insurance/1.2.3");
        assert_eq!(release.file_stem(), "chase-insurance-1.2.3");
    }
}

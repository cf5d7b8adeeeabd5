// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Repository Implementations
//!
//! Infrastructure implementations of the `ContainerRegistry` contract defined
//! in the domain layer.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Persist and retrieve container records and their history
//! - **Pattern:** Repository (DDD), Adapter (Hexagonal Architecture)
//!
//! # Available Implementations
//!
//! - **PostgresContainerRegistry** - production store; uniqueness enforced by
//!   partial unique indexes, compare-and-set via `WHERE revision = $n`
//! - **InMemoryContainerRegistry** - development and tests; enforces the
//!   same uniqueness and revision rules under a single write lock
//!
//! # Usage
//!
//! ```ignore
//! use rulefleet_core::infrastructure::db::Database;
//! use rulefleet_core::infrastructure::repositories::PostgresContainerRegistry;
//!
//! let db = Database::connect(&postgres_config).await?;
//! let registry = PostgresContainerRegistry::new(db.into_pool());
//! let record = registry.find_by_id(&container_id).await?;
//! ```

pub mod postgres_container;

pub use postgres_container::PostgresContainerRegistry;

use std::collections::HashMap;
use std::sync::Arc;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use crate::domain::container::{ContainerId, ContainerRecord, DeploymentHistoryEntry, Platform};
use crate::domain::repository::{ContainerRegistry, RepositoryError, StorageBackend};
use crate::infrastructure::db::Database;

#[derive(Default)]
struct RegistryState {
    records: HashMap<ContainerId, ContainerRecord>,
    history: Vec<DeploymentHistoryEntry>,
}

impl RegistryState {
    /// Uniqueness rules of the active set, ignoring the candidate's own row
    fn check_active_constraints(&self, candidate: &ContainerRecord) -> Result<(), RepositoryError> {
        if !candidate.is_active {
            return Ok(());
        }
        for other in self.records.values() {
            if !other.is_active || other.container_id == candidate.container_id {
                continue;
            }
            if other.tenant_id == candidate.tenant_id && other.ruleset_id == candidate.ruleset_id {
                return Err(RepositoryError::Conflict(format!(
                    "active record already exists for {}/{}",
                    candidate.tenant_id, candidate.ruleset_id
                )));
            }
            if other.platform == candidate.platform && other.port == candidate.port {
                return Err(RepositoryError::Conflict(format!(
                    "port {} already held by {} on {}",
                    candidate.port, other.container_id, candidate.platform
                )));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryContainerRegistry {
    state: Arc<RwLock<RegistryState>>,
}

impl InMemoryContainerRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContainerRegistry for InMemoryContainerRegistry {
    async fn find_by_id(&self, id: &ContainerId) -> Result<Option<ContainerRecord>, RepositoryError> {
        Ok(self.state.read().records.get(id).cloned())
    }

    async fn list_active(&self, platform: Platform) -> Result<Vec<ContainerRecord>, RepositoryError> {
        let state = self.state.read();
        let mut records: Vec<_> = state
            .records
            .values()
            .filter(|r| r.is_active && r.platform == platform)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.container_id.cmp(&b.container_id));
        Ok(records)
    }

    async fn list_all(&self, include_inactive: bool) -> Result<Vec<ContainerRecord>, RepositoryError> {
        let state = self.state.read();
        let mut records: Vec<_> = state
            .records
            .values()
            .filter(|r| include_inactive || r.is_active)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.container_id.cmp(&b.container_id));
        Ok(records)
    }

    async fn insert(&self, record: &ContainerRecord) -> Result<ContainerRecord, RepositoryError> {
        let mut state = self.state.write();
        if state.records.contains_key(&record.container_id) {
            return Err(RepositoryError::Conflict(format!(
                "container {} already exists",
                record.container_id
            )));
        }
        state.check_active_constraints(record)?;

        let mut stored = record.clone();
        stored.revision = 1;
        state.records.insert(stored.container_id.clone(), stored.clone());
        Ok(stored)
    }

    async fn update(&self, record: &ContainerRecord) -> Result<ContainerRecord, RepositoryError> {
        let mut state = self.state.write();
        let current_revision = match state.records.get(&record.container_id) {
            Some(current) => current.revision,
            None => {
                return Err(RepositoryError::NotFound(format!(
                    "container {} not found",
                    record.container_id
                )))
            }
        };
        if current_revision != record.revision {
            return Err(RepositoryError::Conflict(format!(
                "stale revision {} for {} (current {})",
                record.revision, record.container_id, current_revision
            )));
        }
        state.check_active_constraints(record)?;

        let mut stored = record.clone();
        stored.revision += 1;
        stored.updated_at = Utc::now();
        state.records.insert(stored.container_id.clone(), stored.clone());
        Ok(stored)
    }

    async fn append_history(&self, entry: &DeploymentHistoryEntry) -> Result<(), RepositoryError> {
        let mut state = self.state.write();
        if !state.records.contains_key(&entry.container_id) {
            return Err(RepositoryError::NotFound(format!(
                "container {} not found",
                entry.container_id
            )));
        }
        state.history.push(entry.clone());
        Ok(())
    }

    async fn history(&self, id: &ContainerId) -> Result<Vec<DeploymentHistoryEntry>, RepositoryError> {
        Ok(self
            .state
            .read()
            .history
            .iter()
            .filter(|e| &e.container_id == id)
            .cloned()
            .collect())
    }
}

/// Build the registry for a storage backend
pub async fn create_container_registry(
    backend: &StorageBackend,
) -> anyhow::Result<Arc<dyn ContainerRegistry>> {
    match backend {
        StorageBackend::InMemory => {
            tracing::info!("Using in-memory container registry");
            Ok(Arc::new(InMemoryContainerRegistry::new()))
        }
        StorageBackend::PostgreSQL(config) => {
            tracing::info!("Using PostgreSQL container registry");
            let db = Database::connect(config).await?;
            Ok(Arc::new(PostgresContainerRegistry::new(db.into_pool())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::container::{
        ContainerStatus, DeploymentAction, ReleaseId, RulesetId, TenantId,
    };

    fn record(tenant: &str, ruleset: &str, port: u16) -> ContainerRecord {
        ContainerRecord::new_deploying(
            TenantId::new(tenant),
            RulesetId::new(ruleset),
            Platform::Local,
            format!("http://localhost:{}", port),
            port,
        )
    }

    #[tokio::test]
    async fn test_insert_and_find() {
        let registry = InMemoryContainerRegistry::new();
        let stored = registry.insert(&record("chase", "insurance", 8081)).await.unwrap();
        assert_eq!(stored.revision, 1);

        let found = registry.find_by_id(&stored.container_id).await.unwrap().unwrap();
        assert_eq!(found.port, 8081);
        assert_eq!(registry.list_active(Platform::Local).await.unwrap().len(), 1);
        assert!(registry.list_active(Platform::Cluster).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_active_port_is_unique_per_platform() {
        let registry = InMemoryContainerRegistry::new();
        registry.insert(&record("chase", "insurance", 8081)).await.unwrap();

        let err = registry.insert(&record("wells", "loan", 8081)).await.unwrap_err();
        assert!(err.is_conflict());

        let mut cluster = record("wells", "loan", 8081);
        cluster.platform = Platform::Cluster;
        assert!(registry.insert(&cluster).await.is_ok());
    }

    #[tokio::test]
    async fn test_inactive_record_releases_port() {
        let registry = InMemoryContainerRegistry::new();
        let mut stored = registry.insert(&record("chase", "insurance", 8081)).await.unwrap();
        stored.mark_stopped();
        registry.update(&stored).await.unwrap();

        assert!(registry.insert(&record("wells", "loan", 8081)).await.is_ok());
        assert_eq!(registry.list_all(false).await.unwrap().len(), 1);
        assert_eq!(registry.list_all(true).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_update_is_compare_and_set() {
        let registry = InMemoryContainerRegistry::new();
        let stored = registry.insert(&record("chase", "insurance", 8081)).await.unwrap();

        let mut first = stored.clone();
        first
            .mark_running(ReleaseId::new("com.underwriting", "chase-insurance", "1.0.0"), None)
            .unwrap();
        let updated = registry.update(&first).await.unwrap();
        assert_eq!(updated.revision, 2);

        let mut stale = stored;
        stale.mark_failed_inactive();
        let err = registry.update(&stale).await.unwrap_err();
        assert!(err.is_conflict());

        let current = registry.find_by_id(&updated.container_id).await.unwrap().unwrap();
        assert_eq!(current.status, ContainerStatus::Running);
    }

    #[tokio::test]
    async fn test_history_is_per_container_and_ordered() {
        let registry = InMemoryContainerRegistry::new();
        let a = registry.insert(&record("chase", "insurance", 8081)).await.unwrap();
        let b = registry.insert(&record("wells", "loan", 8082)).await.unwrap();

        registry
            .append_history(&DeploymentHistoryEntry::snapshot(&a, DeploymentAction::Deployed, None))
            .await
            .unwrap();
        registry
            .append_history(&DeploymentHistoryEntry::snapshot(&b, DeploymentAction::Deployed, None))
            .await
            .unwrap();
        registry
            .append_history(&DeploymentHistoryEntry::snapshot(&a, DeploymentAction::Stopped, None))
            .await
            .unwrap();

        let history = registry.history(&a.container_id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].action, DeploymentAction::Deployed);
        assert_eq!(history[1].action, DeploymentAction::Stopped);
    }
}

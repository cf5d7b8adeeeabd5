// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Domain Repository Interfaces
//!
//! Persistence contract for the container registry, following the DDD
//! Repository pattern: interface defined in the domain layer, implemented in
//! `crate::infrastructure::repositories`.
//!
//! | Trait | Aggregate | Implementations |
//! |-------|-----------|----------------|
//! | `ContainerRegistry` | `ContainerRecord` | `InMemoryContainerRegistry`, `PostgresContainerRegistry` |
//!
//! ## Storage Backend Abstraction
//!
//! The implementation is selected at startup from `spec.database` in
//! `rulefleet-config.yaml`: in-memory when absent, PostgreSQL otherwise.
//!
//! ## Concurrency
//!
//! Updates are compare-and-set on `ContainerRecord::revision`. A stale
//! revision yields `RepositoryError::Conflict` and the caller re-reads.
//! Uniqueness of active (tenant, rule-set) pairs and of active
//! (platform, port) pairs is enforced by the store and also surfaces as
//! `Conflict`.

use async_trait::async_trait;
use crate::domain::container::{ContainerId, ContainerRecord, DeploymentHistoryEntry, Platform};

/// Storage backend enum for pluggable persistence
#[derive(Debug, Clone)]
pub enum StorageBackend {
    InMemory,
    PostgreSQL(PostgresConfig),
}

#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub connection_string: String,
    pub max_connections: u32,
}

#[async_trait]
pub trait ContainerRegistry: Send + Sync {
    /// Find a record (active or not) by id
    async fn find_by_id(&self, id: &ContainerId) -> Result<Option<ContainerRecord>, RepositoryError>;

    /// Active records hosted on one platform
    async fn list_active(&self, platform: Platform) -> Result<Vec<ContainerRecord>, RepositoryError>;

    /// Every record, optionally including soft-deleted ones
    async fn list_all(&self, include_inactive: bool) -> Result<Vec<ContainerRecord>, RepositoryError>;

    /// Insert a new record. Fails with `Conflict` when the id exists or an
    /// active record already holds the pair or the port.
    async fn insert(&self, record: &ContainerRecord) -> Result<ContainerRecord, RepositoryError>;

    /// Compare-and-set update keyed on `record.revision`.
    ///
    /// Returns the stored record with its bumped revision.
    async fn update(&self, record: &ContainerRecord) -> Result<ContainerRecord, RepositoryError>;

    /// Append an audit row. History is never mutated.
    async fn append_history(&self, entry: &DeploymentHistoryEntry) -> Result<(), RepositoryError>;

    /// History of one container, oldest first
    async fn history(&self, id: &ContainerId) -> Result<Vec<DeploymentHistoryEntry>, RepositoryError>;
}

/// Repository errors
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl RepositoryError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

impl From<sqlx::Error> for RepositoryError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => RepositoryError::NotFound("Row not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                RepositoryError::Conflict(db_err.message().to_string())
            }
            _ => RepositoryError::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        RepositoryError::Serialization(err.to_string())
    }
}

impl From<crate::domain::container::ContainerError> for RepositoryError {
    fn from(err: crate::domain::container::ContainerError) -> Self {
        RepositoryError::Serialization(err.to_string())
    }
}

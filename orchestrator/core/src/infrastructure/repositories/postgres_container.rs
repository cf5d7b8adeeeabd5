// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Postgres Container Registry
//!
//! `rule_containers` holds one row per container id; `deployment_history` is
//! insert-only. Partial unique indexes on the active set make duplicate
//! active pairs and double-booked ports surface as unique violations, which
//! `RepositoryError::from` maps to `Conflict`.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use crate::domain::container::{
    ContainerId, ContainerRecord, DeploymentHistoryEntry, Platform, ReleaseId, RulesetId, TenantId,
};
use crate::domain::repository::{ContainerRegistry, RepositoryError};
use chrono::{DateTime, Utc};

const RECORD_COLUMNS: &str = r#"
    container_id, tenant_id, ruleset_id, platform, environment_name,
    endpoint, port, status, health_status, artifact_version, release_id,
    document_hash, is_active, revision, created_at, updated_at
"#;

pub struct PostgresContainerRegistry {
    pool: PgPool,
}

impl PostgresContainerRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ContainerRegistry for PostgresContainerRegistry {
    async fn find_by_id(&self, id: &ContainerId) -> Result<Option<ContainerRecord>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM rule_containers WHERE container_id = $1",
            RECORD_COLUMNS
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(parse_record_row).transpose()
    }

    async fn list_active(&self, platform: Platform) -> Result<Vec<ContainerRecord>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM rule_containers WHERE is_active AND platform = $1 ORDER BY container_id",
            RECORD_COLUMNS
        ))
        .bind(platform.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(parse_record_row).collect()
    }

    async fn list_all(&self, include_inactive: bool) -> Result<Vec<ContainerRecord>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM rule_containers WHERE is_active OR $1 ORDER BY container_id",
            RECORD_COLUMNS
        ))
        .bind(include_inactive)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(parse_record_row).collect()
    }

    async fn insert(&self, record: &ContainerRecord) -> Result<ContainerRecord, RepositoryError> {
        let release_json = record
            .release_id
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO rule_containers (
                container_id, tenant_id, ruleset_id, platform, environment_name,
                endpoint, port, status, health_status, artifact_version, release_id,
                document_hash, is_active, revision, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, 1, $14, $15)
            ON CONFLICT (container_id) DO NOTHING
            RETURNING {}
            "#,
            RECORD_COLUMNS
        ))
        .bind(record.container_id.as_str())
        .bind(record.tenant_id.as_str())
        .bind(record.ruleset_id.as_str())
        .bind(record.platform.as_str())
        .bind(&record.environment_name)
        .bind(&record.endpoint)
        .bind(i32::from(record.port))
        .bind(record.status.as_str())
        .bind(record.health_status.as_str())
        .bind(record.artifact_version)
        .bind(release_json)
        .bind(&record.document_hash)
        .bind(record.is_active)
        .bind(record.created_at)
        .bind(record.updated_at)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => parse_record_row(row),
            None => Err(RepositoryError::Conflict(format!(
                "container {} already exists",
                record.container_id
            ))),
        }
    }

    async fn update(&self, record: &ContainerRecord) -> Result<ContainerRecord, RepositoryError> {
        let release_json = record
            .release_id
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE rule_containers SET
                platform = $2,
                environment_name = $3,
                endpoint = $4,
                port = $5,
                status = $6,
                health_status = $7,
                artifact_version = $8,
                release_id = $9,
                document_hash = $10,
                is_active = $11,
                revision = revision + 1,
                updated_at = NOW()
            WHERE container_id = $1 AND revision = $12
            RETURNING {}
            "#,
            RECORD_COLUMNS
        ))
        .bind(record.container_id.as_str())
        .bind(record.platform.as_str())
        .bind(&record.environment_name)
        .bind(&record.endpoint)
        .bind(i32::from(record.port))
        .bind(record.status.as_str())
        .bind(record.health_status.as_str())
        .bind(record.artifact_version)
        .bind(release_json)
        .bind(&record.document_hash)
        .bind(record.is_active)
        .bind(record.revision)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return parse_record_row(row);
        }

        let exists: Option<i64> = sqlx::query_scalar("SELECT revision FROM rule_containers WHERE container_id = $1")
            .bind(record.container_id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match exists {
            Some(current) => Err(RepositoryError::Conflict(format!(
                "stale revision {} for {} (current {})",
                record.revision, record.container_id, current
            ))),
            None => Err(RepositoryError::NotFound(format!(
                "container {} not found",
                record.container_id
            ))),
        }
    }

    async fn append_history(&self, entry: &DeploymentHistoryEntry) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO deployment_history (
                id, container_id, action, artifact_version, endpoint, port,
                status, detail, recorded_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(entry.id)
        .bind(entry.container_id.as_str())
        .bind(entry.action.as_str())
        .bind(entry.artifact_version)
        .bind(&entry.endpoint)
        .bind(i32::from(entry.port))
        .bind(entry.status.as_str())
        .bind(&entry.detail)
        .bind(entry.recorded_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            let missing_parent =
                matches!(&e, sqlx::Error::Database(db) if db.is_foreign_key_violation());
            if missing_parent {
                RepositoryError::NotFound(format!("container {} not found", entry.container_id))
            } else {
                RepositoryError::from(e)
            }
        })?;

        Ok(())
    }

    async fn history(&self, id: &ContainerId) -> Result<Vec<DeploymentHistoryEntry>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT id, container_id, action, artifact_version, endpoint, port,
                   status, detail, recorded_at
            FROM deployment_history
            WHERE container_id = $1
            ORDER BY recorded_at ASC, id ASC
            "#,
        )
        .bind(id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(parse_history_row).collect()
    }
}

fn parse_port(raw: i32) -> Result<u16, RepositoryError> {
    u16::try_from(raw).map_err(|_| RepositoryError::Serialization(format!("port {} out of range", raw)))
}

/// Parse a container record from a database row
fn parse_record_row(row: PgRow) -> Result<ContainerRecord, RepositoryError> {
    let container_id: String = row.try_get("container_id")?;
    let tenant_id: String = row.try_get("tenant_id")?;
    let ruleset_id: String = row.try_get("ruleset_id")?;
    let platform: String = row.try_get("platform")?;
    let port: i32 = row.try_get("port")?;
    let status: String = row.try_get("status")?;
    let health_status: String = row.try_get("health_status")?;
    let release_val: Option<serde_json::Value> = row.try_get("release_id")?;
    let created_at: DateTime<Utc> = row.try_get("created_at")?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at")?;

    let release_id: Option<ReleaseId> = release_val
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| RepositoryError::Serialization(format!("Failed to deserialize release_id: {}", e)))?;

    Ok(ContainerRecord {
        container_id: ContainerId::parse(&container_id)?,
        tenant_id: TenantId::new(tenant_id),
        ruleset_id: RulesetId::new(ruleset_id),
        platform: platform.parse()?,
        environment_name: row.try_get("environment_name")?,
        endpoint: row.try_get("endpoint")?,
        port: parse_port(port)?,
        status: status.parse()?,
        health_status: health_status.parse()?,
        artifact_version: row.try_get("artifact_version")?,
        release_id,
        document_hash: row.try_get("document_hash")?,
        is_active: row.try_get("is_active")?,
        revision: row.try_get("revision")?,
        created_at,
        updated_at,
    })
}

fn parse_history_row(row: PgRow) -> Result<DeploymentHistoryEntry, RepositoryError> {
    let container_id: String = row.try_get("container_id")?;
    let action: String = row.try_get("action")?;
    let port: i32 = row.try_get("port")?;
    let status: String = row.try_get("status")?;

    Ok(DeploymentHistoryEntry {
        id: row.try_get("id")?,
        container_id: ContainerId::parse(&container_id)?,
        action: action.parse()?,
        artifact_version: row.try_get("artifact_version")?,
        endpoint: row.try_get("endpoint")?,
        port: parse_port(port)?,
        status: status.parse()?,
        detail: row.try_get("detail")?,
        recorded_at: row.try_get("recorded_at")?,
    })
}

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Registry Database
//!
//! Connection pool for the PostgreSQL registry. Only opened when
//! `spec.database` is configured; the schema itself is applied by
//! `rulefleet update`, never at daemon start.

use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info};

use crate::domain::repository::PostgresConfig;

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Open the pool and check that the server answers.
    pub async fn connect(config: &PostgresConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect(&config.connection_string)
            .await
            .context("Failed to connect to registry database")?;

        let db = Self { pool };
        db.ping().await?;
        info!(max_connections = config.max_connections, "Registry database connected");
        Ok(db)
    }

    /// Round-trip a trivial query
    pub async fn ping(&self) -> Result<()> {
        let one: i32 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("Registry database did not answer")?;
        debug!(result = one, "Registry database ping");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn into_pool(self) -> PgPool {
        self.pool
    }
}

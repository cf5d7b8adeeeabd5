// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Port Allocator
//!
//! Picks the lowest free host port in `[base_port, max_port]` for the
//! configured platform.
//!
//! # Architecture
//!
//! - **Layer:** Application
//! - **Collaborators:** `ContainerRegistry` (active records), `PlatformDriver::list` (live environments)
//!
//! A port counts as used when an active registry record holds it **or** a
//! live environment publishes it. Either source alone misses ports: records
//! lag behind half-created environments, and the platform does not know
//! about reservations that have not reached `create` yet. If the live scan
//! fails the allocation fails.
//!
//! Nothing is locked between allocation and `create`; the orchestrator
//! retries on `PortConflict` with the conflicting port excluded.

use crate::domain::node_config::PortRangeConfig;
use crate::domain::platform::PlatformDriver;
use crate::domain::repository::{ContainerRegistry, RepositoryError};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("No free port in range {base}-{max}")]
    Exhausted { base: u16, max: u16 },

    #[error("Live environment scan failed: {0}")]
    LiveScan(String),

    #[error("Registry error: {0}")]
    Registry(#[from] RepositoryError),
}

pub struct PortAllocator {
    registry: Arc<dyn ContainerRegistry>,
    driver: Arc<dyn PlatformDriver>,
    range: PortRangeConfig,
}

impl PortAllocator {
    pub fn new(
        registry: Arc<dyn ContainerRegistry>,
        driver: Arc<dyn PlatformDriver>,
        range: PortRangeConfig,
    ) -> Self {
        Self { registry, driver, range }
    }

    pub async fn allocate_port(&self) -> Result<u16, AllocationError> {
        self.allocate_port_excluding(&HashSet::new()).await
    }

    /// Allocate, additionally skipping `excluded` (ports that already
    /// failed to bind in this deployment attempt).
    pub async fn allocate_port_excluding(&self, excluded: &HashSet<u16>) -> Result<u16, AllocationError> {
        let used = self.used_ports().await?;

        let port = (self.range.base_port..=self.range.max_port)
            .find(|port| !used.contains(port) && !excluded.contains(port))
            .ok_or(AllocationError::Exhausted {
                base: self.range.base_port,
                max: self.range.max_port,
            })?;

        debug!(port, used = used.len(), excluded = excluded.len(), "Allocated port");
        Ok(port)
    }

    async fn used_ports(&self) -> Result<HashSet<u16>, AllocationError> {
        let platform = self.driver.platform();
        let mut used: HashSet<u16> = self
            .registry
            .list_active(platform)
            .await?
            .into_iter()
            .map(|record| record.port)
            .collect();

        let live = self
            .driver
            .list()
            .await
            .map_err(|e| AllocationError::LiveScan(e.to_string()))?;
        used.extend(live.into_iter().filter_map(|env| env.port));

        Ok(used)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::container::{ContainerRecord, Platform, RulesetId, TenantId};
    use crate::infrastructure::platform::MockPlatformDriver;
    use crate::infrastructure::repositories::InMemoryContainerRegistry;

    fn range(base: u16, max: u16) -> PortRangeConfig {
        PortRangeConfig {
            base_port: base,
            max_port: max,
            max_allocation_retries: 3,
        }
    }

    async fn seed(registry: &InMemoryContainerRegistry, ruleset: &str, port: u16) {
        let record = ContainerRecord::new_deploying(
            TenantId::new("chase"),
            RulesetId::new(ruleset),
            Platform::Local,
            MockPlatformDriver::endpoint_for(port),
            port,
        );
        registry.insert(&record).await.unwrap();
    }

    #[tokio::test]
    async fn test_allocates_base_port_when_empty() {
        let registry = Arc::new(InMemoryContainerRegistry::new());
        let driver = Arc::new(MockPlatformDriver::new(Platform::Local));
        let allocator = PortAllocator::new(registry, driver, range(8081, 8090));

        assert_eq!(allocator.allocate_port().await.unwrap(), 8081);
    }

    #[tokio::test]
    async fn test_skips_registry_and_live_ports() {
        let registry = Arc::new(InMemoryContainerRegistry::new());
        seed(&registry, "insurance", 8081).await;

        let driver = Arc::new(MockPlatformDriver::new(Platform::Local));
        // Orphan the registry knows nothing about
        driver.add_live_environment("rulefleet-stray", None, 8082);

        let allocator = PortAllocator::new(registry, driver, range(8081, 8090));
        assert_eq!(allocator.allocate_port().await.unwrap(), 8083);
    }

    #[tokio::test]
    async fn test_ignores_other_platform_records() {
        let registry = Arc::new(InMemoryContainerRegistry::new());
        let record = ContainerRecord::new_deploying(
            TenantId::new("chase"),
            RulesetId::new("insurance"),
            Platform::Cluster,
            "http://node:8081",
            8081,
        );
        registry.insert(&record).await.unwrap();

        let driver = Arc::new(MockPlatformDriver::new(Platform::Local));
        let allocator = PortAllocator::new(registry, driver, range(8081, 8090));
        assert_eq!(allocator.allocate_port().await.unwrap(), 8081);
    }

    #[tokio::test]
    async fn test_excluded_ports_are_skipped() {
        let registry = Arc::new(InMemoryContainerRegistry::new());
        let driver = Arc::new(MockPlatformDriver::new(Platform::Local));
        let allocator = PortAllocator::new(registry, driver, range(8081, 8090));

        let excluded: HashSet<u16> = [8081, 8082].into_iter().collect();
        assert_eq!(allocator.allocate_port_excluding(&excluded).await.unwrap(), 8083);
    }

    #[tokio::test]
    async fn test_exhausted_range() {
        let registry = Arc::new(InMemoryContainerRegistry::new());
        seed(&registry, "insurance", 8081).await;
        seed(&registry, "loan", 8082).await;

        let driver = Arc::new(MockPlatformDriver::new(Platform::Local));
        let allocator = PortAllocator::new(registry, driver, range(8081, 8082));

        let err = allocator.allocate_port().await.unwrap_err();
        assert!(matches!(err, AllocationError::Exhausted { base: 8081, max: 8082 }));
    }

    #[tokio::test]
    async fn test_live_scan_failure_fails_allocation() {
        let registry = Arc::new(InMemoryContainerRegistry::new());
        let driver = Arc::new(MockPlatformDriver::new(Platform::Local));
        driver.set_list_failure(true);

        let allocator = PortAllocator::new(registry, driver, range(8081, 8090));
        assert!(matches!(
            allocator.allocate_port().await,
            Err(AllocationError::LiveScan(_))
        ));
    }
}

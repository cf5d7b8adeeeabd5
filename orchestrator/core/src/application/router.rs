// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Request Router
//!
//! Maps a container id to the endpoint evaluation traffic should go to.
//! Every artifact is also loaded into the default shared environment, so a
//! container without a routable dedicated environment is served from there.
//! Resolution never fails; a missing record, an inactive or unhealthy one,
//! and a registry error all route to the default endpoint.

use crate::domain::artifact::{BatchCommand, RuleRuntimeClient, RuntimeClientError};
use crate::domain::container::{ContainerId, ContainerStatus, HealthStatus};
use crate::domain::deployment::{Resolution, RouteTarget};
use crate::domain::events::ContainerEvent;
use crate::domain::platform::PlatformDriver;
use crate::domain::repository::ContainerRegistry;
use crate::infrastructure::event_bus::EventBus;
use chrono::Utc;
use metrics::counter;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// Background health refresh after a dedicated resolution
#[derive(Clone)]
struct HealthRefresher {
    registry: Arc<dyn ContainerRegistry>,
    driver: Arc<dyn PlatformDriver>,
    event_bus: Arc<EventBus>,
}

impl HealthRefresher {
    async fn refresh(&self, container_id: &ContainerId, endpoint: &str) {
        let observed = self.driver.health_check(endpoint).await;

        let mut record = match self.registry.find_by_id(container_id).await {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(e) => {
                debug!(container_id = %container_id, error = %e, "Skipping health refresh");
                return;
            }
        };
        // Deployments and teardowns own the record while they run
        let settled = matches!(record.status, ContainerStatus::Running | ContainerStatus::Unhealthy);
        if !record.is_active || !settled || record.endpoint != endpoint {
            return;
        }

        if record.observe_health(observed) {
            match self.registry.update(&record).await {
                Ok(_) => {
                    if observed == HealthStatus::Unhealthy {
                        warn!(container_id = %container_id, %endpoint, "Dedicated environment unhealthy");
                    }
                    self.event_bus.publish(ContainerEvent::HealthChanged {
                        container_id: container_id.clone(),
                        healthy: observed == HealthStatus::Healthy,
                        observed_at: Utc::now(),
                    });
                }
                Err(e) => debug!(container_id = %container_id, error = %e, "Health refresh lost update race"),
            }
        }
    }
}

pub struct RequestRouter {
    registry: Arc<dyn ContainerRegistry>,
    runtime: Arc<dyn RuleRuntimeClient>,
    default_endpoint: String,
    refresher: HealthRefresher,
}

impl RequestRouter {
    pub fn new(
        registry: Arc<dyn ContainerRegistry>,
        driver: Arc<dyn PlatformDriver>,
        runtime: Arc<dyn RuleRuntimeClient>,
        event_bus: Arc<EventBus>,
        default_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            refresher: HealthRefresher {
                registry: registry.clone(),
                driver,
                event_bus,
            },
            registry,
            runtime,
            default_endpoint: default_endpoint.into(),
        }
    }

    pub fn default_endpoint(&self) -> &str {
        &self.default_endpoint
    }

    /// Resolve without refreshing health.
    pub async fn lookup(&self, container_id: &ContainerId) -> Resolution {
        let target = match self.registry.find_by_id(container_id).await {
            Ok(Some(record)) if record.is_routable() => Some(record.endpoint),
            Ok(_) => None,
            Err(e) => {
                warn!(container_id = %container_id, error = %e, "Registry lookup failed, using default environment");
                None
            }
        };

        let resolution = match target {
            Some(endpoint) => Resolution {
                container_id: container_id.clone(),
                endpoint,
                target: RouteTarget::Dedicated,
            },
            None => Resolution {
                container_id: container_id.clone(),
                endpoint: self.default_endpoint.clone(),
                target: RouteTarget::Fallback,
            },
        };
        counter!("rulefleet_route_resolutions_total", "target" => resolution.target.as_str()).increment(1);
        debug!(container_id = %container_id, endpoint = %resolution.endpoint, target = resolution.target.as_str(), "Resolved");
        resolution
    }

    /// Resolve and, for dedicated targets, refresh the record's health in
    /// the background.
    pub async fn resolve(&self, container_id: &ContainerId) -> Resolution {
        let resolution = self.lookup(container_id).await;
        if resolution.target == RouteTarget::Dedicated {
            let refresher = self.refresher.clone();
            let container_id = container_id.clone();
            let endpoint = resolution.endpoint.clone();
            tokio::spawn(async move {
                refresher.refresh(&container_id, &endpoint).await;
            });
        }
        resolution
    }

    /// Refresh health synchronously.
    pub async fn refresh_health(&self, container_id: &ContainerId, endpoint: &str) {
        self.refresher.refresh(container_id, endpoint).await;
    }

    /// Forward a batch to wherever `container_id` resolves and return the
    /// runtime's payload untouched.
    pub async fn evaluate(
        &self,
        container_id: &ContainerId,
        batch: &BatchCommand,
    ) -> Result<(Resolution, Value), RuntimeClientError> {
        let resolution = self.resolve(container_id).await;
        let payload = self.runtime.evaluate(&resolution.endpoint, container_id, batch).await?;
        Ok((resolution, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::container::{ContainerRecord, Platform, ReleaseId, RulesetId, TenantId};
    use crate::infrastructure::kie_server::MockRuleRuntime;
    use crate::infrastructure::platform::MockPlatformDriver;
    use crate::infrastructure::repositories::InMemoryContainerRegistry;
    use serde_json::json;

    const DEFAULT: &str = "http://drools:8080";

    fn id() -> ContainerId {
        ContainerId::for_ruleset(&TenantId::new("chase"), &RulesetId::new("insurance"))
    }

    async fn running_record(registry: &InMemoryContainerRegistry) -> ContainerRecord {
        let mut record = ContainerRecord::new_deploying(
            TenantId::new("chase"),
            RulesetId::new("insurance"),
            Platform::Local,
            "http://localhost:8081",
            8081,
        );
        record
            .mark_running(ReleaseId::new("com.underwriting", "chase-insurance", "1.0.0"), Some("h1".into()))
            .unwrap();
        registry.insert(&record).await.unwrap()
    }

    fn router(
        registry: Arc<InMemoryContainerRegistry>,
        driver: Arc<MockPlatformDriver>,
        runtime: Arc<MockRuleRuntime>,
    ) -> RequestRouter {
        RequestRouter::new(registry, driver, runtime, Arc::new(EventBus::with_default_capacity()), DEFAULT)
    }

    #[tokio::test]
    async fn test_unknown_id_falls_back() {
        let router = router(
            Arc::new(InMemoryContainerRegistry::new()),
            Arc::new(MockPlatformDriver::new(Platform::Local)),
            Arc::new(MockRuleRuntime::new()),
        );

        let resolution = router.resolve(&id()).await;
        assert_eq!(resolution.endpoint, DEFAULT);
        assert_eq!(resolution.target, RouteTarget::Fallback);
    }

    #[tokio::test]
    async fn test_running_record_is_dedicated() {
        let registry = Arc::new(InMemoryContainerRegistry::new());
        running_record(&registry).await;
        let router = router(
            registry,
            Arc::new(MockPlatformDriver::new(Platform::Local)),
            Arc::new(MockRuleRuntime::new()),
        );

        let resolution = router.lookup(&id()).await;
        assert_eq!(resolution.endpoint, "http://localhost:8081");
        assert_eq!(resolution.target, RouteTarget::Dedicated);
    }

    #[tokio::test]
    async fn test_unhealthy_refresh_moves_traffic_to_default() {
        let registry = Arc::new(InMemoryContainerRegistry::new());
        running_record(&registry).await;
        let driver = Arc::new(MockPlatformDriver::new(Platform::Local));
        driver.set_unhealthy("http://localhost:8081", true);
        let router = router(registry.clone(), driver.clone(), Arc::new(MockRuleRuntime::new()));

        router.refresh_health(&id(), "http://localhost:8081").await;
        let record = registry.find_by_id(&id()).await.unwrap().unwrap();
        assert_eq!(record.status, ContainerStatus::Unhealthy);
        assert_eq!(router.lookup(&id()).await.target, RouteTarget::Fallback);

        driver.set_unhealthy("http://localhost:8081", false);
        router.refresh_health(&id(), "http://localhost:8081").await;
        assert_eq!(router.lookup(&id()).await.target, RouteTarget::Dedicated);
    }

    #[tokio::test]
    async fn test_evaluate_forwards_to_resolved_endpoint() {
        let registry = Arc::new(InMemoryContainerRegistry::new());
        let runtime = Arc::new(MockRuleRuntime::new());
        let release = ReleaseId::new("com.underwriting", "chase-insurance", "1.0.0");
        runtime.load_unit(DEFAULT, &id(), &release).await.unwrap();

        let router = router(registry, Arc::new(MockPlatformDriver::new(Platform::Local)), runtime.clone());
        let (resolution, payload) = router
            .evaluate(&id(), &BatchCommand::for_applicant(json!({ "age": 30 })))
            .await
            .unwrap();

        assert_eq!(resolution.target, RouteTarget::Fallback);
        assert_eq!(payload["type"], "SUCCESS");
        assert_eq!(runtime.evaluations(), vec![(DEFAULT.to_string(), id().to_string())]);
    }
}

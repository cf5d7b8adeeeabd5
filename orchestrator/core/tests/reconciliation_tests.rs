// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Reconciliation sweep tests: registry records against live environments.

use rulefleet_core::application::orchestrator::{ContainerOrchestrator, StandardContainerOrchestrator};
use rulefleet_core::application::router::RequestRouter;
use rulefleet_core::domain::artifact::Artifact;
use rulefleet_core::domain::container::{
    ContainerId, ContainerRecord, ContainerStatus, DeploymentAction, HealthStatus, Platform, ReleaseId, RulesetId,
    TenantId,
};
use rulefleet_core::domain::deployment::{DeploymentRequest, DeploymentStatus, DiscrepancyKind, RouteTarget};
use rulefleet_core::domain::events::ContainerEvent;
use rulefleet_core::domain::node_config::{DeploymentConfig, FleetConfigSpec};
use rulefleet_core::domain::repository::ContainerRegistry;
use rulefleet_core::infrastructure::event_bus::EventBus;
use rulefleet_core::infrastructure::kie_server::MockRuleRuntime;
use rulefleet_core::infrastructure::platform::MockPlatformDriver;
use rulefleet_core::infrastructure::repositories::InMemoryContainerRegistry;
use std::sync::Arc;
use std::time::Duration;

fn setup() -> (
    Arc<InMemoryContainerRegistry>,
    Arc<MockPlatformDriver>,
    Arc<EventBus>,
    StandardContainerOrchestrator,
) {
    let mut spec = FleetConfigSpec::default();
    spec.deployment = DeploymentConfig {
        activation_timeout: Duration::from_millis(200),
        probe_base_delay: Duration::from_millis(1),
        probe_max_delay: Duration::from_millis(5),
        ..DeploymentConfig::default()
    };

    let registry = Arc::new(InMemoryContainerRegistry::new());
    let driver = Arc::new(MockPlatformDriver::new(Platform::Local).with_static_environment("drools", "http://drools:8080"));
    let bus = Arc::new(EventBus::with_default_capacity());
    let orchestrator = StandardContainerOrchestrator::new(
        registry.clone(),
        driver.clone(),
        Arc::new(MockRuleRuntime::new()),
        bus.clone(),
        &spec,
    );
    (registry, driver, bus, orchestrator)
}

async fn deploy(orchestrator: &StandardContainerOrchestrator, ruleset: &str) -> ContainerId {
    let report = orchestrator
        .deploy(DeploymentRequest {
            tenant_id: TenantId::new("chase"),
            ruleset_id: RulesetId::new(ruleset),
            artifact: Artifact::inline(
                ReleaseId::new("com.underwriting", format!("chase-{}", ruleset), "1.0.0"),
                b"jar".to_vec(),
                b"<project/>".to_vec(),
            ),
            document_hash: Some("h1".to_string()),
        })
        .await;
    assert_eq!(report.status, DeploymentStatus::Success);
    report.container_id
}

#[tokio::test]
async fn test_consistent_fleet_reports_nothing() {
    let (_registry, _driver, _bus, orchestrator) = setup();
    deploy(&orchestrator, "insurance").await;
    deploy(&orchestrator, "loan").await;

    let report = orchestrator.reconcile().await.unwrap();

    assert!(report.is_consistent());
    assert_eq!(report.registry_active, 2);
    assert_eq!(report.live, 2);
    assert_eq!(report.health_refreshed, 2);
}

#[tokio::test]
async fn test_missing_environment_marks_only_that_record() {
    let (registry, driver, bus, orchestrator) = setup();
    let gone = deploy(&orchestrator, "insurance").await;
    let kept = deploy(&orchestrator, "loan").await;
    driver.add_live_environment("rulefleet-stray", None, 8500);
    let kept_before = registry.find_by_id(&kept).await.unwrap().unwrap();
    assert!(driver.remove_externally(&gone));
    let mut events = bus.subscribe_container(gone.clone());

    let report = orchestrator.reconcile().await.unwrap();

    assert_eq!(report.marked_failed, vec![gone.clone()]);
    assert_eq!(report.count(DiscrepancyKind::MissingEnvironment), 1);

    let record = registry.find_by_id(&gone).await.unwrap().unwrap();
    assert!(!record.is_active);
    assert_eq!(record.status, ContainerStatus::Failed);
    let history = registry.history(&gone).await.unwrap();
    assert_eq!(history.last().map(|e| e.action), Some(DeploymentAction::Failed));
    assert_eq!(events.try_recv().unwrap().name(), "container_marked_failed");

    // Other records and live environments are left alone
    assert_eq!(registry.find_by_id(&kept).await.unwrap().unwrap(), kept_before);
    assert!(driver.delete_calls().is_empty());
    assert!(driver.environment_names().contains(&"rulefleet-stray".to_string()));
}

#[tokio::test]
async fn test_orphan_is_reported_not_deleted() {
    let (_registry, driver, bus, orchestrator) = setup();
    let labelled = ContainerId::for_ruleset(&TenantId::new("acme"), &RulesetId::new("loan"));
    driver.add_live_environment("rulefleet-stray", None, 8500);
    driver.add_live_environment(&labelled.environment_name(), Some(labelled.clone()), 8501);
    let mut events = bus.subscribe();

    let report = orchestrator.reconcile().await.unwrap();

    assert_eq!(report.count(DiscrepancyKind::OrphanedEnvironment), 2);
    assert_eq!(report.orphaned.len(), 2);
    let subjects: Vec<_> = report.discrepancies.iter().map(|d| d.subject.as_str()).collect();
    assert!(subjects.contains(&"rulefleet-stray"));
    assert!(subjects.contains(&labelled.as_str()));
    assert!(driver.delete_calls().is_empty());

    let first = events.try_recv().unwrap();
    assert!(matches!(first, ContainerEvent::OrphanDetected { .. }));
}

#[tokio::test]
async fn test_port_mismatch_is_reported_only() {
    let (registry, driver, _bus, orchestrator) = setup();
    let id = deploy(&orchestrator, "insurance").await;
    let before = registry.find_by_id(&id).await.unwrap().unwrap();
    driver.add_live_environment(&id.environment_name(), Some(id.clone()), 9000);

    let report = orchestrator.reconcile().await.unwrap();

    assert_eq!(report.count(DiscrepancyKind::PortMismatch), 1);
    assert!(report.marked_failed.is_empty());
    assert_eq!(registry.find_by_id(&id).await.unwrap().unwrap(), before);
}

#[tokio::test]
async fn test_deploying_records_are_skipped() {
    let (registry, _driver, _bus, orchestrator) = setup();
    let record = ContainerRecord::new_deploying(
        TenantId::new("chase"),
        RulesetId::new("insurance"),
        Platform::Local,
        "http://localhost:8081",
        8081,
    );
    registry.insert(&record).await.unwrap();

    let report = orchestrator.reconcile().await.unwrap();

    assert_eq!(report.skipped_deploying, 1);
    assert!(report.marked_failed.is_empty());
    let stored = registry.find_by_id(&record.container_id).await.unwrap().unwrap();
    assert_eq!(stored.status, ContainerStatus::Deploying);
    assert!(stored.is_active);
}

#[tokio::test]
async fn test_unhealthy_environment_stops_receiving_traffic() {
    let (registry, driver, bus, orchestrator) = setup();
    let id = deploy(&orchestrator, "insurance").await;
    let router = RequestRouter::new(
        registry.clone(),
        driver.clone(),
        Arc::new(MockRuleRuntime::new()),
        bus.clone(),
        "http://drools:8080",
    );
    let endpoint = registry.find_by_id(&id).await.unwrap().unwrap().endpoint;
    let mut events = bus.subscribe();

    driver.set_unhealthy(&endpoint, true);
    orchestrator.reconcile().await.unwrap();

    let record = registry.find_by_id(&id).await.unwrap().unwrap();
    assert_eq!(record.status, ContainerStatus::Unhealthy);
    assert_eq!(record.health_status, HealthStatus::Unhealthy);
    assert!(record.is_active);
    assert_eq!(router.lookup(&id).await.target, RouteTarget::Fallback);
    assert!(matches!(
        events.try_recv().unwrap(),
        ContainerEvent::HealthChanged { healthy: false, .. }
    ));

    driver.set_unhealthy(&endpoint, false);
    orchestrator.reconcile().await.unwrap();
    assert_eq!(router.lookup(&id).await.target, RouteTarget::Dedicated);
}

#[tokio::test]
async fn test_list_failure_propagates() {
    let (_registry, driver, _bus, orchestrator) = setup();
    driver.set_list_failure(true);
    assert!(orchestrator.reconcile().await.is_err());
}

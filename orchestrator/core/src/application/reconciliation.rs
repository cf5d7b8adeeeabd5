// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Periodic reconciliation sweep.

use crate::application::orchestrator::ContainerOrchestrator;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Run `reconcile()` every `interval` until `shutdown` is cancelled.
///
/// The first sweep runs immediately. A sweep that overruns the interval
/// delays the next one instead of bunching ticks.
pub fn spawn_reconciliation_loop(
    orchestrator: Arc<dyn ContainerOrchestrator>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_secs = interval.as_secs(), "Reconciliation loop started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Reconciliation loop stopped");
                    break;
                }
                _ = ticker.tick() => {
                    match orchestrator.reconcile().await {
                        Ok(report) if !report.is_consistent() => {
                            warn!(
                                discrepancies = report.discrepancies.len(),
                                marked_failed = report.marked_failed.len(),
                                orphaned = report.orphaned.len(),
                                "Registry diverged from live environments"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Reconciliation sweep failed"),
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::orchestrator::StandardContainerOrchestrator;
    use crate::domain::container::Platform;
    use crate::domain::node_config::FleetConfigSpec;
    use crate::infrastructure::event_bus::EventBus;
    use crate::infrastructure::kie_server::MockRuleRuntime;
    use crate::infrastructure::platform::MockPlatformDriver;
    use crate::infrastructure::repositories::InMemoryContainerRegistry;

    #[tokio::test]
    async fn test_loop_sweeps_and_stops_on_cancel() {
        let driver = Arc::new(MockPlatformDriver::new(Platform::Local));
        driver.add_live_environment("rulefleet-stray", None, 8099);
        let bus = Arc::new(EventBus::with_default_capacity());
        let mut events = bus.subscribe();

        let orchestrator: Arc<dyn ContainerOrchestrator> = Arc::new(StandardContainerOrchestrator::new(
            Arc::new(InMemoryContainerRegistry::new()),
            driver,
            Arc::new(MockRuleRuntime::new()),
            bus.clone(),
            &FleetConfigSpec::default(),
        ));

        let shutdown = CancellationToken::new();
        let handle = spawn_reconciliation_loop(orchestrator, Duration::from_secs(3600), shutdown.clone());

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("first sweep runs immediately")
            .unwrap();
        assert_eq!(event.name(), "orphan_detected");

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("loop exits after cancel")
            .unwrap();
    }
}

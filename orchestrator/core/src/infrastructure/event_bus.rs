// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Container event fan-out over a tokio broadcast channel.
//
// Feeds the SSE endpoint, the tests and any in-process observer. Nothing is
// persisted here; the deployment history table is the audit log.

use crate::domain::container::ContainerId;
use crate::domain::events::ContainerEvent;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

const DEFAULT_CAPACITY: usize = 1000;

/// Which events a subscriber wants to see
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    pub container_id: Option<ContainerId>,
    /// Event names as returned by [`ContainerEvent::name`]. Empty means all.
    pub kinds: Vec<String>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn container(id: ContainerId) -> Self {
        Self {
            container_id: Some(id),
            kinds: Vec::new(),
        }
    }

    pub fn with_kinds<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.kinds = kinds.into_iter().map(Into::into).collect();
        self
    }

    pub fn matches(&self, event: &ContainerEvent) -> bool {
        if let Some(wanted) = &self.container_id {
            if event.container_id() != Some(wanted) {
                return false;
            }
        }
        self.kinds.is_empty() || self.kinds.iter().any(|k| k == event.name())
    }
}

#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<ContainerEvent>>,
}

impl EventBus {
    /// Slow subscribers lose the oldest events once `capacity` is exceeded.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }

    /// Fire and forget. Publishing with no subscriber is not an error.
    pub fn publish(&self, event: ContainerEvent) {
        let name = event.name();
        match self.sender.send(event) {
            Ok(receivers) => debug!(event = name, receivers, "Published container event"),
            Err(_) => debug!(event = name, "Container event dropped, no subscribers"),
        }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.subscribe_filtered(EventFilter::all())
    }

    pub fn subscribe_container(&self, container_id: ContainerId) -> EventReceiver {
        self.subscribe_filtered(EventFilter::container(container_id))
    }

    pub fn subscribe_filtered(&self, filter: EventFilter) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
            filter,
        }
    }

    /// Unfiltered receiver, for adapting into streams
    pub fn raw_receiver(&self) -> broadcast::Receiver<ContainerEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

pub struct EventReceiver {
    receiver: broadcast::Receiver<ContainerEvent>,
    filter: EventFilter,
}

impl EventReceiver {
    /// Wait for the next event passing the filter
    pub async fn recv(&mut self) -> Result<ContainerEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(|e| match e {
                broadcast::error::RecvError::Closed => EventBusError::Closed,
                broadcast::error::RecvError::Lagged(n) => lagged(n),
            })?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }

    pub fn try_recv(&mut self) -> Result<ContainerEvent, EventBusError> {
        loop {
            let event = self.receiver.try_recv().map_err(|e| match e {
                broadcast::error::TryRecvError::Empty => EventBusError::Empty,
                broadcast::error::TryRecvError::Closed => EventBusError::Closed,
                broadcast::error::TryRecvError::Lagged(n) => lagged(n),
            })?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}

fn lagged(missed: u64) -> EventBusError {
    warn!(missed, "Container event subscriber lagged");
    EventBusError::Lagged(missed)
}

#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("event bus closed")]
    Closed,

    #[error("no event pending")]
    Empty,

    #[error("subscriber lagged, {0} events dropped")]
    Lagged(u64),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::container::{RulesetId, TenantId};
    use chrono::Utc;

    fn id(tenant: &str) -> ContainerId {
        ContainerId::for_ruleset(&TenantId::new(tenant), &RulesetId::new("insurance"))
    }

    fn stopped(tenant: &str) -> ContainerEvent {
        ContainerEvent::ContainerStopped {
            container_id: id(tenant),
            stopped_at: Utc::now(),
        }
    }

    fn orphan() -> ContainerEvent {
        ContainerEvent::OrphanDetected {
            environment: "rulefleet-ghost".to_string(),
            container_id: None,
            port: Some(8085),
            detected_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_every_subscriber_sees_each_event() {
        let bus = EventBus::new(10);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(stopped("chase"));

        assert_eq!(first.recv().await.unwrap().container_id(), Some(&id("chase")));
        assert_eq!(second.recv().await.unwrap().container_id(), Some(&id("chase")));
    }

    #[tokio::test]
    async fn test_container_filter_skips_other_tenants() {
        let bus = EventBus::new(10);
        let mut receiver = bus.subscribe_container(id("chase"));

        bus.publish(stopped("wells"));
        bus.publish(orphan());
        bus.publish(ContainerEvent::ContainerMarkedFailed {
            container_id: id("chase"),
            reason: "environment missing".to_string(),
            marked_at: Utc::now(),
        });

        assert_eq!(receiver.recv().await.unwrap().name(), "container_marked_failed");
        assert!(matches!(receiver.try_recv(), Err(EventBusError::Empty)));
    }

    #[tokio::test]
    async fn test_kind_filter() {
        let bus = EventBus::new(10);
        let mut receiver = bus.subscribe_filtered(EventFilter::all().with_kinds(["orphan_detected"]));

        bus.publish(stopped("chase"));
        bus.publish(orphan());

        assert_eq!(receiver.recv().await.unwrap().name(), "orphan_detected");
        assert!(matches!(receiver.try_recv(), Err(EventBusError::Empty)));
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::default();
        bus.publish(orphan());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_slow_subscriber_reports_lag() {
        let bus = EventBus::new(2);
        let mut receiver = bus.subscribe();
        for tenant in ["a", "b", "c", "d"] {
            bus.publish(stopped(tenant));
        }
        assert!(matches!(receiver.recv().await, Err(EventBusError::Lagged(2))));
        assert_eq!(receiver.recv().await.unwrap().container_id(), Some(&id("c")));
    }
}

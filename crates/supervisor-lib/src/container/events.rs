//! Container lifecycle events
//!
//! Each lifecycle transition is one enum variant carrying only the fields
//! that make sense for it. Subscribers get events through a broadcast bus
//! in the order they were published.

use crate::models::ContainerInfo;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// Default number of events a slow subscriber may fall behind by
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Fields shared by every lifecycle event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMeta {
    pub container_id: String,
    pub container_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl EventMeta {
    pub fn new(
        container_id: impl Into<String>,
        container_name: impl Into<String>,
        task_id: Option<String>,
    ) -> Self {
        Self {
            container_id: container_id.into(),
            container_name: container_name.into(),
            task_id,
            timestamp: Utc::now(),
        }
    }
}

/// Lifecycle notification published by the container manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ContainerEvent {
    Created {
        #[serde(flatten)]
        meta: EventMeta,
        info: ContainerInfo,
    },
    Started {
        #[serde(flatten)]
        meta: EventMeta,
        #[serde(skip_serializing_if = "Option::is_none")]
        info: Option<ContainerInfo>,
    },
    Stopped {
        #[serde(flatten)]
        meta: EventMeta,
    },
    Removed {
        #[serde(flatten)]
        meta: EventMeta,
    },
    /// The container exited without the manager asking it to
    Died {
        #[serde(flatten)]
        meta: EventMeta,
        exit_code: i64,
        oom_killed: bool,
    },
}

impl ContainerEvent {
    pub fn meta(&self) -> &EventMeta {
        match self {
            ContainerEvent::Created { meta, .. }
            | ContainerEvent::Started { meta, .. }
            | ContainerEvent::Stopped { meta }
            | ContainerEvent::Removed { meta }
            | ContainerEvent::Died { meta, .. } => meta,
        }
    }

    pub fn container_id(&self) -> &str {
        &self.meta().container_id
    }

    /// Wire name of the event, e.g. `container:died`
    pub fn name(&self) -> &'static str {
        match self {
            ContainerEvent::Created { .. } => "container:created",
            ContainerEvent::Started { .. } => "container:started",
            ContainerEvent::Stopped { .. } => "container:stopped",
            ContainerEvent::Removed { .. } => "container:removed",
            ContainerEvent::Died { .. } => "container:died",
        }
    }

    /// Short label for metrics
    pub fn kind(&self) -> &'static str {
        self.name().trim_start_matches("container:")
    }
}

/// Fan-out of container events to any number of subscribers
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ContainerEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ContainerEvent> {
        self.tx.subscribe()
    }

    /// Publish to current subscribers; returns how many received it
    pub fn publish(&self, event: ContainerEvent) -> usize {
        trace!(event = event.name(), container_id = %event.container_id(), "Publishing container event");
        // No subscribers is not an error
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn died(id: &str, code: i64) -> ContainerEvent {
        ContainerEvent::Died {
            meta: EventMeta::new(id, format!("agent-task-{id}"), Some("t1".into())),
            exit_code: code,
            oom_killed: false,
        }
    }

    #[test]
    fn test_event_names() {
        let event = died("abc", 137);
        assert_eq!(event.name(), "container:died");
        assert_eq!(event.kind(), "died");
        assert_eq!(event.container_id(), "abc");

        let stopped = ContainerEvent::Stopped {
            meta: EventMeta::new("abc", "agent-task-abc", None),
        };
        assert_eq!(stopped.name(), "container:stopped");
    }

    #[test]
    fn test_event_serializes_with_kind_tag() {
        let json = serde_json::to_value(died("abc", 137)).unwrap();
        assert_eq!(json["kind"], "died");
        assert_eq!(json["container_id"], "abc");
        assert_eq!(json["task_id"], "t1");
        assert_eq!(json["exit_code"], 137);
    }

    #[tokio::test]
    async fn test_bus_preserves_order() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        for code in 0..5 {
            assert_eq!(bus.publish(died("abc", code)), 1);
        }

        for code in 0..5 {
            match rx.recv().await.unwrap() {
                ContainerEvent::Died { exit_code, .. } => assert_eq!(exit_code, code),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        assert_eq!(bus.publish(died("abc", 1)), 0);
    }
}

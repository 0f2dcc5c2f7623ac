//! Cluster notifications.
//!
//! Delivery is best-effort: events go out on a broadcast channel, slow
//! subscribers lag and lose events, and emitting with no subscribers is a
//! no-op. Emitting never blocks the heartbeat cycle.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::id::InstanceId;

const DEFAULT_CAPACITY: usize = 64;

/// Event raised by the heartbeat cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClusterEvent {
    /// A peer stopped heartbeating and was reaped.
    WorkerLost {
        instance_id: InstanceId,
        last_heartbeat: Option<DateTime<Utc>>,
    },

    /// Load is unevenly spread; work should move from `overloaded` to `target`.
    RebalanceNeeded {
        overloaded: InstanceId,
        target: InstanceId,
    },
}

/// Outbound channel for [`ClusterEvent`]s.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<ClusterEvent>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to current subscribers.
    pub fn emit(&self, event: ClusterEvent) {
        match &event {
            ClusterEvent::WorkerLost { instance_id, .. } => {
                warn!(instance_id = %instance_id, "Worker lost");
            }
            ClusterEvent::RebalanceNeeded { overloaded, target } => {
                info!(overloaded = %overloaded, target = %target, "Rebalance needed");
            }
        }
        // Err only means nobody is listening.
        let _ = self.tx.send(event);
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_subscribers() {
        let notifier = Notifier::new();
        notifier.emit(ClusterEvent::WorkerLost {
            instance_id: InstanceId::new("a"),
            last_heartbeat: None,
        });
    }

    #[tokio::test]
    async fn test_subscriber_receives_event() {
        let notifier = Notifier::new();
        let mut rx = notifier.subscribe();

        let event = ClusterEvent::RebalanceNeeded {
            overloaded: InstanceId::new("a"),
            target: InstanceId::new("b"),
        };
        notifier.emit(event.clone());

        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[test]
    fn test_event_serialization() {
        let event = ClusterEvent::WorkerLost {
            instance_id: InstanceId::new("a"),
            last_heartbeat: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"worker_lost\""));
    }
}

//! Liveness reaper.
//!
//! A soft failure detector: any registry entry whose last heartbeat is older
//! than WORKER_TIMEOUT is deleted and reported as lost. A slow-but-alive peer
//! can be reaped under extreme delay; it reappears on its next publish.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, instrument, warn};

use crate::error::CoordinatorResult;
use crate::id::InstanceId;
use crate::notify::{ClusterEvent, Notifier};
use crate::registry::Registry;

pub struct LivenessReaper {
    registry: Arc<Registry>,
    notifier: Notifier,
}

impl LivenessReaper {
    pub fn new(registry: Arc<Registry>, notifier: Notifier) -> Self {
        Self { registry, notifier }
    }

    /// Evict stale and undecodable entries. Returns the reaped instance ids.
    #[instrument(skip(self), fields(instance_id = %self.registry.instance_id()))]
    pub async fn reap(&self) -> CoordinatorResult<Vec<InstanceId>> {
        let scan = self.registry.scan().await?;
        let now = Utc::now();
        let timeout = self.registry.config().worker_timeout;
        let mut reaped = Vec::new();

        for status in scan.statuses {
            if !status.is_stale(now, timeout) {
                continue;
            }
            // Another instance may have reaped it first.
            if self.registry.remove(status.instance_id.as_str()).await? {
                self.notifier.emit(ClusterEvent::WorkerLost {
                    instance_id: status.instance_id.clone(),
                    last_heartbeat: Some(status.last_heartbeat),
                });
                reaped.push(status.instance_id);
            }
        }

        for field in scan.malformed {
            if self.registry.remove(&field).await? {
                warn!(field = %field, "Removed undecodable registry entry");
                self.notifier.emit(ClusterEvent::WorkerLost {
                    instance_id: InstanceId::new(field),
                    last_heartbeat: None,
                });
            }
        }

        debug!(reaped = reaped.len(), "Reap pass complete");
        Ok(reaped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use hive_store::{CoordinationStore, MemoryStore};

    use crate::health::{HealthClassification, HealthLimits, HealthSnapshot};
    use crate::keys::REGISTRY_KEY;
    use crate::registry::{InstanceStatus, RegistryConfig};

    fn status(id: &str, age_secs: i64) -> InstanceStatus {
        let mut status = InstanceStatus::new(
            InstanceId::new(id),
            HealthSnapshot {
                cpu_load_fraction: 0.0,
                memory_used_fraction: 0.0,
                updated_at: Utc::now(),
                classification: HealthClassification::Healthy,
                open_connections: 0,
                backlog_depth: 0,
                in_flight_jobs: 0,
            },
        );
        status.last_heartbeat = Utc::now() - chrono::Duration::seconds(age_secs);
        status
    }

    fn setup() -> (Arc<MemoryStore>, Arc<Registry>) {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(Registry::new(
            Arc::clone(&store) as Arc<dyn CoordinationStore>,
            InstanceId::new("self"),
            RegistryConfig {
                heartbeat_interval: Duration::from_secs(30),
                worker_timeout: Duration::from_secs(60),
            },
            HealthLimits::default(),
        ));
        (store, registry)
    }

    #[tokio::test]
    async fn test_reap_removes_only_stale_entries() {
        let (_store, registry) = setup();
        let notifier = Notifier::new();
        let mut events = notifier.subscribe();
        let reaper = LivenessReaper::new(Arc::clone(&registry), notifier);

        registry.publish(&status("fresh", 5)).await.unwrap();
        registry.publish(&status("stale", 120)).await.unwrap();

        let reaped = reaper.reap().await.unwrap();
        assert_eq!(reaped, vec![InstanceId::new("stale")]);

        let remaining: Vec<_> = registry
            .entries()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.instance_id)
            .collect();
        assert_eq!(remaining, vec![InstanceId::new("fresh")]);

        match events.recv().await.unwrap() {
            ClusterEvent::WorkerLost { instance_id, .. } => {
                assert_eq!(instance_id, InstanceId::new("stale"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reap_removes_malformed_entries() {
        let (store, registry) = setup();
        let reaper = LivenessReaper::new(Arc::clone(&registry), Notifier::new());

        store
            .hset(REGISTRY_KEY, "broken", "nope".to_string())
            .await
            .unwrap();

        assert!(reaper.reap().await.unwrap().is_empty());
        assert!(store.hgetall(REGISTRY_KEY).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reap_empty_registry() {
        let (_store, registry) = setup();
        let reaper = LivenessReaper::new(registry, Notifier::new());
        assert!(reaper.reap().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reap_fails_when_store_unavailable() {
        let (store, registry) = setup();
        let reaper = LivenessReaper::new(registry, Notifier::new());
        store.set_available(false);

        let err = reaper.reap().await.unwrap_err();
        assert!(err.is_store_unavailable());
    }
}

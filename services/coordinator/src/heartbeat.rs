//! Heartbeat loop for publishing instance status to the shared registry.
//!
//! Each tick runs one cycle, sequentially:
//! - Sample local health
//! - Publish this instance's status
//! - Reap peers that stopped heartbeating
//! - Check whether load needs rebalancing
//!
//! Cycles never overlap within one instance. Store failures skip the cycle;
//! the previous registry entry stays until it expires naturally.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::CoordinatorResult;
use crate::health::{HealthClassification, HealthSampler};
use crate::id::InstanceId;
use crate::notify::{ClusterEvent, Notifier};
use crate::reaper::LivenessReaper;
use crate::registry::{InstanceStatus, Registry};
use crate::selector::{rebalance_plan, RebalancePlan};

/// Outcome of one heartbeat cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub classification: HealthClassification,
    pub reaped: Vec<InstanceId>,
    pub rebalance: Option<RebalancePlan>,
}

/// One instance's sample, publish, reap and rebalance sequence.
pub struct HeartbeatCycle {
    registry: Arc<Registry>,
    sampler: HealthSampler,
    reaper: LivenessReaper,
    notifier: Notifier,
}

impl HeartbeatCycle {
    pub fn new(registry: Arc<Registry>, sampler: HealthSampler, notifier: Notifier) -> Self {
        let reaper = LivenessReaper::new(Arc::clone(&registry), notifier.clone());
        Self {
            registry,
            sampler,
            reaper,
            notifier,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Run a single cycle.
    ///
    /// Fails only when the publish fails. Reap and rebalance errors are logged
    /// and leave the report empty for that step.
    pub async fn run_once(&self) -> CoordinatorResult<CycleReport> {
        let health = self.sampler.sample(&self.registry).await;
        let classification = health.classification;
        let status = InstanceStatus::new(self.registry.instance_id().clone(), health);

        self.registry.publish(&status).await?;

        let reaped = match self.reaper.reap().await {
            Ok(reaped) => reaped,
            Err(e) => {
                warn!(error = %e, "Reap failed");
                Vec::new()
            }
        };

        let rebalance = match self.check_rebalance().await {
            Ok(plan) => plan,
            Err(e) => {
                warn!(error = %e, "Rebalance check failed");
                None
            }
        };

        Ok(CycleReport {
            classification,
            reaped,
            rebalance,
        })
    }

    async fn check_rebalance(&self) -> CoordinatorResult<Option<RebalancePlan>> {
        let live = self.registry.live_entries().await?;
        let plan = rebalance_plan(
            &live,
            Utc::now(),
            self.registry.config().worker_timeout,
            self.registry.limits(),
        );

        if let Some(plan) = &plan {
            self.notifier.emit(ClusterEvent::RebalanceNeeded {
                overloaded: plan.overloaded.clone(),
                target: plan.target.clone(),
            });
        }
        Ok(plan)
    }
}

/// Run the heartbeat loop until shutdown.
pub async fn run_heartbeat_loop(
    cycle: HeartbeatCycle,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    info!(
        instance_id = %cycle.registry().instance_id(),
        interval_secs = interval.as_secs(),
        "Starting heartbeat loop"
    );

    let mut consecutive_failures = 0u32;
    let mut interval_timer = tokio::time::interval(interval);
    interval_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            // Shutdown wins over a tick that is ready at the same moment.
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Heartbeat loop shutting down");
                    break;
                }
            }
            _ = interval_timer.tick() => {
                match cycle.run_once().await {
                    Ok(report) => {
                        consecutive_failures = 0;
                        debug!(
                            classification = %report.classification,
                            reaped = report.reaped.len(),
                            rebalance = report.rebalance.is_some(),
                            "Heartbeat published"
                        );
                        if let Ok(overview) = cycle.registry().cluster_overview().await {
                            debug!(?overview, "Cluster overview");
                        }
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        if consecutive_failures <= 3 {
                            warn!(
                                error = %e,
                                consecutive_failures,
                                "Heartbeat failed"
                            );
                        } else {
                            error!(
                                error = %e,
                                consecutive_failures,
                                "Heartbeat failed repeatedly"
                            );
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_store::{CoordinationStore, MemoryStore};

    use crate::health::HealthLimits;
    use crate::registry::RegistryConfig;
    use crate::resources::FixedProbe;

    fn cycle(store: Arc<MemoryStore>, cpu: f64) -> HeartbeatCycle {
        let registry = Arc::new(Registry::new(
            store as Arc<dyn CoordinationStore>,
            InstanceId::new("self"),
            RegistryConfig::default(),
            HealthLimits::default(),
        ));
        let probe = Arc::new(FixedProbe::new(cpu, 0.2));
        let sampler = HealthSampler::new(probe, HealthLimits::default());
        HeartbeatCycle::new(registry, sampler, Notifier::new())
    }

    #[tokio::test]
    async fn test_cycle_publishes_own_status() {
        let store = Arc::new(MemoryStore::new());
        let cycle = cycle(Arc::clone(&store), 0.1);

        let report = cycle.run_once().await.unwrap();
        assert_eq!(report.classification, HealthClassification::Healthy);
        assert!(report.reaped.is_empty());
        assert!(report.rebalance.is_none());

        let entries = cycle.registry().entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].instance_id, InstanceId::new("self"));
    }

    #[tokio::test]
    async fn test_cycle_classifies_from_probe() {
        let store = Arc::new(MemoryStore::new());
        let cycle = cycle(store, 0.95);
        let report = cycle.run_once().await.unwrap();
        assert_eq!(report.classification, HealthClassification::Unhealthy);
    }

    #[tokio::test]
    async fn test_cycle_skips_publish_when_store_down() {
        let store = Arc::new(MemoryStore::new());
        let cycle = cycle(Arc::clone(&store), 0.1);
        cycle.run_once().await.unwrap();

        store.set_available(false);
        let err = cycle.run_once().await.unwrap_err();
        assert!(err.is_store_unavailable());

        store.set_available(true);
        assert_eq!(cycle.registry().entries().await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_stops_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let cycle = cycle(store, 0.1);
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(run_heartbeat_loop(cycle, Duration::from_secs(30), rx));
        tokio::time::sleep(Duration::from_secs(65)).await;
        tx.send(true).unwrap();

        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_deregister_after_loop_exit_is_final() {
        let store = Arc::new(MemoryStore::new());
        let cycle = cycle(store, 0.1);
        let registry = Arc::clone(cycle.registry());
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(run_heartbeat_loop(cycle, Duration::from_secs(30), rx));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(registry.entries().await.unwrap().len(), 1);

        // Signal at a tick boundary, then wait for the loop before deregistering.
        tokio::time::sleep(Duration::from_secs(29)).await;
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
        registry.deregister().await.unwrap();

        // Well inside the entry TTL, so a late publish would still be visible.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(registry.entries().await.unwrap().is_empty());
    }
}

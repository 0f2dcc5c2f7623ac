//! hive Coordinator
//!
//! Runs the coordination layer for a single hive instance:
//!
//! - **Heartbeat Loop**: samples health, publishes status, reaps dead peers
//!   and checks for rebalancing on a fixed period
//! - **Drain Scheduler**: drains the shared backlog in bounded batches
//!
//! The process uses an in-memory coordination store; a shared backend plugs
//! in through `hive_store::CoordinationStore`.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use hive_coordinator::{
    config, heartbeat, resources::SystemProbe, BacklogDrainer, BatchProcessor, ClusterEvent,
    HealthSampler, HeartbeatCycle, Notifier, Registry,
};
use hive_store::{CoordinationStore, MemoryStore};
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Processor that acknowledges every batch after logging it.
struct LoggingProcessor;

#[async_trait]
impl BatchProcessor for LoggingProcessor {
    async fn process_batch(&self, refs: &[String]) -> Result<()> {
        info!(count = refs.len(), first = ?refs.first(), "Processing backlog batch");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to HIVE_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting hive coordinator");
    info!(
        instance_id = %config.instance_id,
        heartbeat_interval_secs = config.registry.heartbeat_interval.as_secs(),
        worker_timeout_secs = config.registry.worker_timeout.as_secs(),
        max_connections = config.limits.max_connections,
        max_jobs = config.limits.max_jobs,
        "Configuration loaded"
    );

    let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
    let registry = Arc::new(Registry::new(
        Arc::clone(&store),
        config.instance_id.clone(),
        config.registry,
        config.limits,
    ));
    let notifier = Notifier::new();

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Log cluster events
    let events_handle = tokio::spawn({
        let mut events = notifier.subscribe();
        let mut shutdown_rx = shutdown_rx.clone();
        async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(ClusterEvent::WorkerLost { instance_id, .. }) => {
                            info!(instance_id = %instance_id, "Peer removed from registry");
                        }
                        Ok(ClusterEvent::RebalanceNeeded { overloaded, target }) => {
                            info!(
                                overloaded = %overloaded,
                                target = %target,
                                "Rebalance suggested"
                            );
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Cluster event listener lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        }
    });

    // Start the heartbeat loop
    let sampler = HealthSampler::new(Arc::new(SystemProbe), config.limits);
    let cycle = HeartbeatCycle::new(Arc::clone(&registry), sampler, notifier.clone());
    let mut heartbeat_handle = tokio::spawn({
        let interval = config.registry.heartbeat_interval;
        let shutdown_rx = shutdown_rx.clone();
        async move { heartbeat::run_heartbeat_loop(cycle, interval, shutdown_rx).await }
    });

    // Start the drain scheduler
    let drainer = Arc::new(BacklogDrainer::new(
        Arc::clone(&store),
        Arc::new(LoggingProcessor),
        config.drain.clone(),
    ));
    drainer.toggle(config.drain_enabled);
    let drain_handle = tokio::spawn({
        let drainer = Arc::clone(&drainer);
        let interval = config.drain_interval;
        let shutdown_rx = shutdown_rx.clone();
        async move {
            drainer.run(interval, shutdown_rx).await;
        }
    });

    // Wait for shutdown signal
    let heartbeat_result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            None
        }
        result = &mut heartbeat_handle => Some(result),
    };

    // Signal shutdown to all workers; an in-flight drain batch still completes
    let _ = shutdown_tx.send(true);
    drainer.toggle(false);

    // The heartbeat must be done publishing before this instance deregisters.
    let heartbeat_result = match heartbeat_result {
        Some(result) => result,
        None => heartbeat_handle.await,
    };
    match heartbeat_result {
        Ok(Ok(())) => info!("Heartbeat loop exited normally"),
        Ok(Err(e)) => error!(error = %e, "Heartbeat loop error"),
        Err(e) => error!(error = %e, "Heartbeat task panicked"),
    }

    if let Err(e) = drain_handle.await {
        error!(error = %e, "Drain scheduler panicked");
    }
    let _ = events_handle.await;

    if let Err(e) = registry.deregister().await {
        warn!(error = %e, "Failed to deregister, leaving cleanup to peers");
    }

    info!("Coordinator shutdown complete");
    Ok(())
}

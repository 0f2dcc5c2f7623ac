//! Backlog drainer.
//!
//! Consumes the shared `backlog` list in bounded batches:
//!
//! 1. Atomically pop up to `batch_size` references from the head.
//! 2. Hand the batch to the [`BatchProcessor`].
//! 3. On success the references are consumed. On failure the whole batch is
//!    pushed back to the tail and the run stops.
//! 4. Sleep `batch_delay` before the next batch.
//!
//! A run ends when the backlog is empty, a batch fails, the wall-clock budget
//! is spent, or the drainer is toggled off. The budget is only checked between
//! batches. At most one run is active per instance; processing is
//! at-least-once across the fleet.
//!
//! If the requeue itself keeps failing, the batch is held in memory and pushed
//! back at the start of the next run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use hive_store::{CoordinationStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::keys::BACKLOG_KEY;

/// Push attempts for a failed batch before it is held for the next run.
const REQUEUE_ATTEMPTS: u32 = 3;

/// External collaborator that performs the deferred work.
#[async_trait]
pub trait BatchProcessor: Send + Sync {
    async fn process_batch(&self, refs: &[String]) -> anyhow::Result<()>;
}

/// Drainer configuration.
#[derive(Debug, Clone)]
pub struct DrainerConfig {
    /// BATCH_SIZE: references popped per batch.
    pub batch_size: usize,

    /// Wall-clock budget for one run.
    pub budget: Duration,

    /// Pause between successful batches.
    pub batch_delay: Duration,
}

impl Default for DrainerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            budget: Duration::from_secs(5 * 60),
            batch_delay: Duration::from_millis(100),
        }
    }
}

/// Errors that prevent or abort a drain run.
#[derive(Debug, Error)]
pub enum DrainError {
    /// Another run is already active on this instance.
    #[error("drain already in progress")]
    AlreadyRunning,

    /// The backlog could not be read or written.
    #[error("backlog store error: {0}")]
    Store(#[from] StoreError),

    /// A failed batch could not be pushed back. The drainer holds `refs` and
    /// restores them on its next run.
    #[error("failed to requeue {} backlog entries: {source}", .refs.len())]
    RequeueFailed { refs: Vec<String>, source: StoreError },
}

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Empty,
    BatchFailed,
    BudgetExhausted,
    Stopped,
}

/// Progress of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    pub batches: usize,
    pub processed: usize,
    pub requeued: usize,
    pub elapsed_ms: u64,
    pub stop_reason: StopReason,
}

/// Snapshot of the backlog and drainer state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub depth: usize,
    pub in_progress: bool,
    pub enabled: bool,
    /// Budget left in the current run, if one is active.
    pub remaining_budget_ms: Option<u64>,
    /// Entries held after a failed requeue, awaiting the next run.
    pub held: usize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Ends a run however it ends, including when the `drain` future is dropped.
struct RunGuard<'a>(&'a BacklogDrainer);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        *lock(&self.0.started_at) = None;
        self.0.in_progress.store(false, Ordering::SeqCst);
    }
}

/// Single-flight consumer of the shared backlog.
pub struct BacklogDrainer {
    store: Arc<dyn CoordinationStore>,
    processor: Arc<dyn BatchProcessor>,
    config: DrainerConfig,
    in_progress: AtomicBool,
    enabled: AtomicBool,
    started_at: Mutex<Option<Instant>>,
    held: Mutex<Vec<String>>,
}

impl BacklogDrainer {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        processor: Arc<dyn BatchProcessor>,
        config: DrainerConfig,
    ) -> Self {
        Self {
            store,
            processor,
            config,
            in_progress: AtomicBool::new(false),
            enabled: AtomicBool::new(true),
            started_at: Mutex::new(None),
            held: Mutex::new(Vec::new()),
        }
    }

    /// Append references to the backlog tail. Returns the new depth.
    pub async fn enqueue(&self, refs: Vec<String>) -> Result<usize, DrainError> {
        let count = refs.len();
        let depth = self.store.push_back(BACKLOG_KEY, refs).await?;
        debug!(count, depth, "Enqueued backlog entries");
        Ok(depth)
    }

    /// Enable or disable draining. Returns the previous setting.
    ///
    /// Disabling stops an active run after its current batch.
    pub fn toggle(&self, run: bool) -> bool {
        let previous = self.enabled.swap(run, Ordering::SeqCst);
        info!(enabled = run, previous, "Backlog drainer toggled");
        previous
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    pub async fn queue_status(&self) -> Result<QueueStatus, DrainError> {
        let depth = self.store.len(BACKLOG_KEY).await?;
        let started_at = *lock(&self.started_at);
        let remaining_budget_ms = started_at
            .map(|start| self.config.budget.saturating_sub(start.elapsed()).as_millis() as u64);

        Ok(QueueStatus {
            depth,
            in_progress: self.is_in_progress(),
            enabled: self.is_enabled(),
            remaining_budget_ms,
            held: lock(&self.held).len(),
        })
    }

    /// Drain the backlog until empty, failure, budget exhaustion or toggle-off.
    #[instrument(skip(self))]
    pub async fn drain(&self) -> Result<DrainReport, DrainError> {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(DrainError::AlreadyRunning);
        }
        let _guard = RunGuard(self);

        let start = Instant::now();
        *lock(&self.started_at) = Some(start);
        let result = match self.restore_held().await {
            Ok(()) => self.run_batches(start).await,
            Err(e) => Err(e),
        };

        match &result {
            Ok(report) => info!(
                batches = report.batches,
                processed = report.processed,
                requeued = report.requeued,
                elapsed_ms = report.elapsed_ms,
                stop_reason = ?report.stop_reason,
                "Backlog drain finished"
            ),
            Err(e) => error!(error = %e, "Backlog drain aborted"),
        }
        result
    }

    async fn run_batches(&self, start: Instant) -> Result<DrainReport, DrainError> {
        let mut batches = 0;
        let mut processed = 0;
        let mut requeued = 0;

        let stop_reason = loop {
            if !self.is_enabled() {
                break StopReason::Stopped;
            }
            if start.elapsed() >= self.config.budget {
                warn!(
                    budget_secs = self.config.budget.as_secs(),
                    processed,
                    "Drain budget exhausted"
                );
                break StopReason::BudgetExhausted;
            }

            let batch = self
                .store
                .pop_front(BACKLOG_KEY, self.config.batch_size)
                .await?;
            if batch.is_empty() {
                break StopReason::Empty;
            }
            batches += 1;

            match self.processor.process_batch(&batch).await {
                Ok(()) => {
                    processed += batch.len();
                    debug!(batch = batches, size = batch.len(), "Batch processed");
                }
                Err(e) => {
                    let size = batch.len();
                    warn!(batch = batches, size, error = %e, "Batch failed, requeueing");
                    self.requeue(batch).await?;
                    requeued += size;
                    break StopReason::BatchFailed;
                }
            }

            tokio::time::sleep(self.config.batch_delay).await;
        };

        Ok(DrainReport {
            batches,
            processed,
            requeued,
            elapsed_ms: start.elapsed().as_millis() as u64,
            stop_reason,
        })
    }

    /// Push a failed batch back to the tail, retrying briefly. If every attempt
    /// fails the batch is held until the next run.
    async fn requeue(&self, batch: Vec<String>) -> Result<(), DrainError> {
        let mut attempt = 1;
        loop {
            match self.store.push_back(BACKLOG_KEY, batch.clone()).await {
                Ok(_) => return Ok(()),
                Err(e) if attempt < REQUEUE_ATTEMPTS => {
                    warn!(attempt, error = %e, "Requeue failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(self.config.batch_delay).await;
                }
                Err(source) => {
                    error!(
                        refs = ?batch,
                        attempts = attempt,
                        error = %source,
                        "Requeue failed, holding batch for the next run"
                    );
                    lock(&self.held).extend(batch.iter().cloned());
                    return Err(DrainError::RequeueFailed {
                        refs: batch,
                        source,
                    });
                }
            }
        }
    }

    /// Push back entries held from an earlier failed requeue.
    async fn restore_held(&self) -> Result<(), DrainError> {
        let held = std::mem::take(&mut *lock(&self.held));
        if held.is_empty() {
            return Ok(());
        }

        let count = held.len();
        match self.store.push_back(BACKLOG_KEY, held.clone()).await {
            Ok(_) => {
                info!(count, "Restored held backlog entries");
                Ok(())
            }
            Err(e) => {
                let mut slot = lock(&self.held);
                let newer = std::mem::replace(&mut *slot, held);
                slot.extend(newer);
                Err(e.into())
            }
        }
    }

    /// Scheduler tick: drain every `interval` while enabled, until shutdown.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "Starting backlog drain scheduler");

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.is_enabled() {
                        continue;
                    }
                    match self.drain().await {
                        Ok(_) | Err(DrainError::AlreadyRunning) => {}
                        Err(e) => warn!(error = %e, "Scheduled drain failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Backlog drain scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_store::MemoryStore;

    struct Recording {
        batches: std::sync::Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl BatchProcessor for Recording {
        async fn process_batch(&self, refs: &[String]) -> anyhow::Result<()> {
            self.batches.lock().unwrap().push(refs.to_vec());
            Ok(())
        }
    }

    fn items(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("conv-{i:02}")).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_empty_backlog() {
        let store = Arc::new(MemoryStore::new());
        let processor = Arc::new(Recording {
            batches: std::sync::Mutex::new(Vec::new()),
        });
        let drainer = BacklogDrainer::new(store, processor, DrainerConfig::default());

        let report = drainer.drain().await.unwrap();
        assert_eq!(report.batches, 0);
        assert_eq!(report.stop_reason, StopReason::Empty);
        assert!(!drainer.is_in_progress());
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggle_off_stops_before_first_batch() {
        let store = Arc::new(MemoryStore::new());
        let processor = Arc::new(Recording {
            batches: std::sync::Mutex::new(Vec::new()),
        });
        let drainer = BacklogDrainer::new(store, processor, DrainerConfig::default());
        drainer.enqueue(items(3)).await.unwrap();

        assert!(drainer.toggle(false));
        let report = drainer.drain().await.unwrap();
        assert_eq!(report.stop_reason, StopReason::Stopped);
        assert_eq!(drainer.queue_status().await.unwrap().depth, 3);

        assert!(!drainer.toggle(true));
        let report = drainer.drain().await.unwrap();
        assert_eq!(report.processed, 3);
    }

    #[tokio::test]
    async fn test_queue_status_idle() {
        let store = Arc::new(MemoryStore::new());
        let processor = Arc::new(Recording {
            batches: std::sync::Mutex::new(Vec::new()),
        });
        let drainer = BacklogDrainer::new(store, processor, DrainerConfig::default());
        drainer.enqueue(items(4)).await.unwrap();

        let status = drainer.queue_status().await.unwrap();
        assert_eq!(
            status,
            QueueStatus {
                depth: 4,
                in_progress: false,
                enabled: true,
                remaining_budget_ms: None,
                held: 0,
            }
        );
    }

    #[tokio::test]
    async fn test_store_outage_aborts_and_releases_flag() {
        let store = Arc::new(MemoryStore::new());
        let processor = Arc::new(Recording {
            batches: std::sync::Mutex::new(Vec::new()),
        });
        let drainer = BacklogDrainer::new(
            Arc::clone(&store) as Arc<dyn CoordinationStore>,
            processor,
            DrainerConfig::default(),
        );
        store.set_available(false);

        assert!(matches!(drainer.drain().await, Err(DrainError::Store(_))));
        assert!(!drainer.is_in_progress());
    }
}

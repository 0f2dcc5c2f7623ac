//! Shared instance registry.
//!
//! Every instance upserts its [`InstanceStatus`] into the `registry` hash once
//! per heartbeat and refreshes a registry-wide TTL of twice the heartbeat
//! period, so a fleet that stops heartbeating entirely expires on its own.
//!
//! The registry client also owns this instance's counters. Transport code calls
//! the `on_*` hooks directly as connections and jobs come and go; the counters
//! are read back into the next health sample.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hive_store::CoordinationStore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::CoordinatorResult;
use crate::health::{HealthClassification, HealthLimits, HealthSnapshot};
use crate::id::InstanceId;
use crate::keys::{
    counters_key, BACKLOG_KEY, FIELD_IN_FLIGHT_JOBS, FIELD_OPEN_CONNECTIONS, REGISTRY_KEY,
};

/// Timing configuration for the registry.
#[derive(Debug, Clone, Copy)]
pub struct RegistryConfig {
    /// Period between heartbeats.
    pub heartbeat_interval: Duration,

    /// WORKER_TIMEOUT: entries older than this are considered dead.
    pub worker_timeout: Duration,
}

impl RegistryConfig {
    /// TTL applied to the registry hash and counters on every publish.
    pub fn entry_ttl(&self) -> Duration {
        self.heartbeat_interval * 2
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            worker_timeout: Duration::from_secs(60),
        }
    }
}

/// Per-instance mutable load counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstanceCounters {
    pub open_connections: u64,
    pub in_flight_jobs: u64,
}

impl InstanceCounters {
    /// Read counters from a hash. Missing or malformed fields count as zero.
    fn from_fields(fields: &HashMap<String, String>) -> Self {
        let read = |name: &str| {
            fields
                .get(name)
                .and_then(|v| v.parse::<i64>().ok())
                .map(|v| v.max(0) as u64)
                .unwrap_or(0)
        };
        Self {
            open_connections: read(FIELD_OPEN_CONNECTIONS),
            in_flight_jobs: read(FIELD_IN_FLIGHT_JOBS),
        }
    }
}

/// Status one instance publishes about itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    pub instance_id: InstanceId,
    pub health: HealthSnapshot,
    pub active_jobs: u64,
    pub last_heartbeat: DateTime<Utc>,
}

impl InstanceStatus {
    /// Status stamped with the current time.
    pub fn new(instance_id: InstanceId, health: HealthSnapshot) -> Self {
        Self {
            instance_id,
            active_jobs: health.in_flight_jobs,
            health,
            last_heartbeat: Utc::now(),
        }
    }

    /// True if the last heartbeat is older than `timeout` at `now`.
    ///
    /// A heartbeat from the future (clock skew) is never stale.
    pub fn is_stale(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        (now - self.last_heartbeat)
            .to_std()
            .is_ok_and(|age| age > timeout)
    }

    pub fn classification(&self) -> HealthClassification {
        self.health.classification
    }
}

/// Result of scanning the registry hash.
#[derive(Debug, Default)]
pub struct RegistryScan {
    /// Decoded entries, ordered by instance id.
    pub statuses: Vec<InstanceStatus>,
    /// Fields whose value could not be decoded.
    pub malformed: Vec<String>,
}

/// Aggregate view over live registry entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterOverview {
    pub live_instances: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub in_flight_jobs: u64,
    pub open_connections: u64,
}

/// Client for the shared registry, bound to one local instance.
pub struct Registry {
    store: Arc<dyn CoordinationStore>,
    instance_id: InstanceId,
    config: RegistryConfig,
    limits: HealthLimits,
}

impl Registry {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        instance_id: InstanceId,
        config: RegistryConfig,
        limits: HealthLimits,
    ) -> Self {
        Self {
            store,
            instance_id,
            config,
            limits,
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn limits(&self) -> &HealthLimits {
        &self.limits
    }

    /// Upsert a status and refresh the registry and counter TTLs.
    pub async fn publish(&self, status: &InstanceStatus) -> CoordinatorResult<()> {
        let payload = serde_json::to_string(status)?;
        let ttl = self.config.entry_ttl();

        self.store
            .hset(REGISTRY_KEY, status.instance_id.as_str(), payload)
            .await?;
        self.store.expire(REGISTRY_KEY, ttl).await?;
        self.store
            .expire(&counters_key(&status.instance_id), ttl)
            .await?;

        debug!(
            instance_id = %status.instance_id,
            classification = %status.health.classification,
            active_jobs = status.active_jobs,
            "Published instance status"
        );
        Ok(())
    }

    /// Read and decode every registry entry.
    pub async fn scan(&self) -> CoordinatorResult<RegistryScan> {
        let raw = self.store.hgetall(REGISTRY_KEY).await?;
        let mut scan = RegistryScan::default();

        for (field, value) in raw {
            match serde_json::from_str::<InstanceStatus>(&value) {
                Ok(status) => scan.statuses.push(status),
                Err(e) => {
                    warn!(field = %field, error = %e, "Skipping malformed registry entry");
                    scan.malformed.push(field);
                }
            }
        }

        scan.statuses.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        Ok(scan)
    }

    /// All decodable entries, ordered by instance id.
    pub async fn entries(&self) -> CoordinatorResult<Vec<InstanceStatus>> {
        Ok(self.scan().await?.statuses)
    }

    /// Entries whose heartbeat is within WORKER_TIMEOUT.
    pub async fn live_entries(&self) -> CoordinatorResult<Vec<InstanceStatus>> {
        let now = Utc::now();
        let timeout = self.config.worker_timeout;
        Ok(self
            .entries()
            .await?
            .into_iter()
            .filter(|s| !s.is_stale(now, timeout))
            .collect())
    }

    /// Remove a registry field. Returns true if it existed.
    pub async fn remove(&self, field: &str) -> CoordinatorResult<bool> {
        Ok(self.store.hdel(REGISTRY_KEY, field).await?)
    }

    /// Remove this instance's entry and counters (graceful shutdown).
    pub async fn deregister(&self) -> CoordinatorResult<()> {
        self.store
            .hdel(REGISTRY_KEY, self.instance_id.as_str())
            .await?;
        self.store.del(&counters_key(&self.instance_id)).await?;
        info!(instance_id = %self.instance_id, "Instance deregistered");
        Ok(())
    }

    /// This instance's counters. Missing counters or store failures read as zero.
    pub async fn counters(&self) -> InstanceCounters {
        match self.store.hgetall(&counters_key(&self.instance_id)).await {
            Ok(fields) => InstanceCounters::from_fields(&fields),
            Err(e) => {
                warn!(error = %e, "Failed to read instance counters, assuming zero");
                InstanceCounters::default()
            }
        }
    }

    /// Current backlog length, or zero if the store cannot be read.
    pub async fn backlog_depth(&self) -> u64 {
        match self.store.len(BACKLOG_KEY).await {
            Ok(depth) => depth as u64,
            Err(e) => {
                warn!(error = %e, "Failed to read backlog depth, assuming zero");
                0
            }
        }
    }

    pub async fn on_connection_opened(&self) -> CoordinatorResult<u64> {
        self.adjust(FIELD_OPEN_CONNECTIONS, 1).await
    }

    pub async fn on_connection_closed(&self) -> CoordinatorResult<u64> {
        self.adjust(FIELD_OPEN_CONNECTIONS, -1).await
    }

    pub async fn on_job_started(&self) -> CoordinatorResult<u64> {
        self.adjust(FIELD_IN_FLIGHT_JOBS, 1).await
    }

    pub async fn on_job_completed(&self) -> CoordinatorResult<u64> {
        self.adjust(FIELD_IN_FLIGHT_JOBS, -1).await
    }

    /// Whether this instance has room for another connection.
    ///
    /// Fails open when the store is unreachable.
    pub async fn can_accept_connection(&self) -> bool {
        self.counters().await.open_connections < self.limits.max_connections
    }

    /// Whether this instance has room for another job.
    ///
    /// Fails open when the store is unreachable.
    pub async fn can_accept_job(&self) -> bool {
        self.counters().await.in_flight_jobs < self.limits.max_jobs
    }

    /// Summarise live entries.
    pub async fn cluster_overview(&self) -> CoordinatorResult<ClusterOverview> {
        let mut overview = ClusterOverview::default();
        for status in self.live_entries().await? {
            overview.live_instances += 1;
            match status.classification() {
                HealthClassification::Healthy => overview.healthy += 1,
                HealthClassification::Degraded => overview.degraded += 1,
                HealthClassification::Unhealthy => overview.unhealthy += 1,
            }
            overview.in_flight_jobs += status.health.in_flight_jobs;
            overview.open_connections += status.health.open_connections;
        }
        Ok(overview)
    }

    async fn adjust(&self, field: &str, delta: i64) -> CoordinatorResult<u64> {
        let key = counters_key(&self.instance_id);
        let value = self.store.hincr_by(&key, field, delta).await?;
        if value < 0 {
            // More closes than opens (e.g. after a counter expired); clamp.
            self.store.hset(&key, field, "0".to_string()).await?;
            return Ok(0);
        }
        Ok(value as u64)
    }
}

//! Health sampling and classification.
//!
//! Every heartbeat an instance samples its own load and derives a discrete
//! classification from fixed thresholds (first match wins):
//!
//! - **unhealthy**: cpu > 0.9, memory > 0.9, connections > max, or jobs > max
//! - **degraded**: cpu > 0.7, memory > 0.7, connections > 80% of max, or jobs > 80% of max
//! - **healthy**: otherwise
//!
//! An instance only ever classifies itself from its own counters.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::registry::{InstanceCounters, Registry};
use crate::resources::{ResourceProbe, ResourceUsage};

pub const UNHEALTHY_LOAD: f64 = 0.9;
pub const DEGRADED_LOAD: f64 = 0.7;

/// Capacity limits shared by classification, scoring and local admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthLimits {
    /// MAX_CONN: open connections an instance accepts.
    pub max_connections: u64,
    /// MAX_JOBS: jobs an instance runs concurrently.
    pub max_jobs: u64,
}

impl Default for HealthLimits {
    fn default() -> Self {
        Self {
            max_connections: 1000,
            max_jobs: 50,
        }
    }
}

/// Discrete health tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthClassification {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthClassification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }

    /// Weight of this tier in the selection score.
    pub fn weight(&self) -> f64 {
        match self {
            Self::Healthy => 1.0,
            Self::Degraded => 0.5,
            Self::Unhealthy => 0.0,
        }
    }

    pub fn is_unhealthy(&self) -> bool {
        matches!(self, Self::Unhealthy)
    }
}

impl std::fmt::Display for HealthClassification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `count > 0.8 * max`, in integer arithmetic.
fn above_degraded_capacity(count: u64, max: u64) -> bool {
    u128::from(count) * 5 > u128::from(max) * 4
}

/// Classify an instance from its load signals.
pub fn classify(
    cpu_load_fraction: f64,
    memory_used_fraction: f64,
    open_connections: u64,
    in_flight_jobs: u64,
    limits: &HealthLimits,
) -> HealthClassification {
    if cpu_load_fraction > UNHEALTHY_LOAD
        || memory_used_fraction > UNHEALTHY_LOAD
        || open_connections > limits.max_connections
        || in_flight_jobs > limits.max_jobs
    {
        return HealthClassification::Unhealthy;
    }

    if cpu_load_fraction > DEGRADED_LOAD
        || memory_used_fraction > DEGRADED_LOAD
        || above_degraded_capacity(open_connections, limits.max_connections)
        || above_degraded_capacity(in_flight_jobs, limits.max_jobs)
    {
        return HealthClassification::Degraded;
    }

    HealthClassification::Healthy
}

/// Point-in-time health of one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub cpu_load_fraction: f64,
    pub memory_used_fraction: f64,
    pub updated_at: DateTime<Utc>,
    pub classification: HealthClassification,
    pub open_connections: u64,
    pub backlog_depth: u64,
    pub in_flight_jobs: u64,
}

/// Captures local load signals for one instance.
pub struct HealthSampler {
    probe: Arc<dyn ResourceProbe>,
    limits: HealthLimits,
}

impl HealthSampler {
    pub fn new(probe: Arc<dyn ResourceProbe>, limits: HealthLimits) -> Self {
        Self { probe, limits }
    }

    /// Sample this instance: host resources, own counters and backlog depth.
    ///
    /// Store failures while reading counters or the backlog degrade to zero.
    pub async fn sample(&self, registry: &Registry) -> HealthSnapshot {
        let counters = registry.counters().await;
        let backlog_depth = registry.backlog_depth().await;
        self.snapshot(self.probe.usage(), counters, backlog_depth)
    }

    /// Build a snapshot from already-collected signals.
    pub fn snapshot(
        &self,
        usage: ResourceUsage,
        counters: InstanceCounters,
        backlog_depth: u64,
    ) -> HealthSnapshot {
        let classification = classify(
            usage.cpu_load_fraction,
            usage.memory_used_fraction,
            counters.open_connections,
            counters.in_flight_jobs,
            &self.limits,
        );

        HealthSnapshot {
            cpu_load_fraction: usage.cpu_load_fraction,
            memory_used_fraction: usage.memory_used_fraction,
            updated_at: Utc::now(),
            classification,
            open_connections: counters.open_connections,
            backlog_depth,
            in_flight_jobs: counters.in_flight_jobs,
        }
    }
}

//! Worker selection and rebalance planning.
//!
//! Live, non-unhealthy entries are scored as
//!
//! ```text
//! score = 0.3*health + 0.2*load + 0.2*cpu + 0.2*mem + 0.1*conn
//! ```
//!
//! where `health` is 1.0 for healthy and 0.5 for degraded, and the remaining
//! terms are one minus the corresponding utilisation. The strictly-highest
//! score wins; ties go to the first entry in registry order.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::error::CoordinatorResult;
use crate::health::{HealthClassification, HealthLimits, HealthSnapshot};
use crate::id::InstanceId;
use crate::registry::{InstanceStatus, Registry};

const HEALTH_WEIGHT: f64 = 0.3;
const LOAD_WEIGHT: f64 = 0.2;
const CPU_WEIGHT: f64 = 0.2;
const MEM_WEIGHT: f64 = 0.2;
const CONN_WEIGHT: f64 = 0.1;

/// Utilisation spread (in jobs / MAX_JOBS) that triggers a rebalance.
pub const REBALANCE_SPREAD: f64 = 0.5;

/// `count / max`, treating a zero limit as fully used.
fn utilisation(count: u64, max: u64) -> f64 {
    if max == 0 {
        return 1.0;
    }
    count as f64 / max as f64
}

/// Selection score for one snapshot. Higher is better.
pub fn score(health: &HealthSnapshot, limits: &HealthLimits) -> f64 {
    let load = 1.0 - utilisation(health.in_flight_jobs, limits.max_jobs);
    let cpu = 1.0 - health.cpu_load_fraction;
    let mem = 1.0 - health.memory_used_fraction;
    let conn = 1.0 - utilisation(health.open_connections, limits.max_connections);

    HEALTH_WEIGHT * health.classification.weight()
        + LOAD_WEIGHT * load
        + CPU_WEIGHT * cpu
        + MEM_WEIGHT * mem
        + CONN_WEIGHT * conn
}

/// Pick the best candidate among `entries` at `now`.
///
/// Skips unhealthy entries and entries older than `timeout`.
pub fn select_from<'a>(
    entries: &'a [InstanceStatus],
    now: DateTime<Utc>,
    timeout: std::time::Duration,
    limits: &HealthLimits,
) -> Option<&'a InstanceStatus> {
    let mut best: Option<(&InstanceStatus, f64)> = None;

    for entry in entries {
        if entry.classification().is_unhealthy() || entry.is_stale(now, timeout) {
            continue;
        }
        let candidate = score(&entry.health, limits);
        match best {
            Some((_, top)) if candidate <= top => {}
            _ => best = Some((entry, candidate)),
        }
    }

    best.map(|(entry, _)| entry)
}

/// Proposed move of work between two live instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RebalancePlan {
    pub overloaded: InstanceId,
    pub target: InstanceId,
}

/// Decide whether live entries need rebalancing.
///
/// Rebalance when at least two instances are live and either an unhealthy
/// instance coexists with a healthy one, or job utilisation differs by more
/// than [`REBALANCE_SPREAD`]. The lowest scorer is the overloaded side and
/// [`select_from`] picks the target.
pub fn rebalance_plan(
    live: &[InstanceStatus],
    now: DateTime<Utc>,
    timeout: std::time::Duration,
    limits: &HealthLimits,
) -> Option<RebalancePlan> {
    if live.len() < 2 {
        return None;
    }

    let has = |c: HealthClassification| live.iter().any(|s| s.classification() == c);
    let mixed_health = has(HealthClassification::Unhealthy) && has(HealthClassification::Healthy);

    let utils = live
        .iter()
        .map(|s| utilisation(s.health.in_flight_jobs, limits.max_jobs));
    let (lo, hi) = utils.fold((f64::MAX, f64::MIN), |(lo, hi), u| (lo.min(u), hi.max(u)));
    let skewed = hi - lo > REBALANCE_SPREAD;

    if !mixed_health && !skewed {
        return None;
    }

    let overloaded = live.iter().min_by(|a, b| {
        score(&a.health, limits).total_cmp(&score(&b.health, limits))
    })?;
    let target = select_from(live, now, timeout, limits)?;
    if target.instance_id == overloaded.instance_id {
        return None;
    }

    Some(RebalancePlan {
        overloaded: overloaded.instance_id.clone(),
        target: target.instance_id.clone(),
    })
}

/// Chooses the instance that should take the next job or connection.
pub struct WorkerSelector {
    registry: Arc<Registry>,
}

impl WorkerSelector {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Best live instance, or `None` when no instance qualifies.
    ///
    /// `None` means reject or queue the work; it is not an error.
    pub async fn select_best(&self) -> CoordinatorResult<Option<InstanceId>> {
        let entries = self.registry.entries().await?;
        let selected = select_from(
            &entries,
            Utc::now(),
            self.registry.config().worker_timeout,
            self.registry.limits(),
        )
        .map(|s| s.instance_id.clone());

        debug!(
            candidates = entries.len(),
            selected = ?selected.as_ref().map(InstanceId::as_str),
            "Worker selection"
        );
        Ok(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use proptest::prelude::*;

    const LIMITS: HealthLimits = HealthLimits {
        max_connections: 100,
        max_jobs: 10,
    };
    const TIMEOUT: Duration = Duration::from_secs(60);

    fn health(classification: HealthClassification, jobs: u64) -> HealthSnapshot {
        HealthSnapshot {
            cpu_load_fraction: 0.2,
            memory_used_fraction: 0.3,
            updated_at: Utc::now(),
            classification,
            open_connections: 10,
            backlog_depth: 0,
            in_flight_jobs: jobs,
        }
    }

    fn entry(id: &str, classification: HealthClassification, jobs: u64) -> InstanceStatus {
        InstanceStatus::new(InstanceId::new(id), health(classification, jobs))
    }

    #[test]
    fn test_score_idle_healthy_is_one() {
        let snapshot = HealthSnapshot {
            cpu_load_fraction: 0.0,
            memory_used_fraction: 0.0,
            open_connections: 0,
            in_flight_jobs: 0,
            ..health(HealthClassification::Healthy, 0)
        };
        assert!((score(&snapshot, &LIMITS) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_healthy_beats_degraded() {
        let entries = vec![
            entry("b", HealthClassification::Degraded, 5),
            entry("a", HealthClassification::Healthy, 0),
        ];
        let best = select_from(&entries, Utc::now(), TIMEOUT, &LIMITS).unwrap();
        assert_eq!(best.instance_id, InstanceId::new("a"));
    }

    #[test]
    fn test_never_selects_unhealthy() {
        let entries = vec![entry("a", HealthClassification::Unhealthy, 0)];
        assert!(select_from(&entries, Utc::now(), TIMEOUT, &LIMITS).is_none());
    }

    #[test]
    fn test_never_selects_stale() {
        let mut stale = entry("a", HealthClassification::Healthy, 0);
        stale.last_heartbeat = Utc::now() - chrono::Duration::seconds(120);
        let entries = vec![stale, entry("b", HealthClassification::Degraded, 9)];

        let best = select_from(&entries, Utc::now(), TIMEOUT, &LIMITS).unwrap();
        assert_eq!(best.instance_id, InstanceId::new("b"));
    }

    #[test]
    fn test_empty_selects_none() {
        assert!(select_from(&[], Utc::now(), TIMEOUT, &LIMITS).is_none());
    }

    #[test]
    fn test_tie_goes_to_first() {
        let first = entry("x", HealthClassification::Healthy, 1);
        let mut second = first.clone();
        second.instance_id = InstanceId::new("y");
        let entries = vec![first, second];

        let best = select_from(&entries, Utc::now(), TIMEOUT, &LIMITS).unwrap();
        assert_eq!(best.instance_id, InstanceId::new("x"));
    }

    #[test]
    fn test_rebalance_on_job_skew() {
        let live = vec![
            entry("busy", HealthClassification::Degraded, 9),
            entry("idle", HealthClassification::Healthy, 1),
        ];
        let plan = rebalance_plan(&live, Utc::now(), TIMEOUT, &LIMITS).unwrap();
        assert_eq!(plan.overloaded, InstanceId::new("busy"));
        assert_eq!(plan.target, InstanceId::new("idle"));
    }

    #[test]
    fn test_rebalance_on_mixed_health() {
        let live = vec![
            entry("sick", HealthClassification::Unhealthy, 3),
            entry("fine", HealthClassification::Healthy, 3),
        ];
        let plan = rebalance_plan(&live, Utc::now(), TIMEOUT, &LIMITS).unwrap();
        assert_eq!(plan.overloaded, InstanceId::new("sick"));
        assert_eq!(plan.target, InstanceId::new("fine"));
    }

    #[test]
    fn test_no_rebalance_when_balanced() {
        let live = vec![
            entry("a", HealthClassification::Healthy, 3),
            entry("b", HealthClassification::Healthy, 4),
        ];
        assert!(rebalance_plan(&live, Utc::now(), TIMEOUT, &LIMITS).is_none());
    }

    #[test]
    fn test_no_rebalance_single_instance() {
        let live = vec![entry("a", HealthClassification::Unhealthy, 10)];
        assert!(rebalance_plan(&live, Utc::now(), TIMEOUT, &LIMITS).is_none());
    }

    fn snapshot_strategy() -> impl Strategy<Value = HealthSnapshot> {
        (0.0f64..=1.0, 0.0f64..=1.0, 0u64..=100, 0u64..=10).prop_map(|(cpu, mem, conns, jobs)| {
            HealthSnapshot {
                cpu_load_fraction: cpu,
                memory_used_fraction: mem,
                open_connections: conns,
                in_flight_jobs: jobs,
                ..health(HealthClassification::Degraded, 0)
            }
        })
    }

    proptest! {
        #[test]
        fn prop_score_non_increasing_in_load(
            base in snapshot_strategy(),
            d_cpu in 0.0f64..=0.5,
            d_mem in 0.0f64..=0.5,
            d_conn in 0u64..=50,
            d_jobs in 0u64..=5,
        ) {
            let worse = HealthSnapshot {
                cpu_load_fraction: base.cpu_load_fraction + d_cpu,
                memory_used_fraction: base.memory_used_fraction + d_mem,
                open_connections: base.open_connections + d_conn,
                in_flight_jobs: base.in_flight_jobs + d_jobs,
                ..base.clone()
            };
            prop_assert!(score(&worse, &LIMITS) <= score(&base, &LIMITS) + 1e-12);
        }

        #[test]
        fn prop_score_non_decreasing_in_health_tier(base in snapshot_strategy()) {
            let tiers = [
                HealthClassification::Unhealthy,
                HealthClassification::Degraded,
                HealthClassification::Healthy,
            ];
            let scores: Vec<f64> = tiers
                .iter()
                .map(|&classification| {
                    let snapshot = HealthSnapshot { classification, ..base.clone() };
                    score(&snapshot, &LIMITS)
                })
                .collect();
            prop_assert!(scores[0] <= scores[1]);
            prop_assert!(scores[1] <= scores[2]);
        }
    }
}

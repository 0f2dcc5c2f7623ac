//! Configuration for the coordinator.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::drainer::DrainerConfig;
use crate::health::HealthLimits;
use crate::id::InstanceId;
use crate::registry::RegistryConfig;

/// Coordinator configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Identifier this instance publishes under.
    pub instance_id: InstanceId,

    /// Heartbeat period and worker timeout.
    pub registry: RegistryConfig,

    /// MAX_CONN / MAX_JOBS.
    pub limits: HealthLimits,

    /// Backlog drain batching and budget.
    pub drain: DrainerConfig,

    /// Interval between scheduled drain runs.
    pub drain_interval: Duration,

    /// Whether the drainer starts enabled.
    pub drain_enabled: bool,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let instance_id = lookup("HIVE_INSTANCE_ID")
            .filter(|s| !s.trim().is_empty())
            .map(InstanceId::new)
            .unwrap_or_else(InstanceId::generate);

        let heartbeat_secs: u64 = parse_var(&lookup, "HIVE_HEARTBEAT_INTERVAL_SECS", 30)?;
        let worker_timeout_secs: u64 = parse_var(&lookup, "HIVE_WORKER_TIMEOUT_SECS", 60)?;
        if heartbeat_secs == 0 {
            bail!("HIVE_HEARTBEAT_INTERVAL_SECS must be greater than zero.");
        }

        let max_connections: u64 = parse_var(&lookup, "HIVE_MAX_CONNECTIONS", 1000)?;
        let max_jobs: u64 = parse_var(&lookup, "HIVE_MAX_JOBS", 50)?;
        if max_connections == 0 || max_jobs == 0 {
            bail!("HIVE_MAX_CONNECTIONS and HIVE_MAX_JOBS must be greater than zero.");
        }

        let batch_size: usize = parse_var(&lookup, "HIVE_DRAIN_BATCH_SIZE", 10)?;
        let budget_secs: u64 = parse_var(&lookup, "HIVE_DRAIN_BUDGET_SECS", 300)?;
        let batch_delay_ms: u64 = parse_var(&lookup, "HIVE_DRAIN_BATCH_DELAY_MS", 100)?;
        let drain_interval_secs: u64 = parse_var(&lookup, "HIVE_DRAIN_INTERVAL_SECS", 60)?;

        let drain_enabled = lookup("HIVE_DRAIN_ENABLED")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(true);

        let log_level = lookup("HIVE_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            instance_id,
            registry: RegistryConfig {
                heartbeat_interval: Duration::from_secs(heartbeat_secs),
                worker_timeout: Duration::from_secs(worker_timeout_secs),
            },
            limits: HealthLimits {
                max_connections,
                max_jobs,
            },
            drain: DrainerConfig {
                batch_size: batch_size.max(1),
                budget: Duration::from_secs(budget_secs),
                batch_delay: Duration::from_millis(batch_delay_ms),
            },
            drain_interval: Duration::from_secs(drain_interval_secs.max(1)),
            drain_enabled,
            log_level,
        })
    }
}

fn parse_var<T, F>(lookup: &F, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|v| v.trim().parse::<T>())
        .transpose()
        .with_context(|| format!("{name} must be a non-negative integer."))
        .map(|v| v.unwrap_or(default))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();

        assert!(config.instance_id.as_str().starts_with("inst_"));
        assert_eq!(config.registry.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.registry.worker_timeout, Duration::from_secs(60));
        assert_eq!(config.registry.entry_ttl(), Duration::from_secs(60));
        assert_eq!(config.limits, HealthLimits::default());
        assert_eq!(config.drain.batch_size, 10);
        assert_eq!(config.drain.budget, Duration::from_secs(300));
        assert_eq!(config.drain.batch_delay, Duration::from_millis(100));
        assert!(config.drain_enabled);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("HIVE_INSTANCE_ID", "pod-7"),
            ("HIVE_HEARTBEAT_INTERVAL_SECS", "10"),
            ("HIVE_MAX_JOBS", "8"),
            ("HIVE_DRAIN_ENABLED", "false"),
        ]))
        .unwrap();

        assert_eq!(config.instance_id, InstanceId::new("pod-7"));
        assert_eq!(config.registry.entry_ttl(), Duration::from_secs(20));
        assert_eq!(config.limits.max_jobs, 8);
        assert!(!config.drain_enabled);
    }

    #[test]
    fn test_malformed_integer_is_an_error() {
        let err = Config::from_lookup(lookup(&[("HIVE_MAX_JOBS", "lots")])).unwrap_err();
        assert!(err.to_string().contains("HIVE_MAX_JOBS"));
    }

    #[test]
    fn test_zero_heartbeat_rejected() {
        assert!(Config::from_lookup(lookup(&[("HIVE_HEARTBEAT_INTERVAL_SECS", "0")])).is_err());
    }
}

//! hive Coordinator Library
//!
//! Cluster coordination for a fleet of hive instances. There is no leader and
//! no consensus: every instance publishes its own status into a shared store
//! under a TTL, and peers interpret staleness on their own.
//!
//! ## Architecture
//!
//! ```text
//! HeartbeatCycle (per instance, fixed period)
//! ├── HealthSampler     (local load -> classification)
//! ├── Registry          (publish status, own counters)
//! ├── LivenessReaper    (evict stale peers, WorkerLost)
//! └── rebalance check   (RebalanceNeeded)
//!
//! WorkerSelector        (best live target for new work)
//! AdmissionController   (fixed-window rate limits per category/tier)
//! BacklogDrainer        (single-flight batch consumer of the shared backlog)
//! ```
//!
//! ## Modules
//!
//! - `health`: sampling and threshold classification
//! - `registry`: shared registry client and instance counters
//! - `reaper`: liveness reaper
//! - `selector`: scoring, worker selection, rebalance planning
//! - `admission`: tiered admission control
//! - `drainer`: backlog drainer
//! - `heartbeat`: the per-instance heartbeat cycle and loop

pub mod admission;
pub mod config;
pub mod drainer;
pub mod error;
pub mod health;
pub mod heartbeat;
pub mod id;
pub mod keys;
pub mod notify;
pub mod reaper;
pub mod registry;
pub mod resources;
pub mod selector;

// Re-export commonly used types
pub use admission::{Admission, AdmissionController, Caller, RateCategory, RateLimited, Tier};
pub use drainer::{BacklogDrainer, BatchProcessor, DrainReport, DrainerConfig, StopReason};
pub use error::{CoordinatorError, CoordinatorResult};
pub use health::{HealthClassification, HealthLimits, HealthSampler, HealthSnapshot};
pub use heartbeat::HeartbeatCycle;
pub use id::InstanceId;
pub use notify::{ClusterEvent, Notifier};
pub use reaper::LivenessReaper;
pub use registry::{InstanceCounters, InstanceStatus, Registry, RegistryConfig};
pub use selector::WorkerSelector;

//! Coordination store key layout.
//!
//! ```text
//! registry                          hash   instanceId -> InstanceStatus JSON
//! counters:<instanceId>             hash   openConnections, inFlightJobs
//! backlog                           list   opaque work references (FIFO)
//! ratelimit:<category>:<subjectKey> counter with TTL = window
//! ```

use crate::id::InstanceId;

pub const REGISTRY_KEY: &str = "registry";
pub const BACKLOG_KEY: &str = "backlog";

pub const FIELD_OPEN_CONNECTIONS: &str = "openConnections";
pub const FIELD_IN_FLIGHT_JOBS: &str = "inFlightJobs";

pub fn counters_key(instance_id: &InstanceId) -> String {
    format!("counters:{instance_id}")
}

pub fn rate_limit_key(category: &str, subject_key: &str) -> String {
    format!("ratelimit:{category}:{subject_key}")
}

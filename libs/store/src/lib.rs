//! # hive-store
//!
//! Coordination store primitives shared by every hive instance.
//!
//! The coordination layer only relies on a handful of store operations:
//!
//! - **Hashes** for the instance registry and per-instance counters
//! - **Counters** with a time-to-live for fixed-window rate limiting
//! - **Lists** for the shared FIFO backlog
//! - **Key expiry** so abandoned state garbage-collects itself
//!
//! The only operations other instances may race on are counter increments and
//! list pops; both must be atomic in every implementation. Everything else is
//! last-writer-wins.
//!
//! [`MemoryStore`] is an in-process implementation used by the single-node
//! binary and by tests.

mod error;
mod memory;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

pub use error::StoreError;
pub use memory::MemoryStore;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Key-value/hash/list/TTL primitives backing the coordination layer.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Set a hash field, creating the hash if needed.
    async fn hset(&self, key: &str, field: &str, value: String) -> StoreResult<()>;

    /// Read a single hash field.
    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>>;

    /// Read every field of a hash. A missing key yields an empty map.
    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    /// Remove a hash field. Returns true if the field existed.
    async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool>;

    /// Atomically add `delta` to an integer hash field (missing fields start at 0).
    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64>;

    /// Set a key's time-to-live. Returns false if the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    /// Delete a key of any type. Returns true if it existed.
    async fn del(&self, key: &str) -> StoreResult<bool>;

    /// Atomically increment a counter. The TTL is applied only when this call
    /// creates the counter. Returns the post-increment value and remaining TTL.
    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> StoreResult<(i64, Duration)>;

    /// Read a counter without mutating it.
    async fn get_counter(&self, key: &str) -> StoreResult<Option<i64>>;

    /// Remaining time-to-live, or `None` if the key is missing or has no expiry.
    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>>;

    /// Atomically remove and return up to `count` entries from the head of a list.
    async fn pop_front(&self, key: &str, count: usize) -> StoreResult<Vec<String>>;

    /// Append entries to the tail of a list in order. Returns the new length.
    async fn push_back(&self, key: &str, values: Vec<String>) -> StoreResult<usize>;

    /// Length of a list (0 when missing).
    async fn len(&self, key: &str) -> StoreResult<usize>;
}

//! In-process coordination store.
//!
//! Expiry is lazy: an expired key is purged the next time any operation
//! touches it. Time is read from `tokio::time::Instant`, so tests can drive
//! expiry with a paused clock.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::{CoordinationStore, StoreError, StoreResult};

#[derive(Debug)]
enum Value {
    Hash(HashMap<String, String>),
    Counter(i64),
    List(VecDeque<String>),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn remaining(&self, now: Instant) -> Option<Duration> {
        self.expires_at.map(|at| at.saturating_duration_since(now))
    }
}

/// Coordination store held entirely in process memory.
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,

    /// When false every operation fails with [`StoreError::Unavailable`].
    available: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage (or recovery) of the backing store.
    pub fn set_available(&self, available: bool) {
        debug!(available, "Memory store availability changed");
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store marked unavailable".to_string()))
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn purge_expired(entries: &mut HashMap<String, Entry>, key: &str, now: Instant) {
    if entries.get(key).is_some_and(|e| e.is_expired(now)) {
        entries.remove(key);
    }
}

fn wrong_type(key: &str, expected: &'static str) -> StoreError {
    StoreError::WrongType {
        key: key.to_string(),
        expected,
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn hset(&self, key: &str, field: &str, value: String) -> StoreResult<()> {
        self.ensure_available()?;
        let mut entries = self.entries.lock().await;
        purge_expired(&mut entries, key, Instant::now());

        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::Hash(HashMap::new())));
        match &mut entry.value {
            Value::Hash(map) => {
                map.insert(field.to_string(), value);
                Ok(())
            }
            _ => Err(wrong_type(key, "hash")),
        }
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        self.ensure_available()?;
        let mut entries = self.entries.lock().await;
        purge_expired(&mut entries, key, Instant::now());

        match entries.get(key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Hash(map)) => Ok(map.get(field).cloned()),
            Some(_) => Err(wrong_type(key, "hash")),
        }
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        self.ensure_available()?;
        let mut entries = self.entries.lock().await;
        purge_expired(&mut entries, key, Instant::now());

        match entries.get(key).map(|e| &e.value) {
            None => Ok(HashMap::new()),
            Some(Value::Hash(map)) => Ok(map.clone()),
            Some(_) => Err(wrong_type(key, "hash")),
        }
    }

    async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool> {
        self.ensure_available()?;
        let mut entries = self.entries.lock().await;
        purge_expired(&mut entries, key, Instant::now());

        let (removed, now_empty) = match entries.get_mut(key).map(|e| &mut e.value) {
            None => return Ok(false),
            Some(Value::Hash(map)) => (map.remove(field).is_some(), map.is_empty()),
            Some(_) => return Err(wrong_type(key, "hash")),
        };
        if now_empty {
            entries.remove(key);
        }
        Ok(removed)
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64> {
        self.ensure_available()?;
        let mut entries = self.entries.lock().await;
        purge_expired(&mut entries, key, Instant::now());

        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::Hash(HashMap::new())));
        let Value::Hash(map) = &mut entry.value else {
            return Err(wrong_type(key, "hash"));
        };

        let current = match map.get(field) {
            Some(raw) => raw.parse::<i64>().map_err(|_| StoreError::NotAnInteger {
                key: format!("{key}.{field}"),
            })?,
            None => 0,
        };
        let next = current + delta;
        map.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        self.ensure_available()?;
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        purge_expired(&mut entries, key, now);

        match entries.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        self.ensure_available()?;
        let mut entries = self.entries.lock().await;
        purge_expired(&mut entries, key, Instant::now());
        Ok(entries.remove(key).is_some())
    }

    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> StoreResult<(i64, Duration)> {
        self.ensure_available()?;
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        purge_expired(&mut entries, key, now);

        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Counter(0),
            expires_at: Some(now + ttl),
        });
        let Value::Counter(count) = &mut entry.value else {
            return Err(wrong_type(key, "counter"));
        };
        *count += 1;
        let count = *count;

        if entry.expires_at.is_none() {
            entry.expires_at = Some(now + ttl);
        }
        let remaining = entry.remaining(now).unwrap_or(ttl);
        Ok((count, remaining))
    }

    async fn get_counter(&self, key: &str) -> StoreResult<Option<i64>> {
        self.ensure_available()?;
        let mut entries = self.entries.lock().await;
        purge_expired(&mut entries, key, Instant::now());

        match entries.get(key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Counter(count)) => Ok(Some(*count)),
            Some(_) => Err(wrong_type(key, "counter")),
        }
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        self.ensure_available()?;
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        purge_expired(&mut entries, key, now);
        Ok(entries.get(key).and_then(|e| e.remaining(now)))
    }

    async fn pop_front(&self, key: &str, count: usize) -> StoreResult<Vec<String>> {
        self.ensure_available()?;
        let mut entries = self.entries.lock().await;
        purge_expired(&mut entries, key, Instant::now());

        let (popped, now_empty) = match entries.get_mut(key).map(|e| &mut e.value) {
            None => return Ok(Vec::new()),
            Some(Value::List(list)) => {
                let take = count.min(list.len());
                let popped: Vec<String> = list.drain(..take).collect();
                (popped, list.is_empty())
            }
            Some(_) => return Err(wrong_type(key, "list")),
        };
        if now_empty {
            entries.remove(key);
        }
        Ok(popped)
    }

    async fn push_back(&self, key: &str, values: Vec<String>) -> StoreResult<usize> {
        self.ensure_available()?;
        let mut entries = self.entries.lock().await;
        purge_expired(&mut entries, key, Instant::now());

        if values.is_empty() {
            return match entries.get(key).map(|e| &e.value) {
                None => Ok(0),
                Some(Value::List(list)) => Ok(list.len()),
                Some(_) => Err(wrong_type(key, "list")),
            };
        }

        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::List(VecDeque::new())));
        match &mut entry.value {
            Value::List(list) => {
                list.extend(values);
                Ok(list.len())
            }
            _ => Err(wrong_type(key, "list")),
        }
    }

    async fn len(&self, key: &str) -> StoreResult<usize> {
        self.ensure_available()?;
        let mut entries = self.entries.lock().await;
        purge_expired(&mut entries, key, Instant::now());

        match entries.get(key).map(|e| &e.value) {
            None => Ok(0),
            Some(Value::List(list)) => Ok(list.len()),
            Some(_) => Err(wrong_type(key, "list")),
        }
    }
}

//! Coordinator error types.

use hive_store::StoreError;
use thiserror::Error;

/// Result type for coordinator operations.
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

/// Errors raised by registry, reaper and selector operations.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// The shared coordination store failed.
    #[error("coordination store error: {0}")]
    Store(#[from] StoreError),

    /// An instance status could not be encoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoordinatorError {
    /// Returns true if the store was unreachable (the caller should retry next tick).
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, CoordinatorError::Store(e) if e.is_unavailable())
    }
}

//! Error types for coordination store operations.

use thiserror::Error;

/// Errors returned by a coordination store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("coordination store unavailable: {0}")]
    Unavailable(String),

    /// The key holds a value of a different kind than the operation expects.
    #[error("wrong value type at key '{key}': expected {expected}")]
    WrongType { key: String, expected: &'static str },

    /// A hash field or counter did not hold an integer.
    #[error("value at '{key}' is not an integer")]
    NotAnInteger { key: String },
}

impl StoreError {
    /// Returns true if the error is transient and the caller may retry later.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

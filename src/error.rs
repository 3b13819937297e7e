//! Storage error shared by the Result Store and the Durable Store.

use thiserror::Error;

/// Failure reported by any backing store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached or rejected the operation.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A compare-and-swap append found a different head than expected.
    #[error("checkpoint conflict: expected parent {expected:?}, found {found:?}")]
    Conflict {
        expected: Option<String>,
        found: Option<String>,
    },

    /// A single-flight lock stayed held by another run for the whole wait.
    #[error("lock {key} is held by a concurrent run")]
    LockContended { key: String },

    /// A persisted record could not be decoded.
    #[error("corrupt record {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl StoreError {
    pub fn unavailable(context: &str, err: impl std::fmt::Display) -> Self {
        Self::Unavailable(format!("{}: {}", context, err))
    }
}

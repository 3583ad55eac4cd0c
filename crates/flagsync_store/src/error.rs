//! Error types for store operations.

use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// An item could not be serialized or parsed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored item is missing data needed to compare versions.
    #[error("stored item corrupted: {0}")]
    Corrupted(String),

    /// Concurrent writers kept invalidating the read-compare-write cycle.
    #[error("gave up writing {namespace}/{key} after {attempts} conflicting attempts")]
    ConflictRetriesExhausted {
        /// Namespace of the item.
        namespace: String,
        /// Item key.
        key: String,
        /// Number of attempts made.
        attempts: u32,
    },

    /// The backend reported a failure.
    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Creates an unavailable error.
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    /// Creates a backend error.
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    /// Returns true if the failure indicates the store itself is unreachable.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

//! Error types for the sync engine.

use flagsync_store::StoreError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while synchronizing.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the connection can be retried.
        retryable: bool,
    },

    /// The server answered the connection attempt with an HTTP error.
    #[error("unexpected response status {status}")]
    ErrorResponse {
        /// HTTP status code.
        status: u16,
    },

    /// Store error while applying data.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The event source was closed by its owner.
    #[error("sync cancelled")]
    Cancelled,

    /// Not connected.
    #[error("not connected to server")]
    NotConnected,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::ErrorResponse { status } => is_http_error_recoverable(*status),
            SyncError::NotConnected => true,
            SyncError::Store(_) | SyncError::Cancelled => false,
        }
    }
}

/// Returns true if a connection that failed with `status` may be retried.
///
/// Client errors mean the request itself is wrong (bad key, unknown
/// environment), except for the few that signal a transient condition.
pub fn is_http_error_recoverable(status: u16) -> bool {
    match status {
        400..=499 => matches!(status, 400 | 408 | 429),
        _ => true,
    }
}

//! Data source status model.

use crate::error::SyncError;
use std::fmt;
use std::time::{Instant, SystemTime};

/// The state of a data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSourceState {
    /// Started, but no data has been received yet.
    Initializing,
    /// Receiving data normally.
    Valid,
    /// Was valid, but has temporarily lost its connection or data.
    Interrupted,
    /// Stopped for good, either on request or after an unrecoverable error.
    Off,
}

impl fmt::Display for DataSourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataSourceState::Initializing => "INITIALIZING",
            DataSourceState::Valid => "VALID",
            DataSourceState::Interrupted => "INTERRUPTED",
            DataSourceState::Off => "OFF",
        };
        f.write_str(name)
    }
}

/// The category of a data source error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// An unexpected error.
    Unknown,
    /// The connection failed or was dropped.
    NetworkError,
    /// The server answered with an HTTP error status.
    ErrorResponse,
    /// The server sent data that could not be used.
    InvalidData,
    /// Received data could not be written to the store.
    StoreError,
}

/// Details of the most recent data source error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    /// Error category.
    pub kind: ErrorKind,
    /// HTTP status, for [`ErrorKind::ErrorResponse`].
    pub status_code: Option<u16>,
    /// Description, if any.
    pub message: Option<String>,
    /// When the error happened.
    pub time: SystemTime,
}

impl ErrorInfo {
    /// Creates an error of `kind` happening now.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status_code: None,
            message: Some(message.into()),
            time: SystemTime::now(),
        }
    }

    /// Creates an [`ErrorKind::ErrorResponse`] error for an HTTP status.
    pub fn from_http_status(status: u16) -> Self {
        Self {
            kind: ErrorKind::ErrorResponse,
            status_code: Some(status),
            message: None,
            time: SystemTime::now(),
        }
    }

    /// Describes a transport failure.
    pub fn from_sync_error(error: &SyncError) -> Self {
        match error {
            SyncError::ErrorResponse { status } => Self::from_http_status(*status),
            SyncError::Store(e) => Self::new(ErrorKind::StoreError, e.to_string()),
            other => Self::new(ErrorKind::NetworkError, other.to_string()),
        }
    }
}

/// The status of a data source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSourceStatus {
    /// Current state.
    pub state: DataSourceState,
    /// When the state last changed.
    pub state_since: Instant,
    /// The most recent error, kept after recovery.
    pub last_error: Option<ErrorInfo>,
}

impl DataSourceStatus {
    /// The status of a data source that has just started.
    pub fn initializing() -> Self {
        Self {
            state: DataSourceState::Initializing,
            state_since: Instant::now(),
            last_error: None,
        }
    }
}

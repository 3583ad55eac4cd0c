//! Data store status reporting.

use std::sync::Arc;
use tokio::sync::watch;

/// Health of a data store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataStoreStatus {
    /// False while the store cannot be reached.
    pub available: bool,
    /// True once the store recovered from an outage and may have missed
    /// updates; the data source should request a full transfer.
    pub refresh_needed: bool,
}

impl Default for DataStoreStatus {
    fn default() -> Self {
        Self {
            available: true,
            refresh_needed: false,
        }
    }
}

/// Publishes [`DataStoreStatus`] changes to observers.
///
/// Cloning yields another handle to the same channel.
#[derive(Debug, Clone)]
pub struct DataStoreStatusProvider {
    tx: Arc<watch::Sender<DataStoreStatus>>,
    monitoring_enabled: bool,
}

impl DataStoreStatusProvider {
    /// Creates a provider for a store that reports availability.
    pub fn new() -> Self {
        Self::with_monitoring(true)
    }

    /// Creates a provider for a store that never changes status.
    pub fn unmonitored() -> Self {
        Self::with_monitoring(false)
    }

    fn with_monitoring(monitoring_enabled: bool) -> Self {
        let (tx, _rx) = watch::channel(DataStoreStatus::default());
        Self {
            tx: Arc::new(tx),
            monitoring_enabled,
        }
    }

    /// The current status.
    pub fn status(&self) -> DataStoreStatus {
        *self.tx.borrow()
    }

    /// Records a new status. Observers are only woken if it changed.
    ///
    /// Returns true if the status changed.
    pub fn update(&self, status: DataStoreStatus) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        })
    }

    /// Subscribes to status changes.
    pub fn subscribe(&self) -> watch::Receiver<DataStoreStatus> {
        self.tx.subscribe()
    }

    /// Returns true if the underlying store reports availability changes.
    pub fn is_status_monitoring_enabled(&self) -> bool {
        self.monitoring_enabled
    }
}

impl Default for DataStoreStatusProvider {
    fn default() -> Self {
        Self::new()
    }
}

//! The changeset application sink.

use crate::status::{DataSourceState, DataSourceStatus, ErrorInfo, ErrorKind};
use crate::translator::ChangeSetTranslator;
use flagsync_protocol::{ChangeSetType, Payload, PayloadListener, Selector};
use flagsync_store::{DataKind, DataStore, DataStoreStatusProvider, StoreChangeSet, StoreResult};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// An item whose stored version changed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ItemChange {
    /// Item kind.
    pub kind: DataKind,
    /// Item key.
    pub key: String,
}

type VersionMap = HashMap<(DataKind, String), i64>;

/// Where a data source delivers changesets and reports its status.
///
/// Applies changesets to the store, tracks the data source status, and,
/// when a change notifier is attached, reports every item whose version
/// changed.
pub struct DataSourceUpdates {
    store: Arc<dyn DataStore>,
    store_status: DataStoreStatusProvider,
    status: Mutex<DataSourceStatus>,
    status_changed: Condvar,
    status_tx: watch::Sender<DataSourceStatus>,
    changes: Option<mpsc::UnboundedSender<ItemChange>>,
    last_store_update_failed: AtomicBool,
}

impl DataSourceUpdates {
    /// Creates a sink writing to `store`, whose health is reported by
    /// `store_status`.
    pub fn new(store: Arc<dyn DataStore>, store_status: DataStoreStatusProvider) -> Self {
        let initial = DataSourceStatus::initializing();
        let (status_tx, _rx) = watch::channel(initial.clone());
        Self {
            store,
            store_status,
            status: Mutex::new(initial),
            status_changed: Condvar::new(),
            status_tx,
            changes: None,
            last_store_update_failed: AtomicBool::new(false),
        }
    }

    /// Sends an [`ItemChange`] on `tx` for every item a changeset modifies.
    pub fn with_change_notifier(mut self, tx: mpsc::UnboundedSender<ItemChange>) -> Self {
        self.changes = Some(tx);
        self
    }

    /// Applies a changeset to the store.
    ///
    /// Returns true if the store accepted it. On failure the status becomes
    /// [`DataSourceState::Interrupted`] with [`ErrorKind::StoreError`].
    pub fn apply(&self, changeset: &StoreChangeSet) -> bool {
        let before = match self.changes {
            Some(_) => match self.versions_before(changeset) {
                Ok(before) => Some(before),
                Err(e) => {
                    self.report_store_failure(&e.to_string());
                    return false;
                }
            },
            None => None,
        };

        if let Err(e) = self.store.apply(changeset) {
            self.report_store_failure(&e.to_string());
            return false;
        }
        self.last_store_update_failed.store(false, Ordering::SeqCst);

        debug!(
            change_type = ?changeset.change_type,
            items = changeset.item_count(),
            selector_version = changeset.selector.version(),
            "applied changeset"
        );

        if let Some(before) = before {
            self.notify_changes(changeset, &before);
        }
        self.update_status(DataSourceState::Valid, None);
        true
    }

    /// Records a new data source status.
    ///
    /// An [`DataSourceState::Interrupted`] report while still
    /// [`DataSourceState::Initializing`] keeps the state at initializing;
    /// the error is still recorded. Observers are only woken when the state
    /// changes or a new error is reported.
    pub fn update_status(&self, state: DataSourceState, error: Option<ErrorInfo>) {
        let mut status = self.status.lock();
        let state = if state == DataSourceState::Interrupted
            && status.state == DataSourceState::Initializing
        {
            DataSourceState::Initializing
        } else {
            state
        };

        if state == status.state && error.is_none() {
            return;
        }

        if state != status.state {
            status.state = state;
            status.state_since = Instant::now();
        }
        if error.is_some() {
            status.last_error = error;
        }

        debug!(state = %status.state, error = ?status.last_error.as_ref().map(|e| e.kind), "data source status changed");
        self.status_changed.notify_all();
        self.status_tx.send_replace(status.clone());
    }

    /// The current data source status.
    pub fn status(&self) -> DataSourceStatus {
        self.status.lock().clone()
    }

    /// Blocks until the state is `desired`, the source turns off, or
    /// `timeout` elapses. A zero timeout waits indefinitely.
    ///
    /// Returns true only if `desired` was reached.
    pub fn wait_for(&self, desired: DataSourceState, timeout: Duration) -> bool {
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        let mut status = self.status.lock();
        loop {
            if status.state == desired {
                return true;
            }
            if status.state == DataSourceState::Off {
                return false;
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    self.status_changed.wait_for(&mut status, deadline - now);
                }
                None => self.status_changed.wait(&mut status),
            }
        }
    }

    /// Subscribes to status changes.
    pub fn subscribe_status(&self) -> watch::Receiver<DataSourceStatus> {
        self.status_tx.subscribe()
    }

    /// Health of the underlying store.
    pub fn data_store_status_provider(&self) -> &DataStoreStatusProvider {
        &self.store_status
    }

    /// The selector of the data currently held by the store.
    pub fn selector(&self) -> Selector {
        self.store.selector()
    }

    fn report_store_failure(&self, message: &str) {
        if !self.last_store_update_failed.swap(true, Ordering::SeqCst) {
            warn!(error = %message, "unexpected data store error when trying to store an update received from the data source");
        } else {
            debug!(error = %message, "data store is still failing");
        }
        self.update_status(
            DataSourceState::Interrupted,
            Some(ErrorInfo::new(ErrorKind::StoreError, message)),
        );
    }

    fn versions_before(&self, changeset: &StoreChangeSet) -> StoreResult<VersionMap> {
        let mut versions = VersionMap::new();
        match changeset.change_type {
            ChangeSetType::Full => {
                for (kind, _) in &changeset.data {
                    for (key, item) in self.store.get_all(*kind)? {
                        versions.insert((*kind, key), item.version);
                    }
                }
            }
            ChangeSetType::Partial => {
                for (kind, items) in &changeset.data {
                    for (key, _) in items {
                        if let Some(item) = self.store.get(*kind, key)? {
                            versions.insert((*kind, key.clone()), item.version);
                        }
                    }
                }
            }
            ChangeSetType::None => {}
        }
        Ok(versions)
    }

    fn notify_changes(&self, changeset: &StoreChangeSet, before: &VersionMap) {
        let Some(tx) = &self.changes else {
            return;
        };

        let mut changed = Vec::new();
        for (kind, items) in &changeset.data {
            for (key, item) in items {
                let newer = before
                    .get(&(*kind, key.clone()))
                    .map_or(true, |old| *old < item.version);
                if newer {
                    changed.push(ItemChange {
                        kind: *kind,
                        key: key.clone(),
                    });
                }
            }
        }

        if changeset.change_type == ChangeSetType::Full {
            // Items missing from a full changeset were removed.
            for (kind, key) in before.keys() {
                let still_present = changeset
                    .data
                    .iter()
                    .filter(|(k, _)| k == kind)
                    .any(|(_, items)| items.iter().any(|(k, _)| k == key));
                if !still_present {
                    changed.push(ItemChange {
                        kind: *kind,
                        key: key.clone(),
                    });
                }
            }
        }

        for change in changed {
            if tx.send(change).is_err() {
                debug!("change receiver dropped");
                return;
            }
        }
    }
}

/// Feeds the payloads of a [`flagsync_protocol::PayloadProcessor`] into a
/// [`DataSourceUpdates`].
pub struct PayloadSink {
    updates: Arc<DataSourceUpdates>,
    environment_id: Option<String>,
    should_persist: bool,
}

impl PayloadSink {
    /// Creates a listener that applies payloads to `updates`.
    pub fn new(updates: Arc<DataSourceUpdates>) -> Self {
        Self {
            updates,
            environment_id: None,
            should_persist: true,
        }
    }

    /// Tags applied changesets with an environment ID.
    pub fn with_environment_id(mut self, environment_id: impl Into<String>) -> Self {
        self.environment_id = Some(environment_id.into());
        self
    }

    /// Sets whether applied data should be persisted.
    pub fn with_should_persist(mut self, should_persist: bool) -> Self {
        self.should_persist = should_persist;
        self
    }
}

impl PayloadListener for PayloadSink {
    fn on_payload(&self, payload: &Payload) {
        let changeset = ChangeSetTranslator::to_store_changeset(
            &ChangeSetTranslator::payload_to_changeset(payload),
            self.environment_id.as_deref(),
            self.should_persist,
        );
        self.updates.apply(&changeset);
    }

    fn on_error(&self, kind: flagsync_protocol::ErrorKind, message: &str) {
        let kind = match kind {
            flagsync_protocol::ErrorKind::InvalidData => ErrorKind::InvalidData,
            flagsync_protocol::ErrorKind::Unknown => ErrorKind::Unknown,
        };
        self.updates
            .update_status(DataSourceState::Interrupted, Some(ErrorInfo::new(kind, message)));
    }
}

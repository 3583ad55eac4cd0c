//! Write-through store.

use crate::config::DataStoreMode;
use crate::error::StoreResult;
use crate::item::{FullDataSet, ItemDescriptor, KeyedItems, StoreChangeSet};
use crate::kind::DataKind;
use crate::memory_store::InMemoryDataStore;
use crate::status::{DataStoreStatus, DataStoreStatusProvider};
use crate::store::DataStore;
use flagsync_protocol::{ChangeSetType, Selector};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// An in-memory store that optionally writes through to a persistent one.
///
/// Until the first initializing payload arrives, reads are served from the
/// persistent store (which may hold data written by another process). After
/// that, reads are served from memory. Writes always go to memory, and go to
/// the persistent store only in [`DataStoreMode::ReadWrite`] and when the
/// data is marked `should_persist`.
///
/// When a full data set lands in memory without being written through, the
/// persistent store's `refresh_needed` flag is cleared: the data source has
/// nothing left to refetch, and memory is what reads are served from.
pub struct WriteThroughStore {
    memory: InMemoryDataStore,
    persistent: Option<Arc<dyn DataStore>>,
    status: Option<DataStoreStatusProvider>,
    mode: DataStoreMode,
    switched_to_memory: AtomicBool,
}

impl WriteThroughStore {
    /// Creates a store with no persistence.
    pub fn memory_only() -> Self {
        Self {
            memory: InMemoryDataStore::new(),
            persistent: None,
            status: None,
            mode: DataStoreMode::ReadOnly,
            switched_to_memory: AtomicBool::new(true),
        }
    }

    /// Creates a store backed by `persistent`, whose availability is
    /// reported through `status`.
    pub fn with_persistence(
        persistent: Arc<dyn DataStore>,
        status: DataStoreStatusProvider,
        mode: DataStoreMode,
    ) -> Self {
        Self {
            memory: InMemoryDataStore::new(),
            persistent: Some(persistent),
            status: Some(status),
            mode,
            switched_to_memory: AtomicBool::new(false),
        }
    }

    /// The in-memory store.
    pub fn memory(&self) -> &InMemoryDataStore {
        &self.memory
    }

    /// Returns true once reads are served from memory.
    pub fn reads_from_memory(&self) -> bool {
        self.switched_to_memory.load(Ordering::SeqCst)
    }

    fn active(&self) -> &dyn DataStore {
        match &self.persistent {
            Some(persistent) if !self.reads_from_memory() => persistent.as_ref(),
            _ => &self.memory,
        }
    }

    fn writable_persistence(&self, should_persist: bool) -> Option<&Arc<dyn DataStore>> {
        self.persistent
            .as_ref()
            .filter(|_| self.mode == DataStoreMode::ReadWrite && should_persist)
    }

    fn switch_to_memory(&self) {
        if !self.switched_to_memory.swap(true, Ordering::SeqCst) {
            debug!("initializing payload received; serving reads from memory");
        }
    }

    /// Called when a full data set reached memory but not persistence.
    fn refreshed_in_memory(&self) {
        let Some(status) = &self.status else {
            return;
        };
        let current = status.status();
        if current.refresh_needed {
            debug!("full data set held in memory; refresh no longer needed");
            status.update(DataStoreStatus {
                available: current.available,
                refresh_needed: false,
            });
        }
    }
}

impl DataStore for WriteThroughStore {
    fn init(&self, data: FullDataSet<ItemDescriptor>) -> StoreResult<()> {
        let persist = self.writable_persistence(data.should_persist).cloned();
        match persist {
            Some(persistent) => {
                self.memory.init(data.clone())?;
                self.switch_to_memory();
                persistent.init(data)
            }
            None => {
                self.memory.init(data)?;
                self.switch_to_memory();
                self.refreshed_in_memory();
                Ok(())
            }
        }
    }

    fn get(&self, kind: DataKind, key: &str) -> StoreResult<Option<ItemDescriptor>> {
        self.active().get(kind, key)
    }

    fn get_all(&self, kind: DataKind) -> StoreResult<KeyedItems<ItemDescriptor>> {
        self.active().get_all(kind)
    }

    fn upsert(&self, kind: DataKind, key: &str, item: ItemDescriptor) -> StoreResult<bool> {
        match self.writable_persistence(true) {
            Some(persistent) => {
                let written = self.memory.upsert(kind, key, item.clone())?;
                Ok(written && persistent.upsert(kind, key, item)?)
            }
            None => self.memory.upsert(kind, key, item),
        }
    }

    fn apply(&self, changeset: &StoreChangeSet) -> StoreResult<()> {
        self.memory.apply(changeset)?;
        let full = changeset.change_type == ChangeSetType::Full;
        if full {
            self.switch_to_memory();
        }
        match self.writable_persistence(changeset.should_persist) {
            Some(persistent) => persistent.apply(changeset),
            None => {
                if full {
                    self.refreshed_in_memory();
                }
                Ok(())
            }
        }
    }

    fn selector(&self) -> Selector {
        self.memory.selector()
    }

    fn is_initialized(&self) -> bool {
        self.active().is_initialized()
    }

    fn is_status_monitoring_enabled(&self) -> bool {
        self.persistent
            .as_ref()
            .is_some_and(|p| p.is_status_monitoring_enabled())
    }
}

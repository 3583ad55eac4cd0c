//! In-memory data store.

use crate::error::StoreResult;
use crate::item::{FullDataSet, ItemDescriptor, KeyedItems, StoreChangeSet};
use crate::kind::DataKind;
use crate::store::DataStore;
use flagsync_protocol::{ChangeSetType, Selector};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

type Items = HashMap<String, ItemDescriptor>;

#[derive(Debug, Default, Clone)]
struct Snapshot {
    data: HashMap<DataKind, Arc<Items>>,
    initialized: bool,
    selector: Selector,
}

/// A thread-safe, versioned, in-memory store.
///
/// Every write builds a new snapshot and swaps it in whole, so readers
/// never observe a partially applied changeset. Writers are serialized by a
/// separate lock; readers only take the snapshot lock long enough to clone
/// an `Arc`.
///
/// # Example
///
/// ```rust
/// use flagsync_store::{DataKind, DataStore, InMemoryDataStore, ItemDescriptor};
/// use serde_json::json;
///
/// let store = InMemoryDataStore::new();
/// assert!(store.upsert(DataKind::Features, "f1", ItemDescriptor::new(2, json!({}))).unwrap());
/// assert!(!store.upsert(DataKind::Features, "f1", ItemDescriptor::new(1, json!({}))).unwrap());
/// assert_eq!(store.get(DataKind::Features, "f1").unwrap().unwrap().version, 2);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryDataStore {
    snapshot: RwLock<Arc<Snapshot>>,
    write_lock: Mutex<()>,
}

impl InMemoryDataStore {
    /// Creates a new empty, uninitialized store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of all data in the store.
    #[must_use]
    pub fn export_all(&self) -> FullDataSet<ItemDescriptor> {
        let snapshot = self.current();
        let mut data: Vec<_> = snapshot
            .data
            .iter()
            .map(|(kind, items)| {
                let items = items
                    .iter()
                    .map(|(key, item)| (key.clone(), item.clone()))
                    .collect();
                (*kind, items)
            })
            .collect();
        data.sort_by_key(|(kind, _)| *kind);
        FullDataSet::new(data)
    }

    fn current(&self) -> Arc<Snapshot> {
        Arc::clone(&self.snapshot.read())
    }

    fn replace(&self, next: Snapshot) {
        *self.snapshot.write() = Arc::new(next);
    }

    fn apply_full(&self, data: &[(DataKind, KeyedItems<ItemDescriptor>)], selector: Selector) {
        let _guard = self.write_lock.lock();
        let mut next = (*self.current()).clone();
        for (kind, items) in data {
            let items: Items = items.iter().cloned().collect();
            next.data.insert(*kind, Arc::new(items));
        }
        next.initialized = true;
        next.selector = selector;
        self.replace(next);
    }

    fn apply_partial(&self, data: &[(DataKind, KeyedItems<ItemDescriptor>)], selector: Selector) {
        let _guard = self.write_lock.lock();
        let mut next = (*self.current()).clone();
        for (kind, items) in data {
            let existing = next.data.entry(*kind).or_default();
            let kind_items = Arc::make_mut(existing);
            for (key, item) in items {
                let stored = kind_items.get(key).map_or(-1, |old| old.version);
                if item.version > stored {
                    kind_items.insert(key.clone(), item.clone());
                } else {
                    trace!(%kind, key = %key, stored, incoming = item.version, "ignoring stale item");
                }
            }
        }
        next.selector = selector;
        self.replace(next);
    }

    fn record_selector(&self, selector: &Selector) {
        if selector.is_empty() {
            return;
        }
        let _guard = self.write_lock.lock();
        let mut next = (*self.current()).clone();
        next.selector = selector.clone();
        self.replace(next);
    }
}

impl DataStore for InMemoryDataStore {
    fn init(&self, data: FullDataSet<ItemDescriptor>) -> StoreResult<()> {
        // A full init replaces every kind, not only the ones present.
        let _guard = self.write_lock.lock();
        let mut next = Snapshot {
            initialized: true,
            ..Snapshot::default()
        };
        for (kind, items) in data.data {
            next.data.insert(kind, Arc::new(items.into_iter().collect()));
        }
        self.replace(next);
        Ok(())
    }

    fn get(&self, kind: DataKind, key: &str) -> StoreResult<Option<ItemDescriptor>> {
        Ok(self
            .current()
            .data
            .get(&kind)
            .and_then(|items| items.get(key))
            .cloned())
    }

    fn get_all(&self, kind: DataKind) -> StoreResult<KeyedItems<ItemDescriptor>> {
        Ok(self
            .current()
            .data
            .get(&kind)
            .map(|items| {
                items
                    .iter()
                    .map(|(key, item)| (key.clone(), item.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn upsert(&self, kind: DataKind, key: &str, item: ItemDescriptor) -> StoreResult<bool> {
        let _guard = self.write_lock.lock();
        let current = self.current();
        if let Some(old) = current.data.get(&kind).and_then(|items| items.get(key)) {
            if old.version >= item.version {
                return Ok(false);
            }
        }
        let mut next = (*current).clone();
        Arc::make_mut(next.data.entry(kind).or_default()).insert(key.to_string(), item);
        self.replace(next);
        Ok(true)
    }

    fn apply(&self, changeset: &StoreChangeSet) -> StoreResult<()> {
        match changeset.change_type {
            ChangeSetType::Full => self.apply_full(&changeset.data, changeset.selector.clone()),
            ChangeSetType::Partial => {
                self.apply_partial(&changeset.data, changeset.selector.clone())
            }
            ChangeSetType::None => self.record_selector(&changeset.selector),
        }
        Ok(())
    }

    fn selector(&self) -> Selector {
        self.current().selector.clone()
    }

    fn is_initialized(&self) -> bool {
        self.current().initialized
    }
}

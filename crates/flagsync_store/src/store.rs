//! The data store contract.

use crate::error::StoreResult;
use crate::item::{FullDataSet, ItemDescriptor, KeyedItems, StoreChangeSet};
use crate::kind::DataKind;
use flagsync_protocol::Selector;

/// A versioned store of flags and segments.
///
/// # Invariants
///
/// - `upsert` never replaces an item with one of the same or lower version
/// - `apply` is atomic: readers see the whole changeset or none of it
/// - deleted items are kept as tombstones, so `get` may return one
///
/// Implementations must be `Send + Sync`; all methods take `&self`.
pub trait DataStore: Send + Sync {
    /// Replaces all data and marks the store initialized.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage fails.
    fn init(&self, data: FullDataSet<ItemDescriptor>) -> StoreResult<()>;

    /// Gets one item, including tombstones.
    fn get(&self, kind: DataKind, key: &str) -> StoreResult<Option<ItemDescriptor>>;

    /// Gets every item of a kind, including tombstones.
    fn get_all(&self, kind: DataKind) -> StoreResult<KeyedItems<ItemDescriptor>>;

    /// Writes one item if its version is newer than the stored one.
    ///
    /// Returns `Ok(false)` when the write was stale.
    fn upsert(&self, kind: DataKind, key: &str, item: ItemDescriptor) -> StoreResult<bool>;

    /// Applies a changeset.
    ///
    /// - Full: the kinds in the changeset are replaced
    /// - Partial: each item is applied only if newer than the stored one
    /// - None: only a non-empty selector is recorded
    fn apply(&self, changeset: &StoreChangeSet) -> StoreResult<()>;

    /// The selector of the most recently applied changeset.
    fn selector(&self) -> Selector;

    /// Returns true once the store holds a full data set.
    fn is_initialized(&self) -> bool;

    /// Returns true if the store reports availability changes.
    fn is_status_monitoring_enabled(&self) -> bool {
        false
    }
}

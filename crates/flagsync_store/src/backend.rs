//! Optimistic-concurrency backend contract.

use crate::error::StoreResult;
use std::sync::Arc;

/// A revision token returned by [`CasBackend::watch`].
///
/// Only meaningful to the backend that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Revision(pub u64);

/// A shared key/value store with watch/transaction semantics.
///
/// Backends are **opaque string stores** grouped into namespaces. They do not
/// interpret the JSON they hold; version comparison happens in
/// [`crate::CasDataStore`].
///
/// # Invariants
///
/// - `commit_if_unchanged` writes only if no write to the namespace happened
///   since the matching `watch`
/// - `replace_all` is one logical transaction and sets the initialized marker
/// - Backends must be `Send + Sync` for concurrent access
///
/// # Implementors
///
/// - [`crate::MemoryCasBackend`] - For testing
pub trait CasBackend: Send + Sync {
    /// Starts watching a namespace and returns its current revision.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be reached.
    fn watch(&self, namespace: &str) -> StoreResult<Revision>;

    /// Reads one value.
    fn get(&self, namespace: &str, key: &str) -> StoreResult<Option<String>>;

    /// Reads every value in a namespace.
    fn get_all(&self, namespace: &str) -> StoreResult<Vec<(String, String)>>;

    /// Writes a value if the namespace is still at `revision`.
    ///
    /// Returns `Ok(false)` when a concurrent write invalidated the watch.
    fn commit_if_unchanged(
        &self,
        revision: Revision,
        namespace: &str,
        key: &str,
        value: &str,
    ) -> StoreResult<bool>;

    /// Replaces the contents of each listed namespace and sets the
    /// initialized marker.
    fn replace_all(&self, data: &[(&str, Vec<(String, String)>)]) -> StoreResult<()>;

    /// Returns true if the initialized marker exists.
    fn initialized_marker_exists(&self) -> StoreResult<bool>;
}

impl<B: CasBackend + ?Sized> CasBackend for Arc<B> {
    fn watch(&self, namespace: &str) -> StoreResult<Revision> {
        (**self).watch(namespace)
    }

    fn get(&self, namespace: &str, key: &str) -> StoreResult<Option<String>> {
        (**self).get(namespace, key)
    }

    fn get_all(&self, namespace: &str) -> StoreResult<Vec<(String, String)>> {
        (**self).get_all(namespace)
    }

    fn commit_if_unchanged(
        &self,
        revision: Revision,
        namespace: &str,
        key: &str,
        value: &str,
    ) -> StoreResult<bool> {
        (**self).commit_if_unchanged(revision, namespace, key, value)
    }

    fn replace_all(&self, data: &[(&str, Vec<(String, String)>)]) -> StoreResult<()> {
        (**self).replace_all(data)
    }

    fn initialized_marker_exists(&self) -> StoreResult<bool> {
        (**self).initialized_marker_exists()
    }
}

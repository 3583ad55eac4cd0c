//! In-memory CAS backend for testing.

use crate::backend::{CasBackend, Revision};
use crate::error::{StoreError, StoreResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
struct Namespace {
    revision: u64,
    items: HashMap<String, String>,
}

#[derive(Debug, Default)]
struct Inner {
    namespaces: HashMap<String, Namespace>,
    initialized: bool,
}

/// An in-memory [`CasBackend`].
///
/// This backend is suitable for:
/// - Unit tests
/// - Integration tests
/// - Simulating outages, via [`MemoryCasBackend::set_available`]
///
/// Every write bumps the revision of its namespace, which invalidates any
/// outstanding watch on that namespace.
///
/// # Example
///
/// ```rust
/// use flagsync_store::{CasBackend, MemoryCasBackend};
///
/// let backend = MemoryCasBackend::new();
/// let revision = backend.watch("features").unwrap();
/// assert!(backend.commit_if_unchanged(revision, "features", "f1", "{}").unwrap());
/// assert!(!backend.commit_if_unchanged(revision, "features", "f1", "{}").unwrap());
/// ```
#[derive(Debug)]
pub struct MemoryCasBackend {
    inner: Mutex<Inner>,
    available: AtomicBool,
}

impl MemoryCasBackend {
    /// Creates a new empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Makes every operation fail with [`StoreError::Unavailable`] until
    /// availability is restored.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Writes a value unconditionally, as another process sharing the store
    /// would.
    pub fn put_raw(&self, namespace: &str, key: &str, value: &str) {
        let mut inner = self.inner.lock();
        let ns = inner.namespaces.entry(namespace.to_string()).or_default();
        ns.items.insert(key.to_string(), value.to_string());
        ns.revision += 1;
    }

    /// Current revision of a namespace.
    #[must_use]
    pub fn revision(&self, namespace: &str) -> u64 {
        self.inner
            .lock()
            .namespaces
            .get(namespace)
            .map_or(0, |ns| ns.revision)
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::unavailable("memory backend is offline"))
        }
    }
}

impl Default for MemoryCasBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CasBackend for MemoryCasBackend {
    fn watch(&self, namespace: &str) -> StoreResult<Revision> {
        self.check_available()?;
        Ok(Revision(self.revision(namespace)))
    }

    fn get(&self, namespace: &str, key: &str) -> StoreResult<Option<String>> {
        self.check_available()?;
        Ok(self
            .inner
            .lock()
            .namespaces
            .get(namespace)
            .and_then(|ns| ns.items.get(key))
            .cloned())
    }

    fn get_all(&self, namespace: &str) -> StoreResult<Vec<(String, String)>> {
        self.check_available()?;
        Ok(self
            .inner
            .lock()
            .namespaces
            .get(namespace)
            .map(|ns| {
                ns.items
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn commit_if_unchanged(
        &self,
        revision: Revision,
        namespace: &str,
        key: &str,
        value: &str,
    ) -> StoreResult<bool> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        let ns = inner.namespaces.entry(namespace.to_string()).or_default();
        if ns.revision != revision.0 {
            return Ok(false);
        }
        ns.items.insert(key.to_string(), value.to_string());
        ns.revision += 1;
        Ok(true)
    }

    fn replace_all(&self, data: &[(&str, Vec<(String, String)>)]) -> StoreResult<()> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        for (namespace, items) in data {
            let ns = inner.namespaces.entry(namespace.to_string()).or_default();
            ns.items = items.iter().cloned().collect();
            ns.revision += 1;
        }
        inner.initialized = true;
        Ok(())
    }

    fn initialized_marker_exists(&self) -> StoreResult<bool> {
        self.check_available()?;
        Ok(self.inner.lock().initialized)
    }
}

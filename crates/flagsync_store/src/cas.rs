//! Persistent store adapter with optimistic concurrency.
//!
//! [`CasDataStore`] implements [`PersistentDataStore`] over any
//! [`CasBackend`]. Several SDK instances may share one backend, so every
//! upsert is a read-compare-write cycle under a watch: if another writer
//! touches the namespace between the read and the commit, the cycle starts
//! over. The loop blocks the calling thread; use
//! [`CasDataStore::upsert_blocking`] from async code.

use crate::backend::CasBackend;
use crate::config::RetryConfig;
use crate::error::{StoreError, StoreResult};
use crate::item::{stored_version, FullDataSet, KeyedItems, SerializedItemDescriptor};
use crate::kind::DataKind;
use crate::persistent::PersistentDataStore;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Called after the watch and before the read of every upsert attempt.
///
/// Receives the namespace and key being written.
pub type PreCommitHook = Box<dyn Fn(&str, &str) + Send + Sync>;

/// A [`PersistentDataStore`] backed by a shared watch/transaction store.
pub struct CasDataStore<B> {
    backend: B,
    retry: RetryConfig,
    pre_commit: Option<PreCommitHook>,
}

impl<B: CasBackend> CasDataStore<B> {
    /// Creates a store with the default bounded retry policy.
    pub fn new(backend: B) -> Self {
        Self::with_retry(backend, RetryConfig::default())
    }

    /// Creates a store with an explicit retry policy.
    pub fn with_retry(backend: B, retry: RetryConfig) -> Self {
        Self {
            backend,
            retry,
            pre_commit: None,
        }
    }

    /// Installs a hook that runs inside every upsert attempt.
    ///
    /// Tests use this to inject a concurrent writer.
    pub fn with_pre_commit_hook(mut self, hook: PreCommitHook) -> Self {
        self.pre_commit = Some(hook);
        self
    }

    /// The backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// The retry policy.
    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    fn try_upsert(
        &self,
        namespace: &str,
        key: &str,
        item: &SerializedItemDescriptor,
    ) -> StoreResult<Option<bool>> {
        let revision = self.backend.watch(namespace)?;

        if let Some(hook) = &self.pre_commit {
            hook(namespace, key);
        }

        let old_version = match self.backend.get(namespace, key)? {
            Some(json) => stored_version(&json)?.0,
            None => -1,
        };

        if old_version >= item.version {
            debug!(
                namespace,
                key,
                stored = old_version,
                incoming = item.version,
                op = if item.deleted { "delete" } else { "update" },
                "ignoring write with same or older version"
            );
            return Ok(Some(false));
        }

        let json = item.json_or_placeholder(key);
        if self
            .backend
            .commit_if_unchanged(revision, namespace, key, &json)?
        {
            Ok(Some(true))
        } else {
            Ok(None)
        }
    }
}

impl<B: CasBackend + 'static> CasDataStore<B> {
    /// Runs [`PersistentDataStore::upsert`] on tokio's blocking pool.
    pub async fn upsert_blocking(
        self: &Arc<Self>,
        kind: DataKind,
        key: String,
        item: SerializedItemDescriptor,
    ) -> StoreResult<bool> {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || store.upsert(kind, &key, item))
            .await
            .map_err(|e| StoreError::backend(format!("upsert task failed: {e}")))?
    }
}

impl<B: CasBackend> PersistentDataStore for CasDataStore<B> {
    fn init(&self, data: FullDataSet<SerializedItemDescriptor>) -> StoreResult<()> {
        let converted: Vec<(&str, Vec<(String, String)>)> = data
            .data
            .iter()
            .map(|(kind, items)| {
                let items = items
                    .iter()
                    .map(|(key, item)| (key.clone(), item.json_or_placeholder(key)))
                    .collect();
                (kind.namespace(), items)
            })
            .collect();
        self.backend.replace_all(&converted)
    }

    fn get(&self, kind: DataKind, key: &str) -> StoreResult<Option<SerializedItemDescriptor>> {
        match self.backend.get(kind.namespace(), key)? {
            Some(json) => Ok(Some(SerializedItemDescriptor::from_stored(json)?)),
            None => {
                debug!(namespace = kind.namespace(), key, "key not found");
                Ok(None)
            }
        }
    }

    fn get_all(&self, kind: DataKind) -> StoreResult<KeyedItems<SerializedItemDescriptor>> {
        self.backend
            .get_all(kind.namespace())?
            .into_iter()
            .map(|(key, json)| Ok((key, SerializedItemDescriptor::from_stored(json)?)))
            .collect()
    }

    fn upsert(&self, kind: DataKind, key: &str, item: SerializedItemDescriptor) -> StoreResult<bool> {
        let namespace = kind.namespace();
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            if let Some(written) = self.try_upsert(namespace, key, &item)? {
                return Ok(written);
            }

            if !self.retry.allows_attempt(attempts) {
                warn!(namespace, key, attempts, "giving up after repeated concurrent modification");
                return Err(StoreError::ConflictRetriesExhausted {
                    namespace: namespace.to_string(),
                    key: key.to_string(),
                    attempts,
                });
            }

            debug!(namespace, key, attempts, "concurrent modification detected, retrying");
            let delay = self.retry.delay_for_attempt(attempts);
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
        }
    }

    fn is_initialized(&self) -> bool {
        self.backend.initialized_marker_exists().unwrap_or(false)
    }

    fn is_store_available(&self) -> bool {
        // Any answer at all means the store is reachable.
        self.backend.initialized_marker_exists().is_ok()
    }
}

impl<B: fmt::Debug> fmt::Debug for CasDataStore<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CasDataStore")
            .field("backend", &self.backend)
            .field("retry", &self.retry)
            .field("pre_commit", &self.pre_commit.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::ItemDescriptor;
    use crate::memory::MemoryCasBackend;
    use proptest::prelude::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn serialized(key: &str, version: i64) -> SerializedItemDescriptor {
        SerializedItemDescriptor::from_item(&ItemDescriptor::new(
            version,
            json!({"key": key, "version": version}),
        ))
        .unwrap()
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig::new(10).with_initial_delay(Duration::ZERO).with_jitter(false)
    }

    #[test]
    fn upsert_respects_stored_version() {
        let store = CasDataStore::new(MemoryCasBackend::new());
        assert!(store.upsert(DataKind::Features, "f1", serialized("f1", 5)).unwrap());

        assert!(!store.upsert(DataKind::Features, "f1", serialized("f1", 5)).unwrap());
        assert!(!store.upsert(DataKind::Features, "f1", serialized("f1", 4)).unwrap());
        assert_eq!(store.get(DataKind::Features, "f1").unwrap().unwrap().version, 5);

        assert!(store.upsert(DataKind::Features, "f1", serialized("f1", 6)).unwrap());
        assert_eq!(store.get(DataKind::Features, "f1").unwrap().unwrap().version, 6);
    }

    #[test]
    fn deletes_are_written_as_tombstones() {
        let store = CasDataStore::new(MemoryCasBackend::new());
        store.upsert(DataKind::Features, "f1", serialized("f1", 1)).unwrap();
        let tombstone = SerializedItemDescriptor::from_item(&ItemDescriptor::deleted(2)).unwrap();
        assert!(store.upsert(DataKind::Features, "f1", tombstone).unwrap());

        let stored = store.get(DataKind::Features, "f1").unwrap().unwrap();
        assert!(stored.deleted);
        assert_eq!(stored.version, 2);

        // A late, older put cannot resurrect it.
        assert!(!store.upsert(DataKind::Features, "f1", serialized("f1", 1)).unwrap());
    }

    #[test]
    fn retries_after_concurrent_modification() {
        let backend = Arc::new(MemoryCasBackend::new());
        let calls = Arc::new(AtomicU32::new(0));
        let hook_backend = Arc::clone(&backend);
        let hook_calls = Arc::clone(&calls);
        let store = CasDataStore::with_retry(Arc::clone(&backend), fast_retry())
            .with_pre_commit_hook(Box::new(move |namespace: &str, _key: &str| {
                // Interfere on the first attempt only.
                if hook_calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    hook_backend.put_raw(namespace, "other", r#"{"version":1}"#);
                }
            }));

        assert!(store.upsert(DataKind::Features, "f1", serialized("f1", 1)).unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn concurrent_newer_write_wins_over_retry() {
        let backend = Arc::new(MemoryCasBackend::new());
        let hook_backend = Arc::clone(&backend);
        let store = CasDataStore::with_retry(Arc::clone(&backend), fast_retry())
            .with_pre_commit_hook(Box::new(move |namespace: &str, key: &str| {
                if backend_version(&hook_backend, namespace, key).is_none() {
                    hook_backend.put_raw(namespace, key, r#"{"key":"f1","version":7}"#);
                }
            }));

        assert!(!store.upsert(DataKind::Features, "f1", serialized("f1", 6)).unwrap());
        assert_eq!(store.get(DataKind::Features, "f1").unwrap().unwrap().version, 7);
    }

    fn backend_version(backend: &MemoryCasBackend, namespace: &str, key: &str) -> Option<i64> {
        backend
            .get(namespace, key)
            .unwrap()
            .map(|json| stored_version(&json).unwrap().0)
    }

    #[test]
    fn bounded_retry_gives_up() {
        let backend = Arc::new(MemoryCasBackend::new());
        let hook_backend = Arc::clone(&backend);
        let store = CasDataStore::with_retry(
            Arc::clone(&backend),
            RetryConfig::new(3).with_initial_delay(Duration::ZERO).with_jitter(false),
        )
        .with_pre_commit_hook(Box::new(move |namespace: &str, _key: &str| {
            hook_backend.put_raw(namespace, "noise", r#"{"version":1}"#);
        }));

        let err = store
            .upsert(DataKind::Features, "f1", serialized("f1", 1))
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::ConflictRetriesExhausted { attempts: 3, .. }
        ));
    }

    #[test]
    fn init_replaces_namespaces_and_marks_initialized() {
        let store = CasDataStore::new(MemoryCasBackend::new());
        assert!(!store.is_initialized());
        store.upsert(DataKind::Features, "stale", serialized("stale", 1)).unwrap();

        store
            .init(FullDataSet::new(vec![
                (DataKind::Features, vec![("f1".into(), serialized("f1", 1))]),
                (
                    DataKind::Segments,
                    vec![(
                        "s1".into(),
                        SerializedItemDescriptor::from_item(&ItemDescriptor::deleted(3)).unwrap(),
                    )],
                ),
            ]))
            .unwrap();

        assert!(store.is_initialized());
        assert_eq!(store.get(DataKind::Features, "stale").unwrap(), None);
        let all = store.get_all(DataKind::Features).unwrap();
        assert_eq!(all.len(), 1);
        assert!(store.get(DataKind::Segments, "s1").unwrap().unwrap().deleted);
    }

    #[test]
    fn availability_checks_do_not_fail() {
        let backend = Arc::new(MemoryCasBackend::new());
        let store = CasDataStore::new(Arc::clone(&backend));
        assert!(store.is_store_available());

        backend.set_available(false);
        assert!(!store.is_store_available());
        assert!(!store.is_initialized());
        assert!(store.get(DataKind::Features, "f1").unwrap_err().is_unavailable());
    }

    #[test]
    fn racing_upserts_converge_to_newest_version() {
        for _ in 0..20 {
            let backend = Arc::new(MemoryCasBackend::new());
            let store = Arc::new(CasDataStore::with_retry(
                Arc::clone(&backend),
                RetryConfig::unbounded().with_initial_delay(Duration::ZERO).with_jitter(false),
            ));
            store.upsert(DataKind::Features, "f1", serialized("f1", 5)).unwrap();

            let handles: Vec<_> = [6, 7]
                .into_iter()
                .map(|version| {
                    let store = Arc::clone(&store);
                    std::thread::spawn(move || {
                        store
                            .upsert(DataKind::Features, "f1", serialized("f1", version))
                            .unwrap()
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }

            assert_eq!(store.get(DataKind::Features, "f1").unwrap().unwrap().version, 7);
        }
    }

    #[tokio::test]
    async fn upsert_blocking_runs_off_the_runtime() {
        let store = Arc::new(CasDataStore::new(MemoryCasBackend::new()));
        assert!(store
            .upsert_blocking(DataKind::Segments, "s1".into(), serialized("s1", 1))
            .await
            .unwrap());
        assert_eq!(store.get(DataKind::Segments, "s1").unwrap().unwrap().version, 1);
    }

    proptest! {
        #[test]
        fn upsert_keeps_the_highest_version(versions in proptest::collection::vec(0i64..100, 1..30)) {
            let store = CasDataStore::new(MemoryCasBackend::new());
            let mut highest = -1;
            for version in versions {
                let written = store.upsert(DataKind::Features, "f1", serialized("f1", version)).unwrap();
                prop_assert_eq!(written, version > highest);
                highest = highest.max(version);
            }
            let stored = store.get(DataKind::Features, "f1").unwrap().unwrap();
            prop_assert_eq!(stored.version, highest);
        }
    }
}

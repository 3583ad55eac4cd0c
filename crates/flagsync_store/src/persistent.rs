//! Persistent store contract and its [`DataStore`] adapter.

use crate::config::RetryConfig;
use crate::error::StoreResult;
use crate::item::{FullDataSet, ItemDescriptor, KeyedItems, SerializedItemDescriptor, StoreChangeSet};
use crate::kind::DataKind;
use crate::status::{DataStoreStatus, DataStoreStatusProvider};
use crate::store::DataStore;
use flagsync_protocol::{ChangeSetType, Selector};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// An external store shared by several SDK instances.
///
/// Works on serialized items. Deletions arrive as tombstones and must be
/// stored as such, never physically removed.
pub trait PersistentDataStore: Send + Sync {
    /// Replaces the contents of each listed kind in one logical
    /// transaction, then marks the store initialized.
    fn init(&self, data: FullDataSet<SerializedItemDescriptor>) -> StoreResult<()>;

    /// Gets one item.
    fn get(&self, kind: DataKind, key: &str) -> StoreResult<Option<SerializedItemDescriptor>>;

    /// Gets every item of a kind.
    fn get_all(&self, kind: DataKind) -> StoreResult<KeyedItems<SerializedItemDescriptor>>;

    /// Writes an item unless the stored version is the same or newer.
    ///
    /// Returns `Ok(false)` when the write was stale.
    fn upsert(&self, kind: DataKind, key: &str, item: SerializedItemDescriptor) -> StoreResult<bool>;

    /// Returns true if the store has been initialized. Never fails.
    fn is_initialized(&self) -> bool;

    /// Returns true if a trivial read succeeds. Never fails.
    fn is_store_available(&self) -> bool;
}

/// Adapts a [`PersistentDataStore`] to the [`DataStore`] contract.
///
/// Converts items to and from their serialized form and tracks
/// availability: any failed operation marks the store unavailable and
/// starts a background thread that checks the store until it answers
/// again. Recovery marks it available with `refresh_needed` set, since
/// updates may have been missed during the outage.
pub struct PersistentStoreWrapper<P> {
    shared: Arc<Shared<P>>,
    recovery: RetryConfig,
    initialized: AtomicBool,
}

struct Shared<P> {
    store: P,
    status: DataStoreStatusProvider,
    polling: AtomicBool,
}

impl<P: PersistentDataStore> Shared<P> {
    /// Checks the store; on success after an outage, requests a refresh.
    fn recover(&self) -> bool {
        if !self.store.is_store_available() {
            return false;
        }
        if !self.status.status().available {
            info!("persistent store is available again");
            self.status.update(DataStoreStatus {
                available: true,
                refresh_needed: true,
            });
        }
        true
    }
}

/// Delay between availability checks while a store is down.
pub const DEFAULT_RECOVERY_POLL_INTERVAL: Duration = Duration::from_millis(500);

impl<P: PersistentDataStore + 'static> PersistentStoreWrapper<P> {
    /// Wraps a store, reporting availability through `status`.
    pub fn new(store: P, status: DataStoreStatusProvider) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                status,
                polling: AtomicBool::new(false),
            }),
            recovery: RetryConfig::unbounded()
                .with_initial_delay(DEFAULT_RECOVERY_POLL_INTERVAL)
                .with_max_delay(DEFAULT_RECOVERY_POLL_INTERVAL)
                .with_jitter(false),
            initialized: AtomicBool::new(false),
        }
    }

    /// Sets the delays between availability checks during an outage.
    ///
    /// A bounded policy stops polling once its attempts are used up; the
    /// next failed operation starts a new round.
    pub fn with_recovery_poll(mut self, recovery: RetryConfig) -> Self {
        self.recovery = recovery;
        self
    }

    /// The wrapped store.
    pub fn inner(&self) -> &P {
        &self.shared.store
    }

    /// The status provider this wrapper reports to.
    pub fn status_provider(&self) -> &DataStoreStatusProvider {
        &self.shared.status
    }

    /// Returns true while the background availability poller is running.
    pub fn is_polling_availability(&self) -> bool {
        self.shared.polling.load(Ordering::SeqCst)
    }

    /// Checks the store once and records the result.
    pub fn check_availability(&self) -> bool {
        if self.shared.recover() {
            true
        } else {
            self.mark_unavailable();
            false
        }
    }

    /// Checks every `interval` until the store is available.
    pub async fn poll_availability(&self, interval: Duration) {
        while !self.check_availability() {
            tokio::time::sleep(interval).await;
        }
    }

    fn mark_unavailable(&self) {
        let status = &self.shared.status;
        let current = status.status();
        if current.available {
            warn!("persistent store is unavailable");
            status.update(DataStoreStatus {
                available: false,
                refresh_needed: current.refresh_needed,
            });
        }
        self.start_polling();
    }

    fn start_polling(&self) {
        if self.shared.polling.swap(true, Ordering::SeqCst) {
            return;
        }
        let shared = Arc::downgrade(&self.shared);
        let recovery = self.recovery.clone();
        let spawned = thread::Builder::new()
            .name("flagsync-store-recovery".into())
            .spawn(move || poll_until_available(shared, recovery));
        if let Err(err) = spawned {
            warn!(error = %err, "could not start availability polling");
            self.shared.polling.store(false, Ordering::SeqCst);
        }
    }

    fn observe<T>(&self, result: StoreResult<T>) -> StoreResult<T> {
        if result.is_err() {
            self.mark_unavailable();
        }
        result
    }

    fn serialize_all(
        data: &[(DataKind, KeyedItems<ItemDescriptor>)],
    ) -> StoreResult<Vec<(DataKind, KeyedItems<SerializedItemDescriptor>)>> {
        data.iter()
            .map(|(kind, items)| {
                let items = items
                    .iter()
                    .map(|(key, item)| Ok((key.clone(), SerializedItemDescriptor::from_item(item)?)))
                    .collect::<StoreResult<Vec<_>>>()?;
                Ok((*kind, items))
            })
            .collect()
    }

    fn init_serialized(&self, data: FullDataSet<SerializedItemDescriptor>) -> StoreResult<()> {
        self.observe(self.shared.store.init(data))?;
        self.initialized.store(true, Ordering::SeqCst);

        let status = self.shared.status.status();
        if status.refresh_needed {
            // A full write brings the store back in sync.
            self.shared.status.update(DataStoreStatus {
                available: status.available,
                refresh_needed: false,
            });
        }
        Ok(())
    }
}

/// Body of the recovery thread. Exits once the store answers, the policy
/// runs out of attempts or the wrapper is dropped.
fn poll_until_available<P: PersistentDataStore>(shared: Weak<Shared<P>>, recovery: RetryConfig) {
    let mut attempts = 0;
    while recovery.allows_attempt(attempts) {
        attempts += 1;
        thread::sleep(recovery.delay_for_attempt(attempts));
        let Some(shared) = shared.upgrade() else {
            return;
        };
        if shared.recover() {
            debug!(attempts, "availability polling finished");
            shared.polling.store(false, Ordering::SeqCst);
            // A failure between the check and the flag reset found the
            // flag still set; keep polling on its behalf.
            if shared.status.status().available || shared.polling.swap(true, Ordering::SeqCst) {
                return;
            }
        }
    }
    if let Some(shared) = shared.upgrade() {
        warn!(attempts, "persistent store still unavailable; polling stopped");
        shared.polling.store(false, Ordering::SeqCst);
    }
}

impl<P: PersistentDataStore + 'static> DataStore for PersistentStoreWrapper<P> {
    fn init(&self, data: FullDataSet<ItemDescriptor>) -> StoreResult<()> {
        let serialized = Self::serialize_all(&data.data)?;
        self.init_serialized(FullDataSet {
            data: serialized,
            should_persist: data.should_persist,
        })
    }

    fn get(&self, kind: DataKind, key: &str) -> StoreResult<Option<ItemDescriptor>> {
        self.observe(self.shared.store.get(kind, key))?
            .map(|item| item.to_item())
            .transpose()
    }

    fn get_all(&self, kind: DataKind) -> StoreResult<KeyedItems<ItemDescriptor>> {
        self.observe(self.shared.store.get_all(kind))?
            .into_iter()
            .map(|(key, item)| Ok((key, item.to_item()?)))
            .collect()
    }

    fn upsert(&self, kind: DataKind, key: &str, item: ItemDescriptor) -> StoreResult<bool> {
        let serialized = SerializedItemDescriptor::from_item(&item)?;
        self.observe(self.shared.store.upsert(kind, key, serialized))
    }

    fn apply(&self, changeset: &StoreChangeSet) -> StoreResult<()> {
        match changeset.change_type {
            ChangeSetType::Full => self.init_serialized(FullDataSet {
                data: Self::serialize_all(&changeset.data)?,
                should_persist: changeset.should_persist,
            }),
            ChangeSetType::Partial => {
                for (kind, items) in &changeset.data {
                    for (key, item) in items {
                        // A stale write is not a failure; a newer version is already stored.
                        self.upsert(*kind, key, item.clone())?;
                    }
                }
                Ok(())
            }
            ChangeSetType::None => Ok(()),
        }
    }

    fn selector(&self) -> Selector {
        Selector::EMPTY
    }

    fn is_initialized(&self) -> bool {
        if self.initialized.load(Ordering::SeqCst) {
            return true;
        }
        let initialized = self.shared.store.is_initialized();
        if initialized {
            self.initialized.store(true, Ordering::SeqCst);
        }
        initialized
    }

    fn is_status_monitoring_enabled(&self) -> bool {
        self.shared.status.is_status_monitoring_enabled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cas::CasDataStore;
    use crate::memory::MemoryCasBackend;
    use serde_json::json;
    use std::sync::Arc;

    type Wrapper = PersistentStoreWrapper<CasDataStore<Arc<MemoryCasBackend>>>;

    fn setup() -> (Arc<MemoryCasBackend>, Wrapper) {
        let backend = Arc::new(MemoryCasBackend::new());
        let wrapper = PersistentStoreWrapper::new(
            CasDataStore::new(Arc::clone(&backend)),
            DataStoreStatusProvider::new(),
        );
        (backend, wrapper)
    }

    fn item(version: i64) -> ItemDescriptor {
        ItemDescriptor::new(version, json!({"key": "k", "version": version}))
    }

    fn changeset(change_type: ChangeSetType, data: Vec<(DataKind, KeyedItems<ItemDescriptor>)>) -> StoreChangeSet {
        StoreChangeSet {
            change_type,
            selector: Selector::from_payload(1, "s"),
            data,
            environment_id: None,
            should_persist: true,
        }
    }

    #[test]
    fn items_round_trip_through_serialization() {
        let (_backend, wrapper) = setup();
        assert!(wrapper.upsert(DataKind::Features, "k", item(2)).unwrap());
        assert_eq!(wrapper.get(DataKind::Features, "k").unwrap(), Some(item(2)));

        assert!(wrapper
            .upsert(DataKind::Features, "k", ItemDescriptor::deleted(3))
            .unwrap());
        assert_eq!(
            wrapper.get(DataKind::Features, "k").unwrap(),
            Some(ItemDescriptor::deleted(3))
        );
        assert!(!wrapper.upsert(DataKind::Features, "k", item(3)).unwrap());
    }

    #[test]
    fn full_apply_initializes() {
        let (_backend, wrapper) = setup();
        assert!(!wrapper.is_initialized());
        wrapper
            .apply(&changeset(
                ChangeSetType::Full,
                vec![(DataKind::Features, vec![("k".into(), item(1))])],
            ))
            .unwrap();
        assert!(wrapper.is_initialized());
        assert_eq!(wrapper.get_all(DataKind::Features).unwrap().len(), 1);
        // Persistent stores do not track selectors.
        assert!(wrapper.selector().is_empty());
    }

    #[test]
    fn partial_apply_ignores_stale_items() {
        let (_backend, wrapper) = setup();
        wrapper.upsert(DataKind::Features, "k", item(5)).unwrap();
        wrapper
            .apply(&changeset(
                ChangeSetType::Partial,
                vec![(
                    DataKind::Features,
                    vec![("k".into(), item(4)), ("j".into(), item(1))],
                )],
            ))
            .unwrap();
        assert_eq!(wrapper.get(DataKind::Features, "k").unwrap().unwrap().version, 5);
        assert!(wrapper.get(DataKind::Features, "j").unwrap().is_some());
    }

    #[test]
    fn outage_and_recovery_update_status() {
        let (backend, wrapper) = setup();
        let provider = wrapper.status_provider().clone();
        assert!(wrapper.is_status_monitoring_enabled());

        backend.set_available(false);
        assert!(wrapper.upsert(DataKind::Features, "k", item(1)).is_err());
        assert!(!provider.status().available);
        assert!(!wrapper.check_availability());

        backend.set_available(true);
        assert!(wrapper.check_availability());
        assert_eq!(
            provider.status(),
            DataStoreStatus {
                available: true,
                refresh_needed: true,
            }
        );

        wrapper
            .init(FullDataSet::new(vec![(DataKind::Features, vec![])]))
            .unwrap();
        assert_eq!(provider.status(), DataStoreStatus::default());
    }

    fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = std::time::Instant::now();
        while start.elapsed() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        done()
    }

    #[test]
    fn outage_recovers_in_the_background() {
        let (backend, wrapper) = setup();
        let wrapper = wrapper.with_recovery_poll(
            RetryConfig::unbounded()
                .with_initial_delay(Duration::from_millis(2))
                .with_max_delay(Duration::from_millis(2))
                .with_jitter(false),
        );
        let provider = wrapper.status_provider().clone();

        backend.set_available(false);
        assert!(wrapper.get(DataKind::Features, "k").is_err());
        assert!(wrapper.is_polling_availability());
        thread::sleep(Duration::from_millis(20));
        assert!(!provider.status().available);

        backend.set_available(true);
        assert!(wait_until(Duration::from_secs(5), || provider.status().available));
        assert_eq!(
            provider.status(),
            DataStoreStatus {
                available: true,
                refresh_needed: true,
            }
        );
        assert!(wait_until(Duration::from_secs(5), || !wrapper.is_polling_availability()));
    }

    #[test]
    fn bounded_recovery_poll_gives_up_and_restarts() {
        let (backend, wrapper) = setup();
        let wrapper = wrapper.with_recovery_poll(
            RetryConfig::new(2)
                .with_initial_delay(Duration::from_millis(50))
                .with_max_delay(Duration::from_millis(50))
                .with_jitter(false),
        );

        backend.set_available(false);
        assert!(wrapper.upsert(DataKind::Features, "k", item(1)).is_err());
        assert!(wait_until(Duration::from_secs(5), || !wrapper.is_polling_availability()));
        assert!(!wrapper.status_provider().status().available);

        assert!(wrapper.upsert(DataKind::Features, "k", item(1)).is_err());
        backend.set_available(true);
        assert!(wait_until(Duration::from_secs(5), || {
            wrapper.status_provider().status().refresh_needed
        }));
    }

    #[tokio::test]
    async fn poll_returns_once_available() {
        let (backend, wrapper) = setup();
        backend.set_available(false);
        assert!(!wrapper.check_availability());

        let restore = {
            let backend = Arc::clone(&backend);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                backend.set_available(true);
            })
        };
        tokio::time::timeout(
            Duration::from_secs(5),
            wrapper.poll_availability(Duration::from_millis(5)),
        )
        .await
        .unwrap();
        restore.await.unwrap();
        assert!(wrapper.status_provider().status().refresh_needed);
    }
}

//! Configuration for the data system.

use flagsync_store::{
    CasBackend, CasDataStore, DataStore, DataStoreMode, DataStoreStatusProvider,
    PersistentStoreWrapper, RetryConfig, WriteThroughStore, DEFAULT_RECOVERY_POLL_INTERVAL,
};
use std::sync::Arc;
use std::time::Duration;

/// Configuration for the synchronizer and the stores it feeds.
#[derive(Debug, Clone)]
pub struct DataSystemConfig {
    /// How a configured persistent store may be used.
    pub persistence_mode: DataStoreMode,
    /// Retry policy for the persistent store's compare-and-swap loop.
    pub store_retry: RetryConfig,
    /// Delays between availability checks while the persistent store is
    /// down.
    pub store_recovery: RetryConfig,
    /// Backoff between stream reconnects.
    pub reconnect: RetryConfig,
    /// How long callers should wait for the first payload.
    pub initial_wait: Duration,
    /// Environment the data belongs to, if known.
    pub environment_id: Option<String>,
    /// Whether received data should be written to persistence.
    pub should_persist: bool,
}

impl DataSystemConfig {
    /// Creates a configuration with default settings.
    pub fn new() -> Self {
        Self {
            persistence_mode: DataStoreMode::default(),
            store_retry: RetryConfig::default(),
            store_recovery: RetryConfig::unbounded()
                .with_initial_delay(DEFAULT_RECOVERY_POLL_INTERVAL)
                .with_max_delay(DEFAULT_RECOVERY_POLL_INTERVAL)
                .with_jitter(false),
            reconnect: RetryConfig::unbounded()
                .with_initial_delay(Duration::from_secs(1))
                .with_max_delay(Duration::from_secs(30)),
            initial_wait: Duration::from_secs(5),
            environment_id: None,
            should_persist: true,
        }
    }

    /// Sets the persistence mode.
    pub fn with_persistence_mode(mut self, mode: DataStoreMode) -> Self {
        self.persistence_mode = mode;
        self
    }

    /// Sets the store retry policy.
    pub fn with_store_retry(mut self, retry: RetryConfig) -> Self {
        self.store_retry = retry;
        self
    }

    /// Sets the availability check delays used during a store outage.
    pub fn with_store_recovery(mut self, recovery: RetryConfig) -> Self {
        self.store_recovery = recovery;
        self
    }

    /// Sets the reconnect backoff.
    pub fn with_reconnect(mut self, reconnect: RetryConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Sets the initial wait.
    pub fn with_initial_wait(mut self, wait: Duration) -> Self {
        self.initial_wait = wait;
        self
    }

    /// Sets the environment ID.
    pub fn with_environment_id(mut self, environment_id: impl Into<String>) -> Self {
        self.environment_id = Some(environment_id.into());
        self
    }

    /// Sets whether received data is persisted.
    pub fn with_should_persist(mut self, should_persist: bool) -> Self {
        self.should_persist = should_persist;
        self
    }
}

impl DataSystemConfig {
    /// Builds the store stack for this configuration.
    ///
    /// With a backend, the in-memory store writes through to a
    /// compare-and-swap store over it, using [`Self::store_retry`] and
    /// [`Self::persistence_mode`]. An outage is checked in the background
    /// with [`Self::store_recovery`] until the store answers again. Without
    /// a backend, the stack is memory only and its status never changes.
    pub fn build_stores<B: CasBackend + 'static>(&self, backend: Option<B>) -> StoreStack<B> {
        match backend {
            Some(backend) => {
                let status = DataStoreStatusProvider::new();
                let persistent = Arc::new(
                    PersistentStoreWrapper::new(
                        CasDataStore::with_retry(backend, self.store_retry.clone()),
                        status.clone(),
                    )
                    .with_recovery_poll(self.store_recovery.clone()),
                );
                let store = WriteThroughStore::with_persistence(
                    Arc::clone(&persistent) as Arc<dyn DataStore>,
                    status.clone(),
                    self.persistence_mode,
                );
                StoreStack {
                    store: Arc::new(store),
                    persistent: Some(persistent),
                    status,
                }
            }
            None => StoreStack {
                store: Arc::new(WriteThroughStore::memory_only()),
                persistent: None,
                status: DataStoreStatusProvider::unmonitored(),
            },
        }
    }
}

/// The stores built by [`DataSystemConfig::build_stores`].
pub struct StoreStack<B> {
    /// The store the synchronizer writes to.
    pub store: Arc<WriteThroughStore>,
    /// The persistent store, if one was configured.
    pub persistent: Option<Arc<PersistentStoreWrapper<CasDataStore<B>>>>,
    /// Status of the persistent store.
    pub status: DataStoreStatusProvider,
}

impl Default for DataSystemConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flagsync_store::MemoryCasBackend;

    #[test]
    fn defaults() {
        let config = DataSystemConfig::default();
        assert_eq!(config.persistence_mode, DataStoreMode::ReadWrite);
        assert_eq!(config.store_retry.max_attempts, Some(10));
        assert_eq!(config.store_recovery.max_attempts, None);
        assert_eq!(
            config.store_recovery.delay_for_attempt(3),
            DEFAULT_RECOVERY_POLL_INTERVAL
        );
        assert_eq!(config.reconnect.max_attempts, None);
        assert_eq!(config.reconnect.initial_delay, Duration::from_secs(1));
        assert!(config.should_persist);
        assert!(config.environment_id.is_none());
    }

    #[test]
    fn builder() {
        let config = DataSystemConfig::new()
            .with_persistence_mode(DataStoreMode::ReadOnly)
            .with_store_retry(RetryConfig::unbounded())
            .with_store_recovery(RetryConfig::new(5))
            .with_reconnect(RetryConfig::new(3))
            .with_initial_wait(Duration::from_millis(250))
            .with_environment_id("env-1")
            .with_should_persist(false);

        assert_eq!(config.persistence_mode, DataStoreMode::ReadOnly);
        assert_eq!(config.store_retry.max_attempts, None);
        assert_eq!(config.store_recovery.max_attempts, Some(5));
        assert_eq!(config.reconnect.max_attempts, Some(3));
        assert_eq!(config.initial_wait, Duration::from_millis(250));
        assert_eq!(config.environment_id.as_deref(), Some("env-1"));
        assert!(!config.should_persist);
    }

    #[test]
    fn memory_only_stack() {
        let stack = DataSystemConfig::new().build_stores::<MemoryCasBackend>(None);
        assert!(stack.persistent.is_none());
        assert!(!stack.status.is_status_monitoring_enabled());
        assert!(stack.store.reads_from_memory());
    }

    #[test]
    fn persistent_stack_shares_status() {
        let backend = Arc::new(MemoryCasBackend::new());
        let stack = DataSystemConfig::new()
            .with_store_retry(RetryConfig::new(3))
            .build_stores(Some(Arc::clone(&backend)));

        let persistent = stack.persistent.as_ref().unwrap();
        assert_eq!(persistent.inner().retry_config().max_attempts, Some(3));
        assert!(stack.store.is_status_monitoring_enabled());

        backend.set_available(false);
        assert!(!persistent.check_availability());
        assert!(!stack.status.status().available);
        assert!(persistent.is_polling_availability());
    }
}

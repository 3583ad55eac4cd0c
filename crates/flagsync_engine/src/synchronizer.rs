//! The streaming synchronizer.

use crate::config::DataSystemConfig;
use crate::error::SyncError;
use crate::sink::DataSourceUpdates;
use crate::source::EventSource;
use crate::status::{DataSourceState, ErrorInfo, ErrorKind};
use crate::translator::ChangeSetTranslator;
use flagsync_protocol::{Action, ProtocolHandler, Selector};
use flagsync_store::DataStoreStatus;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Longest single sleep while waiting to reconnect, so cancellation is
/// noticed promptly.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Statistics about a synchronizer.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Connections successfully opened.
    pub connections: u64,
    /// Events read from the source.
    pub events_received: u64,
    /// Changesets the store accepted.
    pub changesets_applied: u64,
    /// Changesets the store rejected.
    pub changesets_failed: u64,
    /// Reconnect attempts after the first connection.
    pub reconnects: u64,
    /// Last payload received.
    pub last_payload_time: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// How one connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionEnd {
    /// Open a new connection.
    Reconnect,
    /// Stop for good.
    Stop,
}

/// Drives the protocol over an [`EventSource`] and feeds the results to
/// a [`DataSourceUpdates`] sink.
///
/// Each connection starts from a freshly reset [`ProtocolHandler`], so a
/// partial payload from a torn-down connection is never surfaced. The
/// loop runs until the source is closed by its owner, [`Self::cancel`] is
/// called, or an unrecoverable error turns the data source off.
pub struct StreamingSynchronizer<S: EventSource> {
    config: DataSystemConfig,
    source: Mutex<S>,
    updates: Arc<DataSourceUpdates>,
    stats: RwLock<SyncStats>,
    cancelled: AtomicBool,
}

impl<S: EventSource> StreamingSynchronizer<S> {
    /// Creates a synchronizer reading from `source`.
    pub fn new(config: DataSystemConfig, source: S, updates: Arc<DataSourceUpdates>) -> Self {
        Self {
            config,
            source: Mutex::new(source),
            updates,
            stats: RwLock::new(SyncStats::default()),
            cancelled: AtomicBool::new(false),
        }
    }

    /// The sink this synchronizer feeds.
    pub fn updates(&self) -> &Arc<DataSourceUpdates> {
        &self.updates
    }

    /// Gets the current stats.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Asks the loop to stop.
    ///
    /// Takes effect between events; a source blocked waiting for an event
    /// must be closed by its owner.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Returns true once [`Self::cancel`] was called.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Blocks until the first payload was applied, the data source turned
    /// off, or the configured initial wait elapsed.
    pub fn wait_for_initialization(&self) -> bool {
        self.updates
            .wait_for(DataSourceState::Valid, self.config.initial_wait)
    }

    /// Runs the connection loop on the calling thread until it stops.
    pub fn run(&self) {
        let mut source = self.source.lock();
        let mut handler = ProtocolHandler::new();
        let mut store_status = self.updates.data_store_status_provider().subscribe();
        let mut failures: u32 = 0;

        info!("starting streaming synchronizer");
        while !self.is_cancelled() {
            if failures > 0 {
                if !self.config.reconnect.allows_attempt(failures) {
                    error!(attempts = failures, "giving up on the stream after repeated failures");
                    self.updates.update_status(DataSourceState::Off, None);
                    break;
                }
                let delay = self.config.reconnect.delay_for_attempt(failures);
                debug!(delay_ms = delay.as_millis() as u64, attempt = failures, "waiting to reconnect");
                if !self.sleep_unless_cancelled(delay) {
                    break;
                }
                self.stats.write().reconnects += 1;
            }

            let selector = self.basis_selector(&mut store_status);
            handler.reset();
            debug!(
                selector_version = selector.version(),
                full_transfer = selector.is_empty(),
                "connecting"
            );

            if let Err(e) = source.connect(&selector) {
                if self.handle_transport_error(e) == ConnectionEnd::Stop {
                    break;
                }
                failures += 1;
                continue;
            }
            self.stats.write().connections += 1;

            let (end, applied) = self.consume(&mut *source, &mut handler, &mut store_status);
            source.close();
            if end == ConnectionEnd::Stop {
                break;
            }
            failures = if applied { 1 } else { failures + 1 };
        }
        info!("streaming synchronizer stopped");
    }

    /// Runs [`Self::run`] on tokio's blocking pool.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()>
    where
        S: 'static,
    {
        tokio::task::spawn_blocking(move || self.run())
    }

    /// The selector to resume from.
    ///
    /// After a store outage the store may have missed updates, so a full
    /// transfer is requested instead.
    fn basis_selector(&self, store_status: &mut watch::Receiver<DataStoreStatus>) -> Selector {
        if store_status.borrow_and_update().refresh_needed {
            info!("data store needs a refresh; requesting a full transfer");
            return Selector::EMPTY;
        }
        self.updates.selector()
    }

    /// Reads events until the connection ends.
    ///
    /// Returns how it ended and whether any changeset was applied.
    fn consume(
        &self,
        source: &mut S,
        handler: &mut ProtocolHandler,
        store_status: &mut watch::Receiver<DataStoreStatus>,
    ) -> (ConnectionEnd, bool) {
        let mut applied = false;
        loop {
            if self.is_cancelled() {
                return (ConnectionEnd::Stop, applied);
            }
            if store_status.has_changed().unwrap_or(false) {
                let status = *store_status.borrow_and_update();
                if status.available && status.refresh_needed {
                    info!("data store recovered; restarting the stream");
                    return (ConnectionEnd::Reconnect, applied);
                }
            }

            let raw = match source.next_event() {
                Ok(Some(raw)) => raw,
                Ok(None) => {
                    warn!("stream closed by the server");
                    self.record_error("stream closed by the server");
                    self.updates.update_status(
                        DataSourceState::Interrupted,
                        Some(ErrorInfo::new(ErrorKind::NetworkError, "stream closed by the server")),
                    );
                    return (ConnectionEnd::Reconnect, applied);
                }
                Err(e) => return (self.handle_transport_error(e), applied),
            };
            self.stats.write().events_received += 1;

            match handler.handle_raw(&raw) {
                Action::None => {}
                Action::ChangeSet(changeset) => {
                    let changeset = ChangeSetTranslator::to_store_changeset(
                        &changeset,
                        self.config.environment_id.as_deref(),
                        self.config.should_persist,
                    );
                    let accepted = self.updates.apply(&changeset);
                    let mut stats = self.stats.write();
                    if accepted {
                        stats.changesets_applied += 1;
                        stats.last_payload_time = Some(Instant::now());
                        applied = true;
                    } else {
                        stats.changesets_failed += 1;
                    }
                }
                Action::Error { id, reason } => {
                    // The handler already discarded the payload; stay connected.
                    error!(payload_id = ?id, reason = %reason, "server reported an error for the payload");
                    self.record_error(&reason);
                }
                Action::Goodbye { reason } => {
                    info!(reason = ?reason, "server said goodbye; reconnecting");
                    return (ConnectionEnd::Reconnect, applied);
                }
                Action::InternalError { message, kind } => {
                    let error_kind = if kind.is_invalid_data() {
                        ErrorKind::InvalidData
                    } else {
                        ErrorKind::Unknown
                    };
                    warn!(kind = ?kind, error = %message, "internal error during event processing; reconnecting");
                    self.record_error(&message);
                    self.updates.update_status(
                        DataSourceState::Interrupted,
                        Some(ErrorInfo::new(error_kind, "Internal error during FDv2 event processing")),
                    );
                    return (ConnectionEnd::Reconnect, applied);
                }
            }
        }
    }

    /// Reports a transport failure and decides whether to reconnect.
    fn handle_transport_error(&self, error: SyncError) -> ConnectionEnd {
        if matches!(error, SyncError::Cancelled) {
            debug!("event source closed by its owner");
            return ConnectionEnd::Stop;
        }

        self.record_error(&error.to_string());
        let info = ErrorInfo::from_sync_error(&error);
        if error.is_retryable() {
            warn!(error = %error, "stream error, will retry");
            self.updates
                .update_status(DataSourceState::Interrupted, Some(info));
            ConnectionEnd::Reconnect
        } else {
            error!(error = %error, "stream error, giving up permanently");
            self.updates.update_status(DataSourceState::Off, Some(info));
            ConnectionEnd::Stop
        }
    }

    fn record_error(&self, message: &str) {
        self.stats.write().last_error = Some(message.to_string());
    }

    /// Sleeps for `delay`, waking early if cancelled.
    ///
    /// Returns false if cancelled.
    fn sleep_unless_cancelled(&self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(CANCEL_POLL_INTERVAL));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{ScriptedEventSource, ScriptedItem};
    use flagsync_protocol::RawEvent;
    use flagsync_store::{
        DataKind, DataStore, DataStoreStatusProvider, InMemoryDataStore, RetryConfig,
    };
    use serde_json::json;

    fn config() -> DataSystemConfig {
        DataSystemConfig::new().with_reconnect(
            RetryConfig::unbounded()
                .with_initial_delay(Duration::from_millis(1))
                .with_max_delay(Duration::from_millis(5))
                .with_jitter(false),
        )
    }

    fn full_transfer(state: &str, version: i64, flags: &[(&str, i64)]) -> Vec<RawEvent> {
        let mut events = vec![RawEvent::new(
            "server-intent",
            json!({"payloads": [{"id": "p", "target": version, "intentCode": "xfer-full"}]}),
        )];
        for (key, flag_version) in flags {
            events.push(RawEvent::new(
                "put-object",
                json!({"kind": "flag", "key": key, "version": flag_version, "object": {"key": key}}),
            ));
        }
        events.push(RawEvent::new(
            "payload-transferred",
            json!({"state": state, "version": version}),
        ));
        events
    }

    fn setup(
        source: ScriptedEventSource,
    ) -> (Arc<InMemoryDataStore>, StreamingSynchronizer<ScriptedEventSource>) {
        let store = Arc::new(InMemoryDataStore::new());
        let updates = Arc::new(DataSourceUpdates::new(
            Arc::clone(&store) as Arc<dyn DataStore>,
            DataStoreStatusProvider::unmonitored(),
        ));
        (store, StreamingSynchronizer::new(config(), source, updates))
    }

    #[test]
    fn applies_full_transfer() {
        let source = ScriptedEventSource::new().with_connection(full_transfer("s1", 1, &[("f1", 3)]));
        let log = source.selector_log();
        let (store, sync) = setup(source);

        sync.run();

        assert_eq!(store.get(DataKind::Features, "f1").unwrap().unwrap().version, 3);
        assert_eq!(store.selector(), Selector::from_payload(1, "s1"));
        assert_eq!(sync.updates().status().state, DataSourceState::Valid);
        assert_eq!(*log.lock(), vec![Selector::EMPTY]);

        let stats = sync.stats();
        assert_eq!(stats.connections, 1);
        assert_eq!(stats.events_received, 3);
        assert_eq!(stats.changesets_applied, 1);
        assert!(stats.last_payload_time.is_some());
    }

    #[test]
    fn goodbye_reconnects_with_current_selector() {
        let mut first = full_transfer("s1", 1, &[("f1", 1)]);
        first.push(RawEvent::new("goodbye", json!({"reason": "maintenance"})));
        let source = ScriptedEventSource::new()
            .with_connection(first)
            .with_connection(vec![RawEvent::new(
                "server-intent",
                json!({"payloads": [{"id": "p", "target": 1, "intentCode": "none"}]}),
            )]);
        let log = source.selector_log();
        let (_store, sync) = setup(source);

        sync.run();

        assert_eq!(*log.lock(), vec![Selector::EMPTY, Selector::from_payload(1, "s1")]);
        assert_eq!(sync.stats().connections, 2);
        assert_eq!(sync.updates().status().state, DataSourceState::Valid);
    }

    #[test]
    fn partial_payload_is_dropped_on_disconnect() {
        let source = ScriptedEventSource::new()
            .with_items(vec![
                ScriptedItem::Event(RawEvent::new(
                    "server-intent",
                    json!({"payloads": [{"id": "p", "target": 1, "intentCode": "xfer-full"}]}),
                )),
                ScriptedItem::Event(RawEvent::new(
                    "put-object",
                    json!({"kind": "flag", "key": "lost", "version": 1, "object": {}}),
                )),
                ScriptedItem::Fail {
                    message: "connection reset".into(),
                    retryable: true,
                },
            ])
            .with_connection(vec![RawEvent::new(
                "payload-transferred",
                json!({"state": "s", "version": 1}),
            )]);
        let (store, sync) = setup(source);

        sync.run();

        assert_eq!(store.get(DataKind::Features, "lost").unwrap(), None);
        assert!(!store.is_initialized());
        let status = sync.updates().status();
        assert_eq!(status.state, DataSourceState::Initializing);
        assert_eq!(status.last_error.unwrap().kind, ErrorKind::Unknown);
    }

    #[test]
    fn malformed_event_interrupts_with_invalid_data() {
        let mut events = full_transfer("s1", 1, &[("f1", 1)]);
        events.push(RawEvent::new("put-object", json!({"kind": "flag"})));
        let source = ScriptedEventSource::new()
            .with_connection(events)
            .with_connection(vec![]);
        let (_store, sync) = setup(source);

        sync.run();

        let status = sync.updates().status();
        assert_eq!(status.state, DataSourceState::Interrupted);
        assert_eq!(status.last_error.unwrap().kind, ErrorKind::InvalidData);
        assert_eq!(sync.stats().connections, 2);
    }

    #[test]
    fn server_error_event_keeps_connection() {
        let mut events = vec![
            RawEvent::new(
                "server-intent",
                json!({"payloads": [{"id": "p", "target": 1, "intentCode": "xfer-full"}]}),
            ),
            RawEvent::new(
                "put-object",
                json!({"kind": "flag", "key": "discarded", "version": 1, "object": {}}),
            ),
            RawEvent::new("error", json!({"id": "p", "reason": "bad payload"})),
        ];
        events.extend(full_transfer("s2", 2, &[("kept", 1)]).into_iter().skip(1));
        let source = ScriptedEventSource::new().with_connection(events);
        let (store, sync) = setup(source);

        sync.run();

        assert_eq!(sync.stats().connections, 1);
        assert_eq!(store.get(DataKind::Features, "discarded").unwrap(), None);
        assert!(store.get(DataKind::Features, "kept").unwrap().is_some());
        assert_eq!(sync.stats().last_error.as_deref(), Some("bad payload"));
    }

    #[test]
    fn unrecoverable_status_turns_off() {
        let source = ScriptedEventSource::new()
            .with_error_status(503)
            .with_error_status(401)
            .with_connection(full_transfer("s1", 1, &[]));
        let log = source.selector_log();
        let (_store, sync) = setup(source);

        sync.run();

        let status = sync.updates().status();
        assert_eq!(status.state, DataSourceState::Off);
        assert_eq!(status.last_error.unwrap().status_code, Some(401));
        assert_eq!(log.lock().len(), 2);
        assert_eq!(sync.stats().reconnects, 1);
    }

    #[test]
    fn bounded_reconnects_give_up() {
        let source = ScriptedEventSource::new()
            .with_refused_connection("refused", true)
            .with_refused_connection("refused", true)
            .with_refused_connection("refused", true);
        let store = Arc::new(InMemoryDataStore::new());
        let updates = Arc::new(DataSourceUpdates::new(
            store,
            DataStoreStatusProvider::unmonitored(),
        ));
        let config = config()
            .with_reconnect(RetryConfig::new(2).with_initial_delay(Duration::from_millis(1)));
        let sync = StreamingSynchronizer::new(config, source, updates);

        sync.run();

        assert_eq!(sync.updates().status().state, DataSourceState::Off);
        assert_eq!(sync.stats().connections, 0);
        assert_eq!(sync.stats().reconnects, 1);
    }

    #[test]
    fn cancel_stops_before_connecting() {
        let source = ScriptedEventSource::new().with_connection(full_transfer("s1", 1, &[]));
        let log = source.selector_log();
        let (_store, sync) = setup(source);

        sync.cancel();
        sync.run();

        assert!(log.lock().is_empty());
        assert_eq!(sync.updates().status().state, DataSourceState::Initializing);
    }

    #[tokio::test]
    async fn spawned_synchronizer_initializes() {
        let source = ScriptedEventSource::new().with_connection(full_transfer("s1", 1, &[("f1", 1)]));
        let (store, sync) = setup(source);
        let sync = Arc::new(sync);

        let handle = Arc::clone(&sync).spawn();
        handle.await.unwrap();

        assert!(sync.wait_for_initialization());
        assert!(store.is_initialized());
    }
}

//! Event source abstraction for the streaming synchronizer.

use crate::error::{SyncError, SyncResult};
use flagsync_protocol::{RawEvent, Selector};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// A stream of protocol events from the service.
///
/// This trait abstracts the transport, allowing for different
/// implementations (server-sent events, polling, a script for testing).
/// Decoding bytes into [`RawEvent`]s, heartbeats and stale-connection
/// detection belong to the implementation.
pub trait EventSource: Send {
    /// Opens a stream, resuming from `selector` unless it is empty.
    fn connect(&mut self, selector: &Selector) -> SyncResult<()>;

    /// Waits for the next event.
    ///
    /// Returns `Ok(None)` when the server closed the stream.
    /// [`SyncError::Cancelled`] means the source was closed by its owner
    /// and must not be reconnected.
    fn next_event(&mut self) -> SyncResult<Option<RawEvent>>;

    /// Closes the current stream.
    fn close(&mut self);
}

/// One step of a scripted connection.
#[derive(Debug, Clone)]
pub enum ScriptedItem {
    /// An event delivered to the reader.
    Event(RawEvent),
    /// A transport failure that ends the connection.
    Fail {
        /// Error message.
        message: String,
        /// Whether the failure can be retried.
        retryable: bool,
    },
    /// An HTTP error status that ends the connection.
    Status(u16),
}

#[derive(Debug, Clone)]
enum ScriptedConnection {
    Accept(Vec<ScriptedItem>),
    Refuse(ScriptedItem),
}

/// The selectors an event source was connected with, shared with tests.
pub type SelectorLog = Arc<Mutex<Vec<Selector>>>;

/// An event source that replays scripted connections.
///
/// Each call to [`EventSource::connect`] consumes the next scripted
/// connection. A connection that runs out of items is closed by the
/// "server", except for the last one, which reports
/// [`SyncError::Cancelled`] so the reader stops.
#[derive(Debug, Default)]
pub struct ScriptedEventSource {
    connections: VecDeque<ScriptedConnection>,
    current: VecDeque<ScriptedItem>,
    connected: bool,
    selectors: SelectorLog,
    closes: usize,
}

impl ScriptedEventSource {
    /// Creates a source with no scripted connections.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a connection that delivers `events`.
    pub fn with_connection(self, events: Vec<RawEvent>) -> Self {
        self.with_items(events.into_iter().map(ScriptedItem::Event).collect())
    }

    /// Adds a connection that replays `items`.
    pub fn with_items(mut self, items: Vec<ScriptedItem>) -> Self {
        self.connections.push_back(ScriptedConnection::Accept(items));
        self
    }

    /// Adds a connection attempt that fails with a transport error.
    pub fn with_refused_connection(mut self, message: impl Into<String>, retryable: bool) -> Self {
        self.connections
            .push_back(ScriptedConnection::Refuse(ScriptedItem::Fail {
                message: message.into(),
                retryable,
            }));
        self
    }

    /// Adds a connection attempt answered with an HTTP error status.
    pub fn with_error_status(mut self, status: u16) -> Self {
        self.connections
            .push_back(ScriptedConnection::Refuse(ScriptedItem::Status(status)));
        self
    }

    /// A handle to the selectors passed to [`EventSource::connect`].
    pub fn selector_log(&self) -> SelectorLog {
        Arc::clone(&self.selectors)
    }

    /// How many times the source was closed.
    pub fn close_count(&self) -> usize {
        self.closes
    }

    fn failure(item: ScriptedItem) -> SyncError {
        match item {
            ScriptedItem::Fail {
                message,
                retryable: true,
            } => SyncError::transport_retryable(message),
            ScriptedItem::Fail { message, .. } => SyncError::transport_fatal(message),
            ScriptedItem::Status(status) => SyncError::ErrorResponse { status },
            ScriptedItem::Event(_) => SyncError::NotConnected,
        }
    }
}

impl EventSource for ScriptedEventSource {
    fn connect(&mut self, selector: &Selector) -> SyncResult<()> {
        self.selectors.lock().push(selector.clone());
        match self.connections.pop_front() {
            Some(ScriptedConnection::Accept(items)) => {
                self.current = items.into();
                self.connected = true;
                Ok(())
            }
            Some(ScriptedConnection::Refuse(item)) => Err(Self::failure(item)),
            None => Err(SyncError::Cancelled),
        }
    }

    fn next_event(&mut self) -> SyncResult<Option<RawEvent>> {
        if !self.connected {
            return Err(SyncError::NotConnected);
        }
        match self.current.pop_front() {
            Some(ScriptedItem::Event(event)) => Ok(Some(event)),
            Some(item) => {
                self.connected = false;
                Err(Self::failure(item))
            }
            None if self.connections.is_empty() => Err(SyncError::Cancelled),
            None => {
                self.connected = false;
                Ok(None)
            }
        }
    }

    fn close(&mut self) {
        self.connected = false;
        self.current.clear();
        self.closes += 1;
    }
}

//! Listener-style payload processor.
//!
//! [`PayloadProcessor`] accepts batches of raw events and reports whole
//! payloads to its listeners. It is a thin adapter over [`ProtocolHandler`]:
//! the state machine is the same, only the surface differs.
//!
//! Differences from driving the handler directly:
//!
//! - Calls to [`PayloadProcessor::process_events`] are serialized, so several
//!   producers may share one processor.
//! - An intent of `none` becomes an ordinary payload with no updates, unless
//!   it lacks an id or a target version, in which case it is ignored.
//! - Malformed events are reported to listeners and the batch continues.
//! - Objects that arrive before any intent are dropped silently.

use crate::change::{Change, ChangeSetType};
use crate::event::{event_types, Event, RawEvent};
use crate::handler::{Action, ProtocolHandler};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Category of error reported to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed data was received and could not be parsed.
    InvalidData,
    /// Any other problem, such as a server-side error event.
    Unknown,
}

/// One item update within a [`Payload`].
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    /// Item kind.
    pub kind: String,
    /// Item key.
    pub key: String,
    /// Item version.
    pub version: i64,
    /// Raw item JSON; absent for deletions.
    pub object: Option<Value>,
    /// True for deletions.
    pub deleted: bool,
}

impl From<Change> for Update {
    fn from(change: Change) -> Self {
        Self {
            deleted: change.is_delete(),
            kind: change.kind,
            key: change.key,
            version: change.version,
            object: change.object,
        }
    }
}

/// A complete payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    /// Payload identifier from the server intent.
    pub id: String,
    /// Payload version.
    pub version: i64,
    /// Opaque state identifier; absent when the intent was `none`.
    pub state: Option<String>,
    /// True if the payload is a full basis.
    pub basis: bool,
    /// Updates in arrival order.
    pub updates: Vec<Update>,
}

/// Receives payloads and errors from a [`PayloadProcessor`].
pub trait PayloadListener: Send + Sync {
    /// Called once per completed payload.
    fn on_payload(&self, payload: &Payload);

    /// Called when an event could not be processed.
    fn on_error(&self, kind: ErrorKind, message: &str);
}

#[derive(Debug, Clone)]
struct DeclaredPayload {
    id: String,
    target: i64,
}

#[derive(Debug, Default)]
struct ProcessorState {
    handler: ProtocolHandler,
    declared: Option<DeclaredPayload>,
}

impl ProcessorState {
    fn reset(&mut self) {
        self.handler.reset();
        self.declared = None;
    }
}

/// Turns batches of raw events into payloads for a fixed set of listeners.
pub struct PayloadProcessor {
    listeners: Vec<Arc<dyn PayloadListener>>,
    state: Mutex<ProcessorState>,
}

impl PayloadProcessor {
    /// Creates a processor that reports to the given listeners.
    pub fn new(listeners: Vec<Arc<dyn PayloadListener>>) -> Self {
        Self {
            listeners,
            state: Mutex::new(ProcessorState::default()),
        }
    }

    /// Processes a batch of events in order.
    ///
    /// Listeners are invoked on the calling thread while the processor lock
    /// is held.
    pub fn process_events(&self, events: &[RawEvent]) {
        let mut state = self.state.lock();
        for raw in events {
            self.process_one(&mut state, raw);
        }
    }

    fn process_one(&self, state: &mut ProcessorState, raw: &RawEvent) {
        let event = match Event::decode(raw) {
            Ok(event) => event,
            Err(e) => {
                self.report(ErrorKind::InvalidData, &format!("Failed to parse {}: {e}", raw.event));
                if raw.event == event_types::PAYLOAD_TRANSFERRED {
                    // The payload was terminated either way.
                    state.reset();
                }
                return;
            }
        };

        match &event {
            Event::PutObject(_) | Event::DeleteObject(_) if state.declared.is_none() => {
                trace!(event = event.event_type(), "ignoring object received before intent");
                return;
            }
            Event::PayloadTransferred(_) if state.declared.is_none() => {
                debug!("payload-transferred received before intent; resetting");
                state.reset();
                return;
            }
            Event::Unknown(name) => {
                trace!(event = %name, "skipping unrecognized event");
                return;
            }
            _ => {}
        }

        let mut pending = None;
        if let Event::ServerIntent(intent) = &event {
            state.declared = None;
            pending = intent.payloads.first().map(|p| DeclaredPayload {
                id: p.id.clone(),
                target: p.target,
            });
        }

        match state.handler.handle_event(event) {
            Action::None => {
                if let Some(declared) = pending {
                    state.declared = Some(declared);
                }
            }
            Action::ChangeSet(changeset) => {
                let (change_type, changes, selector) = changeset.into_parts();
                let payload = if change_type == ChangeSetType::None {
                    let Some(declared) = pending else {
                        return;
                    };
                    if declared.id.is_empty() || declared.target == 0 {
                        // No version to report; a selector at 0 would be meaningless.
                        debug!(id = %declared.id, "ignoring intent none without id or target");
                        return;
                    }
                    let payload = Payload {
                        id: declared.id.clone(),
                        version: declared.target,
                        state: None,
                        basis: false,
                        updates: Vec::new(),
                    };
                    state.declared = Some(declared);
                    payload
                } else {
                    let Some(declared) = state.declared.as_ref() else {
                        return;
                    };
                    Payload {
                        id: declared.id.clone(),
                        version: selector.version(),
                        state: Some(selector.state().to_string()),
                        basis: change_type == ChangeSetType::Full,
                        updates: changes.into_iter().map(Update::from).collect(),
                    }
                };
                debug!(
                    id = %payload.id,
                    version = payload.version,
                    basis = payload.basis,
                    updates = payload.updates.len(),
                    "payload complete"
                );
                for listener in &self.listeners {
                    listener.on_payload(&payload);
                }
            }
            Action::Error { id, reason } => {
                let id = id.as_deref().unwrap_or("<unknown>");
                self.report(
                    ErrorKind::Unknown,
                    &format!(
                        "An error was encountered receiving updates for payload {id} with reason: {reason}."
                    ),
                );
            }
            Action::Goodbye { reason } => {
                info!(reason = reason.as_deref().unwrap_or(""), "goodbye received");
                state.reset();
            }
            Action::InternalError { message, kind } => {
                let kind = if kind.is_invalid_data() {
                    ErrorKind::InvalidData
                } else {
                    ErrorKind::Unknown
                };
                self.report(kind, &message);
            }
        }
    }

    fn report(&self, kind: ErrorKind, message: &str) {
        warn!(?kind, "{message}");
        for listener in &self.listeners {
            listener.on_error(kind, message);
        }
    }
}

//! Payload protocol state machine.
//!
//! [`ProtocolHandler`] consumes one decoded event at a time and emits one
//! [`Action`] per event. Changes are buffered until a `payload-transferred`
//! event closes the payload, so a changeset is only ever surfaced whole.
//!
//! The handler carries no locking. Exactly one reader drives it per
//! connection, and [`ProtocolHandler::reset`] must be called whenever the
//! underlying connection is replaced; otherwise changes from two unrelated
//! streams could be spliced into one changeset.

use crate::change::{Change, ChangeSet, ChangeSetType};
use crate::error::ProtocolErrorKind;
use crate::event::{
    event_types, DeleteObject, ErrorEvent, Event, Goodbye, IntentCode, PayloadTransferred,
    PutObject, RawEvent, ServerIntent,
};
use crate::selector::Selector;
use tracing::{debug, trace};

/// Transfer state of the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    /// No server intent has been declared on this connection.
    Inactive,
    /// Receiving incremental changes.
    Changes,
    /// Receiving a full transfer.
    Full,
}

impl ProtocolState {
    /// Returns true once an intent has been declared.
    pub fn is_active(&self) -> bool {
        !matches!(self, ProtocolState::Inactive)
    }
}

/// What the caller should do in response to an event.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// A complete changeset is ready to be applied.
    ChangeSet(ChangeSet),
    /// The server reported an error; buffered changes were discarded.
    Error {
        /// Identifier of the affected payload, if any.
        id: Option<String>,
        /// Reason given by the server.
        reason: String,
    },
    /// The server intends to disconnect.
    Goodbye {
        /// Reason given by the server.
        reason: Option<String>,
    },
    /// Something went wrong locally or the event stream broke the protocol.
    InternalError {
        /// Description of the problem.
        message: String,
        /// Error category.
        kind: ProtocolErrorKind,
    },
    /// Nothing to do.
    None,
}

impl Action {
    fn internal_error(kind: ProtocolErrorKind, message: impl Into<String>) -> Self {
        Action::InternalError {
            message: message.into(),
            kind,
        }
    }

    /// Returns true for [`Action::None`].
    pub fn is_none(&self) -> bool {
        matches!(self, Action::None)
    }
}

const HANDLED_EVENT_TYPES: &[&str] = &[
    event_types::SERVER_INTENT,
    event_types::DELETE_OBJECT,
    event_types::PUT_OBJECT,
    event_types::ERROR,
    event_types::GOODBYE,
    event_types::PAYLOAD_TRANSFERRED,
    event_types::HEARTBEAT,
];

/// The per-connection protocol state machine.
#[derive(Debug)]
pub struct ProtocolHandler {
    changes: Vec<Change>,
    state: ProtocolState,
}

impl ProtocolHandler {
    /// Creates a handler in the [`ProtocolState::Inactive`] state.
    pub fn new() -> Self {
        Self {
            changes: Vec::new(),
            state: ProtocolState::Inactive,
        }
    }

    /// Gets the current state.
    pub fn state(&self) -> ProtocolState {
        self.state
    }

    /// Number of changes buffered for the payload in progress.
    pub fn buffered(&self) -> usize {
        self.changes.len()
    }

    /// The event names this handler understands.
    pub fn handled_event_types() -> &'static [&'static str] {
        HANDLED_EVENT_TYPES
    }

    /// Decodes and handles a raw event.
    ///
    /// A body that fails to decode yields
    /// [`ProtocolErrorKind::JsonError`] and leaves the handler untouched, so
    /// the next event is still processed normally.
    pub fn handle_raw(&mut self, raw: &RawEvent) -> Action {
        match Event::decode(raw) {
            Ok(event) => self.handle_event(event),
            Err(e) => {
                debug!(event = %raw.event, error = %e, "failed to decode event");
                Action::internal_error(
                    ProtocolErrorKind::JsonError,
                    format!("Failed to deserialize {} event: {e}", raw.event),
                )
            }
        }
    }

    /// Processes one event and returns the action the caller should take.
    pub fn handle_event(&mut self, event: Event) -> Action {
        trace!(event = event.event_type(), state = ?self.state, "handling event");
        match event {
            Event::ServerIntent(intent) => self.server_intent(intent),
            Event::PutObject(put) => {
                self.put_object(put);
                Action::None
            }
            Event::DeleteObject(delete) => {
                self.delete_object(delete);
                Action::None
            }
            Event::PayloadTransferred(transferred) => self.payload_transferred(transferred),
            Event::Error(error) => self.error(error),
            Event::Goodbye(goodbye) => Self::goodbye(goodbye),
            Event::Heartbeat => Action::None,
            Event::Unknown(name) => Action::internal_error(
                ProtocolErrorKind::UnknownEvent,
                format!("Received an unknown event of type {name}"),
            ),
        }
    }

    /// Discards buffered changes and returns to [`ProtocolState::Inactive`].
    ///
    /// Call this whenever the connection is replaced.
    pub fn reset(&mut self) {
        self.changes.clear();
        self.state = ProtocolState::Inactive;
    }

    fn server_intent(&mut self, intent: ServerIntent) -> Action {
        // Only one payload per intent is defined by the current protocol
        // version. Multi-payload negotiation needs a protocol version bump.
        if intent.payloads.len() > 1 {
            debug!(
                count = intent.payloads.len(),
                "server-intent declared several payloads; using the first"
            );
        }
        let Some(payload) = intent.payloads.into_iter().next() else {
            return Action::internal_error(
                ProtocolErrorKind::MissingPayload,
                "No payload present in server-intent",
            );
        };

        match payload.intent_code {
            IntentCode::None => {
                self.state = ProtocolState::Changes;
                self.changes.clear();
                return Action::ChangeSet(ChangeSet::none());
            }
            IntentCode::TransferFull => self.state = ProtocolState::Full,
            IntentCode::TransferChanges => self.state = ProtocolState::Changes,
            IntentCode::Other(code) => {
                return Action::internal_error(
                    ProtocolErrorKind::ImplementationError,
                    format!("Unhandled intent code: {code}"),
                );
            }
        }

        self.changes.clear();
        Action::None
    }

    fn put_object(&mut self, put: PutObject) {
        self.changes
            .push(Change::put(put.kind, put.key, put.version, put.object));
    }

    fn delete_object(&mut self, delete: DeleteObject) {
        self.changes
            .push(Change::delete(delete.kind, delete.key, delete.version));
    }

    fn payload_transferred(&mut self, transferred: PayloadTransferred) -> Action {
        let change_type = match self.state {
            ProtocolState::Inactive => {
                return Action::internal_error(
                    ProtocolErrorKind::ProtocolError,
                    "A payload transferred has been received without an intent having been established.",
                );
            }
            ProtocolState::Changes => ChangeSetType::Partial,
            ProtocolState::Full => ChangeSetType::Full,
        };

        let changes = std::mem::take(&mut self.changes);
        let changeset = ChangeSet::new(
            change_type,
            changes,
            Selector::from_payload(transferred.version, transferred.state),
        );
        self.state = ProtocolState::Changes;
        Action::ChangeSet(changeset)
    }

    fn error(&mut self, error: ErrorEvent) -> Action {
        self.changes.clear();
        Action::Error {
            id: error.id,
            reason: error.reason,
        }
    }

    fn goodbye(goodbye: Goodbye) -> Action {
        Action::Goodbye {
            reason: goodbye.reason,
        }
    }
}

impl Default for ProtocolHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::ChangeType;
    use proptest::prelude::*;
    use serde_json::{json, Value};

    fn intent(code: &str) -> RawEvent {
        RawEvent::new(
            "server-intent",
            json!({"payloads": [{"id": "p1", "target": 1, "intentCode": code}]}),
        )
    }

    fn put(kind: &str, key: &str, version: i64) -> RawEvent {
        RawEvent::new(
            "put-object",
            json!({"kind": kind, "key": key, "version": version, "object": {"key": key}}),
        )
    }

    fn delete(kind: &str, key: &str, version: i64) -> RawEvent {
        RawEvent::new(
            "delete-object",
            json!({"kind": kind, "key": key, "version": version}),
        )
    }

    fn transferred(version: i64, state: &str) -> RawEvent {
        RawEvent::new(
            "payload-transferred",
            json!({"state": state, "version": version}),
        )
    }

    fn expect_changeset(action: Action) -> ChangeSet {
        match action {
            Action::ChangeSet(changeset) => changeset,
            other => panic!("expected changeset, got {other:?}"),
        }
    }

    fn expect_internal(action: Action) -> ProtocolErrorKind {
        match action {
            Action::InternalError { kind, .. } => kind,
            other => panic!("expected internal error, got {other:?}"),
        }
    }

    #[test]
    fn starts_inactive() {
        let handler = ProtocolHandler::new();
        assert_eq!(handler.state(), ProtocolState::Inactive);
        assert!(!handler.state().is_active());
        assert_eq!(handler.buffered(), 0);
    }

    #[test]
    fn full_transfer_produces_full_changeset() {
        let mut handler = ProtocolHandler::new();
        assert!(handler.handle_raw(&intent("xfer-full")).is_none());
        assert_eq!(handler.state(), ProtocolState::Full);
        assert!(handler.handle_raw(&put("flag", "f1", 1)).is_none());
        assert!(handler.handle_raw(&put("segment", "s1", 2)).is_none());

        let changeset = expect_changeset(handler.handle_raw(&transferred(7, "abc")));
        assert_eq!(changeset.change_type(), ChangeSetType::Full);
        assert_eq!(changeset.changes().len(), 2);
        assert_eq!(changeset.selector(), &Selector::from_payload(7, "abc"));

        // Subsequent payloads on the same connection are incremental.
        assert_eq!(handler.state(), ProtocolState::Changes);
        assert_eq!(handler.buffered(), 0);
    }

    #[test]
    fn incremental_transfer_example() {
        let mut handler = ProtocolHandler::new();
        let events = [
            intent("xfer-changes"),
            put("flags", "f1", 3),
            delete("flags", "f2", 1),
            transferred(10, "s1"),
        ];
        let mut actions: Vec<Action> = events.iter().map(|e| handler.handle_raw(e)).collect();
        let last = actions.pop().unwrap();
        assert!(actions.iter().all(Action::is_none));

        let changeset = expect_changeset(last);
        assert_eq!(changeset.change_type(), ChangeSetType::Partial);
        let changes = changeset.changes();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].change_type, ChangeType::Put);
        assert_eq!(changes[0].key, "f1");
        assert_eq!(changes[0].version, 3);
        assert_eq!(changes[1].change_type, ChangeType::Delete);
        assert_eq!(changes[1].key, "f2");
        assert_eq!(changes[1].version, 1);
        assert_eq!(changes[1].object, None);
        assert_eq!(changeset.selector().version(), 10);
        assert_eq!(changeset.selector().state(), "s1");
    }

    #[test]
    fn intent_none_emits_empty_changeset_immediately() {
        let mut handler = ProtocolHandler::new();
        let changeset = expect_changeset(handler.handle_raw(&intent("none")));
        assert_eq!(changeset, ChangeSet::none());
        assert_eq!(handler.state(), ProtocolState::Changes);
    }

    #[test]
    fn intent_none_discards_buffer() {
        let mut handler = ProtocolHandler::new();
        handler.handle_raw(&intent("xfer-changes"));
        handler.handle_raw(&put("flag", "f1", 1));
        assert_eq!(handler.buffered(), 1);

        handler.handle_raw(&intent("none"));
        assert_eq!(handler.buffered(), 0);
    }

    #[test]
    fn transferred_while_inactive_is_protocol_error() {
        let mut handler = ProtocolHandler::new();
        let kind = expect_internal(handler.handle_raw(&transferred(1, "s")));
        assert_eq!(kind, ProtocolErrorKind::ProtocolError);
        assert_eq!(handler.state(), ProtocolState::Inactive);
    }

    #[test]
    fn reset_discards_uncommitted_changes() {
        let mut handler = ProtocolHandler::new();
        handler.handle_raw(&intent("xfer-full"));
        handler.handle_raw(&put("flag", "f1", 1));
        handler.reset();

        assert_eq!(handler.state(), ProtocolState::Inactive);
        assert_eq!(handler.buffered(), 0);

        // Events from a new connection never see the old buffer.
        handler.handle_raw(&put("flag", "f2", 2));
        let kind = expect_internal(handler.handle_raw(&transferred(2, "s")));
        assert_eq!(kind, ProtocolErrorKind::ProtocolError);

        handler.handle_raw(&intent("xfer-changes"));
        let changeset = expect_changeset(handler.handle_raw(&transferred(3, "t")));
        assert!(changeset.changes().is_empty());
    }

    #[test]
    fn missing_payload() {
        let mut handler = ProtocolHandler::new();
        let raw = RawEvent::new("server-intent", json!({"payloads": []}));
        assert_eq!(
            expect_internal(handler.handle_raw(&raw)),
            ProtocolErrorKind::MissingPayload
        );
    }

    #[test]
    fn unrecognized_intent_code_is_implementation_error() {
        let mut handler = ProtocolHandler::new();
        assert_eq!(
            expect_internal(handler.handle_raw(&intent("xfer-sideways"))),
            ProtocolErrorKind::ImplementationError
        );
        assert_eq!(handler.state(), ProtocolState::Inactive);
    }

    #[test]
    fn only_first_payload_intent_is_honored() {
        let mut handler = ProtocolHandler::new();
        let raw = RawEvent::new(
            "server-intent",
            json!({"payloads": [
                {"id": "a", "target": 1, "intentCode": "xfer-full"},
                {"id": "b", "target": 1, "intentCode": "none"}
            ]}),
        );
        assert!(handler.handle_raw(&raw).is_none());
        assert_eq!(handler.state(), ProtocolState::Full);
    }

    #[test]
    fn malformed_body_is_json_error_and_processing_continues() {
        let mut handler = ProtocolHandler::new();
        handler.handle_raw(&intent("xfer-changes"));
        handler.handle_raw(&put("flag", "f1", 1));

        let bad = RawEvent::new("put-object", json!({"kind": "flag"}));
        assert_eq!(
            expect_internal(handler.handle_raw(&bad)),
            ProtocolErrorKind::JsonError
        );
        assert_eq!(handler.buffered(), 1);

        let changeset = expect_changeset(handler.handle_raw(&transferred(2, "s")));
        assert_eq!(changeset.changes().len(), 1);
    }

    #[test]
    fn error_clears_buffer_but_keeps_state() {
        let mut handler = ProtocolHandler::new();
        handler.handle_raw(&intent("xfer-full"));
        handler.handle_raw(&put("flag", "f1", 1));

        let action = handler.handle_raw(&RawEvent::new(
            "error",
            json!({"id": "p1", "reason": "overloaded"}),
        ));
        assert_eq!(
            action,
            Action::Error {
                id: Some("p1".into()),
                reason: "overloaded".into(),
            }
        );
        assert_eq!(handler.buffered(), 0);
        assert_eq!(handler.state(), ProtocolState::Full);

        handler.handle_raw(&put("flag", "f2", 2));
        let changeset = expect_changeset(handler.handle_raw(&transferred(3, "s")));
        assert_eq!(changeset.change_type(), ChangeSetType::Full);
        assert_eq!(changeset.changes().len(), 1);
        assert_eq!(changeset.changes()[0].key, "f2");
    }

    #[test]
    fn goodbye_and_heartbeat() {
        let mut handler = ProtocolHandler::new();
        handler.handle_raw(&intent("xfer-full"));
        handler.handle_raw(&put("flag", "f1", 1));

        assert!(handler
            .handle_raw(&RawEvent::new("heartbeat", Value::Null))
            .is_none());
        assert_eq!(handler.buffered(), 1);

        let action = handler.handle_raw(&RawEvent::new("goodbye", json!({"reason": "bye"})));
        assert_eq!(
            action,
            Action::Goodbye {
                reason: Some("bye".into())
            }
        );
    }

    #[test]
    fn unknown_event() {
        let mut handler = ProtocolHandler::new();
        let raw = RawEvent::new("surprise", json!({}));
        assert_eq!(
            expect_internal(handler.handle_raw(&raw)),
            ProtocolErrorKind::UnknownEvent
        );
    }

    #[test]
    fn handled_event_types_cover_vocabulary() {
        let types = ProtocolHandler::handled_event_types();
        assert_eq!(types.len(), 7);
        for name in [
            "server-intent",
            "put-object",
            "delete-object",
            "payload-transferred",
            "error",
            "goodbye",
            "heartbeat",
        ] {
            assert!(types.contains(&name), "{name} not handled");
        }
    }

    proptest! {
        #[test]
        fn full_transfer_preserves_arrival_order(
            keys in proptest::collection::vec("[a-z]{1,8}", 0..32),
            version in 1i64..10_000,
            state in "[a-z0-9]{1,12}",
        ) {
            let mut handler = ProtocolHandler::new();
            prop_assert!(handler.handle_raw(&intent("xfer-full")).is_none());
            for (i, key) in keys.iter().enumerate() {
                prop_assert!(handler.handle_raw(&put("flag", key, i as i64 + 1)).is_none());
            }

            let changeset = expect_changeset(handler.handle_raw(&transferred(version, &state)));
            prop_assert_eq!(changeset.change_type(), ChangeSetType::Full);
            prop_assert_eq!(changeset.changes().len(), keys.len());
            for (change, key) in changeset.changes().iter().zip(&keys) {
                prop_assert_eq!(&change.key, key);
            }
            prop_assert_eq!(changeset.selector(), &Selector::from_payload(version, state));
        }

        #[test]
        fn reset_never_leaks_changes(count in 1usize..16) {
            let mut handler = ProtocolHandler::new();
            handler.handle_raw(&intent("xfer-changes"));
            for i in 0..count {
                handler.handle_raw(&put("flag", &format!("k{i}"), 1));
            }
            handler.reset();
            let action = handler.handle_raw(&transferred(1, "s"));
            prop_assert_eq!(expect_internal(action), ProtocolErrorKind::ProtocolError);
        }
    }
}

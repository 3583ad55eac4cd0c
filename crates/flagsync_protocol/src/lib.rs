//! # flagsync Protocol
//!
//! Delivery protocol types and the payload state machine for flagsync.
//!
//! This crate provides:
//! - [`Selector`], [`Change`] and [`ChangeSet`] value types
//! - The wire event vocabulary ([`Event`]) decoded once from JSON
//! - [`ProtocolHandler`], which turns one event at a time into an [`Action`]
//! - [`PayloadProcessor`], a listener-style adapter over the same handler
//!
//! This is a pure protocol crate with no I/O operations. Establishing the
//! stream, retrying connections and decoding bytes into [`RawEvent`]s belong
//! to the transport.
//!
//! ## Example
//!
//! ```rust
//! use flagsync_protocol::{Action, ChangeSetType, ProtocolHandler, RawEvent};
//! use serde_json::json;
//!
//! let mut handler = ProtocolHandler::new();
//! let events = [
//!     RawEvent::new("server-intent", json!({
//!         "payloads": [{"id": "p1", "target": 1, "intentCode": "xfer-full"}]
//!     })),
//!     RawEvent::new("put-object", json!({
//!         "kind": "flag", "key": "f1", "version": 1, "object": {"on": true}
//!     })),
//!     RawEvent::new("payload-transferred", json!({"state": "s1", "version": 1})),
//! ];
//!
//! let actions: Vec<Action> = events.iter().map(|e| handler.handle_raw(e)).collect();
//! match &actions[2] {
//!     Action::ChangeSet(changeset) => {
//!         assert_eq!(changeset.change_type(), ChangeSetType::Full);
//!         assert_eq!(changeset.changes().len(), 1);
//!     }
//!     other => panic!("unexpected action {other:?}"),
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change;
mod error;
mod event;
mod handler;
mod processor;
mod selector;

pub use change::{Change, ChangeSet, ChangeSetType, ChangeType};
pub use error::{DecodeError, DecodeResult, ProtocolErrorKind};
pub use event::{
    event_types, parse_events_array, DeleteObject, ErrorEvent, Event, Goodbye, IntentCode,
    PayloadIntent, PayloadTransferred, PutObject, RawEvent, ServerIntent,
};
pub use handler::{Action, ProtocolHandler, ProtocolState};
pub use processor::{ErrorKind, Payload, PayloadListener, PayloadProcessor, Update};
pub use selector::Selector;

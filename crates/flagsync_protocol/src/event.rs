//! Wire events.
//!
//! Events arrive from the transport as a name plus a JSON body
//! ([`RawEvent`]). They are decoded once, at the boundary, into the closed
//! [`Event`] enum so that the protocol handler can match exhaustively.

use crate::error::{DecodeError, DecodeResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Names of the events in the delivery protocol.
pub mod event_types {
    /// Declares the kind of payload about to be sent.
    pub const SERVER_INTENT: &str = "server-intent";
    /// Adds or replaces an item.
    pub const PUT_OBJECT: &str = "put-object";
    /// Deletes an item.
    pub const DELETE_OBJECT: &str = "delete-object";
    /// Completes a payload and carries its selector.
    pub const PAYLOAD_TRANSFERRED: &str = "payload-transferred";
    /// Reports a server-side problem with the current payload.
    pub const ERROR: &str = "error";
    /// Announces that the server is about to disconnect.
    pub const GOODBYE: &str = "goodbye";
    /// Keep-alive; carries nothing.
    pub const HEARTBEAT: &str = "heartbeat";
}

/// An undecoded event as delivered by the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    /// Event name.
    pub event: String,
    /// Event body.
    pub data: Value,
}

impl RawEvent {
    /// Creates a raw event.
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}

/// Server-declared type of the payload about to be sent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum IntentCode {
    /// The receiver is already up to date.
    None,
    /// A full basis follows.
    TransferFull,
    /// Incremental changes follow.
    TransferChanges,
    /// A code this implementation does not know.
    Other(String),
}

impl IntentCode {
    /// Returns the wire representation.
    pub fn as_str(&self) -> &str {
        match self {
            IntentCode::None => "none",
            IntentCode::TransferFull => "xfer-full",
            IntentCode::TransferChanges => "xfer-changes",
            IntentCode::Other(code) => code.as_str(),
        }
    }
}

impl From<String> for IntentCode {
    fn from(code: String) -> Self {
        match code.as_str() {
            "none" => IntentCode::None,
            "xfer-full" => IntentCode::TransferFull,
            "xfer-changes" => IntentCode::TransferChanges,
            _ => IntentCode::Other(code),
        }
    }
}

impl From<IntentCode> for String {
    fn from(code: IntentCode) -> Self {
        match code {
            IntentCode::Other(code) => code,
            known => known.as_str().to_string(),
        }
    }
}

/// One declared payload in a server intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadIntent {
    /// Payload identifier.
    pub id: String,
    /// Target version of the payload.
    pub target: i64,
    /// What kind of transfer follows.
    pub intent_code: IntentCode,
    /// Human-readable reason for the intent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Body of a `server-intent` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerIntent {
    /// Declared payloads. Only the first entry is honored by this protocol
    /// version.
    pub payloads: Vec<PayloadIntent>,
}

/// Body of a `put-object` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PutObject {
    /// Item kind.
    pub kind: String,
    /// Item key.
    pub key: String,
    /// Item version.
    pub version: i64,
    /// Raw item JSON.
    pub object: Value,
}

/// Body of a `delete-object` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteObject {
    /// Item kind.
    pub kind: String,
    /// Item key.
    pub key: String,
    /// Version of the deletion.
    pub version: i64,
}

/// Body of a `payload-transferred` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadTransferred {
    /// Opaque state identifier.
    pub state: String,
    /// Payload version.
    pub version: i64,
}

/// Body of an `error` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    /// Identifier of the affected payload, if any.
    #[serde(default)]
    pub id: Option<String>,
    /// Reason given by the server.
    pub reason: String,
}

/// Body of a `goodbye` event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Goodbye {
    /// Reason given by the server.
    #[serde(default)]
    pub reason: Option<String>,
}

/// A decoded protocol event.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// `server-intent`
    ServerIntent(ServerIntent),
    /// `put-object`
    PutObject(PutObject),
    /// `delete-object`
    DeleteObject(DeleteObject),
    /// `payload-transferred`
    PayloadTransferred(PayloadTransferred),
    /// `error`
    Error(ErrorEvent),
    /// `goodbye`
    Goodbye(Goodbye),
    /// `heartbeat`
    Heartbeat,
    /// An event name outside the protocol vocabulary.
    Unknown(String),
}

impl Event {
    /// Returns the wire name of the event.
    pub fn event_type(&self) -> &str {
        match self {
            Event::ServerIntent(_) => event_types::SERVER_INTENT,
            Event::PutObject(_) => event_types::PUT_OBJECT,
            Event::DeleteObject(_) => event_types::DELETE_OBJECT,
            Event::PayloadTransferred(_) => event_types::PAYLOAD_TRANSFERRED,
            Event::Error(_) => event_types::ERROR,
            Event::Goodbye(_) => event_types::GOODBYE,
            Event::Heartbeat => event_types::HEARTBEAT,
            Event::Unknown(name) => name.as_str(),
        }
    }

    /// Decodes a raw event.
    ///
    /// Unknown event names decode successfully to [`Event::Unknown`]; only a
    /// body that does not match its schema is an error.
    pub fn decode(raw: &RawEvent) -> DecodeResult<Self> {
        let name = raw.event.as_str();
        let event = match name {
            event_types::SERVER_INTENT => Event::ServerIntent(body(name, &raw.data)?),
            event_types::PUT_OBJECT => {
                let put: PutObject = body(name, &raw.data)?;
                if put.object.is_null() {
                    return Err(DecodeError::missing(name, "object"));
                }
                Event::PutObject(put)
            }
            event_types::DELETE_OBJECT => Event::DeleteObject(body(name, &raw.data)?),
            event_types::PAYLOAD_TRANSFERRED => {
                Event::PayloadTransferred(body(name, &raw.data)?)
            }
            event_types::ERROR => Event::Error(body(name, &raw.data)?),
            event_types::GOODBYE if raw.data.is_null() => Event::Goodbye(Goodbye::default()),
            event_types::GOODBYE => Event::Goodbye(body(name, &raw.data)?),
            event_types::HEARTBEAT => Event::Heartbeat,
            other => Event::Unknown(other.to_string()),
        };
        Ok(event)
    }
}

fn body<T: serde::de::DeserializeOwned>(event: &str, data: &Value) -> DecodeResult<T> {
    T::deserialize(data).map_err(|e| DecodeError::json(event, e))
}

/// Parses the body of a polling response, `{"events": [{"event", "data"}, ...]}`.
///
/// The whole response is rejected if any element is malformed; individual
/// event bodies are not decoded here.
pub fn parse_events_array(json: &str) -> DecodeResult<Vec<RawEvent>> {
    let root: Value =
        serde_json::from_str(json).map_err(|e| DecodeError::MalformedResponse(e.to_string()))?;

    let events = root
        .get("events")
        .ok_or_else(|| DecodeError::MalformedResponse("missing 'events' property".into()))?
        .as_array()
        .ok_or_else(|| DecodeError::MalformedResponse("'events' is not an array".into()))?;

    events
        .iter()
        .enumerate()
        .map(|(index, element)| {
            if element.is_null() {
                return Err(DecodeError::MalformedResponse(format!(
                    "null event at index {index}"
                )));
            }
            let object = element.as_object().ok_or_else(|| {
                DecodeError::MalformedResponse(format!("event at index {index} is not an object"))
            })?;
            let name = object
                .get("event")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    DecodeError::MalformedResponse(format!(
                        "event at index {index} missing required property 'event'"
                    ))
                })?;
            let data = object.get("data").filter(|v| !v.is_null()).ok_or_else(|| {
                DecodeError::MalformedResponse(format!(
                    "event at index {index} missing required property 'data'"
                ))
            })?;
            Ok(RawEvent::new(name, data.clone()))
        })
        .collect()
}

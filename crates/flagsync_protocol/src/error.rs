//! Error types for the delivery protocol.

use thiserror::Error;

/// Result type for event decoding.
pub type DecodeResult<T> = Result<T, DecodeError>;

/// Errors that can occur while decoding wire events.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The event body did not match its schema.
    #[error("failed to deserialize {event} event: {source}")]
    Json {
        /// Event name.
        event: String,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// A required property was absent or null.
    #[error("{event} event missing required property '{field}'")]
    MissingField {
        /// Event name.
        event: String,
        /// Property name.
        field: &'static str,
    },

    /// A polling response did not have the expected shape.
    #[error("malformed polling response: {0}")]
    MalformedResponse(String),
}

impl DecodeError {
    pub(crate) fn json(event: &str, source: serde_json::Error) -> Self {
        Self::Json {
            event: event.to_string(),
            source,
        }
    }

    pub(crate) fn missing(event: &str, field: &'static str) -> Self {
        Self::MissingField {
            event: event.to_string(),
            field,
        }
    }
}

/// Categories of internal errors reported by the protocol handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolErrorKind {
    /// Received an event name that is not recognized.
    UnknownEvent,
    /// A server intent arrived without any payload.
    MissingPayload,
    /// The event body could not be parsed or did not match its schema.
    JsonError,
    /// An illegal internal state/action combination; a local defect.
    ImplementationError,
    /// An event that is legal in general but not in the current state.
    ProtocolError,
}

impl ProtocolErrorKind {
    /// Returns true if the error was caused by data received from the service.
    pub fn is_invalid_data(&self) -> bool {
        matches!(
            self,
            ProtocolErrorKind::JsonError | ProtocolErrorKind::MissingPayload
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_data_kinds() {
        assert!(ProtocolErrorKind::JsonError.is_invalid_data());
        assert!(ProtocolErrorKind::MissingPayload.is_invalid_data());
        assert!(!ProtocolErrorKind::ProtocolError.is_invalid_data());
        assert!(!ProtocolErrorKind::UnknownEvent.is_invalid_data());
        assert!(!ProtocolErrorKind::ImplementationError.is_invalid_data());
    }

    #[test]
    fn error_display() {
        let err = DecodeError::missing("put-object", "object");
        assert_eq!(
            err.to_string(),
            "put-object event missing required property 'object'"
        );

        let err = DecodeError::MalformedResponse("missing 'events'".into());
        assert!(err.to_string().contains("missing 'events'"));
    }
}

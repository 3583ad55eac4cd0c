//! Resumption tokens.

/// An opaque resumption token identifying a point in the remote data sequence.
///
/// A selector is either empty or carries the `version` and `state` received
/// in a `payload-transferred` event. The empty selector cannot be used as a
/// basis when reconnecting; it asks the service for a full transfer.
///
/// Non-empty selectors are only minted from data received over the wire.
/// Custom data sources must pass [`Selector::EMPTY`] instead of inventing one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Selector {
    version: i64,
    state: String,
    empty: bool,
}

impl Selector {
    /// The empty selector (`version = 0`, `state = ""`).
    pub const EMPTY: Selector = Selector {
        version: 0,
        state: String::new(),
        empty: true,
    };

    /// Creates a selector from the `version` and `state` of a
    /// `payload-transferred` event.
    pub fn from_payload(version: i64, state: impl Into<String>) -> Self {
        Self {
            version,
            state: state.into(),
            empty: false,
        }
    }

    /// Returns true if this is the empty selector.
    pub fn is_empty(&self) -> bool {
        self.empty
    }

    /// The version of the data associated with this selector.
    pub fn version(&self) -> i64 {
        self.version
    }

    /// The state identifier associated with the payload.
    pub fn state(&self) -> &str {
        &self.state
    }
}

impl Default for Selector {
    fn default() -> Self {
        Self::EMPTY
    }
}

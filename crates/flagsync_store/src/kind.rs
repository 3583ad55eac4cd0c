//! Data kinds.

use std::fmt;

/// A category of stored item.
///
/// Each kind lives in its own namespace in every store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DataKind {
    /// Feature flags.
    Features,
    /// User segments.
    Segments,
}

impl DataKind {
    /// Every known kind.
    pub const ALL: [DataKind; 2] = [DataKind::Features, DataKind::Segments];

    /// The namespace name used by stores.
    pub fn namespace(&self) -> &'static str {
        match self {
            DataKind::Features => "features",
            DataKind::Segments => "segments",
        }
    }

    /// Maps a wire kind (`"flag"`, `"segment"`) to a data kind.
    pub fn from_wire_kind(kind: &str) -> Option<Self> {
        match kind {
            "flag" => Some(DataKind::Features),
            "segment" => Some(DataKind::Segments),
            _ => None,
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.namespace())
    }
}

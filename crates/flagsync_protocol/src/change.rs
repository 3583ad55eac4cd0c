//! Changes and changesets.

use crate::selector::Selector;
use serde_json::Value;

/// Type of change operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    /// Item was created or updated.
    Put,
    /// Item was deleted.
    Delete,
}

/// A single versioned change to one item.
///
/// # Fields
///
/// - `change_type`: Put or Delete
/// - `kind`: The wire kind of the item (`"flag"`, `"segment"`, ...)
/// - `key`: The item key, unique within its kind
/// - `version`: Monotonically increasing per `(kind, key)`
/// - `object`: For Put changes, the raw JSON of the item
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    /// Change type.
    pub change_type: ChangeType,
    /// Item kind.
    pub kind: String,
    /// Item key.
    pub key: String,
    /// Item version.
    pub version: i64,
    /// Raw item JSON (Put only).
    pub object: Option<Value>,
}

impl Change {
    /// Creates a Put change.
    pub fn put(kind: impl Into<String>, key: impl Into<String>, version: i64, object: Value) -> Self {
        Self {
            change_type: ChangeType::Put,
            kind: kind.into(),
            key: key.into(),
            version,
            object: Some(object),
        }
    }

    /// Creates a Delete change.
    pub fn delete(kind: impl Into<String>, key: impl Into<String>, version: i64) -> Self {
        Self {
            change_type: ChangeType::Delete,
            kind: kind.into(),
            key: key.into(),
            version,
            object: None,
        }
    }

    /// Returns true for Delete changes.
    pub fn is_delete(&self) -> bool {
        self.change_type == ChangeType::Delete
    }
}

/// How a changeset relates to the data already held by the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeSetType {
    /// A complete basis; replaces all prior items of the affected kinds.
    Full,
    /// Deltas applied on top of existing data.
    Partial,
    /// No changes; the receiver is already up to date.
    None,
}

/// An immutable, atomic batch of changes plus a resumption marker.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSet {
    change_type: ChangeSetType,
    changes: Vec<Change>,
    selector: Selector,
}

impl ChangeSet {
    /// Creates a changeset.
    pub fn new(change_type: ChangeSetType, changes: Vec<Change>, selector: Selector) -> Self {
        Self {
            change_type,
            changes,
            selector,
        }
    }

    /// The changeset that carries nothing and leaves the selector empty.
    pub fn none() -> Self {
        Self::new(ChangeSetType::None, Vec::new(), Selector::EMPTY)
    }

    /// The changeset type.
    pub fn change_type(&self) -> ChangeSetType {
        self.change_type
    }

    /// The changes, in arrival order.
    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    /// The selector to record once the changeset is applied.
    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    /// Splits the changeset into its parts.
    pub fn into_parts(self) -> (ChangeSetType, Vec<Change>, Selector) {
        (self.change_type, self.changes, self.selector)
    }
}

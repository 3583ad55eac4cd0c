//! Versioned item descriptors and data sets.

use crate::error::{StoreError, StoreResult};
use crate::kind::DataKind;
use flagsync_protocol::{ChangeSetType, Selector};
use serde_json::{json, Value};

/// Items of one kind, keyed, in insertion order.
pub type KeyedItems<T> = Vec<(String, T)>;

/// A versioned item, or a tombstone when `item` is `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemDescriptor {
    /// Item version.
    pub version: i64,
    /// Raw item JSON; `None` marks a deletion.
    pub item: Option<Value>,
}

impl ItemDescriptor {
    /// Creates a descriptor for a live item.
    pub fn new(version: i64, item: Value) -> Self {
        Self {
            version,
            item: Some(item),
        }
    }

    /// Creates a tombstone.
    pub fn deleted(version: i64) -> Self {
        Self {
            version,
            item: None,
        }
    }

    /// Returns true for tombstones.
    pub fn is_deleted(&self) -> bool {
        self.item.is_none()
    }
}

/// An item as handed to a persistent store.
///
/// `serialized` is `None` for tombstones written by this process; stores
/// substitute [`SerializedItemDescriptor::placeholder`] so the version stays
/// comparable. Items read back from a store always carry their JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedItemDescriptor {
    /// Item version.
    pub version: i64,
    /// True for tombstones.
    pub deleted: bool,
    /// Serialized item JSON.
    pub serialized: Option<String>,
}

impl SerializedItemDescriptor {
    /// Serializes an item descriptor.
    ///
    /// The descriptor's version is written into object payloads so that it
    /// can be recovered from the stored JSON alone.
    pub fn from_item(item: &ItemDescriptor) -> StoreResult<Self> {
        match &item.item {
            Some(value) => {
                let mut value = value.clone();
                if let Some(object) = value.as_object_mut() {
                    object.insert("version".to_string(), Value::from(item.version));
                }
                Ok(Self {
                    version: item.version,
                    deleted: false,
                    serialized: Some(serde_json::to_string(&value)?),
                })
            }
            None => Ok(Self {
                version: item.version,
                deleted: true,
                serialized: None,
            }),
        }
    }

    /// Parses JSON read back from a store, recovering version and deletion
    /// state from the JSON itself.
    pub fn from_stored(json: String) -> StoreResult<Self> {
        let (version, deleted) = stored_version(&json)?;
        Ok(Self {
            version,
            deleted,
            serialized: Some(json),
        })
    }

    /// The tombstone placeholder stored for a deleted item.
    pub fn placeholder(key: &str, version: i64) -> String {
        json!({"key": key, "version": version, "deleted": true}).to_string()
    }

    /// The JSON to write for this item under `key`.
    pub fn json_or_placeholder(&self, key: &str) -> String {
        match &self.serialized {
            Some(json) if !self.deleted => json.clone(),
            _ => Self::placeholder(key, self.version),
        }
    }

    /// Converts back to an item descriptor.
    pub fn to_item(&self) -> StoreResult<ItemDescriptor> {
        let Some(json) = self.serialized.as_deref().filter(|_| !self.deleted) else {
            return Ok(ItemDescriptor::deleted(self.version));
        };
        let value: Value = serde_json::from_str(json)?;
        if value.get("deleted").and_then(Value::as_bool) == Some(true) {
            return Ok(ItemDescriptor::deleted(self.version));
        }
        Ok(ItemDescriptor::new(self.version, value))
    }
}

/// Reads `(version, deleted)` out of stored JSON.
pub(crate) fn stored_version(json: &str) -> StoreResult<(i64, bool)> {
    let value: Value = serde_json::from_str(json)?;
    let version = value
        .get("version")
        .and_then(Value::as_i64)
        .ok_or_else(|| StoreError::Corrupted(format!("missing version in {json}")))?;
    let deleted = value.get("deleted").and_then(Value::as_bool).unwrap_or(false);
    Ok((version, deleted))
}

/// A complete data set for initializing a store.
#[derive(Debug, Clone, PartialEq)]
pub struct FullDataSet<T> {
    /// Items grouped by kind.
    pub data: Vec<(DataKind, KeyedItems<T>)>,
    /// Whether the data should be written to a persistent store.
    pub should_persist: bool,
}

impl<T> FullDataSet<T> {
    /// Creates a data set that should be persisted.
    pub fn new(data: Vec<(DataKind, KeyedItems<T>)>) -> Self {
        Self {
            data,
            should_persist: true,
        }
    }
}

/// A changeset in store terms: items grouped by kind.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreChangeSet {
    /// How the changeset relates to existing data.
    pub change_type: ChangeSetType,
    /// Selector to record once applied.
    pub selector: Selector,
    /// Items grouped by kind, in arrival order.
    pub data: Vec<(DataKind, KeyedItems<ItemDescriptor>)>,
    /// Environment the data belongs to, if known.
    pub environment_id: Option<String>,
    /// Whether the data should be written to a persistent store.
    pub should_persist: bool,
}

impl StoreChangeSet {
    /// Number of items across all kinds.
    pub fn item_count(&self) -> usize {
        self.data.iter().map(|(_, items)| items.len()).sum()
    }
}

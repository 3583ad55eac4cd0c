//! Translation of wire changesets into store changesets.

use flagsync_protocol::{Change, ChangeSet, ChangeSetType, ChangeType, Payload, Selector};
use flagsync_store::{DataKind, ItemDescriptor, KeyedItems, StoreChangeSet};
use tracing::warn;

/// Converts protocol [`ChangeSet`]s into [`StoreChangeSet`]s.
pub struct ChangeSetTranslator;

impl ChangeSetTranslator {
    /// Groups changes by data kind, preserving arrival order.
    ///
    /// Changes of unknown kinds and puts without an object are skipped.
    /// Deletes become tombstones. A full changeset lists every known kind,
    /// so that applying it replaces kinds the server sent nothing for.
    pub fn to_store_changeset(
        changeset: &ChangeSet,
        environment_id: Option<&str>,
        should_persist: bool,
    ) -> StoreChangeSet {
        let mut data: Vec<(DataKind, KeyedItems<ItemDescriptor>)> = Vec::new();

        for change in changeset.changes() {
            let Some(kind) = DataKind::from_wire_kind(&change.kind) else {
                warn!(kind = %change.kind, "Unknown data kind '{}' in changeset, skipping", change.kind);
                continue;
            };

            let item = match (change.change_type, &change.object) {
                (ChangeType::Put, Some(object)) => ItemDescriptor::new(change.version, object.clone()),
                (ChangeType::Put, None) => {
                    warn!(kind = %change.kind, key = %change.key, "put without an object, skipping");
                    continue;
                }
                (ChangeType::Delete, _) => ItemDescriptor::deleted(change.version),
            };

            match data.iter_mut().find(|(k, _)| *k == kind) {
                Some((_, items)) => items.push((change.key.clone(), item)),
                None => data.push((kind, vec![(change.key.clone(), item)])),
            }
        }

        if changeset.change_type() == ChangeSetType::Full {
            for kind in DataKind::ALL {
                if !data.iter().any(|(k, _)| *k == kind) {
                    data.push((kind, Vec::new()));
                }
            }
        }

        StoreChangeSet {
            change_type: changeset.change_type(),
            selector: changeset.selector().clone(),
            data,
            environment_id: environment_id.map(str::to_string),
            should_persist,
        }
    }

    /// Rebuilds the changeset a [`Payload`] was reported from.
    ///
    /// A basis payload is full. A payload with no state and no updates came
    /// from an intent of `none`, and carries no selector. Anything else is
    /// partial.
    pub fn payload_to_changeset(payload: &Payload) -> ChangeSet {
        let change_type = match (payload.basis, &payload.state) {
            (true, _) => ChangeSetType::Full,
            (false, None) if payload.updates.is_empty() => ChangeSetType::None,
            _ => ChangeSetType::Partial,
        };
        let selector = payload
            .state
            .as_ref()
            .map_or(Selector::EMPTY, |state| Selector::from_payload(payload.version, state.as_str()));
        let changes = payload
            .updates
            .iter()
            .map(|update| Change {
                change_type: if update.deleted {
                    ChangeType::Delete
                } else {
                    ChangeType::Put
                },
                kind: update.kind.clone(),
                key: update.key.clone(),
                version: update.version,
                object: update.object.clone(),
            })
            .collect();
        ChangeSet::new(change_type, changes, selector)
    }
}

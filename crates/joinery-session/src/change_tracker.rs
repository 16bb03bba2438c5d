//! Change tracking and dirty detection.
//!
//! Every record carries the last stored values of its columns (the baseline).
//! A field is changed when its current value differs from the baseline; a
//! collection is changed when members were added or removed since the last
//! successful flush. Nothing is snapshotted up front, so asking for changes is
//! always relative to what storage last confirmed.

use crate::entity::{EntityHandle, EntityRecord, same_value};
use crate::identity_map::IdentityMap;
use joinery_core::{FieldKind, Value};
use serde::Serialize;
use std::collections::BTreeMap;

/// Change state of a single column-backed field.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldChange {
    pub has_changed: bool,
    /// Stored value, `None` for entities that were never written.
    pub original: Option<Value>,
}

/// Membership changes of one collection since the last flush.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CollectionChanges {
    pub added: Vec<EntityHandle>,
    pub removed: Vec<EntityHandle>,
}

impl CollectionChanges {
    pub fn has_updated(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }
}

/// Everything that changed on one entity since it was loaded or last flushed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EntityChanges {
    fields: BTreeMap<&'static str, FieldChange>,
    collections: BTreeMap<&'static str, CollectionChanges>,
}

impl EntityChanges {
    pub fn field(&self, name: &str) -> Option<&FieldChange> {
        self.fields.get(name)
    }

    /// Collection changes for `name`; empty when nothing changed.
    pub fn collection(&self, name: &str) -> CollectionChanges {
        self.collections.get(name).cloned().unwrap_or_default()
    }

    /// Names of column-backed fields whose value differs from storage.
    pub fn changed_fields(&self) -> Vec<&'static str> {
        self.fields
            .iter()
            .filter(|(_, c)| c.has_changed)
            .map(|(name, _)| *name)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.changed_fields().is_empty()
            && self.collections.values().all(|c| !c.has_updated())
    }

    /// Render as JSON for debugging.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Compute the changes of one record.
#[tracing::instrument(level = "trace", skip(map, record), fields(entity = record.type_name()))]
pub(crate) fn changes_of(map: &IdentityMap, record: &EntityRecord) -> EntityChanges {
    let mut changes = EntityChanges::default();
    for field in record.meta.column_fields() {
        let original = record.baseline.get(field.name).cloned();
        let current = match field.kind {
            FieldKind::ManyToOne { .. } => match record.refs.get(field.name) {
                // An unresolved target has no id yet, so it cannot match storage.
                Some(target) => map.ref_value(target),
                None => continue,
            },
            _ => match record.values.get(field.name) {
                Some(v) => Some(v.clone()),
                None => continue,
            },
        };
        let has_changed = match (&current, &original) {
            (Some(now), Some(stored)) => !same_value(now, stored),
            (Some(now), None) => !(record.persisted && now.is_null()),
            (None, _) => true,
        };
        changes.fields.insert(
            field.name,
            FieldChange {
                has_changed,
                original,
            },
        );
    }
    for (name, collection) in &record.collections {
        if collection.added().is_empty() && collection.removed().is_empty() {
            continue;
        }
        changes.collections.insert(
            *name,
            CollectionChanges {
                added: collection.added().to_vec(),
                removed: collection.removed().to_vec(),
            },
        );
    }
    tracing::trace!(changed = ?changes.changed_fields(), "Computed entity changes");
    changes
}

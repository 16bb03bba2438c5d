//! Identity Map: one live entity record per tagged id.
//!
//! The map is an arena. Records are addressed by [`EntityHandle`] and are never
//! removed for the life of the unit of work; deleting an entity only flips its
//! status. Collections and references hold handles, so the bidirectional entity
//! graph never needs shared ownership.
//!
//! Hydrating a row for an id that is already resident refreshes the existing
//! record instead of allocating a second one:
//!
//! - the stored baseline is replaced with the row
//! - current values and references are refreshed only where they have no
//!   unflushed local change
//! - a locally deleted entity stays deleted

use crate::entity::{EntityHandle, EntityRecord, EntityStatus, RefTarget, same_value};
use joinery_core::{
    EntityMetadata, Error, FieldKind, IdValue, MetadataRegistry, Result, Row, TaggedId, TypeError,
    Value,
};
use std::collections::HashMap;
use std::sync::Arc;

/// Arena of entity records with an index by tagged id and by type.
#[derive(Debug, Default)]
pub struct IdentityMap {
    records: Vec<EntityRecord>,
    by_id: HashMap<TaggedId, EntityHandle>,
    by_type: HashMap<&'static str, Vec<EntityHandle>>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a record and return its handle.
    ///
    /// Fails when a record with the same id is already resident.
    pub fn register(&mut self, record: EntityRecord) -> Result<EntityHandle> {
        if let Some(id) = &record.id {
            if self.by_id.contains_key(id) {
                return Err(Error::config(format!(
                    "{} is already in the identity map",
                    id
                )));
            }
        }
        let handle = EntityHandle::from_index(self.records.len());
        if let Some(id) = &record.id {
            self.by_id.insert(id.clone(), handle);
        }
        self.by_type
            .entry(record.meta.type_name)
            .or_default()
            .push(handle);
        tracing::trace!(
            handle = %handle,
            entity = record.meta.type_name,
            id = ?record.id,
            "Registered entity"
        );
        self.records.push(record);
        Ok(handle)
    }

    pub fn find(&self, id: &TaggedId) -> Option<EntityHandle> {
        self.by_id.get(id).copied()
    }

    /// Record behind a handle.
    ///
    /// # Panics
    ///
    /// Panics if the handle was issued by a different identity map.
    pub fn get(&self, handle: EntityHandle) -> &EntityRecord {
        &self.records[handle.index()]
    }

    pub(crate) fn get_mut(&mut self, handle: EntityHandle) -> &mut EntityRecord {
        &mut self.records[handle.index()]
    }

    /// Every resident entity of a type, in registration order.
    pub fn all_of(&self, type_name: &str) -> &[EntityHandle] {
        self.by_type.get(type_name).map_or(&[], Vec::as_slice)
    }

    pub fn handles(&self) -> impl Iterator<Item = EntityHandle> + '_ {
        (0..self.records.len()).map(EntityHandle::from_index)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Mark an entity deleted. The record stays resident.
    ///
    /// Returns false if it was already deleted.
    pub fn delete(&mut self, handle: EntityHandle) -> bool {
        let record = self.get_mut(handle);
        if record.status == EntityStatus::Deleted {
            return false;
        }
        record.status = EntityStatus::Deleted;
        true
    }

    /// Give a new entity its storage id.
    pub(crate) fn assign_id(&mut self, handle: EntityHandle, id: TaggedId) {
        self.by_id.insert(id.clone(), handle);
        self.get_mut(handle).id = Some(id);
    }

    /// Id of a resident entity, if it has one.
    pub fn id_of(&self, handle: EntityHandle) -> Option<&TaggedId> {
        self.get(handle).id.as_ref()
    }

    /// Stored column value a reference target corresponds to.
    ///
    /// `None` when the target is an entity that has no id yet.
    pub(crate) fn ref_value(&self, target: &RefTarget) -> Option<Value> {
        match target {
            RefTarget::Unset => Some(Value::Null),
            RefTarget::Id(id) => Some(id.to_value()),
            RefTarget::Entity(h) => self.id_of(*h).map(TaggedId::to_value),
        }
    }

    /// Resolve a reference to a resident entity, if there is one.
    pub fn resolve(&self, target: &RefTarget) -> Option<EntityHandle> {
        match target {
            RefTarget::Unset => None,
            RefTarget::Id(id) => self.find(id),
            RefTarget::Entity(h) => Some(*h),
        }
    }

    /// Does `target` denote the entity behind `handle`?
    pub(crate) fn points_at(&self, target: &RefTarget, handle: EntityHandle) -> bool {
        match target {
            RefTarget::Unset => false,
            RefTarget::Entity(h) => *h == handle,
            RefTarget::Id(id) => self.id_of(handle) == Some(id),
        }
    }

    /// Turn a stored row into a resident entity, reusing an existing record.
    pub(crate) fn hydrate(
        &mut self,
        meta: &Arc<EntityMetadata>,
        row: &Row,
        registry: &MetadataRegistry,
    ) -> Result<EntityHandle> {
        let id = row
            .get_by_name(meta.id_column)
            .and_then(IdValue::from_value)
            .map(|v| TaggedId::new(meta.tag, v))
            .ok_or_else(|| {
                Error::Type(TypeError {
                    expected: "id",
                    actual: format!("row of {} without a usable id", meta.table),
                    column: Some(meta.id_column.to_string()),
                })
            })?;

        let mut refs_from_row = Vec::new();
        let mut values_from_row = Vec::new();
        for field in meta.column_fields() {
            let Some(column) = field.column else {
                continue;
            };
            let Some(value) = row.get_by_name(column) else {
                continue;
            };
            match field.kind {
                FieldKind::ManyToOne { other, .. } => {
                    let target = if value.is_null() {
                        RefTarget::Unset
                    } else {
                        let other_meta = registry.get(other)?;
                        let key = IdValue::from_value(value).ok_or_else(|| {
                            Error::Type(TypeError {
                                expected: "id",
                                actual: value.type_name().to_string(),
                                column: Some(column.to_string()),
                            })
                        })?;
                        RefTarget::Id(TaggedId::new(other_meta.tag, key))
                    };
                    refs_from_row.push((field.name, value.clone(), target));
                }
                FieldKind::Primitive => values_from_row.push((field.name, value.clone())),
                FieldKind::PrimaryKey
                | FieldKind::OneToMany { .. }
                | FieldKind::OneToOne { .. }
                | FieldKind::ManyToMany { .. } => {}
            }
        }

        let handle = match self.find(&id) {
            Some(handle) => handle,
            None => self.register(EntityRecord::loaded(Arc::clone(meta), id))?,
        };

        // Decide which refs are locally unchanged before borrowing mutably.
        let ref_unchanged: Vec<bool> = {
            let record = self.get(handle);
            refs_from_row
                .iter()
                .map(|(name, _, _)| match record.refs.get(name) {
                    None => true,
                    Some(current) => match (self.ref_value(current), record.baseline.get(name)) {
                        (Some(now), Some(stored)) => same_value(&now, stored),
                        (Some(now), None) => now.is_null(),
                        (None, _) => false,
                    },
                })
                .collect()
        };

        let record = self.get_mut(handle);
        for (name, value) in values_from_row {
            let unchanged = match (record.values.get(name), record.baseline.get(name)) {
                (None, _) => true,
                (Some(now), Some(stored)) => same_value(now, stored),
                (Some(now), None) => now.is_null(),
            };
            if unchanged {
                record.values.insert(name, value.clone());
            }
            record.baseline.insert(name, value);
        }
        for ((name, value, target), unchanged) in refs_from_row.into_iter().zip(ref_unchanged) {
            if unchanged {
                record.refs.insert(name, target);
            }
            record.baseline.insert(name, value);
        }
        record.persisted = record.persisted || record.status != EntityStatus::New;
        Ok(handle)
    }
}

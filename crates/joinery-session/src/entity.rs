//! Entity records stored in the identity map.

use crate::collection::RelationCollection;
use joinery_core::{EntityMetadata, TaggedId, Value};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Stable index of an entity inside one unit of work.
///
/// Handles stay valid for the life of the unit of work whether or not the
/// entity has been assigned an id yet. They are meaningless in any other
/// unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EntityHandle(u32);

impl EntityHandle {
    pub(crate) fn from_index(index: usize) -> Self {
        Self(index as u32)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for EntityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of an entity within the unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EntityStatus {
    /// Created in this unit of work, not yet inserted.
    New,
    /// Backed by a stored row.
    Loaded,
    /// Scheduled for deletion (or already deleted by a flush).
    Deleted,
}

/// Target of a many-to-one reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefTarget {
    /// NULL foreign key.
    Unset,
    /// Points at a stored row that may not be resident.
    Id(TaggedId),
    /// Points at a resident entity, possibly one without an id yet.
    Entity(EntityHandle),
}

impl RefTarget {
    pub fn is_set(&self) -> bool {
        !matches!(self, RefTarget::Unset)
    }
}

/// One entity: current values, the stored baseline they diverged from, and
/// relation state.
#[derive(Debug)]
pub struct EntityRecord {
    pub(crate) meta: Arc<EntityMetadata>,
    pub(crate) id: Option<TaggedId>,
    pub(crate) status: EntityStatus,
    /// Whether a row for this entity currently exists in storage.
    pub(crate) persisted: bool,
    pub(crate) values: HashMap<&'static str, Value>,
    pub(crate) refs: HashMap<&'static str, RefTarget>,
    /// Last known stored column values, keyed by field name.
    pub(crate) baseline: HashMap<&'static str, Value>,
    pub(crate) collections: HashMap<&'static str, RelationCollection>,
    pub(crate) touches: u64,
    pub(crate) flushed_touches: u64,
}

impl EntityRecord {
    pub(crate) fn new_entity(meta: Arc<EntityMetadata>) -> Self {
        Self {
            meta,
            id: None,
            status: EntityStatus::New,
            persisted: false,
            values: HashMap::new(),
            refs: HashMap::new(),
            baseline: HashMap::new(),
            collections: HashMap::new(),
            touches: 0,
            flushed_touches: 0,
        }
    }

    pub(crate) fn loaded(meta: Arc<EntityMetadata>, id: TaggedId) -> Self {
        Self {
            id: Some(id),
            status: EntityStatus::Loaded,
            persisted: true,
            ..Self::new_entity(meta)
        }
    }

    pub fn meta(&self) -> &Arc<EntityMetadata> {
        &self.meta
    }

    pub fn type_name(&self) -> &'static str {
        self.meta.type_name
    }

    pub fn id(&self) -> Option<&TaggedId> {
        self.id.as_ref()
    }

    pub fn status(&self) -> EntityStatus {
        self.status
    }

    pub fn is_new(&self) -> bool {
        self.status == EntityStatus::New
    }

    pub fn is_deleted(&self) -> bool {
        self.status == EntityStatus::Deleted
    }

    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    /// Hard-deleted, or soft-deleted through the soft-delete column.
    pub fn is_deleted_or_soft_deleted(&self) -> bool {
        if self.is_deleted() {
            return true;
        }
        self.meta
            .soft_delete_field
            .and_then(|f| self.values.get(f))
            .is_some_and(|v| !v.is_null())
    }

    /// Current value of a primitive field. Unset primitives read as NULL.
    pub fn value(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    pub fn reference(&self, field: &str) -> Option<&RefTarget> {
        self.refs.get(field)
    }

    pub fn collection(&self, field: &str) -> Option<&RelationCollection> {
        self.collections.get(field)
    }

    /// Has `touch` been called since the last flush?
    pub fn is_touched(&self) -> bool {
        self.touches > self.flushed_touches
    }

    /// Stored version token, when the type has one.
    pub fn version(&self) -> Option<i64> {
        self.meta
            .version_field
            .and_then(|f| self.baseline.get(f))
            .and_then(Value::as_i64)
    }

    /// Collection state for `field`, created on first use.
    ///
    /// Collections of stored entities start unloaded; collections of entities
    /// created in this unit of work are empty and loaded.
    pub(crate) fn collection_mut(&mut self, field: &'static str) -> &mut RelationCollection {
        let persisted = self.persisted;
        self.collections.entry(field).or_insert_with(|| {
            if persisted {
                RelationCollection::unloaded()
            } else {
                RelationCollection::loaded_empty()
            }
        })
    }

    /// Mark every collection that has never been touched as loaded and empty.
    pub(crate) fn materialize_empty_collections(&mut self) {
        let fields: Vec<&'static str> = self.meta.collection_fields().map(|f| f.name).collect();
        for field in fields {
            self.collections
                .entry(field)
                .or_insert_with(RelationCollection::loaded_empty);
        }
    }

    /// Human-readable name for logs and error messages.
    pub(crate) fn describe(&self, handle: EntityHandle) -> String {
        match &self.id {
            Some(id) => id.to_string(),
            None => format!("{}{}", self.meta.type_name, handle),
        }
    }
}

/// Equality used for dirty checking: NULL equals NULL here.
pub(crate) fn same_value(a: &Value, b: &Value) -> bool {
    (a.is_null() && b.is_null()) || a.sql_eq(b) || a == b
}

#[cfg(test)]
mod tests {
    use super::*;

    fn author_meta() -> Arc<EntityMetadata> {
        Arc::new(
            EntityMetadata::new("Author", "a", "authors")
                .primitive("first_name")
                .one_to_many("books", "Book", "author")
                .version("version")
                .soft_delete("deleted_at"),
        )
    }

    #[test]
    fn new_entities_start_with_loaded_collections() {
        let mut record = EntityRecord::new_entity(author_meta());
        assert!(record.collection_mut("books").is_loaded());
    }

    #[test]
    fn stored_entities_start_with_unloaded_collections() {
        let mut record = EntityRecord::loaded(author_meta(), TaggedId::int("a", 1));
        assert!(!record.collection_mut("books").is_loaded());
        assert_eq!(record.describe(EntityHandle::from_index(0)), "a:1");
    }

    #[test]
    fn soft_delete_column_counts_as_deleted() {
        let mut record = EntityRecord::loaded(author_meta(), TaggedId::int("a", 1));
        assert!(!record.is_deleted_or_soft_deleted());
        record.values.insert("deleted_at", Value::Timestamp(5));
        assert!(record.is_deleted_or_soft_deleted());
    }

    #[test]
    fn same_value_treats_nulls_as_equal() {
        assert!(same_value(&Value::Null, &Value::Null));
        assert!(same_value(&Value::Int(1), &Value::BigInt(1)));
        assert!(!same_value(&Value::Null, &Value::BigInt(1)));
    }
}

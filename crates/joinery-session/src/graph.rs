//! The in-memory entity graph of one unit of work.
//!
//! [`EntityGraph`] owns the identity map and the join-row ledger and exposes
//! every synchronous operation: creating entities, writing fields, and
//! navigating and mutating relations. Anything that needs storage lives on
//! [`UnitOfWork`](crate::UnitOfWork), which wraps a graph.
//!
//! Relation changes are applied to both sides in the same call:
//!
//! - one-to-many and one-to-one membership is driven by the child's
//!   many-to-one reference; moving a child removes it from its previous
//!   owner's collection whether or not that collection was loaded
//! - many-to-many membership is mirrored on the reciprocal collection with an
//!   explicit `reciprocal` flag and recorded in the ledger once per change

use crate::change_tracker::{EntityChanges, changes_of};
use crate::collection::CollectionState;
use crate::entity::{EntityHandle, EntityRecord, EntityStatus, RefTarget};
use crate::identity_map::IdentityMap;
use crate::join_rows::JoinRowLedger;
use joinery_core::{
    EntityMetadata, Error, FieldKind, FieldMeta, IdValue, MetadataRegistry, NotLoadedError,
    Result, Row, TaggedId, Value,
};
use serde::Serialize;
use std::sync::Arc;

/// Counts of pending writes, as a flush would see them right now.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PendingCounts {
    pub inserts: usize,
    pub updates: usize,
    pub deletes: usize,
    pub join_inserts: usize,
    pub join_deletes: usize,
}

impl PendingCounts {
    pub fn total(&self) -> usize {
        self.inserts + self.updates + self.deletes + self.join_inserts + self.join_deletes
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// A validated write produced by `create` / `set_fields`.
enum FieldWrite {
    Id(TaggedId),
    Value(&'static str, Value),
    Reference(FieldMeta, Option<TaggedId>),
}

/// Entities, relation state and join rows of one unit of work.
#[derive(Debug)]
pub struct EntityGraph {
    registry: Arc<MetadataRegistry>,
    pub(crate) map: IdentityMap,
    pub(crate) ledger: JoinRowLedger,
    pub(crate) pending_cascades: Vec<EntityHandle>,
}

impl EntityGraph {
    pub fn new(registry: Arc<MetadataRegistry>) -> Self {
        Self {
            registry,
            map: IdentityMap::new(),
            ledger: JoinRowLedger::new(),
            pending_cascades: Vec::new(),
        }
    }

    pub fn registry(&self) -> &Arc<MetadataRegistry> {
        &self.registry
    }

    pub fn identity_map(&self) -> &IdentityMap {
        &self.map
    }

    pub fn ledger(&self) -> &JoinRowLedger {
        &self.ledger
    }

    pub fn entity(&self, handle: EntityHandle) -> &EntityRecord {
        self.map.get(handle)
    }

    pub fn find(&self, id: &TaggedId) -> Option<EntityHandle> {
        self.map.find(id)
    }

    pub fn all_of(&self, type_name: &str) -> &[EntityHandle] {
        self.map.all_of(type_name)
    }

    /// Turn a stored row of `meta`'s table into a resident entity.
    pub(crate) fn hydrate(&mut self, meta: &Arc<EntityMetadata>, row: &Row) -> Result<EntityHandle> {
        self.map.hydrate(meta, row, &self.registry)
    }

    /// Id of an entity rendered as `"tag:key"`, or `Type#n` before it has one.
    pub fn describe(&self, handle: EntityHandle) -> String {
        self.map.get(handle).describe(handle)
    }

    /// Whether storage may hold a join row for the pair that the ledger has
    /// not seen. A loaded side has already reconciled every stored row.
    fn pair_maybe_stored(
        &self,
        owner: EntityHandle,
        field: &str,
        other: EntityHandle,
        back: &str,
    ) -> bool {
        self.map.get(owner).is_persisted()
            && self.map.get(other).is_persisted()
            && !self.is_loaded(owner, field)
            && !self.is_loaded(other, back)
    }

    fn meta_of(&self, handle: EntityHandle) -> Arc<EntityMetadata> {
        Arc::clone(self.map.get(handle).meta())
    }

    fn field_of(&self, handle: EntityHandle, name: &str) -> Result<FieldMeta> {
        self.map.get(handle).meta().require_field(name).copied()
    }

    fn collection_field(&self, handle: EntityHandle, name: &str) -> Result<FieldMeta> {
        let field = self.field_of(handle, name)?;
        if !field.is_collection() {
            return Err(Error::config(format!(
                "{}.{} is not a collection",
                self.map.get(handle).type_name(),
                field.name
            )));
        }
        Ok(field)
    }

    /// The field on the other side of a relation.
    pub(crate) fn reciprocal_field(&self, handle: EntityHandle, field: &FieldMeta) -> Result<FieldMeta> {
        let meta = self.meta_of(handle);
        let (_, back) = self.registry.reciprocal_of(&meta, field)?;
        Ok(*back)
    }

    fn check_type(&self, field: &FieldMeta, other: EntityHandle) -> Result<()> {
        let actual = self.map.get(other).type_name();
        match field.other_type() {
            Some(expected) if expected == actual => Ok(()),
            Some(expected) => Err(Error::WrongEntityType {
                field: field.name,
                expected,
                actual,
            }),
            None => Err(Error::config(format!("{} is not a relation", field.name))),
        }
    }

    // ------------------------------------------------------------------
    // Entity factory and field access
    // ------------------------------------------------------------------

    /// Create a new entity of `type_name` with initial field values.
    ///
    /// Many-to-one fields take a tagged id string, a bare integer key, or
    /// NULL. Every name and id is validated before anything is created.
    pub fn create<'f, I>(&mut self, type_name: &str, fields: I) -> Result<EntityHandle>
    where
        I: IntoIterator<Item = (&'f str, Value)>,
    {
        let meta = Arc::clone(self.registry.get(type_name)?);
        let writes = self.prepare_writes(&meta, None, fields)?;
        let mut record = EntityRecord::new_entity(Arc::clone(&meta));
        for write in &writes {
            if let FieldWrite::Id(id) = write {
                record.id = Some(id.clone());
            }
        }
        let handle = self.map.register(record)?;
        self.apply_writes(handle, writes)?;
        tracing::debug!(entity = meta.type_name, handle = %handle, "Created entity");
        Ok(handle)
    }

    /// Write several fields at once. Nothing is written unless every field is valid.
    pub fn set_fields<'f, I>(&mut self, handle: EntityHandle, fields: I) -> Result<()>
    where
        I: IntoIterator<Item = (&'f str, Value)>,
    {
        let meta = self.meta_of(handle);
        let writes = self.prepare_writes(&meta, Some(handle), fields)?;
        self.apply_writes(handle, writes)
    }

    pub fn set_field(&mut self, handle: EntityHandle, name: &str, value: impl Into<Value>) -> Result<()> {
        self.set_fields(handle, [(name, value.into())])
    }

    /// Current value of a column-backed field. Unset fields read as NULL.
    pub fn get_field(&self, handle: EntityHandle, name: &str) -> Result<Value> {
        let record = self.map.get(handle);
        let field = record.meta().require_field(name)?;
        Ok(match field.kind {
            FieldKind::PrimaryKey => record.id().map_or(Value::Null, TaggedId::to_value),
            FieldKind::Primitive => record.value(field.name).cloned().unwrap_or(Value::Null),
            FieldKind::ManyToOne { .. } => record
                .reference(field.name)
                .and_then(|t| self.map.ref_value(t))
                .unwrap_or(Value::Null),
            FieldKind::OneToMany { .. } | FieldKind::OneToOne { .. } | FieldKind::ManyToMany { .. } => {
                return Err(Error::config(format!(
                    "{}.{} is a collection",
                    record.type_name(),
                    field.name
                )));
            }
        })
    }

    fn prepare_writes<'f, I>(
        &self,
        meta: &EntityMetadata,
        existing: Option<EntityHandle>,
        fields: I,
    ) -> Result<Vec<FieldWrite>>
    where
        I: IntoIterator<Item = (&'f str, Value)>,
    {
        let mut writes = Vec::new();
        for (name, value) in fields {
            let field = *meta.require_field(name)?;
            match field.kind {
                FieldKind::PrimaryKey => {
                    let id = match &value {
                        Value::Text(raw) => self.registry.parse_id_for(meta.type_name, raw)?,
                        other => IdValue::from_value(other)
                            .map(|v| TaggedId::new(meta.tag, v))
                            .ok_or_else(|| Error::InvalidId(other.render()))?,
                    };
                    if let Some(h) = existing {
                        if self.map.id_of(h) != Some(&id) {
                            return Err(Error::config(format!(
                                "id of {} cannot change",
                                self.describe(h)
                            )));
                        }
                        continue;
                    }
                    if self.map.find(&id).is_some() {
                        return Err(Error::config(format!("{} already exists", id)));
                    }
                    writes.push(FieldWrite::Id(id));
                }
                FieldKind::Primitive => writes.push(FieldWrite::Value(field.name, value)),
                FieldKind::ManyToOne { other, .. } => {
                    let target = match &value {
                        Value::Null => None,
                        Value::Text(raw) => Some(self.registry.parse_id_for(other, raw)?),
                        Value::Int(_) | Value::BigInt(_) => {
                            let tag = self.registry.get(other)?.tag;
                            IdValue::from_value(&value).map(|v| TaggedId::new(tag, v))
                        }
                        other_value => return Err(Error::InvalidId(other_value.render())),
                    };
                    writes.push(FieldWrite::Reference(field, target));
                }
                FieldKind::OneToMany { .. } | FieldKind::OneToOne { .. } | FieldKind::ManyToMany { .. } => {
                    return Err(Error::config(format!(
                        "{}.{} is a collection; use set() instead",
                        meta.type_name, field.name
                    )));
                }
            }
        }
        Ok(writes)
    }

    fn apply_writes(&mut self, handle: EntityHandle, writes: Vec<FieldWrite>) -> Result<()> {
        for write in writes {
            match write {
                FieldWrite::Id(_) => {}
                FieldWrite::Value(name, value) => {
                    self.map.get_mut(handle).values.insert(name, value);
                }
                FieldWrite::Reference(field, target) => {
                    let target = match target {
                        None => RefTarget::Unset,
                        Some(id) => match self.map.find(&id) {
                            Some(h) => RefTarget::Entity(h),
                            None => RefTarget::Id(id),
                        },
                    };
                    self.set_reference_inner(handle, field, target, None)?;
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Many-to-one references
    // ------------------------------------------------------------------

    pub fn reference(&self, handle: EntityHandle, name: &str) -> Result<RefTarget> {
        let field = self.field_of(handle, name)?;
        if !field.is_reference() {
            return Err(Error::config(format!("{} is not a reference", field.name)));
        }
        Ok(self
            .map
            .get(handle)
            .reference(field.name)
            .cloned()
            .unwrap_or(RefTarget::Unset))
    }

    /// Point a many-to-one reference at `target`, keeping both owners'
    /// collections in step.
    pub fn set_reference(
        &mut self,
        handle: EntityHandle,
        name: &str,
        target: Option<EntityHandle>,
    ) -> Result<()> {
        let field = self.field_of(handle, name)?;
        if !field.is_reference() {
            return Err(Error::config(format!("{} is not a reference", field.name)));
        }
        if let Some(t) = target {
            self.check_type(&field, t)?;
        }
        let target = target.map_or(RefTarget::Unset, RefTarget::Entity);
        self.set_reference_inner(handle, field, target, None)
    }

    fn same_target(&self, a: &RefTarget, b: &RefTarget) -> bool {
        match (self.map.resolve(a), self.map.resolve(b)) {
            (Some(x), Some(y)) => x == y,
            (None, None) => a == b,
            _ => false,
        }
    }

    /// Repoint `child.field`. `from_owner` is the owner whose collection the
    /// caller is already updating; it is left alone.
    fn set_reference_inner(
        &mut self,
        child: EntityHandle,
        field: FieldMeta,
        target: RefTarget,
        from_owner: Option<EntityHandle>,
    ) -> Result<()> {
        let back = self.reciprocal_field(child, &field)?;
        let old = self
            .map
            .get(child)
            .reference(field.name)
            .cloned()
            .unwrap_or(RefTarget::Unset);
        if self.same_target(&old, &target) {
            return Ok(());
        }
        let old_owner = self.map.resolve(&old);
        let new_owner = self.map.resolve(&target);
        self.map.get_mut(child).refs.insert(field.name, target);

        if let Some(prev) = old_owner.filter(|o| Some(*o) != from_owner) {
            self.collection_remove_local(prev, back.name, child);
        }
        if let Some(next) = new_owner.filter(|o| Some(*o) != from_owner) {
            if matches!(back.kind, FieldKind::OneToOne { .. }) {
                self.displace_one_to_one(next, back, child)?;
            }
            self.collection_add_local(next, back.name, child);
        }
        Ok(())
    }

    /// Detach whatever currently occupies a one-to-one slot on `owner`.
    fn displace_one_to_one(
        &mut self,
        owner: EntityHandle,
        field: FieldMeta,
        incoming: EntityHandle,
    ) -> Result<()> {
        let occupants: Vec<EntityHandle> = self
            .map
            .get(owner)
            .collection(field.name)
            .and_then(|c| c.members())
            .map(|m| m.iter().copied().filter(|h| *h != incoming).collect())
            .unwrap_or_default();
        if occupants.is_empty() {
            return Ok(());
        }
        let child_field = self.reciprocal_field(owner, &field)?;
        for occupant in occupants {
            let points_here = self
                .map
                .get(occupant)
                .reference(child_field.name)
                .is_some_and(|t| self.map.points_at(t, owner));
            if points_here {
                self.set_reference_inner(occupant, child_field, RefTarget::Unset, Some(owner))?;
            }
            self.collection_remove_local(owner, field.name, occupant);
        }
        Ok(())
    }

    fn collection_add_local(&mut self, owner: EntityHandle, field: &'static str, other: EntityHandle) -> bool {
        let collection = self.map.get_mut(owner).collection_mut(field);
        let changed = collection.local_add(other);
        if changed {
            collection.record_add(other);
        }
        changed
    }

    fn collection_remove_local(&mut self, owner: EntityHandle, field: &'static str, other: EntityHandle) -> bool {
        let collection = self.map.get_mut(owner).collection_mut(field);
        let changed = collection.local_remove(other);
        if changed {
            collection.record_remove(other);
        }
        changed
    }

    // ------------------------------------------------------------------
    // Collections
    // ------------------------------------------------------------------

    /// Add `other` to `owner.field` and update the reciprocal side.
    ///
    /// Adding a current member is a no-op.
    pub fn add(&mut self, owner: EntityHandle, field: &str, other: EntityHandle) -> Result<()> {
        let field = self.collection_field(owner, field)?;
        self.check_type(&field, other)?;
        self.add_inner(owner, field, other, false)
    }

    /// Remove `other` from `owner.field` and update the reciprocal side.
    ///
    /// Removing a non-member of a loaded collection is a no-op.
    pub fn remove(&mut self, owner: EntityHandle, field: &str, other: EntityHandle) -> Result<()> {
        let field = self.collection_field(owner, field)?;
        self.check_type(&field, other)?;
        self.remove_inner(owner, field, other, false)
    }

    pub(crate) fn add_inner(
        &mut self,
        owner: EntityHandle,
        field: FieldMeta,
        other: EntityHandle,
        reciprocal: bool,
    ) -> Result<()> {
        match field.kind {
            FieldKind::OneToMany { .. } | FieldKind::OneToOne { .. } => {
                if matches!(field.kind, FieldKind::OneToOne { .. }) {
                    self.displace_one_to_one(owner, field, other)?;
                }
                if !reciprocal {
                    let back = self.reciprocal_field(owner, &field)?;
                    self.set_reference_inner(other, back, RefTarget::Entity(owner), Some(owner))?;
                }
                self.collection_add_local(owner, field.name, other);
                Ok(())
            }
            FieldKind::ManyToMany { link, .. } => {
                let changed = self.collection_add_local(owner, field.name, other);
                if changed && !reciprocal {
                    let back = self.reciprocal_field(owner, &field)?;
                    self.add_inner(other, back, owner, true)?;
                    self.ledger.add_new(link, owner, other);
                }
                Ok(())
            }
            FieldKind::PrimaryKey | FieldKind::Primitive | FieldKind::ManyToOne { .. } => Err(
                Error::config(format!("{} is not a collection", field.name)),
            ),
        }
    }

    pub(crate) fn remove_inner(
        &mut self,
        owner: EntityHandle,
        field: FieldMeta,
        other: EntityHandle,
        reciprocal: bool,
    ) -> Result<()> {
        match field.kind {
            FieldKind::OneToMany { .. } | FieldKind::OneToOne { .. } => {
                if !reciprocal {
                    let back = self.reciprocal_field(owner, &field)?;
                    let points_here = self
                        .map
                        .get(other)
                        .reference(back.name)
                        .is_some_and(|t| self.map.points_at(t, owner));
                    if points_here {
                        self.set_reference_inner(other, back, RefTarget::Unset, Some(owner))?;
                    }
                }
                self.collection_remove_local(owner, field.name, other);
                Ok(())
            }
            FieldKind::ManyToMany { link, .. } => {
                let changed = self.collection_remove_local(owner, field.name, other);
                if changed && !reciprocal {
                    let back = self.reciprocal_field(owner, &field)?;
                    self.remove_inner(other, back, owner, true)?;
                    let maybe_stored = self.pair_maybe_stored(owner, field.name, other, back.name);
                    self.ledger.add_remove(link, owner, other, maybe_stored);
                }
                Ok(())
            }
            FieldKind::PrimaryKey | FieldKind::Primitive | FieldKind::ManyToOne { .. } => Err(
                Error::config(format!("{} is not a collection", field.name)),
            ),
        }
    }

    /// Replace the membership of `owner.field`.
    ///
    /// On a loaded collection only the difference is applied. On an unloaded
    /// one the values become a pending set that supersedes earlier adds and
    /// removes and is diffed against storage when the collection loads.
    pub fn set(&mut self, owner: EntityHandle, field: &str, values: &[EntityHandle]) -> Result<()> {
        let field = self.collection_field(owner, field)?;
        let mut wanted: Vec<EntityHandle> = Vec::with_capacity(values.len());
        for v in values {
            self.check_type(&field, *v)?;
            if !wanted.contains(v) {
                wanted.push(*v);
            }
        }
        if matches!(field.kind, FieldKind::OneToOne { .. }) && wanted.len() > 1 {
            return Err(Error::config(format!(
                "{} holds at most one entity",
                field.name
            )));
        }

        let state = self.map.get_mut(owner).collection_mut(field.name).state().clone();
        match state {
            CollectionState::Loaded(current) => {
                for m in current.iter().filter(|m| !wanted.contains(m)) {
                    self.remove_inner(owner, field, *m, false)?;
                }
                for v in wanted.iter().filter(|v| !current.contains(v)) {
                    self.add_inner(owner, field, *v, false)?;
                }
                Ok(())
            }
            CollectionState::Unloaded { added, .. } => {
                self.set_pending(owner, field, &added, true, wanted)
            }
            CollectionState::PendingSet(previous) => {
                self.set_pending(owner, field, &previous, false, wanted)
            }
        }
    }

    fn set_pending(
        &mut self,
        owner: EntityHandle,
        field: FieldMeta,
        provisional: &[EntityHandle],
        in_ledger: bool,
        wanted: Vec<EntityHandle>,
    ) -> Result<()> {
        let back = self.reciprocal_field(owner, &field)?;
        for m in provisional.iter().filter(|m| !wanted.contains(m)) {
            match field.kind {
                FieldKind::ManyToMany { link, .. } => {
                    self.collection_remove_local(*m, back.name, owner);
                    if in_ledger {
                        let maybe_stored = self.pair_maybe_stored(owner, field.name, *m, back.name);
                        self.ledger.add_remove(link, owner, *m, maybe_stored);
                    }
                }
                _ => {
                    let points_here = self
                        .map
                        .get(*m)
                        .reference(back.name)
                        .is_some_and(|t| self.map.points_at(t, owner));
                    if points_here {
                        self.set_reference_inner(*m, back, RefTarget::Unset, Some(owner))?;
                    }
                }
            }
            self.map.get_mut(owner).collection_mut(field.name).record_remove(*m);
        }

        self.map
            .get_mut(owner)
            .collection_mut(field.name)
            .set_pending(wanted.clone());
        for v in &wanted {
            match field.kind {
                FieldKind::ManyToMany { .. } => {
                    self.collection_add_local(*v, back.name, owner);
                }
                _ => self.set_reference_inner(*v, back, RefTarget::Entity(owner), Some(owner))?,
            }
        }
        self.ledger.mark_pending_set(owner, field.name);
        tracing::debug!(
            owner = %self.describe(owner),
            field = field.name,
            members = wanted.len(),
            "Stored pending set"
        );
        Ok(())
    }

    /// Members of a loaded collection, without deleted entities.
    pub fn get(&self, owner: EntityHandle, field: &str) -> Result<Vec<EntityHandle>> {
        Ok(self
            .get_with_deleted(owner, field)?
            .into_iter()
            .filter(|h| !self.map.get(*h).is_deleted_or_soft_deleted())
            .collect())
    }

    /// Members of a loaded collection, deleted entities included.
    pub fn get_with_deleted(&self, owner: EntityHandle, field: &str) -> Result<Vec<EntityHandle>> {
        let field = self.collection_field(owner, field)?;
        let record = self.map.get(owner);
        match record.collection(field.name) {
            Some(c) => c.members().map(<[EntityHandle]>::to_vec).ok_or_else(|| {
                Error::NotLoaded(NotLoadedError {
                    entity: record.describe(owner),
                    field: field.name,
                })
            }),
            None if !record.is_persisted() => Ok(Vec::new()),
            None => Err(Error::NotLoaded(NotLoadedError {
                entity: record.describe(owner),
                field: field.name,
            })),
        }
    }

    pub fn is_loaded(&self, owner: EntityHandle, field: &str) -> bool {
        let record = self.map.get(owner);
        match record.collection(field) {
            Some(c) => c.members().is_some(),
            None => !record.is_persisted(),
        }
    }

    /// Membership answer without storage; `None` when storage must be asked.
    pub fn includes_known(&self, owner: EntityHandle, field: &str, other: EntityHandle) -> Result<Option<bool>> {
        let field = self.collection_field(owner, field)?;
        self.check_type(&field, other)?;
        let owner_record = self.map.get(owner);
        if !owner_record.is_persisted() || !self.map.get(other).is_persisted() {
            if let Some(c) = owner_record.collection(field.name) {
                if let Some(known) = c.contains_known(other) {
                    return Ok(Some(known));
                }
            }
            return Ok(Some(false));
        }
        if let Some(known) = owner_record
            .collection(field.name)
            .and_then(|c| c.contains_known(other))
        {
            return Ok(Some(known));
        }
        if let FieldKind::OneToMany { .. } | FieldKind::OneToOne { .. } = field.kind {
            let back = self.reciprocal_field(owner, &field)?;
            if let Some(target) = self.map.get(other).reference(back.name) {
                return Ok(Some(self.map.points_at(target, owner)));
            }
        }
        Ok(None)
    }

    /// Remove every member of a loaded collection.
    pub fn remove_all(&mut self, owner: EntityHandle, field: &str) -> Result<()> {
        let members = self.get_with_deleted(owner, field)?;
        let field = self.collection_field(owner, field)?;
        for m in members {
            self.remove_inner(owner, field, m, false)?;
        }
        Ok(())
    }

    /// Fold a freshly fetched baseline into `owner.field`.
    pub(crate) fn apply_loaded(
        &mut self,
        owner: EntityHandle,
        field: FieldMeta,
        baseline: Vec<EntityHandle>,
    ) -> Result<()> {
        let pending = self
            .map
            .get_mut(owner)
            .collection_mut(field.name)
            .merge_loaded(baseline.clone());
        if let Some(values) = pending {
            self.ledger.clear_pending_set(owner, field.name);
            for m in baseline.iter().filter(|m| !values.contains(m)) {
                self.remove_inner(owner, field, *m, false)?;
            }
            for v in &values {
                if !baseline.contains(v) {
                    self.add_inner(owner, field, *v, false)?;
                } else if let FieldKind::ManyToMany { link, .. } = field.kind {
                    self.ledger.add_new(link, owner, *v);
                }
            }
            self.map
                .get_mut(owner)
                .collection_mut(field.name)
                .replace_loaded(values);
            tracing::debug!(
                owner = %self.describe(owner),
                field = field.name,
                "Resolved pending set against storage"
            );
        }
        if matches!(field.kind, FieldKind::OneToOne { .. }) {
            let members = self
                .map
                .get(owner)
                .collection(field.name)
                .and_then(|c| c.members())
                .map(<[EntityHandle]>::to_vec)
                .unwrap_or_default();
            if let Some(keep) = members.first() {
                self.displace_one_to_one(owner, field, *keep)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Schedule an entity for deletion. Its relations are cascaded or
    /// detached before the next flush pass.
    pub fn delete(&mut self, handle: EntityHandle) {
        if self.map.delete(handle) {
            tracing::debug!(entity = %self.describe(handle), "Marked entity deleted");
            self.pending_cascades.push(handle);
        }
    }

    /// Mark an entity dirty without changing a field.
    pub fn touch(&mut self, handle: EntityHandle) {
        self.map.get_mut(handle).touches += 1;
    }

    pub(crate) fn take_pending_cascades(&mut self) -> Vec<EntityHandle> {
        std::mem::take(&mut self.pending_cascades)
    }

    /// Collection fields of `handle` that must be loaded before it can be cascaded.
    pub(crate) fn unloaded_collections(&self, handle: EntityHandle) -> Vec<FieldMeta> {
        let record = self.map.get(handle);
        record
            .meta()
            .collection_fields()
            .filter(|f| !self.is_loaded(handle, f.name))
            .copied()
            .collect()
    }

    /// Delete or detach the members of every collection of a deleted entity.
    ///
    /// All collections must be loaded.
    pub(crate) fn cascade_delete(&mut self, handle: EntityHandle) -> Result<()> {
        let meta = self.meta_of(handle);
        for field in meta.collection_fields().copied() {
            let members = self.get_with_deleted(handle, field.name)?;
            match field.kind {
                FieldKind::OneToMany { cascade_delete, .. }
                | FieldKind::OneToOne { cascade_delete, .. } => {
                    if cascade_delete {
                        for m in members {
                            self.delete(m);
                        }
                        continue;
                    }
                    let back = self.reciprocal_field(handle, &field)?;
                    for m in members {
                        if self.map.get(m).is_deleted() {
                            continue;
                        }
                        let points_here = self
                            .map
                            .get(m)
                            .reference(back.name)
                            .is_some_and(|t| self.map.points_at(t, handle));
                        if points_here {
                            self.set_reference_inner(m, back, RefTarget::Unset, None)?;
                        }
                    }
                }
                FieldKind::ManyToMany { .. } => {
                    for m in members {
                        self.remove_inner(handle, field, m, false)?;
                    }
                }
                FieldKind::PrimaryKey | FieldKind::Primitive | FieldKind::ManyToOne { .. } => {}
            }
        }
        tracing::trace!(entity = %self.describe(handle), "Cascaded delete");
        Ok(())
    }

    /// Copy an entity. Listed one-to-many fields are deep-copied; nested
    /// paths use dots (`"books.reviews"`).
    pub fn clone_entity(&mut self, source: EntityHandle, deep: &[&str]) -> Result<EntityHandle> {
        self.validate_clone(source, deep)?;
        self.clone_inner(source, deep)
    }

    fn validate_clone(&self, source: EntityHandle, deep: &[&str]) -> Result<()> {
        let meta = self.meta_of(source);
        for path in deep {
            let (head, rest) = match path.split_once('.') {
                Some((head, rest)) => (head, Some(rest)),
                None => (*path, None),
            };
            let field = meta.require_field(head)?;
            match field.kind {
                FieldKind::ManyToMany { .. } => {
                    return Err(Error::UncloneableRelation {
                        entity: meta.type_name,
                        field: field.name.to_string(),
                    });
                }
                FieldKind::OneToMany { .. } | FieldKind::OneToOne { .. } => {
                    let members = self.get_with_deleted(source, field.name)?;
                    if let Some(rest) = rest {
                        for m in members {
                            self.validate_clone(m, &[rest])?;
                        }
                    }
                }
                FieldKind::PrimaryKey | FieldKind::Primitive | FieldKind::ManyToOne { .. } => {
                    return Err(Error::config(format!(
                        "{}.{} is not a collection and cannot be deep-cloned",
                        meta.type_name, field.name
                    )));
                }
            }
        }
        Ok(())
    }

    fn clone_inner(&mut self, source: EntityHandle, deep: &[&str]) -> Result<EntityHandle> {
        let meta = self.meta_of(source);
        let copy = self.map.register(EntityRecord::new_entity(Arc::clone(&meta)))?;
        for field in meta.column_fields().copied() {
            if Some(field.name) == meta.version_field {
                continue;
            }
            match field.kind {
                FieldKind::Primitive => {
                    if let Some(v) = self.map.get(source).value(field.name).cloned() {
                        self.map.get_mut(copy).values.insert(field.name, v);
                    }
                }
                FieldKind::ManyToOne { .. } => {
                    if let Some(target) = self.map.get(source).reference(field.name).cloned() {
                        self.set_reference_inner(copy, field, target, None)?;
                    }
                }
                _ => {}
            }
        }

        for path in deep {
            let (head, rest) = match path.split_once('.') {
                Some((head, rest)) => (head, vec![rest]),
                None => (*path, Vec::new()),
            };
            let field = *meta.require_field(head)?;
            let back = self.reciprocal_field(source, &field)?;
            for child in self.get(source, field.name)? {
                let child_copy = self.clone_inner(child, &rest)?;
                self.set_reference_inner(child_copy, back, RefTarget::Entity(copy), None)?;
            }
        }
        tracing::debug!(
            source = %self.describe(source),
            copy = %copy,
            "Cloned entity"
        );
        Ok(copy)
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    /// Field and collection changes since load or the last flush.
    pub fn changes(&self, handle: EntityHandle) -> EntityChanges {
        changes_of(&self.map, self.map.get(handle))
    }

    /// Would a flush write this entity?
    pub fn is_dirty(&self, handle: EntityHandle) -> bool {
        let record = self.map.get(handle);
        match record.status() {
            EntityStatus::New => true,
            EntityStatus::Deleted => record.is_persisted(),
            EntityStatus::Loaded => {
                record.is_touched() || !self.changes(handle).changed_fields().is_empty()
            }
        }
    }

    pub fn pending_counts(&self) -> PendingCounts {
        let mut counts = PendingCounts::default();
        for h in self.map.handles() {
            let record = self.map.get(h);
            match record.status() {
                EntityStatus::New => counts.inserts += 1,
                EntityStatus::Deleted if record.is_persisted() => counts.deletes += 1,
                EntityStatus::Deleted => {}
                EntityStatus::Loaded if self.is_dirty(h) => counts.updates += 1,
                EntityStatus::Loaded => {}
            }
        }
        for todo in self.ledger.todos() {
            counts.join_inserts += todo.new_rows.len();
            counts.join_deletes += todo.deleted_rows.len();
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::library;
    use joinery_core::LinkTableInfo;

    fn stored(graph: &mut EntityGraph, type_name: &str, row: Row) -> EntityHandle {
        let meta = Arc::clone(graph.registry().get(type_name).unwrap());
        let registry = Arc::clone(graph.registry());
        graph.map.hydrate(&meta, &row, &registry).unwrap()
    }

    fn stored_author(graph: &mut EntityGraph, id: i64) -> EntityHandle {
        stored(
            graph,
            "Author",
            Row::from_pairs([("id", Value::BigInt(id)), ("first_name", Value::from("a"))]),
        )
    }

    fn stored_book(graph: &mut EntityGraph, id: i64, author: i64) -> EntityHandle {
        stored(
            graph,
            "Book",
            Row::from_pairs([
                ("id", Value::BigInt(id)),
                ("title", Value::from("t")),
                ("author_id", Value::BigInt(author)),
            ]),
        )
    }

    #[test]
    fn add_is_visible_from_both_sides() {
        let mut graph = EntityGraph::new(library());
        let author = graph.create("Author", []).unwrap();
        let book = graph.create("Book", []).unwrap();
        graph.add(author, "books", book).unwrap();
        assert_eq!(graph.get(author, "books").unwrap(), vec![book]);
        assert_eq!(graph.reference(book, "author").unwrap(), RefTarget::Entity(author));

        let tag = graph.create("Tag", []).unwrap();
        graph.add(author, "tags", tag).unwrap();
        assert_eq!(graph.includes_known(tag, "authors", author).unwrap(), Some(true));
        graph.remove(tag, "authors", author).unwrap();
        assert_eq!(graph.includes_known(author, "tags", tag).unwrap(), Some(false));
    }

    #[test]
    fn add_twice_keeps_one_member() {
        let mut graph = EntityGraph::new(library());
        let author = graph.create("Author", []).unwrap();
        let tag = graph.create("Tag", []).unwrap();
        graph.add(author, "tags", tag).unwrap();
        graph.add(author, "tags", tag).unwrap();
        assert_eq!(graph.get(author, "tags").unwrap().len(), 1);
        assert_eq!(graph.get(tag, "authors").unwrap().len(), 1);
        graph.remove(author, "tags", tag).unwrap();
        graph.remove(author, "tags", tag).unwrap();
        assert!(graph.get(author, "tags").unwrap().is_empty());
    }

    #[test]
    fn add_then_remove_leaves_no_join_rows() {
        let mut graph = EntityGraph::new(library());
        let author = stored_author(&mut graph, 1);
        let tag = graph.create("Tag", []).unwrap();
        graph.add(author, "tags", tag).unwrap();
        graph.remove(author, "tags", tag).unwrap();
        assert!(graph.ledger().todos().is_empty());
    }

    #[test]
    fn adding_to_unloaded_collection_is_tracked() {
        let mut graph = EntityGraph::new(library());
        let author = stored_author(&mut graph, 1);
        let book = graph.create("Book", [("title", Value::from("New"))]).unwrap();
        graph.add(author, "books", book).unwrap();
        let changes = graph.changes(author).collection("books");
        assert_eq!(changes.added, vec![book]);
        assert!(changes.has_updated());
        assert!(graph.get(author, "books").unwrap_err().is_not_loaded());
    }

    #[test]
    fn reparenting_removes_from_previous_owner() {
        let mut graph = EntityGraph::new(library());
        let a1 = stored_author(&mut graph, 1);
        let a2 = stored_author(&mut graph, 2);
        let b1 = stored_book(&mut graph, 10, 1);
        graph.map.get_mut(a1).collection_mut("books").merge_loaded(vec![b1]);
        graph.add(a2, "books", b1).unwrap();
        assert!(graph.map.points_at(&graph.reference(b1, "author").unwrap(), a2));
        assert!(graph.get(a1, "books").unwrap().is_empty());
        assert_eq!(graph.changes(a1).collection("books").removed, vec![b1]);
    }

    #[test]
    fn reparenting_with_unloaded_previous_owner_records_removal() {
        let mut graph = EntityGraph::new(library());
        let a1 = stored_author(&mut graph, 1);
        let a2 = stored_author(&mut graph, 2);
        let b1 = stored_book(&mut graph, 10, 1);
        graph.add(a2, "books", b1).unwrap();
        assert_eq!(graph.includes_known(a1, "books", b1).unwrap(), Some(false));
        assert_eq!(graph.includes_known(a2, "books", b1).unwrap(), Some(true));
    }

    #[test]
    fn one_to_one_add_replaces_member() {
        let mut graph = EntityGraph::new(library());
        let author = graph.create("Author", []).unwrap();
        let first = graph.create("Image", []).unwrap();
        let second = graph.create("Image", []).unwrap();
        graph.add(author, "image", first).unwrap();
        graph.add(author, "image", second).unwrap();
        assert_eq!(graph.get(author, "image").unwrap(), vec![second]);
        assert_eq!(graph.reference(first, "author").unwrap(), RefTarget::Unset);
    }

    #[test]
    fn set_on_loaded_collection_applies_difference() {
        let mut graph = EntityGraph::new(library());
        let author = graph.create("Author", []).unwrap();
        let (t1, t2, t3) = (
            graph.create("Tag", []).unwrap(),
            graph.create("Tag", []).unwrap(),
            graph.create("Tag", []).unwrap(),
        );
        graph.add(author, "tags", t1).unwrap();
        graph.add(author, "tags", t2).unwrap();
        graph.set(author, "tags", &[t2, t3]).unwrap();
        assert_eq!(graph.get(author, "tags").unwrap(), vec![t2, t3]);
        assert!(graph.get(t1, "authors").unwrap().is_empty());
    }

    #[test]
    fn pending_set_resolves_against_baseline() {
        let mut graph = EntityGraph::new(library());
        let author = stored_author(&mut graph, 1);
        let x = stored(&mut graph, "Tag", Row::from_pairs([("id", Value::BigInt(1))]));
        let y = stored(&mut graph, "Tag", Row::from_pairs([("id", Value::BigInt(2))]));
        let w = stored(&mut graph, "Tag", Row::from_pairs([("id", Value::BigInt(3))]));
        graph.set(author, "tags", &[x, y]).unwrap();
        assert_eq!(graph.get(author, "tags").unwrap(), vec![x, y]);
        assert!(graph.ledger().has_pending_sets());

        // storage holds {y, w}
        let link = LinkTableInfo::new("authors_to_tags", "author_id", "tag_id");
        graph.ledger.add_existing(link, Some(100), author, y);
        graph.ledger.add_existing(link, Some(101), author, w);
        let field = graph.field_of(author, "tags").unwrap();
        graph.apply_loaded(author, field, vec![y, w]).unwrap();

        assert_eq!(graph.get(author, "tags").unwrap(), vec![x, y]);
        assert!(!graph.ledger().has_pending_sets());
        let todos = graph.ledger().todos();
        assert_eq!(todos.len(), 1);
        assert_eq!(todos[0].new_rows.len(), 1);
        assert_eq!(todos[0].new_rows[0].members(), [author, x]);
        assert_eq!(todos[0].deleted_rows.len(), 1);
        assert_eq!(todos[0].deleted_rows[0].id(), Some(101));
    }

    #[test]
    fn deleted_members_are_filtered_by_get() {
        let mut graph = EntityGraph::new(library());
        let author = graph.create("Author", []).unwrap();
        let book = graph.create("Book", []).unwrap();
        graph.add(author, "books", book).unwrap();
        graph.delete(book);
        assert!(graph.get(author, "books").unwrap().is_empty());
        assert_eq!(graph.get_with_deleted(author, "books").unwrap(), vec![book]);
    }

    #[test]
    fn create_validates_before_writing() {
        let mut graph = EntityGraph::new(library());
        let err = graph
            .create("Book", [("title", Value::from("x")), ("nope", Value::Null)])
            .unwrap_err();
        assert!(matches!(err, Error::UnknownField { .. }));
        assert!(graph.all_of("Book").is_empty());

        let err = graph
            .create("Book", [("author", Value::from("t:1"))])
            .unwrap_err();
        assert!(matches!(err, Error::InvalidId(_)));

        let book = graph.create("Book", [("author", Value::from("a:5"))]).unwrap();
        assert_eq!(
            graph.reference(book, "author").unwrap(),
            RefTarget::Id(TaggedId::int("a", 5))
        );
    }

    #[test]
    fn set_fields_is_all_or_nothing() {
        let mut graph = EntityGraph::new(library());
        let author = stored_author(&mut graph, 1);
        let err = graph
            .set_fields(author, [("first_name", Value::from("b")), ("bogus", Value::Null)])
            .unwrap_err();
        assert!(matches!(err, Error::UnknownField { .. }));
        assert_eq!(graph.get_field(author, "first_name").unwrap(), Value::from("a"));
        graph.set_field(author, "first_name", "b").unwrap();
        assert_eq!(graph.changes(author).changed_fields(), vec!["first_name"]);
        assert!(graph.is_dirty(author));
    }

    #[test]
    fn wrong_entity_type_is_rejected() {
        let mut graph = EntityGraph::new(library());
        let author = graph.create("Author", []).unwrap();
        let tag = graph.create("Tag", []).unwrap();
        let err = graph.add(author, "books", tag).unwrap_err();
        assert!(matches!(err, Error::WrongEntityType { expected: "Book", .. }));
    }

    #[test]
    fn cascade_deletes_owned_children_and_detaches_others() {
        let mut graph = EntityGraph::new(library());
        let author = graph.create("Author", []).unwrap();
        let book = graph.create("Book", []).unwrap();
        let review = graph.create("Review", []).unwrap();
        let tag = graph.create("Tag", []).unwrap();
        graph.add(author, "books", book).unwrap();
        graph.add(book, "reviews", review).unwrap();
        graph.add(author, "tags", tag).unwrap();

        graph.delete(book);
        for h in graph.take_pending_cascades() {
            graph.cascade_delete(h).unwrap();
        }
        for h in graph.take_pending_cascades() {
            graph.cascade_delete(h).unwrap();
        }
        assert!(graph.entity(review).is_deleted());

        graph.delete(author);
        for h in graph.take_pending_cascades() {
            graph.cascade_delete(h).unwrap();
        }
        assert!(graph.get(tag, "authors").unwrap().is_empty());
    }

    #[test]
    fn clone_copies_listed_children() {
        let mut graph = EntityGraph::new(library());
        let author = graph.create("Author", [("first_name", Value::from("a"))]).unwrap();
        let book = graph.create("Book", [("title", Value::from("t"))]).unwrap();
        graph.add(author, "books", book).unwrap();

        let copy = graph.clone_entity(author, &["books"]).unwrap();
        let copied_books = graph.get(copy, "books").unwrap();
        assert_eq!(copied_books.len(), 1);
        assert_ne!(copied_books[0], book);
        assert_eq!(graph.get(author, "books").unwrap(), vec![book]);
        assert_eq!(graph.get_field(copied_books[0], "title").unwrap(), Value::from("t"));

        let err = graph.clone_entity(author, &["tags"]).unwrap_err();
        assert!(matches!(err, Error::UncloneableRelation { .. }));
    }

    #[test]
    fn touch_makes_loaded_entity_dirty() {
        let mut graph = EntityGraph::new(library());
        let author = stored_author(&mut graph, 1);
        assert!(!graph.is_dirty(author));
        graph.touch(author);
        assert!(graph.is_dirty(author));
        assert_eq!(graph.pending_counts().updates, 1);
    }
}

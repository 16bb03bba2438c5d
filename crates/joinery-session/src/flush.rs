//! Flush planning.
//!
//! A flush runs one or more passes inside a single transaction. Each pass
//! snapshots the dirty entities into per-type todos, reserves ids for new
//! entities, and hands one [`FlushBatch`] to the driver.
//!
//! What a pass wrote is kept in a [`FlushOverlay`] instead of the graph. Later
//! passes read ids, stored values and touch counters through the overlay, and
//! the graph only sees them once the transaction commits. Join-row results are
//! applied to the ledger right away (later passes must not write them again)
//! with an undo log, so a failed flush can put the ledger back too.

use crate::driver::{
    DeleteRow, EntityTodo, FlushBatch, FlushResult, IdRequest, InsertRow, JoinRowTodo,
    JoinRowWrite, UpdateRow,
};
use crate::entity::{EntityHandle, EntityStatus, RefTarget, same_value};
use crate::graph::EntityGraph;
use crate::join_rows::JoinRow;
use joinery_core::{
    EntityMetadata, Error, FieldKind, FieldMeta, IdValue, ReservationError, Result, TaggedId,
    Value,
};
use serde::Serialize;
use std::collections::{HashMap, HashSet};

/// What one flush pass wrote. Handed to the reactive engine between passes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassSummary {
    /// 1-based pass number within the flush.
    pub pass: usize,
    pub inserted: Vec<EntityHandle>,
    pub updated: Vec<EntityHandle>,
    pub deleted: Vec<EntityHandle>,
    /// Touched entities without a version column. Nothing is written for them.
    pub touched: Vec<EntityHandle>,
    /// Join rows inserted or deleted.
    pub join_rows: usize,
    pub result: FlushResult,
}

impl PassSummary {
    /// Was this entity written (inserted, updated or deleted) by the pass?
    pub fn wrote(&self, handle: EntityHandle) -> bool {
        self.inserted.contains(&handle)
            || self.updated.contains(&handle)
            || self.deleted.contains(&handle)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Totals of a committed flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushSummary {
    pub passes: usize,
    pub result: FlushResult,
}

enum UpdatePlan {
    Clean,
    Touch,
    Write(UpdateRow, Vec<(&'static str, Value)>),
}

type JoinKey = (&'static str, [&'static str; 2], [EntityHandle; 2]);

/// The writes of one pass, plus what the overlay needs to remember about them.
#[derive(Debug, Default)]
pub(crate) struct PassPlan {
    pub(crate) batch: FlushBatch,
    pub(crate) summary: PassSummary,
    written: Vec<(EntityHandle, Vec<(&'static str, Value)>)>,
    touched: Vec<(EntityHandle, u64)>,
    /// Members of each new join row, parallel to `batch.join_rows`.
    join_new: Vec<Vec<[EntityHandle; 2]>>,
    join_deleted: Vec<Vec<[EntityHandle; 2]>>,
    /// Rows that can never reach storage and are dropped without SQL.
    join_dropped: Vec<JoinKey>,
}

impl PassPlan {
    pub(crate) fn has_work(&self) -> bool {
        !self.batch.is_empty() || !self.summary.touched.is_empty() || !self.join_dropped.is_empty()
    }
}

/// Per-flush record of ids, written values and join-row changes.
#[derive(Debug, Default)]
pub(crate) struct FlushOverlay {
    ids: HashMap<EntityHandle, TaggedId>,
    inserted: HashSet<EntityHandle>,
    deleted: HashSet<EntityHandle>,
    written: HashMap<EntityHandle, HashMap<&'static str, Value>>,
    touches: HashMap<EntityHandle, u64>,
    join_undo: Vec<(&'static str, [&'static str; 2], JoinRow)>,
    pub(crate) passes: usize,
    pub(crate) result: FlushResult,
}

impl FlushOverlay {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn id_of(&self, graph: &EntityGraph, handle: EntityHandle) -> Option<TaggedId> {
        graph
            .identity_map()
            .id_of(handle)
            .or_else(|| self.ids.get(&handle))
            .cloned()
    }

    fn require_id(&self, graph: &EntityGraph, handle: EntityHandle) -> Result<IdValue> {
        self.id_of(graph, handle)
            .map(|id| id.value().clone())
            .ok_or_else(|| Error::config(format!("{} has no id to write", graph.describe(handle))))
    }

    /// Stored value of a field as of the previous pass.
    fn stored<'a>(&'a self, graph: &'a EntityGraph, handle: EntityHandle, field: &str) -> Option<&'a Value> {
        self.written
            .get(&handle)
            .and_then(|w| w.get(field))
            .or_else(|| graph.entity(handle).baseline.get(field))
    }

    fn is_persisted(&self, graph: &EntityGraph, handle: EntityHandle) -> bool {
        (graph.entity(handle).is_persisted() || self.inserted.contains(&handle))
            && !self.deleted.contains(&handle)
    }

    fn flushed_touches(&self, graph: &EntityGraph, handle: EntityHandle) -> u64 {
        self.touches
            .get(&handle)
            .copied()
            .unwrap_or(graph.entity(handle).flushed_touches)
    }

    /// Column value for a reference. A target that never got an id (created
    /// and deleted in this unit of work) is written as NULL.
    fn reference_value(
        &self,
        graph: &EntityGraph,
        handle: EntityHandle,
        field: &FieldMeta,
        target: &RefTarget,
    ) -> Value {
        let value = match target {
            RefTarget::Unset => Some(Value::Null),
            RefTarget::Id(id) => Some(id.to_value()),
            RefTarget::Entity(h) => self.id_of(graph, *h).map(|id| id.to_value()),
        };
        value.unwrap_or_else(|| {
            tracing::warn!(
                entity = %graph.describe(handle),
                field = field.name,
                "Reference target was never saved; writing NULL"
            );
            Value::Null
        })
    }

    /// New entities that still lack an id, grouped into one request per type
    /// in flush order.
    pub(crate) fn id_requests(&self, graph: &EntityGraph) -> Vec<(IdRequest, Vec<EntityHandle>)> {
        let registry = graph.registry();
        let mut requests = Vec::new();
        for type_name in registry.flush_order() {
            let Ok(meta) = registry.get(type_name) else {
                continue;
            };
            let handles: Vec<EntityHandle> = graph
                .all_of(type_name)
                .iter()
                .copied()
                .filter(|h| {
                    graph.entity(*h).status() == EntityStatus::New
                        && !self.inserted.contains(h)
                        && self.id_of(graph, *h).is_none()
                })
                .collect();
            if handles.is_empty() {
                continue;
            }
            requests.push((
                IdRequest {
                    entity: meta.type_name,
                    table: meta.table,
                    id_column: meta.id_column,
                    count: handles.len(),
                },
                handles,
            ));
        }
        requests
    }

    /// Take reserved ids, failing when the driver came back short.
    pub(crate) fn accept_ids(
        &mut self,
        graph: &EntityGraph,
        requests: Vec<(IdRequest, Vec<EntityHandle>)>,
        ids: Vec<Vec<IdValue>>,
    ) -> Result<()> {
        let mut ids = ids.into_iter();
        for (request, handles) in requests {
            let got = ids.next().unwrap_or_default();
            if got.len() < request.count {
                return Err(Error::Reservation(ReservationError {
                    table: request.table,
                    requested: request.count,
                    received: got.len(),
                }));
            }
            let tag = graph.registry().get(request.entity)?.tag;
            tracing::trace!(
                entity = request.entity,
                count = request.count,
                first = %got[0],
                "Reserved ids"
            );
            for (handle, id) in handles.into_iter().zip(got) {
                self.ids.insert(handle, TaggedId::new(tag, id));
            }
        }
        Ok(())
    }

    /// Snapshot everything dirty into one batch.
    pub(crate) fn plan_pass(&self, graph: &EntityGraph, deferred_constraints: bool) -> Result<PassPlan> {
        let registry = graph.registry();
        let mut plan = PassPlan::default();
        plan.summary.pass = self.passes + 1;

        for type_name in registry.flush_order() {
            let meta = registry.get(type_name)?;
            let mut todo = EntityTodo {
                entity: meta.type_name,
                table: meta.table,
                id_column: meta.id_column,
                version_column: version_column(meta),
                inserts: Vec::new(),
                updates: Vec::new(),
                deletes: Vec::new(),
            };
            for &h in graph.all_of(type_name) {
                let record = graph.entity(h);
                let pending_touches = record.touches;
                match record.status() {
                    EntityStatus::New if !self.inserted.contains(&h) => {
                        let (row, written) = self.insert_row(graph, h)?;
                        todo.inserts.push(row);
                        plan.written.push((h, written));
                        plan.summary.inserted.push(h);
                        if pending_touches > self.flushed_touches(graph, h) {
                            plan.touched.push((h, pending_touches));
                        }
                    }
                    EntityStatus::Deleted => {
                        if self.is_persisted(graph, h) {
                            todo.deletes.push(DeleteRow {
                                id: self.require_id(graph, h)?,
                            });
                            plan.summary.deleted.push(h);
                        }
                    }
                    EntityStatus::New | EntityStatus::Loaded => match self.plan_update(graph, h)? {
                        UpdatePlan::Clean => {}
                        UpdatePlan::Touch => {
                            plan.summary.touched.push(h);
                            plan.touched.push((h, pending_touches));
                        }
                        UpdatePlan::Write(row, written) => {
                            todo.updates.push(row);
                            plan.written.push((h, written));
                            plan.summary.updated.push(h);
                            if pending_touches > self.flushed_touches(graph, h) {
                                plan.touched.push((h, pending_touches));
                            }
                        }
                    },
                }
            }
            if !todo.is_empty() {
                plan.batch.entities.push(todo);
            }
        }

        self.plan_join_rows(graph, &mut plan);

        if !deferred_constraints {
            for cycle in registry.cycles() {
                let written: Vec<&'static str> = cycle
                    .iter()
                    .copied()
                    .filter(|t| {
                        plan.batch
                            .entities
                            .iter()
                            .any(|todo| todo.entity == *t && (!todo.inserts.is_empty() || !todo.deletes.is_empty()))
                    })
                    .collect();
                if written.len() >= 2 {
                    return Err(Error::DependencyCycle { types: written });
                }
            }
        }

        tracing::debug!(
            pass = plan.summary.pass,
            inserts = plan.summary.inserted.len(),
            updates = plan.summary.updated.len(),
            deletes = plan.summary.deleted.len(),
            touched = plan.summary.touched.len(),
            join_tables = plan.batch.join_rows.len(),
            "Planned flush pass"
        );
        Ok(plan)
    }

    fn insert_row(
        &self,
        graph: &EntityGraph,
        handle: EntityHandle,
    ) -> Result<(InsertRow, Vec<(&'static str, Value)>)> {
        let record = graph.entity(handle);
        let meta = record.meta();
        let id = self.require_id(graph, handle)?;
        let mut columns = Vec::new();
        let mut written = Vec::new();
        for field in meta.column_fields() {
            let Some(column) = field.column else {
                continue;
            };
            let value = if Some(field.name) == meta.version_field {
                Some(Value::BigInt(1))
            } else {
                match field.kind {
                    FieldKind::Primitive => record.value(field.name).cloned(),
                    FieldKind::ManyToOne { .. } => record
                        .reference(field.name)
                        .map(|t| self.reference_value(graph, handle, field, t)),
                    FieldKind::PrimaryKey
                    | FieldKind::OneToMany { .. }
                    | FieldKind::OneToOne { .. }
                    | FieldKind::ManyToMany { .. } => None,
                }
            };
            if let Some(value) = value {
                columns.push((column, value.clone()));
                written.push((field.name, value));
            }
        }
        Ok((InsertRow { id, columns }, written))
    }

    fn plan_update(&self, graph: &EntityGraph, handle: EntityHandle) -> Result<UpdatePlan> {
        let record = graph.entity(handle);
        let meta = record.meta();
        let mut changes = Vec::new();
        let mut written = Vec::new();
        for field in meta.column_fields() {
            if Some(field.name) == meta.version_field {
                continue;
            }
            let Some(column) = field.column else {
                continue;
            };
            let current = match field.kind {
                FieldKind::Primitive => record.value(field.name).cloned(),
                FieldKind::ManyToOne { .. } => record
                    .reference(field.name)
                    .map(|t| self.reference_value(graph, handle, field, t)),
                FieldKind::PrimaryKey
                | FieldKind::OneToMany { .. }
                | FieldKind::OneToOne { .. }
                | FieldKind::ManyToMany { .. } => None,
            };
            let Some(current) = current else {
                continue;
            };
            let changed = match self.stored(graph, handle, field.name) {
                Some(stored) => !same_value(&current, stored),
                None => !current.is_null(),
            };
            if changed {
                changes.push((column, current.clone()));
                written.push((field.name, current));
            }
        }

        let touched = record.touches > self.flushed_touches(graph, handle);
        if changes.is_empty() && !touched {
            return Ok(UpdatePlan::Clean);
        }
        let id = self.require_id(graph, handle)?;
        match (meta.version_field, version_column(meta)) {
            (Some(name), Some(column)) => {
                let expected = self.stored(graph, handle, name).and_then(Value::as_i64);
                let next = Value::BigInt(expected.unwrap_or(0) + 1);
                changes.push((column, next.clone()));
                written.push((name, next));
                Ok(UpdatePlan::Write(
                    UpdateRow {
                        id,
                        changes,
                        expected_version: expected,
                    },
                    written,
                ))
            }
            _ if changes.is_empty() => Ok(UpdatePlan::Touch),
            _ => Ok(UpdatePlan::Write(
                UpdateRow {
                    id,
                    changes,
                    expected_version: None,
                },
                written,
            )),
        }
    }

    fn plan_join_rows(&self, graph: &EntityGraph, plan: &mut PassPlan) {
        let side = |h: EntityHandle| self.id_of(graph, h).map(|id| id.to_value());
        for todo in graph.ledger().todos() {
            let mut write = JoinRowTodo {
                table: todo.table,
                columns: todo.columns,
                new_rows: Vec::new(),
                deleted_rows: Vec::new(),
            };
            let mut new_members = Vec::new();
            let mut deleted_members = Vec::new();

            for row in &todo.new_rows {
                let members = row.members();
                match (side(members[0]), side(members[1])) {
                    (Some(a), Some(b)) => {
                        write.new_rows.push(JoinRowWrite {
                            id: None,
                            values: [a, b],
                        });
                        new_members.push(members);
                    }
                    // Only entities created and deleted before any insert lack ids.
                    _ => {
                        tracing::trace!(table = todo.table, "Dropping join row to an unsaved entity");
                        plan.join_dropped.push((todo.table, todo.columns, members));
                    }
                }
            }

            for row in &todo.deleted_rows {
                let members = row.members();
                let (a, b) = (side(members[0]), side(members[1]));
                match (row.id(), a, b) {
                    (Some(id), a, b) => write.deleted_rows.push(JoinRowWrite {
                        id: Some(id),
                        values: [a.unwrap_or(Value::Null), b.unwrap_or(Value::Null)],
                    }),
                    (None, Some(a), Some(b)) => write.deleted_rows.push(JoinRowWrite {
                        id: None,
                        values: [a, b],
                    }),
                    (None, _, _) => {
                        plan.join_dropped.push((todo.table, todo.columns, members));
                        continue;
                    }
                }
                deleted_members.push(members);
            }

            if write.new_rows.is_empty() && write.deleted_rows.is_empty() {
                continue;
            }
            plan.summary.join_rows += write.new_rows.len() + write.deleted_rows.len();
            plan.batch.join_rows.push(write);
            plan.join_new.push(new_members);
            plan.join_deleted.push(deleted_members);
        }
    }

    /// Record a pass the driver wrote successfully.
    pub(crate) fn absorb(
        &mut self,
        graph: &mut EntityGraph,
        plan: PassPlan,
        result: FlushResult,
    ) -> PassSummary {
        let PassPlan {
            batch,
            mut summary,
            written,
            touched,
            join_new,
            join_deleted,
            join_dropped,
        } = plan;
        self.passes += 1;
        for (h, values) in written {
            self.written.entry(h).or_default().extend(values);
        }
        self.inserted.extend(summary.inserted.iter().copied());
        self.deleted.extend(summary.deleted.iter().copied());
        self.touches.extend(touched);

        for (todo, members) in batch.join_rows.iter().zip(&join_new) {
            for (row, m) in todo.new_rows.iter().zip(members) {
                self.remember(graph, todo.table, todo.columns, *m);
                graph.ledger.mark_flushed(todo.table, *m, row.id);
            }
        }
        for (todo, members) in batch.join_rows.iter().zip(&join_deleted) {
            for m in members {
                self.remember(graph, todo.table, todo.columns, *m);
                graph.ledger.mark_deleted(todo.table, *m);
            }
        }
        for (table, columns, m) in join_dropped {
            self.remember(graph, table, columns, m);
            graph.ledger.mark_deleted(table, m);
        }

        summary.result = result;
        self.result.absorb(result);
        summary
    }

    fn remember(
        &mut self,
        graph: &EntityGraph,
        table: &'static str,
        columns: [&'static str; 2],
        members: [EntityHandle; 2],
    ) {
        if let Some(row) = graph.ledger().snapshot(table, members) {
            self.join_undo.push((table, columns, row));
        }
    }

    /// Entities still dirty, for error reports.
    pub(crate) fn dirty_entities(&self, graph: &EntityGraph) -> Vec<String> {
        graph
            .identity_map()
            .handles()
            .filter(|h| {
                let record = graph.entity(*h);
                match record.status() {
                    EntityStatus::New if !self.inserted.contains(h) => true,
                    EntityStatus::Deleted => self.is_persisted(graph, *h),
                    EntityStatus::New | EntityStatus::Loaded => {
                        record.touches > self.flushed_touches(graph, *h)
                            || matches!(self.plan_update(graph, *h), Ok(UpdatePlan::Write(..)))
                    }
                }
            })
            .map(|h| graph.describe(h))
            .collect()
    }

    /// Fold a committed flush into the graph.
    pub(crate) fn apply(self, graph: &mut EntityGraph) {
        for (h, id) in self.ids {
            graph.map.assign_id(h, id);
        }
        for h in &self.inserted {
            let record = graph.map.get_mut(*h);
            record.materialize_empty_collections();
            record.persisted = true;
            if record.status == EntityStatus::New {
                record.status = EntityStatus::Loaded;
            }
        }
        for (h, values) in self.written {
            let record = graph.map.get_mut(h);
            let version = record.meta.version_field;
            for (name, value) in values {
                if Some(name) == version {
                    record.values.insert(name, value.clone());
                }
                record.baseline.insert(name, value);
            }
        }
        for (h, touches) in self.touches {
            graph.map.get_mut(h).flushed_touches = touches;
        }
        for h in self.deleted {
            graph.map.get_mut(h).persisted = false;
        }
        let handles: Vec<EntityHandle> = graph.map.handles().collect();
        for h in handles {
            for collection in graph.map.get_mut(h).collections.values_mut() {
                collection.clear_changes();
            }
        }
    }

    /// Put the join-row ledger back as it was before the flush.
    pub(crate) fn revert(self, graph: &mut EntityGraph) {
        for (table, columns, row) in self.join_undo.into_iter().rev() {
            graph.ledger.restore(table, columns, row);
        }
    }
}

fn version_column(meta: &EntityMetadata) -> Option<&'static str> {
    meta.version_field
        .and_then(|f| meta.field(f))
        .and_then(|f| f.column)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::library;
    use joinery_core::Row;
    use std::sync::Arc;

    fn stored(graph: &mut EntityGraph, type_name: &str, row: Row) -> EntityHandle {
        let meta = Arc::clone(graph.registry().get(type_name).unwrap());
        graph.hydrate(&meta, &row).unwrap()
    }

    fn stored_author(graph: &mut EntityGraph, id: i64, version: i64) -> EntityHandle {
        stored(
            graph,
            "Author",
            Row::from_pairs([
                ("id", Value::BigInt(id)),
                ("first_name", Value::from("a")),
                ("version", Value::BigInt(version)),
            ]),
        )
    }

    fn reserve(overlay: &mut FlushOverlay, graph: &EntityGraph, first: i64) {
        let requests = overlay.id_requests(graph);
        let mut next = first;
        let ids: Vec<Vec<IdValue>> = requests
            .iter()
            .map(|(r, _)| {
                (0..r.count)
                    .map(|_| {
                        next += 1;
                        IdValue::Int(next - 1)
                    })
                    .collect()
            })
            .collect();
        overlay.accept_ids(graph, requests, ids).unwrap();
    }

    #[test]
    fn one_request_per_type_in_flush_order() {
        let mut graph = EntityGraph::new(library());
        let author = graph.create("Author", []).unwrap();
        for _ in 0..3 {
            let book = graph.create("Book", []).unwrap();
            graph.set_reference(book, "author", Some(author)).unwrap();
        }
        let requests = FlushOverlay::new().id_requests(&graph);
        let summary: Vec<(&str, usize)> = requests.iter().map(|(r, _)| (r.entity, r.count)).collect();
        assert_eq!(summary, vec![("Author", 1), ("Book", 3)]);
    }

    #[test]
    fn short_reservation_is_an_error() {
        let mut graph = EntityGraph::new(library());
        graph.create("Tag", []).unwrap();
        graph.create("Tag", []).unwrap();
        let mut overlay = FlushOverlay::new();
        let requests = overlay.id_requests(&graph);
        let err = overlay
            .accept_ids(&graph, requests, vec![vec![IdValue::Int(1)]])
            .unwrap_err();
        match err {
            Error::Reservation(e) => {
                assert_eq!(e.table, "tags");
                assert_eq!((e.requested, e.received), (2, 1));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn inserts_carry_foreign_keys_and_initial_version() {
        let mut graph = EntityGraph::new(library());
        let author = graph.create("Author", [("first_name", Value::from("Ann"))]).unwrap();
        let book = graph.create("Book", [("title", Value::from("B"))]).unwrap();
        graph.set_reference(book, "author", Some(author)).unwrap();

        let mut overlay = FlushOverlay::new();
        reserve(&mut overlay, &graph, 10);
        let plan = overlay.plan_pass(&graph, false).unwrap();
        let entities: Vec<&str> = plan.batch.entities.iter().map(|t| t.entity).collect();
        assert_eq!(entities, vec!["Author", "Book"]);

        let author_row = &plan.batch.entities[0].inserts[0];
        assert_eq!(author_row.id, IdValue::Int(10));
        assert!(author_row.columns.contains(&("version", Value::BigInt(1))));
        let book_row = &plan.batch.entities[1].inserts[0];
        assert!(book_row.columns.contains(&("author_id", Value::BigInt(10))));
    }

    #[test]
    fn updates_check_and_bump_version() {
        let mut graph = EntityGraph::new(library());
        let author = stored_author(&mut graph, 1, 4);
        graph.set_field(author, "first_name", "b").unwrap();

        let overlay = FlushOverlay::new();
        let plan = overlay.plan_pass(&graph, false).unwrap();
        let update = &plan.batch.entities[0].updates[0];
        assert_eq!(update.expected_version, Some(4));
        assert!(update.changes.contains(&("first_name", Value::from("b"))));
        assert!(update.changes.contains(&("version", Value::BigInt(5))));
    }

    #[test]
    fn touch_without_version_column_writes_nothing() {
        let mut graph = EntityGraph::new(library());
        let tag = stored(
            &mut graph,
            "Tag",
            Row::from_pairs([("id", Value::BigInt(3)), ("name", Value::from("x"))]),
        );
        graph.touch(tag);
        let plan = FlushOverlay::new().plan_pass(&graph, false).unwrap();
        assert!(plan.batch.is_empty());
        assert_eq!(plan.summary.touched, vec![tag]);
        assert!(plan.has_work());
    }

    #[test]
    fn later_pass_sees_earlier_writes() {
        let mut graph = EntityGraph::new(library());
        let author = stored_author(&mut graph, 1, 1);
        graph.set_field(author, "first_name", "b").unwrap();

        let mut overlay = FlushOverlay::new();
        let plan = overlay.plan_pass(&graph, false).unwrap();
        let result = FlushResult {
            updated: 1,
            ..FlushResult::default()
        };
        let summary = overlay.absorb(&mut graph, plan, result);
        assert_eq!(summary.updated, vec![author]);

        let second = overlay.plan_pass(&graph, false).unwrap();
        assert!(!second.has_work());

        graph.touch(author);
        let third = overlay.plan_pass(&graph, false).unwrap();
        assert_eq!(third.batch.entities[0].updates[0].expected_version, Some(2));
    }

    #[test]
    fn apply_moves_overlay_into_graph() {
        let mut graph = EntityGraph::new(library());
        let author = graph.create("Author", [("first_name", Value::from("Ann"))]).unwrap();
        let mut overlay = FlushOverlay::new();
        reserve(&mut overlay, &graph, 7);
        let plan = overlay.plan_pass(&graph, false).unwrap();
        overlay.absorb(&mut graph, plan, FlushResult::default());
        assert!(graph.entity(author).id().is_none());

        overlay.apply(&mut graph);
        let record = graph.entity(author);
        assert_eq!(record.id(), Some(&TaggedId::int("a", 7)));
        assert_eq!(record.status(), EntityStatus::Loaded);
        assert_eq!(record.version(), Some(1));
        assert!(graph.is_loaded(author, "books"));
        assert!(!graph.is_dirty(author));
    }

    #[test]
    fn join_rows_are_marked_and_reverted() {
        let mut graph = EntityGraph::new(library());
        let author = stored_author(&mut graph, 1, 1);
        let tag = stored(
            &mut graph,
            "Tag",
            Row::from_pairs([("id", Value::BigInt(2)), ("name", Value::from("x"))]),
        );
        graph.add(author, "tags", tag).unwrap();

        let mut overlay = FlushOverlay::new();
        let mut plan = overlay.plan_pass(&graph, false).unwrap();
        assert_eq!(plan.batch.join_rows[0].new_rows.len(), 1);
        plan.batch.join_rows[0].new_rows[0].id = Some(55);
        overlay.absorb(&mut graph, plan, FlushResult::default());
        assert!(graph.ledger().todos().is_empty());

        overlay.revert(&mut graph);
        let rows = graph.ledger().rows("authors_to_tags");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id(), None);
        assert_eq!(graph.ledger().todos().len(), 1);
    }

    #[test]
    fn cycle_without_deferred_constraints_fails() {
        let registry = joinery_core::MetadataRegistry::new()
            .with(
                EntityMetadata::new("Employee", "e", "employees")
                    .many_to_one("desk", "desk_id", "Desk", "employees")
                    .one_to_many("owned_desks", "Desk", "owner"),
            )
            .and_then(|r| {
                r.with(
                    EntityMetadata::new("Desk", "d", "desks")
                        .many_to_one("owner", "owner_id", "Employee", "owned_desks")
                        .one_to_many("employees", "Employee", "desk"),
                )
            })
            .and_then(joinery_core::MetadataRegistry::finish)
            .unwrap();
        let mut graph = EntityGraph::new(registry);
        graph.create("Employee", []).unwrap();
        graph.create("Desk", []).unwrap();

        let mut overlay = FlushOverlay::new();
        reserve(&mut overlay, &graph, 1);
        match overlay.plan_pass(&graph, false) {
            Err(Error::DependencyCycle { types }) => assert_eq!(types.len(), 2),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(overlay.plan_pass(&graph, true).is_ok());
    }
}

//! Join-row ledger for many-to-many relations.
//!
//! Every membership change of a many-to-many collection is recorded here as a
//! row of the backing join table. Rows are stored once per table in a canonical
//! column order, so `author.tags.add(tag)` and `tag.authors.add(author)` land on
//! the same row.
//!
//! A row that was never written has no id. Removing such a row before flush
//! drops it outright when one side has never been stored, so an add followed
//! by a remove emits no SQL at all. Between two stored entities the pair may
//! already exist, and the row turns into a delete by pair instead.

use crate::entity::EntityHandle;
use joinery_core::LinkTableInfo;
use std::collections::BTreeMap;

/// Pending operation of a join row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinRowOp {
    /// Needs an insert.
    New,
    /// Needs a delete.
    Deleted,
    /// In storage, nothing to do.
    Flushed,
}

/// One row of a join table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRow {
    id: Option<i64>,
    members: [EntityHandle; 2],
    op: JoinRowOp,
}

impl JoinRow {
    /// Storage id, `None` until the row has been written or read back.
    pub fn id(&self) -> Option<i64> {
        self.id
    }

    /// Entities in the table's canonical column order.
    pub fn members(&self) -> [EntityHandle; 2] {
        self.members
    }

    pub fn op(&self) -> JoinRowOp {
        self.op
    }
}

#[derive(Debug, Clone)]
struct JoinTable {
    columns: [&'static str; 2],
    rows: Vec<JoinRow>,
}

/// Writes due for one join table.
#[derive(Debug)]
pub struct JoinTableTodo<'a> {
    pub table: &'static str,
    pub columns: [&'static str; 2],
    pub new_rows: Vec<&'a JoinRow>,
    pub deleted_rows: Vec<&'a JoinRow>,
}

/// Per-table bookkeeping of join rows.
#[derive(Debug, Clone, Default)]
pub struct JoinRowLedger {
    tables: BTreeMap<&'static str, JoinTable>,
    pending_sets: Vec<(EntityHandle, &'static str)>,
}

fn canonical(
    link: LinkTableInfo,
    owner: EntityHandle,
    other: EntityHandle,
) -> ([&'static str; 2], [EntityHandle; 2]) {
    if link.local_column <= link.remote_column {
        ([link.local_column, link.remote_column], [owner, other])
    } else {
        ([link.remote_column, link.local_column], [other, owner])
    }
}

impl JoinRowLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn table_mut(&mut self, table: &'static str, columns: [&'static str; 2]) -> &mut JoinTable {
        self.tables.entry(table).or_insert_with(|| JoinTable {
            columns,
            rows: Vec::new(),
        })
    }

    fn position(&self, table: &str, members: [EntityHandle; 2]) -> Option<usize> {
        self.tables
            .get(table)?
            .rows
            .iter()
            .position(|r| r.members == members)
    }

    /// Record that `owner` and `other` became joined.
    pub fn add_new(&mut self, link: LinkTableInfo, owner: EntityHandle, other: EntityHandle) {
        let (columns, members) = canonical(link, owner, other);
        let index = self.position(link.table_name, members);
        let table = self.table_mut(link.table_name, columns);
        match index {
            Some(i) => {
                let row = &mut table.rows[i];
                if row.op == JoinRowOp::Deleted {
                    row.op = if row.id.is_some() {
                        JoinRowOp::Flushed
                    } else {
                        JoinRowOp::New
                    };
                }
            }
            None => table.rows.push(JoinRow {
                id: None,
                members,
                op: JoinRowOp::New,
            }),
        }
    }

    /// Record that `owner` and `other` are no longer joined.
    ///
    /// `maybe_stored` is false when either side has never been written, so
    /// the pair cannot be in storage.
    pub fn add_remove(
        &mut self,
        link: LinkTableInfo,
        owner: EntityHandle,
        other: EntityHandle,
        maybe_stored: bool,
    ) {
        let (columns, members) = canonical(link, owner, other);
        let index = self.position(link.table_name, members);
        let table = self.table_mut(link.table_name, columns);
        match index {
            Some(i) => match (table.rows[i].op, table.rows[i].id) {
                (JoinRowOp::New, None) if !maybe_stored => {
                    tracing::trace!(table = link.table_name, "Dropped unwritten join row");
                    table.rows.remove(i);
                }
                (JoinRowOp::Deleted, _) => {}
                _ => table.rows[i].op = JoinRowOp::Deleted,
            },
            // Not known yet; may exist in storage, delete by pair.
            None => table.rows.push(JoinRow {
                id: None,
                members,
                op: JoinRowOp::Deleted,
            }),
        }
    }

    /// Reconcile a join row read from storage.
    pub fn add_existing(
        &mut self,
        link: LinkTableInfo,
        id: Option<i64>,
        owner: EntityHandle,
        other: EntityHandle,
    ) {
        let (columns, members) = canonical(link, owner, other);
        let index = self.position(link.table_name, members);
        let table = self.table_mut(link.table_name, columns);
        match index {
            Some(i) => {
                let row = &mut table.rows[i];
                if row.id.is_none() {
                    row.id = id;
                }
                if row.op == JoinRowOp::New {
                    row.op = JoinRowOp::Flushed;
                }
            }
            None => table.rows.push(JoinRow {
                id,
                members,
                op: JoinRowOp::Flushed,
            }),
        }
    }

    /// Note that a relation's membership was replaced before load and must be
    /// resolved against storage before flush.
    pub fn mark_pending_set(&mut self, owner: EntityHandle, field: &'static str) {
        if !self.pending_sets.contains(&(owner, field)) {
            self.pending_sets.push((owner, field));
        }
    }

    pub fn has_pending_sets(&self) -> bool {
        !self.pending_sets.is_empty()
    }

    pub fn pending_sets(&self) -> &[(EntityHandle, &'static str)] {
        &self.pending_sets
    }

    pub(crate) fn clear_pending_set(&mut self, owner: EntityHandle, field: &'static str) {
        self.pending_sets.retain(|p| *p != (owner, field));
    }

    /// Current row for a pair, if any.
    pub fn row(&self, link: LinkTableInfo, owner: EntityHandle, other: EntityHandle) -> Option<&JoinRow> {
        let (_, members) = canonical(link, owner, other);
        let i = self.position(link.table_name, members)?;
        self.tables.get(link.table_name).map(|t| &t.rows[i])
    }

    /// Rows of one table, in recording order.
    pub fn rows(&self, table: &str) -> &[JoinRow] {
        self.tables.get(table).map_or(&[], |t| t.rows.as_slice())
    }

    /// Inserts and deletes due, per table.
    pub fn todos(&self) -> Vec<JoinTableTodo<'_>> {
        self.tables
            .iter()
            .filter_map(|(name, table)| {
                let new_rows: Vec<&JoinRow> = table
                    .rows
                    .iter()
                    .filter(|r| r.op == JoinRowOp::New)
                    .collect();
                let deleted_rows: Vec<&JoinRow> = table
                    .rows
                    .iter()
                    .filter(|r| r.op == JoinRowOp::Deleted)
                    .collect();
                if new_rows.is_empty() && deleted_rows.is_empty() {
                    return None;
                }
                Some(JoinTableTodo {
                    table: *name,
                    columns: table.columns,
                    new_rows,
                    deleted_rows,
                })
            })
            .collect()
    }

    /// Copy of a row as it is now.
    pub(crate) fn snapshot(&self, table: &str, members: [EntityHandle; 2]) -> Option<JoinRow> {
        self.tables
            .get(table)?
            .rows
            .iter()
            .find(|r| r.members == members)
            .cloned()
    }

    /// Put back a row captured with [`snapshot`](Self::snapshot).
    pub(crate) fn restore(&mut self, table: &'static str, columns: [&'static str; 2], row: JoinRow) {
        let t = self.table_mut(table, columns);
        match t.rows.iter_mut().find(|r| r.members == row.members) {
            Some(existing) => *existing = row,
            None => t.rows.push(row),
        }
    }

    /// A row was inserted and received `id`.
    pub(crate) fn mark_flushed(&mut self, table: &str, members: [EntityHandle; 2], id: Option<i64>) {
        if let Some(t) = self.tables.get_mut(table) {
            if let Some(row) = t.rows.iter_mut().find(|r| r.members == members) {
                row.op = JoinRowOp::Flushed;
                if id.is_some() {
                    row.id = id;
                }
            }
        }
    }

    /// A row was deleted from storage, or can never exist there.
    pub(crate) fn mark_deleted(&mut self, table: &str, members: [EntityHandle; 2]) {
        if let Some(t) = self.tables.get_mut(table) {
            t.rows.retain(|r| r.members != members);
        }
    }
}

//! The storage driver boundary.
//!
//! A [`Driver`] is everything the unit of work needs from storage: structured
//! finds for the read batcher, raw queries, a transaction, id reservation, and
//! one call that writes a whole flush pass. Drivers use interior mutability and
//! take `&self` everywhere, mirroring `Connection`.

use asupersync::{Cx, Outcome};
use joinery_core::{Error, IdValue, Row, Value};
use serde::Serialize;
use std::cmp::Ordering;
use std::future::Future;

/// Comparison operators usable in a [`Filter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    pub const fn as_sql(self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }
}

/// One conjunct of a find's WHERE clause.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Compare {
        column: &'static str,
        op: CompareOp,
        value: Value,
    },
    In {
        column: &'static str,
        values: Vec<Value>,
    },
    /// Row-value membership: `(a, b) IN ((1, 2), (3, 4))`.
    InTuples {
        columns: Vec<&'static str>,
        tuples: Vec<Vec<Value>>,
    },
    IsNull(&'static str),
    NotNull(&'static str),
}

impl Filter {
    pub fn eq(column: &'static str, value: impl Into<Value>) -> Self {
        Filter::Compare {
            column,
            op: CompareOp::Eq,
            value: value.into(),
        }
    }

    pub fn compare(column: &'static str, op: CompareOp, value: impl Into<Value>) -> Self {
        Filter::Compare {
            column,
            op,
            value: value.into(),
        }
    }

    pub fn is_in(column: &'static str, values: Vec<Value>) -> Self {
        Filter::In { column, values }
    }

    /// Evaluate against a row the way SQL would. NULL comparisons are false.
    pub fn matches(&self, row: &Row) -> bool {
        let cell = |column: &str| row.get_by_name(column).unwrap_or(&Value::Null);
        match self {
            Filter::Compare { column, op, value } => {
                let actual = cell(column);
                match op {
                    CompareOp::Eq => actual.sql_eq(value),
                    CompareOp::Ne => {
                        !actual.is_null() && !value.is_null() && !actual.sql_eq(value)
                    }
                    CompareOp::Lt => compare_values(actual, value) == Some(Ordering::Less),
                    CompareOp::Le => matches!(
                        compare_values(actual, value),
                        Some(Ordering::Less | Ordering::Equal)
                    ),
                    CompareOp::Gt => compare_values(actual, value) == Some(Ordering::Greater),
                    CompareOp::Ge => matches!(
                        compare_values(actual, value),
                        Some(Ordering::Greater | Ordering::Equal)
                    ),
                }
            }
            Filter::In { column, values } => {
                let actual = cell(column);
                values.iter().any(|v| actual.sql_eq(v))
            }
            Filter::InTuples { columns, tuples } => tuples.iter().any(|tuple| {
                columns
                    .iter()
                    .zip(tuple)
                    .all(|(column, v)| cell(column).sql_eq(v))
            }),
            Filter::IsNull(column) => cell(column).is_null(),
            Filter::NotNull(column) => !cell(column).is_null(),
        }
    }
}

/// Ordering of two non-null values, `None` when they are not comparable.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    if a.is_null() || b.is_null() {
        return None;
    }
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return Some(x.cmp(&y));
    }
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x.partial_cmp(&y);
    }
    if let (Some(x), Some(y)) = (a.as_str(), b.as_str()) {
        return Some(x.cmp(y));
    }
    None
}

/// ORDER BY term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OrderBy {
    pub column: &'static str,
    pub descending: bool,
}

/// A structured single-table find.
#[derive(Debug, Clone, PartialEq)]
pub struct FindQuery {
    /// Entity type the rows hydrate into; `None` for join-table reads.
    pub entity: Option<&'static str>,
    pub table: &'static str,
    pub filters: Vec<Filter>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl FindQuery {
    /// Find over a raw table.
    pub fn table(table: &'static str) -> Self {
        Self {
            entity: None,
            table,
            filters: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    /// Find rows of an entity type.
    pub fn entity(type_name: &'static str, table: &'static str) -> Self {
        Self {
            entity: Some(type_name),
            ..Self::table(table)
        }
    }

    #[must_use]
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    #[must_use]
    pub fn order_by(mut self, column: &'static str, descending: bool) -> Self {
        self.order_by.push(OrderBy { column, descending });
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Apply filters, ordering, offset and limit to in-memory rows.
    pub fn evaluate<'r>(&self, rows: impl IntoIterator<Item = &'r Row>) -> Vec<Row> {
        let mut matched: Vec<Row> = rows
            .into_iter()
            .filter(|row| self.filters.iter().all(|f| f.matches(row)))
            .cloned()
            .collect();
        if !self.order_by.is_empty() {
            matched.sort_by(|a, b| {
                for term in &self.order_by {
                    let x = a.get_by_name(term.column).unwrap_or(&Value::Null);
                    let y = b.get_by_name(term.column).unwrap_or(&Value::Null);
                    let ord = match (x.is_null(), y.is_null()) {
                        (true, true) => Ordering::Equal,
                        (true, false) => Ordering::Greater,
                        (false, true) => Ordering::Less,
                        (false, false) => compare_values(x, y).unwrap_or(Ordering::Equal),
                    };
                    let ord = if term.descending { ord.reverse() } else { ord };
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            });
        }
        let offset = self.offset.unwrap_or(0);
        let limit = self.limit.unwrap_or(usize::MAX);
        matched.into_iter().skip(offset).take(limit).collect()
    }
}

/// Ask for `count` fresh ids of one entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdRequest {
    pub entity: &'static str,
    pub table: &'static str,
    pub id_column: &'static str,
    pub count: usize,
}

/// A row to insert. `columns` excludes the id column.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertRow {
    pub id: IdValue,
    pub columns: Vec<(&'static str, Value)>,
}

/// Changed columns of one stored row.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateRow {
    pub id: IdValue,
    pub changes: Vec<(&'static str, Value)>,
    /// Version the row must still carry in storage.
    pub expected_version: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteRow {
    pub id: IdValue,
}

/// Writes for one entity type within one pass.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityTodo {
    pub entity: &'static str,
    pub table: &'static str,
    pub id_column: &'static str,
    pub version_column: Option<&'static str>,
    pub inserts: Vec<InsertRow>,
    pub updates: Vec<UpdateRow>,
    pub deletes: Vec<DeleteRow>,
}

impl EntityTodo {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }
}

/// A join-table row to insert or delete.
///
/// Inserted rows get their storage id filled in by the driver. Deletes go by
/// id when it is known, otherwise by the column pair.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinRowWrite {
    pub id: Option<i64>,
    pub values: [Value; 2],
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinRowTodo {
    pub table: &'static str,
    pub columns: [&'static str; 2],
    pub new_rows: Vec<JoinRowWrite>,
    pub deleted_rows: Vec<JoinRowWrite>,
}

/// Everything one flush pass writes.
///
/// `entities` is in dependency order: parents before children. Drivers write
/// inserts in that order, then updates, then join-row deletes and inserts, then
/// entity deletes in reverse order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushBatch {
    pub entities: Vec<EntityTodo>,
    pub join_rows: Vec<JoinRowTodo>,
}

impl FlushBatch {
    pub fn is_empty(&self) -> bool {
        self.entities.iter().all(EntityTodo::is_empty)
            && self
                .join_rows
                .iter()
                .all(|j| j.new_rows.is_empty() && j.deleted_rows.is_empty())
    }
}

/// Result of a flush operation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FlushResult {
    /// Number of rows inserted.
    pub inserted: usize,
    /// Number of rows updated.
    pub updated: usize,
    /// Number of rows deleted.
    pub deleted: usize,
    pub join_inserted: usize,
    pub join_deleted: usize,
}

impl FlushResult {
    /// Create a new empty result.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of operations performed.
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted + self.join_inserted + self.join_deleted
    }

    pub fn absorb(&mut self, other: FlushResult) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.join_inserted += other.join_inserted;
        self.join_deleted += other.join_deleted;
    }
}

/// Storage backend consumed by the read batcher and the flush planner.
///
/// Implementations must be `Send + Sync` for use across async boundaries.
pub trait Driver: Send + Sync {
    /// Whether foreign keys are checked at commit rather than per statement.
    fn supports_deferred_constraints(&self) -> bool {
        false
    }

    /// Run a structured find and return all matching rows.
    fn execute_find(
        &self,
        cx: &Cx,
        query: &FindQuery,
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send;

    /// Run raw SQL and return all rows.
    fn execute_query(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send;

    /// Begin a transaction. Nested calls only deepen the current one.
    fn begin(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Commit; only the outermost commit reaches storage.
    fn commit(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Roll back the whole transaction, whatever the nesting depth.
    fn rollback(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Reserve ids for every request in one round trip.
    ///
    /// Returns one id list per request, in request order.
    fn assign_new_ids(
        &self,
        cx: &Cx,
        requests: &[IdRequest],
    ) -> impl Future<Output = Outcome<Vec<Vec<IdValue>>, Error>> + Send;

    /// Write one flush pass, filling in the ids of inserted join rows.
    fn flush(
        &self,
        cx: &Cx,
        batch: &mut FlushBatch,
    ) -> impl Future<Output = Outcome<FlushResult, Error>> + Send;
}

//! [`MemoryDriver`]: a [`Driver`] over in-process tables.
//!
//! State lives in an `Arc<Mutex<_>>`, so clones of a driver share one store.
//! Every operation runs synchronously under the mutex and the async methods
//! only wrap it.

#![allow(clippy::manual_async_fn)] // Trait impls must match the trait's `impl Future` signatures

use crate::store::Store;
use asupersync::{Cx, Outcome};
use joinery_core::{
    Error, IdValue, OptimisticLockError, QueryErrorKind, Result, Row, TransactionError,
    TransactionErrorKind, Value,
};
use joinery_session::{Driver, EntityTodo, FindQuery, FlushBatch, FlushResult, IdRequest, JoinRowTodo};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

/// Calls made against a [`MemoryDriver`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    /// `execute_find` calls; one per batched read
    pub finds: usize,
    pub flushes: usize,
    /// `assign_new_ids` calls
    pub id_calls: usize,
    pub ids_reserved: usize,
    pub begins: usize,
    pub commits: usize,
    pub rollbacks: usize,
}

#[derive(Debug, Default)]
struct MemoryInner {
    store: Store,
    /// Store as of the outermost `begin`.
    snapshot: Option<Store>,
    depth: usize,
    /// Last id handed out per table. Not rolled back.
    sequences: HashMap<&'static str, i64>,
    stats: MemoryStats,
    find_log: Vec<FindQuery>,
    fail_next_flush: Option<Error>,
    reservation_limit: Option<usize>,
    deferred_constraints: bool,
}

impl MemoryInner {
    fn next_id(&mut self, table: &'static str) -> i64 {
        let floor = self.store.max_int_id(table);
        let seq = self.sequences.entry(table).or_insert(0);
        *seq = (*seq).max(floor) + 1;
        *seq
    }

    fn begin(&mut self) {
        self.stats.begins += 1;
        if self.depth == 0 {
            self.snapshot = Some(self.store.clone());
        }
        self.depth += 1;
    }

    fn commit(&mut self) -> Result<()> {
        if self.depth == 0 {
            return Err(not_active("commit"));
        }
        self.depth -= 1;
        if self.depth == 0 {
            self.snapshot = None;
            self.stats.commits += 1;
            tracing::debug!("Memory transaction committed");
        }
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        let Some(snapshot) = self.snapshot.take() else {
            return Err(not_active("rollback"));
        };
        self.store = snapshot;
        self.depth = 0;
        self.stats.rollbacks += 1;
        tracing::debug!("Memory transaction rolled back");
        Ok(())
    }

    fn reserve(&mut self, requests: &[IdRequest]) -> Vec<Vec<IdValue>> {
        self.stats.id_calls += 1;
        let mut out = Vec::with_capacity(requests.len());
        for request in requests {
            let count = self
                .reservation_limit
                .map_or(request.count, |limit| request.count.min(limit));
            let ids: Vec<IdValue> = (0..count)
                .map(|_| IdValue::Int(self.next_id(request.table)))
                .collect();
            self.stats.ids_reserved += ids.len();
            tracing::trace!(table = request.table, requested = request.count, reserved = ids.len(), "Reserved ids");
            out.push(ids);
        }
        out
    }

    /// Write one pass. Nothing is kept unless the whole pass succeeds.
    fn write(&mut self, batch: &mut FlushBatch) -> Result<FlushResult> {
        self.stats.flushes += 1;
        if let Some(err) = self.fail_next_flush.take() {
            return Err(err);
        }

        let mut store = self.store.clone();
        let mut result = FlushResult::new();
        for todo in &batch.entities {
            for insert in &todo.inserts {
                let row = Row::from_pairs(
                    std::iter::once((todo.id_column, insert.id.to_value()))
                        .chain(insert.columns.iter().cloned()),
                );
                store.insert(todo.table, todo.id_column, row)?;
                result.inserted += 1;
            }
        }
        for todo in &batch.entities {
            result.updated += update_rows(&mut store, todo)?;
        }
        for join in &batch.join_rows {
            result.join_deleted += delete_join_rows(&mut store, join);
        }
        for join in &mut batch.join_rows {
            for row in &mut join.new_rows {
                if let Some(IdValue::Int(existing)) = store.find_pair(join.table, join.columns, &row.values) {
                    row.id = Some(existing);
                    continue;
                }
                let id = self.next_id(join.table);
                store.insert(
                    join.table,
                    "id",
                    Row::from_pairs([
                        ("id", Value::BigInt(id)),
                        (join.columns[0], row.values[0].clone()),
                        (join.columns[1], row.values[1].clone()),
                    ]),
                )?;
                row.id = Some(id);
                result.join_inserted += 1;
            }
        }
        for todo in batch.entities.iter().rev() {
            for delete in &todo.deletes {
                if store.remove(todo.table, &delete.id) {
                    result.deleted += 1;
                }
            }
        }

        self.store = store;
        tracing::debug!(
            inserted = result.inserted,
            updated = result.updated,
            deleted = result.deleted,
            join_inserted = result.join_inserted,
            join_deleted = result.join_deleted,
            "Memory flush written"
        );
        Ok(result)
    }
}

/// Apply one type's updates, checking versions first.
fn update_rows(store: &mut Store, todo: &EntityTodo) -> Result<usize> {
    if todo.updates.is_empty() {
        return Ok(0);
    }
    let table = store.table(todo.table);
    let mut stale = Vec::new();
    for update in &todo.updates {
        let row = table.and_then(|t| t.get(&update.id));
        let current = match (row, todo.version_column, update.expected_version) {
            (None, _, _) => false,
            (Some(row), Some(column), Some(expected)) => {
                row.get_by_name(column).and_then(Value::as_i64) == Some(expected)
            }
            (Some(_), _, _) => true,
        };
        if !current {
            stale.push(update.id.to_string());
        }
    }
    if !stale.is_empty() {
        let expected = todo.updates.len() as u64;
        tracing::warn!(table = todo.table, stale = stale.len(), "Optimistic lock check failed");
        return Err(Error::OptimisticLock(OptimisticLockError {
            table: todo.table,
            expected,
            actual: expected - stale.len() as u64,
            ids: stale,
        }));
    }
    for update in &todo.updates {
        store.update(todo.table, &update.id, &update.changes);
    }
    Ok(todo.updates.len())
}

fn delete_join_rows(store: &mut Store, join: &JoinRowTodo) -> usize {
    let mut deleted = 0;
    for row in &join.deleted_rows {
        let id = match row.id {
            Some(id) => Some(IdValue::Int(id)),
            None => store.find_pair(join.table, join.columns, &row.values),
        };
        if id.is_some_and(|id| store.remove(join.table, &id)) {
            deleted += 1;
        }
    }
    deleted
}

fn not_active(op: &str) -> Error {
    Error::Transaction(TransactionError {
        kind: TransactionErrorKind::NotActive,
        message: format!("{} without an active transaction", op),
    })
}

/// In-process storage for tests and prototyping.
///
/// Foreign keys are never checked, so the driver reports deferred constraints
/// unless told otherwise.
#[derive(Debug, Clone)]
pub struct MemoryDriver {
    inner: Arc<Mutex<MemoryInner>>,
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryInner {
                deferred_constraints: true,
                ..MemoryInner::default()
            })),
        }
    }

    /// Report immediate constraints, as a backend without deferral would.
    #[must_use]
    pub fn with_immediate_constraints(self) -> Self {
        self.lock().deferred_constraints = false;
        self
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Seed a row directly, outside any transaction bookkeeping.
    pub fn insert_row(&self, table: &'static str, id_column: &'static str, row: Row) -> Result<()> {
        self.lock().store.insert(table, id_column, row).map(|_| ())
    }

    /// Seed many rows of one table.
    pub fn insert_rows(
        &self,
        table: &'static str,
        id_column: &'static str,
        rows: impl IntoIterator<Item = Row>,
    ) -> Result<()> {
        let mut inner = self.lock();
        for row in rows {
            inner.store.insert(table, id_column, row)?;
        }
        Ok(())
    }

    /// All rows of a table, ordered by id.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.lock()
            .store
            .table(table)
            .map(|t| t.rows().cloned().collect())
            .unwrap_or_default()
    }

    pub fn row(&self, table: &str, id: &IdValue) -> Option<Row> {
        self.lock().store.table(table)?.get(id).cloned()
    }

    /// Change one stored column, as a concurrent writer would.
    pub fn set_column(&self, table: &str, id: &IdValue, column: &str, value: impl Into<Value>) -> bool {
        self.lock().store.update(table, id, &[(column, value.into())])
    }

    /// Make the next `flush` call fail with `err` before writing anything.
    pub fn fail_next_flush(&self, err: Error) {
        self.lock().fail_next_flush = Some(err);
    }

    /// Hand out at most `limit` ids per request, to exercise short reservations.
    pub fn limit_reservations(&self, limit: Option<usize>) {
        self.lock().reservation_limit = limit;
    }

    pub fn stats(&self) -> MemoryStats {
        self.lock().stats
    }

    /// Every find the driver ran, in order.
    pub fn finds(&self) -> Vec<FindQuery> {
        self.lock().find_log.clone()
    }

    pub fn reset_stats(&self) {
        let mut inner = self.lock();
        inner.stats = MemoryStats::default();
        inner.find_log.clear();
    }

    pub fn in_transaction(&self) -> bool {
        self.lock().depth > 0
    }
}

impl Driver for MemoryDriver {
    fn supports_deferred_constraints(&self) -> bool {
        self.lock().deferred_constraints
    }

    fn execute_find(
        &self,
        _cx: &Cx,
        query: &FindQuery,
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let query = query.clone();
        async move {
            let mut inner = self.lock();
            inner.stats.finds += 1;
            let rows = inner
                .store
                .table(query.table)
                .map(|t| query.evaluate(t.rows()))
                .unwrap_or_default();
            tracing::trace!(table = query.table, rows = rows.len(), "Memory find");
            inner.find_log.push(query);
            Outcome::Ok(rows)
        }
    }

    fn execute_query(
        &self,
        _cx: &Cx,
        sql: &str,
        _params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let message = format!("memory driver cannot run SQL: {}", sql);
        async move { Outcome::Err(Error::query(QueryErrorKind::Unsupported, message)) }
    }

    fn begin(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        async move {
            self.lock().begin();
            Outcome::Ok(())
        }
    }

    fn commit(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        async move {
            match self.lock().commit() {
                Ok(()) => Outcome::Ok(()),
                Err(e) => Outcome::Err(e),
            }
        }
    }

    fn rollback(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        async move {
            match self.lock().rollback() {
                Ok(()) => Outcome::Ok(()),
                Err(e) => Outcome::Err(e),
            }
        }
    }

    fn assign_new_ids(
        &self,
        _cx: &Cx,
        requests: &[IdRequest],
    ) -> impl Future<Output = Outcome<Vec<Vec<IdValue>>, Error>> + Send {
        let requests = requests.to_vec();
        async move { Outcome::Ok(self.lock().reserve(&requests)) }
    }

    fn flush(
        &self,
        _cx: &Cx,
        batch: &mut FlushBatch,
    ) -> impl Future<Output = Outcome<FlushResult, Error>> + Send {
        // Written eagerly; the future only reports the result.
        let written = self.lock().write(batch);
        async move {
            match written {
                Ok(result) => Outcome::Ok(result),
                Err(e) => Outcome::Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;
    use joinery_session::{InsertRow, JoinRowWrite, UpdateRow};

    fn block_on<F: Future>(f: F) -> F::Output {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        rt.block_on(f)
    }

    fn unwrap<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    fn author_todo() -> EntityTodo {
        EntityTodo {
            entity: "Author",
            table: "authors",
            id_column: "id",
            version_column: Some("version"),
            inserts: Vec::new(),
            updates: Vec::new(),
            deletes: Vec::new(),
        }
    }

    fn seeded() -> MemoryDriver {
        let driver = MemoryDriver::new();
        driver
            .insert_row(
                "authors",
                "id",
                Row::from_pairs([
                    ("id", Value::BigInt(1)),
                    ("first_name", Value::from("a")),
                    ("version", Value::BigInt(1)),
                ]),
            )
            .unwrap();
        driver
    }

    #[test]
    fn ids_continue_after_seeded_rows() {
        let driver = seeded();
        let cx = Cx::for_testing();
        let request = IdRequest {
            entity: "Author",
            table: "authors",
            id_column: "id",
            count: 2,
        };
        let ids = unwrap(block_on(driver.assign_new_ids(&cx, &[request.clone()])));
        assert_eq!(ids, vec![vec![IdValue::Int(2), IdValue::Int(3)]]);

        driver.limit_reservations(Some(1));
        let short = unwrap(block_on(driver.assign_new_ids(&cx, &[request])));
        assert_eq!(short[0].len(), 1);
        assert_eq!(driver.stats().id_calls, 2);
    }

    #[test]
    fn rollback_restores_the_outermost_snapshot() {
        let driver = seeded();
        let cx = Cx::for_testing();
        block_on(async {
            unwrap(driver.begin(&cx).await);
            unwrap(driver.begin(&cx).await);
            let mut todo = author_todo();
            todo.inserts.push(InsertRow {
                id: IdValue::Int(5),
                columns: vec![("first_name", Value::from("b"))],
            });
            let mut batch = FlushBatch {
                entities: vec![todo],
                join_rows: Vec::new(),
            };
            unwrap(driver.flush(&cx, &mut batch).await);
            unwrap(driver.commit(&cx).await);
            assert!(driver.in_transaction());
            unwrap(driver.rollback(&cx).await);
        });
        assert!(!driver.in_transaction());
        assert_eq!(driver.rows("authors").len(), 1);
        let stats = driver.stats();
        assert_eq!((stats.begins, stats.commits, stats.rollbacks), (2, 0, 1));
    }

    #[test]
    fn stale_versions_fail_the_whole_statement() {
        let driver = seeded();
        let cx = Cx::for_testing();
        driver.set_column("authors", &IdValue::Int(1), "version", Value::BigInt(2));
        let mut todo = author_todo();
        todo.updates.push(UpdateRow {
            id: IdValue::Int(1),
            changes: vec![("first_name", Value::from("z")), ("version", Value::BigInt(2))],
            expected_version: Some(1),
        });
        let mut batch = FlushBatch {
            entities: vec![todo],
            join_rows: Vec::new(),
        };
        match block_on(driver.flush(&cx, &mut batch)) {
            Outcome::Err(Error::OptimisticLock(e)) => {
                assert_eq!(e.table, "authors");
                assert_eq!((e.expected, e.actual), (1, 0));
                assert_eq!(e.ids, vec!["1".to_string()]);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        let row = driver.row("authors", &IdValue::Int(1)).unwrap();
        assert_eq!(row.get_by_name("first_name"), Some(&Value::from("a")));
    }

    #[test]
    fn join_rows_upsert_by_pair_and_get_ids() {
        let driver = MemoryDriver::new();
        let cx = Cx::for_testing();
        let pair = [Value::BigInt(1), Value::BigInt(2)];
        let mut batch = FlushBatch {
            entities: Vec::new(),
            join_rows: vec![JoinRowTodo {
                table: "authors_to_tags",
                columns: ["author_id", "tag_id"],
                new_rows: vec![
                    JoinRowWrite {
                        id: None,
                        values: pair.clone(),
                    },
                    JoinRowWrite {
                        id: None,
                        values: pair.clone(),
                    },
                ],
                deleted_rows: Vec::new(),
            }],
        };
        let result = unwrap(block_on(driver.flush(&cx, &mut batch)));
        assert_eq!(result.join_inserted, 1);
        let ids: Vec<_> = batch.join_rows[0].new_rows.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![Some(1), Some(1)]);

        let mut delete = FlushBatch {
            entities: Vec::new(),
            join_rows: vec![JoinRowTodo {
                table: "authors_to_tags",
                columns: ["author_id", "tag_id"],
                new_rows: Vec::new(),
                deleted_rows: vec![JoinRowWrite {
                    id: None,
                    values: pair,
                }],
            }],
        };
        let result = unwrap(block_on(driver.flush(&cx, &mut delete)));
        assert_eq!(result.join_deleted, 1);
        assert!(driver.rows("authors_to_tags").is_empty());
    }

    #[test]
    fn injected_failure_writes_nothing() {
        let driver = seeded();
        let cx = Cx::for_testing();
        driver.fail_next_flush(Error::Custom("boom".to_string()));
        let mut todo = author_todo();
        todo.deletes.push(joinery_session::DeleteRow { id: IdValue::Int(1) });
        let mut batch = FlushBatch {
            entities: vec![todo],
            join_rows: Vec::new(),
        };
        assert!(matches!(
            block_on(driver.flush(&cx, &mut batch)),
            Outcome::Err(Error::Custom(_))
        ));
        assert_eq!(driver.rows("authors").len(), 1);
        let result = unwrap(block_on(driver.flush(&cx, &mut batch)));
        assert_eq!(result.deleted, 1);
    }

    #[test]
    fn raw_sql_is_unsupported() {
        let driver = MemoryDriver::new();
        let cx = Cx::for_testing();
        let outcome = block_on(driver.execute_query(&cx, "SELECT 1", &[]));
        assert!(matches!(outcome, Outcome::Err(Error::Query(_))));
    }
}

//! [`SqlDriver`]: a [`Driver`] that writes batched SQL through a [`Connection`].

#![allow(clippy::manual_async_fn)] // Trait impls must match the trait's `impl Future` signatures

use crate::config::{ResolvedSequences, SqlDriverConfig};
use crate::statements::{self, Statement};
use asupersync::{Cx, Outcome};
use joinery_core::{
    Connection, Dialect, Error, IdValue, OptimisticLockError, Result, Row, TransactionError,
    TransactionErrorKind, Value,
};
use joinery_session::{
    Driver, EntityTodo, FindQuery, FlushBatch, FlushResult, IdRequest, InsertRow, JoinRowTodo,
    UpdateRow,
};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Reference driver over any [`Connection`].
///
/// Transactions nest by depth: only the outermost `begin` and `commit` reach
/// the connection, and `rollback` always ends the whole transaction.
#[derive(Debug)]
pub struct SqlDriver<C: Connection> {
    conn: C,
    dialect: Dialect,
    sequences: ResolvedSequences,
    max_rows: usize,
    depth: AtomicUsize,
}

impl<C: Connection> SqlDriver<C> {
    pub fn new(conn: C) -> Result<Self> {
        Self::with_config(conn, SqlDriverConfig::default())
    }

    pub fn with_config(conn: C, config: SqlDriverConfig) -> Result<Self> {
        let dialect = conn.dialect();
        let sequences = config.resolve(dialect)?;
        Ok(Self {
            conn,
            dialect,
            sequences,
            max_rows: config.max_rows_per_statement.max(1),
            depth: AtomicUsize::new(0),
        })
    }

    pub fn connection(&self) -> &C {
        &self.conn
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Current transaction nesting depth.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    async fn run(&self, cx: &Cx, stmt: &Statement) -> Outcome<u64, Error> {
        tracing::trace!(sql = %stmt.sql, params = stmt.params.len(), "Executing statement");
        self.conn.execute(cx, &stmt.sql, &stmt.params).await
    }

    async fn fetch(&self, cx: &Cx, stmt: &Statement) -> Outcome<Vec<Row>, Error> {
        tracing::trace!(sql = %stmt.sql, params = stmt.params.len(), "Running query");
        self.conn.query(cx, &stmt.sql, &stmt.params).await
    }

    async fn write_inserts(&self, cx: &Cx, todo: &EntityTodo) -> Outcome<usize, Error> {
        let mut written = 0;
        for group in group_by_columns(&todo.inserts, |r: &InsertRow| {
            r.columns.iter().map(|(c, _)| *c).collect::<Vec<_>>()
        }) {
            for chunk in group.chunks(self.max_rows) {
                let stmt = statements::insert_rows(self.dialect, todo, chunk);
                try_outcome!(self.run(cx, &stmt).await);
                written += chunk.len();
            }
        }
        Outcome::Ok(written)
    }

    async fn write_updates(&self, cx: &Cx, todo: &EntityTodo) -> Outcome<usize, Error> {
        let mut written = 0;
        for group in group_by_columns(&todo.updates, |r: &UpdateRow| {
            let mut key: Vec<&'static str> = r.changes.iter().map(|(c, _)| *c).collect();
            if r.expected_version.is_some() {
                key.push("");
            }
            key
        }) {
            for chunk in group.chunks(self.max_rows) {
                let stmt = statements::update_rows(self.dialect, todo, chunk);
                let affected = try_outcome!(self.run(cx, &stmt).await);
                let checked = todo.version_column.is_some() && chunk[0].expected_version.is_some();
                if checked && affected < chunk.len() as u64 {
                    tracing::warn!(
                        table = todo.table,
                        expected = chunk.len(),
                        actual = affected,
                        "Optimistic lock check failed"
                    );
                    return Outcome::Err(Error::OptimisticLock(OptimisticLockError {
                        table: todo.table,
                        expected: chunk.len() as u64,
                        actual: affected,
                        ids: chunk.iter().map(|r| r.id.to_string()).collect(),
                    }));
                }
                written += chunk.len();
            }
        }
        Outcome::Ok(written)
    }

    async fn write_deletes(&self, cx: &Cx, todo: &EntityTodo) -> Outcome<usize, Error> {
        let mut deleted = 0;
        for chunk in todo.deletes.chunks(self.max_rows) {
            let ids = chunk.iter().map(|d| d.id.to_value()).collect();
            let stmt = statements::delete_by_ids(self.dialect, todo.table, todo.id_column, ids);
            deleted += try_outcome!(self.run(cx, &stmt).await) as usize;
        }
        Outcome::Ok(deleted)
    }

    async fn delete_join_rows(&self, cx: &Cx, join: &JoinRowTodo) -> Outcome<usize, Error> {
        let mut deleted = 0;
        let (by_id, by_pair): (Vec<_>, Vec<_>) = join.deleted_rows.iter().partition(|r| r.id.is_some());
        for chunk in by_id.chunks(self.max_rows) {
            let ids = chunk
                .iter()
                .filter_map(|r| r.id.map(Value::BigInt))
                .collect();
            let stmt = statements::delete_by_ids(self.dialect, join.table, "id", ids);
            deleted += try_outcome!(self.run(cx, &stmt).await) as usize;
        }
        for chunk in by_pair.chunks(self.max_rows) {
            let pairs: Vec<[Value; 2]> = chunk.iter().map(|r| r.values.clone()).collect();
            let stmt = statements::delete_join_pairs(self.dialect, join.table, join.columns, &pairs);
            deleted += try_outcome!(self.run(cx, &stmt).await) as usize;
        }
        Outcome::Ok(deleted)
    }

    /// Insert join rows and fill in their ids.
    async fn insert_join_rows(&self, cx: &Cx, join: &mut JoinRowTodo) -> Outcome<usize, Error> {
        let mut inserted = 0;
        let table = join.table;
        let columns = join.columns;
        for chunk in join.new_rows.chunks_mut(self.max_rows) {
            let pairs: Vec<[Value; 2]> = chunk.iter().map(|r| r.values.clone()).collect();
            let stmt = statements::insert_join_rows(self.dialect, table, columns, &pairs);
            let rows = if self.dialect.supports_returning() {
                let rows = try_outcome!(self.fetch(cx, &stmt).await);
                inserted += rows.len();
                rows
            } else {
                inserted += try_outcome!(self.run(cx, &stmt).await) as usize;
                let select = statements::select_join_ids(self.dialect, table, columns, &pairs);
                try_outcome!(self.fetch(cx, &select).await)
            };
            for row in chunk.iter_mut() {
                row.id = rows.iter().find_map(|stored| {
                    let matches = columns
                        .iter()
                        .zip(&row.values)
                        .all(|(c, v)| stored.get_by_name(c).is_some_and(|s| s.sql_eq(v)));
                    if matches {
                        stored.get_by_name("id").and_then(Value::as_i64)
                    } else {
                        None
                    }
                });
                if row.id.is_none() {
                    tracing::warn!(table, "Join row id not returned by storage");
                }
            }
        }
        Outcome::Ok(inserted)
    }

    #[tracing::instrument(level = "debug", skip(self, cx, batch), fields(types = batch.entities.len(), join_tables = batch.join_rows.len()))]
    async fn write_batch(&self, cx: &Cx, batch: &mut FlushBatch) -> Outcome<FlushResult, Error> {
        let mut result = FlushResult::new();
        for todo in &batch.entities {
            result.inserted += try_outcome!(self.write_inserts(cx, todo).await);
        }
        for todo in &batch.entities {
            result.updated += try_outcome!(self.write_updates(cx, todo).await);
        }
        for join in &batch.join_rows {
            result.join_deleted += try_outcome!(self.delete_join_rows(cx, join).await);
        }
        for join in &mut batch.join_rows {
            result.join_inserted += try_outcome!(self.insert_join_rows(cx, join).await);
        }
        for todo in batch.entities.iter().rev() {
            result.deleted += try_outcome!(self.write_deletes(cx, todo).await);
        }
        tracing::debug!(
            inserted = result.inserted,
            updated = result.updated,
            deleted = result.deleted,
            join_inserted = result.join_inserted,
            join_deleted = result.join_deleted,
            "SQL flush written"
        );
        Outcome::Ok(result)
    }

    async fn reserve(&self, cx: &Cx, requests: &[IdRequest]) -> Outcome<Vec<Vec<IdValue>>, Error> {
        if requests.is_empty() {
            return Outcome::Ok(Vec::new());
        }
        match &self.sequences {
            ResolvedSequences::Native => {
                let stmt = statements::reserve_native(self.dialect, requests);
                let rows = try_outcome!(self.fetch(cx, &stmt).await);
                let mut out = vec![Vec::new(); requests.len()];
                for row in &rows {
                    let request = row.get_by_name("request").and_then(Value::as_i64);
                    let id = row.get_by_name("id").and_then(Value::as_i64);
                    if let (Some(request), Some(id)) = (request, id) {
                        if let Some(ids) = out.get_mut(request as usize) {
                            ids.push(id);
                        }
                    }
                }
                Outcome::Ok(
                    out.into_iter()
                        .map(|mut ids| {
                            ids.sort_unstable();
                            ids.into_iter().map(IdValue::Int).collect()
                        })
                        .collect(),
                )
            }
            ResolvedSequences::Table(sequence_table) => {
                let mut out = Vec::with_capacity(requests.len());
                for request in requests {
                    let bump =
                        statements::sequence_bump(self.dialect, sequence_table, request.table, request.count);
                    if try_outcome!(self.run(cx, &bump).await) == 0 {
                        let seed = statements::sequence_seed(self.dialect, sequence_table, request);
                        try_outcome!(self.run(cx, &seed).await);
                    }
                    let read = statements::sequence_read(self.dialect, sequence_table, request.table);
                    let rows = try_outcome!(self.fetch(cx, &read).await);
                    let last = rows
                        .first()
                        .and_then(|r| r.get_by_name("next_id"))
                        .and_then(Value::as_i64)
                        .unwrap_or(0);
                    let first = last - request.count as i64 + 1;
                    out.push((first.max(1)..=last).map(IdValue::Int).collect());
                }
                Outcome::Ok(out)
            }
        }
    }

    async fn transaction_statement(&self, cx: &Cx, sql: &str) -> Outcome<(), Error> {
        tracing::debug!(sql, "Transaction");
        match self.conn.execute(cx, sql, &[]).await {
            Outcome::Ok(_) => Outcome::Ok(()),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }
}

/// Split rows into groups sharing a key, keeping first-seen order.
fn group_by_columns<'r, R, K: PartialEq>(rows: &'r [R], key: impl Fn(&R) -> K) -> Vec<Vec<&'r R>> {
    let mut groups: Vec<(K, Vec<&'r R>)> = Vec::new();
    for row in rows {
        let k = key(row);
        match groups.iter_mut().find(|(g, _)| *g == k) {
            Some((_, members)) => members.push(row),
            None => groups.push((k, vec![row])),
        }
    }
    groups.into_iter().map(|(_, members)| members).collect()
}

fn not_active(op: &str) -> Error {
    Error::Transaction(TransactionError {
        kind: TransactionErrorKind::NotActive,
        message: format!("{} without an active transaction", op),
    })
}

impl<C: Connection> Driver for SqlDriver<C> {
    fn supports_deferred_constraints(&self) -> bool {
        self.dialect.supports_deferred_constraints()
    }

    fn execute_find(
        &self,
        cx: &Cx,
        query: &FindQuery,
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let stmt = statements::select(self.dialect, query);
        async move { self.fetch(cx, &stmt).await }
    }

    fn execute_query(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        self.conn.query(cx, sql, params)
    }

    fn begin(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        async move {
            if self.depth.fetch_add(1, Ordering::SeqCst) > 0 {
                return Outcome::Ok(());
            }
            let outcome = self.transaction_statement(cx, "BEGIN").await;
            if !matches!(outcome, Outcome::Ok(())) {
                self.depth.store(0, Ordering::SeqCst);
            }
            outcome
        }
    }

    fn commit(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        async move {
            match self.depth.load(Ordering::SeqCst) {
                0 => Outcome::Err(not_active("commit")),
                1 => {
                    self.depth.store(0, Ordering::SeqCst);
                    self.transaction_statement(cx, "COMMIT").await
                }
                _ => {
                    self.depth.fetch_sub(1, Ordering::SeqCst);
                    Outcome::Ok(())
                }
            }
        }
    }

    fn rollback(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        async move {
            if self.depth.swap(0, Ordering::SeqCst) == 0 {
                return Outcome::Err(not_active("rollback"));
            }
            self.transaction_statement(cx, "ROLLBACK").await
        }
    }

    fn assign_new_ids(
        &self,
        cx: &Cx,
        requests: &[IdRequest],
    ) -> impl Future<Output = Outcome<Vec<Vec<IdValue>>, Error>> + Send {
        async move { self.reserve(cx, requests).await }
    }

    fn flush(
        &self,
        cx: &Cx,
        batch: &mut FlushBatch,
    ) -> impl Future<Output = Outcome<FlushResult, Error>> + Send {
        async move { self.write_batch(cx, batch).await }
    }
}

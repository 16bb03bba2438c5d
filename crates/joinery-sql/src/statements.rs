//! SQL text for every statement the driver issues.
//!
//! Builders return a [`Statement`] with positional bindings in the dialect's
//! placeholder style. Identifiers are always quoted.

use joinery_core::{Dialect, Value};
use joinery_session::{EntityTodo, Filter, FindQuery, IdRequest, InsertRow, UpdateRow};

/// SQL text plus its bindings.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

struct SqlWriter {
    dialect: Dialect,
    sql: String,
    params: Vec<Value>,
}

impl SqlWriter {
    fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            sql: String::new(),
            params: Vec::new(),
        }
    }

    fn push(&mut self, text: &str) {
        self.sql.push_str(text);
    }

    fn ident(&mut self, name: &str) {
        let quoted = self.dialect.quote_identifier(name);
        self.sql.push_str(&quoted);
    }

    fn idents(&mut self, names: &[&str]) {
        for (i, name) in names.iter().enumerate() {
            if i > 0 {
                self.push(", ");
            }
            self.ident(name);
        }
    }

    fn bind(&mut self, value: Value) {
        self.params.push(value);
        let placeholder = self.dialect.placeholder(self.params.len());
        self.sql.push_str(&placeholder);
    }

    /// `(p1, p2, ...)`
    fn bind_list(&mut self, values: impl IntoIterator<Item = Value>) {
        self.push("(");
        for (i, value) in values.into_iter().enumerate() {
            if i > 0 {
                self.push(", ");
            }
            self.bind(value);
        }
        self.push(")");
    }

    /// `(a, b) IN ((p1, p2), (p3, p4))`, or a false predicate when empty.
    fn tuple_in(&mut self, columns: &[&str], tuples: &[Vec<Value>]) {
        if tuples.is_empty() {
            self.push("1 = 0");
            return;
        }
        if columns.len() == 1 {
            self.ident(columns[0]);
            self.push(" IN ");
            self.bind_list(tuples.iter().filter_map(|t| t.first().cloned()));
            return;
        }
        self.push("(");
        self.idents(columns);
        self.push(") IN (");
        for (i, tuple) in tuples.iter().enumerate() {
            if i > 0 {
                self.push(", ");
            }
            self.bind_list(tuple.iter().cloned());
        }
        self.push(")");
    }

    fn filter(&mut self, filter: &Filter) {
        match filter {
            Filter::Compare { column, op, value } => {
                self.ident(column);
                self.push(" ");
                self.push(op.as_sql());
                self.push(" ");
                self.bind(value.clone());
            }
            Filter::In { column, values } => {
                if values.is_empty() {
                    self.push("1 = 0");
                } else {
                    self.ident(column);
                    self.push(" IN ");
                    self.bind_list(values.iter().cloned());
                }
            }
            Filter::InTuples { columns, tuples } => self.tuple_in(columns, tuples),
            Filter::IsNull(column) => {
                self.ident(column);
                self.push(" IS NULL");
            }
            Filter::NotNull(column) => {
                self.ident(column);
                self.push(" IS NOT NULL");
            }
        }
    }

    /// `CASE "id" WHEN p THEN p ... END`
    fn case_by_id<'v>(&mut self, id_column: &str, arms: impl IntoIterator<Item = (Value, &'v Value)>) {
        self.push("CASE ");
        self.ident(id_column);
        for (id, value) in arms {
            self.push(" WHEN ");
            self.bind(id);
            self.push(" THEN ");
            self.bind(value.clone());
        }
        self.push(" END");
    }

    fn finish(self) -> Statement {
        Statement {
            sql: self.sql,
            params: self.params,
        }
    }
}

/// `SELECT * FROM t WHERE ... ORDER BY ... LIMIT ... OFFSET ...`
pub fn select(dialect: Dialect, query: &FindQuery) -> Statement {
    let mut w = SqlWriter::new(dialect);
    w.push("SELECT * FROM ");
    w.ident(query.table);
    for (i, filter) in query.filters.iter().enumerate() {
        w.push(if i == 0 { " WHERE " } else { " AND " });
        w.filter(filter);
    }
    for (i, order) in query.order_by.iter().enumerate() {
        w.push(if i == 0 { " ORDER BY " } else { ", " });
        w.ident(order.column);
        w.push(if order.descending { " DESC" } else { " ASC" });
    }
    if let Some(limit) = query.limit {
        w.push(&format!(" LIMIT {}", limit));
    }
    if let Some(offset) = query.offset {
        if query.limit.is_none() && dialect == Dialect::Mysql {
            w.push(" LIMIT 18446744073709551615");
        }
        w.push(&format!(" OFFSET {}", offset));
    }
    w.finish()
}

/// Multi-row insert. Every row must carry the same columns as the first.
pub fn insert_rows(dialect: Dialect, todo: &EntityTodo, rows: &[&InsertRow]) -> Statement {
    let mut w = SqlWriter::new(dialect);
    let columns: Vec<&str> = rows
        .first()
        .map(|r| r.columns.iter().map(|(c, _)| *c).collect())
        .unwrap_or_default();
    w.push("INSERT INTO ");
    w.ident(todo.table);
    w.push(" (");
    w.ident(todo.id_column);
    for column in &columns {
        w.push(", ");
        w.ident(column);
    }
    w.push(") VALUES ");
    for (i, row) in rows.iter().enumerate() {
        if i > 0 {
            w.push(", ");
        }
        w.bind_list(
            std::iter::once(row.id.to_value()).chain(row.columns.iter().map(|(_, v)| v.clone())),
        );
    }
    w.finish()
}

/// Update rows that change the same columns.
///
/// One row becomes a plain `UPDATE ... WHERE id = ?`; several become one
/// statement with a `CASE` per column. Rows with an expected version also
/// match on the version column.
pub fn update_rows(dialect: Dialect, todo: &EntityTodo, rows: &[&UpdateRow]) -> Statement {
    let mut w = SqlWriter::new(dialect);
    let columns: Vec<&str> = rows
        .first()
        .map(|r| r.changes.iter().map(|(c, _)| *c).collect())
        .unwrap_or_default();
    let version_column = todo
        .version_column
        .filter(|_| rows.iter().all(|r| r.expected_version.is_some()));

    w.push("UPDATE ");
    w.ident(todo.table);
    w.push(" SET ");
    if let [row] = rows {
        for (i, (column, value)) in row.changes.iter().enumerate() {
            if i > 0 {
                w.push(", ");
            }
            w.ident(column);
            w.push(" = ");
            w.bind(value.clone());
        }
        w.push(" WHERE ");
        w.ident(todo.id_column);
        w.push(" = ");
        w.bind(row.id.to_value());
        if let (Some(column), Some(expected)) = (version_column, row.expected_version) {
            w.push(" AND ");
            w.ident(column);
            w.push(" = ");
            w.bind(Value::BigInt(expected));
        }
        return w.finish();
    }

    for (i, column) in columns.iter().enumerate() {
        if i > 0 {
            w.push(", ");
        }
        w.ident(column);
        w.push(" = ");
        w.case_by_id(
            todo.id_column,
            rows.iter().map(|r| (r.id.to_value(), &r.changes[i].1)),
        );
    }
    w.push(" WHERE ");
    w.ident(todo.id_column);
    w.push(" IN ");
    w.bind_list(rows.iter().map(|r| r.id.to_value()));
    if let Some(column) = version_column {
        let expected: Vec<(Value, Value)> = rows
            .iter()
            .map(|r| (r.id.to_value(), Value::BigInt(r.expected_version.unwrap_or_default())))
            .collect();
        w.push(" AND ");
        w.ident(column);
        w.push(" = ");
        w.case_by_id(todo.id_column, expected.iter().map(|(id, v)| (id.clone(), v)));
    }
    w.finish()
}

/// `DELETE FROM t WHERE id IN (...)`
pub fn delete_by_ids(dialect: Dialect, table: &str, id_column: &str, ids: Vec<Value>) -> Statement {
    let mut w = SqlWriter::new(dialect);
    w.push("DELETE FROM ");
    w.ident(table);
    w.push(" WHERE ");
    w.ident(id_column);
    w.push(" IN ");
    w.bind_list(ids);
    w.finish()
}

/// `DELETE FROM t WHERE (a, b) IN ((...), ...)`
pub fn delete_join_pairs(dialect: Dialect, table: &str, columns: [&str; 2], pairs: &[[Value; 2]]) -> Statement {
    let mut w = SqlWriter::new(dialect);
    let tuples: Vec<Vec<Value>> = pairs.iter().map(|p| p.to_vec()).collect();
    w.push("DELETE FROM ");
    w.ident(table);
    w.push(" WHERE ");
    w.tuple_in(&columns, &tuples);
    w.finish()
}

/// Insert join rows, leaving existing pairs alone.
///
/// Dialects with `RETURNING` get back the id of every pair, new or existing,
/// from this one statement. Elsewhere `INSERT IGNORE` is followed by
/// [`select_join_ids`].
pub fn insert_join_rows(dialect: Dialect, table: &str, columns: [&str; 2], pairs: &[[Value; 2]]) -> Statement {
    let mut w = SqlWriter::new(dialect);
    w.push(if dialect.supports_returning() {
        "INSERT INTO "
    } else {
        "INSERT IGNORE INTO "
    });
    w.ident(table);
    w.push(" (");
    w.idents(&columns);
    w.push(") VALUES ");
    for (i, pair) in pairs.iter().enumerate() {
        if i > 0 {
            w.push(", ");
        }
        w.bind_list(pair.iter().cloned());
    }
    if dialect.supports_returning() {
        w.push(" ON CONFLICT (");
        w.idents(&columns);
        w.push(") DO UPDATE SET ");
        w.ident(columns[0]);
        w.push(" = EXCLUDED.");
        w.ident(columns[0]);
        w.push(" RETURNING ");
        w.idents(&["id", columns[0], columns[1]]);
    }
    w.finish()
}

/// `SELECT id, a, b FROM t WHERE (a, b) IN (...)`
pub fn select_join_ids(dialect: Dialect, table: &str, columns: [&str; 2], pairs: &[[Value; 2]]) -> Statement {
    let mut w = SqlWriter::new(dialect);
    let tuples: Vec<Vec<Value>> = pairs.iter().map(|p| p.to_vec()).collect();
    w.push("SELECT ");
    w.idents(&["id", columns[0], columns[1]]);
    w.push(" FROM ");
    w.ident(table);
    w.push(" WHERE ");
    w.tuple_in(&columns, &tuples);
    w.finish()
}

/// One query drawing ids from every request's native sequence.
///
/// Each result row carries the request's position in `request` and one id in
/// `id`.
pub fn reserve_native(dialect: Dialect, requests: &[IdRequest]) -> Statement {
    let mut w = SqlWriter::new(dialect);
    for (i, request) in requests.iter().enumerate() {
        if i > 0 {
            w.push(" UNION ALL ");
        }
        w.push(&format!("SELECT {} AS ", i));
        w.ident("request");
        w.push(", nextval(CAST(");
        w.bind(Value::Text(format!("{}_{}_seq", request.table, request.id_column)));
        w.push(" AS regclass)) AS ");
        w.ident("id");
        w.push(" FROM generate_series(1, ");
        w.bind(Value::BigInt(request.count as i64));
        w.push(")");
    }
    w.finish()
}

/// Advance a counter-table entry by `count`.
pub fn sequence_bump(dialect: Dialect, sequence_table: &str, table: &str, count: usize) -> Statement {
    let mut w = SqlWriter::new(dialect);
    w.push("UPDATE ");
    w.ident(sequence_table);
    w.push(" SET ");
    w.ident("next_id");
    w.push(" = ");
    w.ident("next_id");
    w.push(" + ");
    w.bind(Value::BigInt(count as i64));
    w.push(" WHERE ");
    w.ident("table_name");
    w.push(" = ");
    w.bind(Value::Text(table.to_string()));
    w.finish()
}

/// Create a counter-table entry past the table's current ids, already
/// advanced by `request.count`.
pub fn sequence_seed(dialect: Dialect, sequence_table: &str, request: &IdRequest) -> Statement {
    let mut w = SqlWriter::new(dialect);
    w.push("INSERT INTO ");
    w.ident(sequence_table);
    w.push(" (");
    w.idents(&["table_name", "next_id"]);
    w.push(") SELECT ");
    w.bind(Value::Text(request.table.to_string()));
    w.push(", COALESCE(MAX(");
    w.ident(request.id_column);
    w.push("), 0) + ");
    w.bind(Value::BigInt(request.count as i64));
    w.push(" FROM ");
    w.ident(request.table);
    w.finish()
}

/// Read a counter-table entry.
pub fn sequence_read(dialect: Dialect, sequence_table: &str, table: &str) -> Statement {
    let mut w = SqlWriter::new(dialect);
    w.push("SELECT ");
    w.ident("next_id");
    w.push(" FROM ");
    w.ident(sequence_table);
    w.push(" WHERE ");
    w.ident("table_name");
    w.push(" = ");
    w.bind(Value::Text(table.to_string()));
    w.finish()
}

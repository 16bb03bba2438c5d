//! Tables behind [`MemoryDriver`](crate::MemoryDriver).
//!
//! Each table keeps its rows ordered by id, so finds without an `ORDER BY`
//! still come back in a stable order.

use joinery_core::{Error, IdValue, QueryErrorKind, Result, Row, Value};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone)]
pub(crate) struct Table {
    id_column: &'static str,
    rows: BTreeMap<IdValue, Row>,
}

impl Table {
    fn new(id_column: &'static str) -> Self {
        Self {
            id_column,
            rows: BTreeMap::new(),
        }
    }

    pub(crate) fn rows(&self) -> impl Iterator<Item = &Row> {
        self.rows.values()
    }

    pub(crate) fn get(&self, id: &IdValue) -> Option<&Row> {
        self.rows.get(id)
    }

    fn max_int_id(&self) -> i64 {
        self.rows
            .keys()
            .filter_map(|k| match k {
                IdValue::Int(v) => Some(*v),
                IdValue::Text(_) => None,
            })
            .max()
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Store {
    tables: HashMap<&'static str, Table>,
}

impl Store {
    pub(crate) fn table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    fn table_mut(&mut self, name: &'static str, id_column: &'static str) -> &mut Table {
        self.tables
            .entry(name)
            .or_insert_with(|| Table::new(id_column))
    }

    pub(crate) fn max_int_id(&self, name: &str) -> i64 {
        self.tables.get(name).map_or(0, Table::max_int_id)
    }

    /// Add a row; its id must not be taken yet.
    pub(crate) fn insert(&mut self, name: &'static str, id_column: &'static str, row: Row) -> Result<IdValue> {
        let table = self.table_mut(name, id_column);
        let id = row_id(&row, table.id_column, name)?;
        if table.rows.contains_key(&id) {
            return Err(Error::query(
                QueryErrorKind::Constraint,
                format!("duplicate key {}={} in {}", table.id_column, id, name),
            ));
        }
        table.rows.insert(id.clone(), row);
        Ok(id)
    }

    /// Overwrite some columns of one row. False when the row is missing.
    pub(crate) fn update(&mut self, name: &str, id: &IdValue, changes: &[(&str, Value)]) -> bool {
        let Some(row) = self.tables.get_mut(name).and_then(|t| t.rows.get_mut(id)) else {
            return false;
        };
        *row = with_changes(row, changes);
        true
    }

    pub(crate) fn remove(&mut self, name: &str, id: &IdValue) -> bool {
        self.tables
            .get_mut(name)
            .is_some_and(|t| t.rows.remove(id).is_some())
    }

    /// Id of the row whose two columns hold `values`.
    pub(crate) fn find_pair(&self, name: &str, columns: [&str; 2], values: &[Value; 2]) -> Option<IdValue> {
        self.tables.get(name)?.rows.iter().find_map(|(id, row)| {
            let matches = columns.iter().zip(values).all(|(c, v)| {
                row.get_by_name(c).is_some_and(|stored| stored.sql_eq(v))
            });
            matches.then(|| id.clone())
        })
    }
}

fn row_id(row: &Row, id_column: &str, table: &str) -> Result<IdValue> {
    row.get_by_name(id_column)
        .and_then(IdValue::from_value)
        .ok_or_else(|| {
            Error::query(
                QueryErrorKind::Constraint,
                format!("row for {} has no usable {} column", table, id_column),
            )
        })
}

/// Copy of `row` with `changes` applied; unknown columns are appended.
pub(crate) fn with_changes(row: &Row, changes: &[(&str, Value)]) -> Row {
    let mut pairs: Vec<(String, Value)> = row
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect();
    for (column, value) in changes {
        match pairs.iter_mut().find(|(k, _)| k == column) {
            Some(pair) => pair.1 = value.clone(),
            None => pairs.push(((*column).to_string(), value.clone())),
        }
    }
    Row::from_pairs(pairs)
}

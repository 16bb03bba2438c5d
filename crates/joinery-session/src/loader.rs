//! Read batching.
//!
//! Finds enqueued into a [`ReadBatcher`] before [`dispatch`](ReadBatcher::dispatch)
//! form one batching window. Requests with the same [`BatchKey`] are merged
//! into a single `execute_find`: their equality filters are lifted into an
//! `IN` (or row-value `IN`) filter, identical tuples collapse, and the returned
//! rows are split back to each request by matching the lifted columns.
//!
//! Paged finds (`limit`/`offset`) keep all their filters in the key, so they
//! only merge with identical requests.

use crate::driver::{CompareOp, Driver, Filter, FindQuery};
use asupersync::{Cx, Outcome};
use joinery_core::{Error, Row, Value};
use std::collections::BTreeMap;

/// Index of a request within its batcher.
pub type Ticket = usize;

/// Structural fingerprint of a find. Requests with equal keys share a round trip.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BatchKey {
    pub table: &'static str,
    /// Columns whose equality values were lifted out of the request.
    pub match_columns: Vec<&'static str>,
    /// Everything else: remaining filters, ordering, paging, target entity.
    pub shape: String,
}

#[derive(Debug, Clone)]
struct LoadRequest {
    key: BatchKey,
    tuple: Vec<Value>,
    residual: FindQuery,
}

/// Collects finds for one batching window and dispatches them together.
#[derive(Debug, Default)]
pub struct ReadBatcher {
    requests: Vec<LoadRequest>,
    results: Vec<Option<Vec<Row>>>,
    dispatched: usize,
    round_trips: usize,
}

impl ReadBatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a find to the current window.
    pub fn enqueue(&mut self, query: FindQuery) -> Ticket {
        let (key, tuple, residual) = split_query(query);
        tracing::trace!(table = key.table, columns = ?key.match_columns, "Enqueued find");
        self.requests.push(LoadRequest {
            key,
            tuple,
            residual,
        });
        self.results.push(None);
        self.requests.len() - 1
    }

    pub fn key_of(&self, ticket: Ticket) -> Option<&BatchKey> {
        self.requests.get(ticket).map(|r| &r.key)
    }

    /// Requests waiting for the next dispatch.
    pub fn pending(&self) -> usize {
        self.requests.len() - self.dispatched
    }

    /// Total `execute_find` calls made by this batcher.
    pub fn round_trips(&self) -> usize {
        self.round_trips
    }

    /// Issue one find per distinct key among the waiting requests.
    #[tracing::instrument(level = "debug", skip(self, cx, driver))]
    pub async fn dispatch<D: Driver>(&mut self, cx: &Cx, driver: &D) -> Outcome<usize, Error> {
        let start = self.dispatched;
        self.dispatched = self.requests.len();

        let mut groups: BTreeMap<BatchKey, Vec<Ticket>> = BTreeMap::new();
        for ticket in start..self.requests.len() {
            groups
                .entry(self.requests[ticket].key.clone())
                .or_default()
                .push(ticket);
        }

        let mut trips = 0;
        for (key, tickets) in groups {
            let mut tuples: Vec<Vec<Value>> = Vec::new();
            for t in &tickets {
                let tuple = &self.requests[*t].tuple;
                if !tuples.iter().any(|seen| same_tuple(seen, tuple)) {
                    tuples.push(tuple.clone());
                }
            }
            let query = merged_query(&key, &self.requests[tickets[0]].residual, tuples.clone());
            tracing::debug!(
                table = key.table,
                requests = tickets.len(),
                distinct = tuples.len(),
                "Dispatching batched find"
            );

            let rows = match driver.execute_find(cx, &query).await {
                Outcome::Ok(rows) => rows,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            trips += 1;

            for t in tickets {
                let tuple = &self.requests[t].tuple;
                let mine: Vec<Row> = rows
                    .iter()
                    .filter(|row| {
                        key.match_columns
                            .iter()
                            .zip(tuple)
                            .all(|(c, v)| row.get_by_name(c).is_some_and(|x| x.sql_eq(v)))
                    })
                    .cloned()
                    .collect();
                self.results[t] = Some(mine);
            }
        }
        self.round_trips += trips;
        Outcome::Ok(trips)
    }

    /// Rows for a dispatched request. Taking twice yields nothing.
    pub fn take(&mut self, ticket: Ticket) -> Vec<Row> {
        self.results
            .get_mut(ticket)
            .and_then(Option::take)
            .unwrap_or_default()
    }
}

/// Lift equality filters out of a query and fingerprint what is left.
fn split_query(query: FindQuery) -> (BatchKey, Vec<Value>, FindQuery) {
    let mut lifted: Vec<(&'static str, Value)> = Vec::new();
    let mut residual = FindQuery {
        filters: Vec::new(),
        ..query.clone()
    };
    let pageable = query.limit.is_some() || query.offset.is_some();
    for filter in query.filters {
        match filter {
            Filter::Compare {
                column,
                op: CompareOp::Eq,
                value,
            } if !pageable && !value.is_null() && !lifted.iter().any(|(c, _)| *c == column) => {
                lifted.push((column, value));
            }
            other => residual.filters.push(other),
        }
    }
    lifted.sort_by(|a, b| a.0.cmp(b.0));
    let shape = format!(
        "{:?}|{}|{:?}|{:?}|{:?}",
        residual.entity,
        residual
            .filters
            .iter()
            .map(render_filter)
            .collect::<Vec<_>>()
            .join(" AND "),
        residual.order_by,
        residual.limit,
        residual.offset
    );
    let key = BatchKey {
        table: residual.table,
        match_columns: lifted.iter().map(|(c, _)| *c).collect(),
        shape,
    };
    let tuple = lifted.into_iter().map(|(_, v)| v).collect();
    (key, tuple, residual)
}

fn render_filter(filter: &Filter) -> String {
    let list = |values: &[Value]| {
        values
            .iter()
            .map(Value::render)
            .collect::<Vec<_>>()
            .join(",")
    };
    match filter {
        Filter::Compare { column, op, value } => {
            format!("{} {} {}", column, op.as_sql(), value.render())
        }
        Filter::In { column, values } => format!("{} IN ({})", column, list(values)),
        Filter::InTuples { columns, tuples } => format!(
            "({}) IN ({})",
            columns.join(","),
            tuples
                .iter()
                .map(|t| format!("({})", list(t)))
                .collect::<Vec<_>>()
                .join(",")
        ),
        Filter::IsNull(column) => format!("{} IS NULL", column),
        Filter::NotNull(column) => format!("{} IS NOT NULL", column),
    }
}

fn same_tuple(a: &[Value], b: &[Value]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.sql_eq(y))
}

fn merged_query(key: &BatchKey, residual: &FindQuery, tuples: Vec<Vec<Value>>) -> FindQuery {
    let mut query = residual.clone();
    match (key.match_columns.as_slice(), tuples.len()) {
        ([], _) => {}
        (columns, 1) => {
            for (column, value) in columns.iter().zip(tuples.into_iter().flatten()) {
                query.filters.push(Filter::eq(*column, value));
            }
        }
        ([column], _) => query.filters.push(Filter::In {
            column: *column,
            values: tuples.into_iter().flatten().collect(),
        }),
        (columns, _) => query.filters.push(Filter::InTuples {
            columns: columns.to_vec(),
            tuples,
        }),
    }
    query
}

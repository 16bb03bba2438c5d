//! Test fixtures shared by this crate's unit tests.

#![allow(clippy::manual_async_fn)] // Mock trait impls must match trait signatures

use crate::driver::{Driver, FindQuery, FlushBatch, FlushResult, IdRequest};
use asupersync::{Cx, Outcome};
use joinery_core::{EntityMetadata, Error, IdValue, LinkTableInfo, MetadataRegistry, Row, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

pub(crate) fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
    }
}

/// Authors, books, reviews, author images and tags.
pub(crate) fn library() -> Arc<MetadataRegistry> {
    MetadataRegistry::new()
        .with(
            EntityMetadata::new("Author", "a", "authors")
                .primitive("first_name")
                .one_to_many("books", "Book", "author")
                .one_to_one("image", "Image", "author")
                .many_to_many(
                    "tags",
                    "Tag",
                    "authors",
                    LinkTableInfo::new("authors_to_tags", "author_id", "tag_id"),
                )
                .version("version"),
        )
        .and_then(|r| {
            r.with(
                EntityMetadata::new("Book", "b", "books")
                    .primitive("title")
                    .many_to_one("author", "author_id", "Author", "books")
                    .one_to_many("reviews", "Review", "book")
                    .cascade_delete("reviews"),
            )
        })
        .and_then(|r| {
            r.with(
                EntityMetadata::new("Review", "r", "reviews")
                    .primitive("rating")
                    .many_to_one("book", "book_id", "Book", "reviews"),
            )
        })
        .and_then(|r| {
            r.with(
                EntityMetadata::new("Image", "i", "images")
                    .many_to_one("author", "author_id", "Author", "image"),
            )
        })
        .and_then(|r| {
            r.with(
                EntityMetadata::new("Tag", "t", "tags")
                    .primitive("name")
                    .many_to_many(
                        "authors",
                        "Author",
                        "tags",
                        LinkTableInfo::new("authors_to_tags", "tag_id", "author_id"),
                    ),
            )
        })
        .and_then(MetadataRegistry::finish)
        .expect("library metadata is valid")
}

#[derive(Debug, Default)]
pub(crate) struct StubState {
    pub tables: HashMap<&'static str, Vec<Row>>,
    pub finds: Vec<FindQuery>,
    pub flushes: Vec<FlushBatch>,
    pub id_calls: usize,
    pub next_id: i64,
    pub begins: usize,
    pub commits: usize,
    pub rollbacks: usize,
}

/// Read-only driver over canned rows that records every call.
#[derive(Debug, Clone, Default)]
pub(crate) struct StubDriver {
    pub state: Arc<Mutex<StubState>>,
}

impl StubDriver {
    pub fn with_rows(table: &'static str, rows: Vec<Row>) -> Self {
        let driver = Self::default();
        driver.add_rows(table, rows);
        driver
    }

    pub fn add_rows(&self, table: &'static str, rows: Vec<Row>) {
        let mut guard = self.state.lock().expect("lock poisoned");
        guard.tables.entry(table).or_default().extend(rows);
    }

    pub fn find_count(&self) -> usize {
        self.state.lock().expect("lock poisoned").finds.len()
    }

    pub fn finds(&self) -> Vec<FindQuery> {
        self.state.lock().expect("lock poisoned").finds.clone()
    }
}

impl Driver for StubDriver {
    fn execute_find(
        &self,
        _cx: &Cx,
        query: &FindQuery,
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let state = Arc::clone(&self.state);
        let query = query.clone();
        async move {
            let mut guard = state.lock().expect("lock poisoned");
            let rows = guard
                .tables
                .get(query.table)
                .map(|rows| query.evaluate(rows))
                .unwrap_or_default();
            guard.finds.push(query);
            Outcome::Ok(rows)
        }
    }

    fn execute_query(
        &self,
        _cx: &Cx,
        _sql: &str,
        _params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        async { Outcome::Ok(vec![]) }
    }

    fn begin(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let state = Arc::clone(&self.state);
        async move {
            state.lock().expect("lock poisoned").begins += 1;
            Outcome::Ok(())
        }
    }

    fn commit(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let state = Arc::clone(&self.state);
        async move {
            state.lock().expect("lock poisoned").commits += 1;
            Outcome::Ok(())
        }
    }

    fn rollback(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let state = Arc::clone(&self.state);
        async move {
            state.lock().expect("lock poisoned").rollbacks += 1;
            Outcome::Ok(())
        }
    }

    fn assign_new_ids(
        &self,
        _cx: &Cx,
        requests: &[IdRequest],
    ) -> impl Future<Output = Outcome<Vec<Vec<IdValue>>, Error>> + Send {
        let state = Arc::clone(&self.state);
        let counts: Vec<usize> = requests.iter().map(|r| r.count).collect();
        async move {
            let mut guard = state.lock().expect("lock poisoned");
            guard.id_calls += 1;
            let mut out = Vec::new();
            for count in counts {
                let mut ids = Vec::new();
                for _ in 0..count {
                    guard.next_id += 1;
                    ids.push(IdValue::Int(guard.next_id));
                }
                out.push(ids);
            }
            Outcome::Ok(out)
        }
    }

    fn flush(
        &self,
        _cx: &Cx,
        batch: &mut FlushBatch,
    ) -> impl Future<Output = Outcome<FlushResult, Error>> + Send {
        let state = Arc::clone(&self.state);
        async move {
            let mut guard = state.lock().expect("lock poisoned");
            let mut result = FlushResult::new();
            for todo in &batch.entities {
                result.inserted += todo.inserts.len();
                result.updated += todo.updates.len();
                result.deleted += todo.deletes.len();
            }
            for join in &mut batch.join_rows {
                for row in &mut join.new_rows {
                    guard.next_id += 1;
                    row.id = Some(guard.next_id);
                }
                result.join_inserted += join.new_rows.len();
                result.join_deleted += join.deleted_rows.len();
            }
            guard.flushes.push(batch.clone());
            Outcome::Ok(result)
        }
    }
}

//! The unit of work: an entity graph bound to a storage driver.
//!
//! [`UnitOfWork`] owns the [`EntityGraph`] and adds everything that needs
//! storage: loading relations, finds, membership checks, and flush. Every
//! method that reaches the driver takes `&mut self`, so a unit of work is
//! driven by one task at a time and a flush cannot start while another one is
//! in flight.

use crate::collection::LoadOptions;
use crate::driver::{Driver, FindQuery};
use crate::entity::EntityHandle;
use crate::flush::{FlushOverlay, FlushSummary};
use crate::graph::EntityGraph;
use crate::n1_detection::N1Tracker;
use crate::preload::{LoadHint, PreloadCache, PreloadPlugin};
use crate::window::ReadWindow;
use crate::{FlushEvent, FlushEventCallbacks, ReactiveEngine, UnitOfWorkConfig};
use asupersync::{Cx, Outcome};
use joinery_core::{Error, FieldKind, MetadataRegistry, Row, TaggedId, Value};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

/// Tracks entity changes and writes them through a [`Driver`] on flush.
pub struct UnitOfWork<D: Driver> {
    pub(crate) graph: EntityGraph,
    pub(crate) driver: D,
    pub(crate) preload: PreloadCache,
    config: UnitOfWorkConfig,
    callbacks: FlushEventCallbacks,
    preload_plugin: Option<Box<dyn PreloadPlugin>>,
    reactive: Option<Box<dyn ReactiveEngine>>,
    n1: N1Tracker,
}

impl<D: Driver> std::fmt::Debug for UnitOfWork<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("entities", &self.graph.identity_map().len())
            .field("config", &self.config)
            .field("callbacks", &self.callbacks)
            .field("preload_entries", &self.preload.len())
            .field("has_preload_plugin", &self.preload_plugin.is_some())
            .field("has_reactive_engine", &self.reactive.is_some())
            .finish_non_exhaustive()
    }
}

impl<D: Driver> UnitOfWork<D> {
    pub fn new(registry: Arc<MetadataRegistry>, driver: D) -> Self {
        Self::with_config(registry, driver, UnitOfWorkConfig::default())
    }

    pub fn with_config(registry: Arc<MetadataRegistry>, driver: D, config: UnitOfWorkConfig) -> Self {
        Self {
            graph: EntityGraph::new(registry),
            driver,
            preload: PreloadCache::new(),
            n1: N1Tracker::new(config.n1_threshold),
            config,
            callbacks: FlushEventCallbacks::default(),
            preload_plugin: None,
            reactive: None,
        }
    }

    pub fn graph(&self) -> &EntityGraph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut EntityGraph {
        &mut self.graph
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn config(&self) -> &UnitOfWorkConfig {
        &self.config
    }

    pub fn preload_cache(&self) -> &PreloadCache {
        &self.preload
    }

    pub fn preload_cache_mut(&mut self) -> &mut PreloadCache {
        &mut self.preload
    }

    pub fn n1_tracker(&self) -> &N1Tracker {
        &self.n1
    }

    pub fn n1_tracker_mut(&mut self) -> &mut N1Tracker {
        &mut self.n1
    }

    pub fn set_preload_plugin(&mut self, plugin: impl PreloadPlugin + 'static) {
        self.preload_plugin = Some(Box::new(plugin));
    }

    pub fn set_reactive_engine(&mut self, engine: impl ReactiveEngine + 'static) {
        self.reactive = Some(Box::new(engine));
    }

    // ========================================================================
    // Event Callbacks
    // ========================================================================

    /// Register a callback to run before each flush.
    ///
    /// Returning `Err` aborts the flush before anything is written.
    pub fn on_before_flush(&mut self, f: impl FnMut() -> Result<(), Error> + Send + 'static) {
        self.callbacks.before_flush.push(Box::new(f));
    }

    /// Register a callback to run after a flush has written every pass.
    pub fn on_after_flush(&mut self, f: impl FnMut() -> Result<(), Error> + Send + 'static) {
        self.callbacks.after_flush.push(Box::new(f));
    }

    /// Register a callback to run after the flush transaction commits.
    pub fn on_after_commit(&mut self, f: impl FnMut() -> Result<(), Error> + Send + 'static) {
        self.callbacks.after_commit.push(Box::new(f));
    }

    /// Register a callback to run after a failed flush was rolled back.
    pub fn on_after_rollback(&mut self, f: impl FnMut() -> Result<(), Error> + Send + 'static) {
        self.callbacks.after_rollback.push(Box::new(f));
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Open a batching window.
    pub fn read_window(&mut self) -> ReadWindow<'_, D> {
        ReadWindow::new(self)
    }

    /// Load one collection.
    ///
    /// Counts toward N+1 detection whenever storage has to be asked; load
    /// many owners with [`load_all`](Self::load_all) or
    /// [`populate`](Self::populate) instead.
    #[track_caller]
    pub fn load<'a>(
        &'a mut self,
        cx: &'a Cx,
        owner: EntityHandle,
        field: &'a str,
        options: LoadOptions,
    ) -> impl Future<Output = Outcome<Vec<EntityHandle>, Error>> + 'a {
        self.note_single_load(owner, field, options);
        async move {
            let mut window = self.read_window();
            let request = try_result!(window.load_collection(owner, field, options));
            let results = try_outcome!(window.dispatch(cx).await);
            Outcome::Ok(results.entities(request).to_vec())
        }
    }

    #[track_caller]
    fn note_single_load(&mut self, owner: EntityHandle, field: &str, options: LoadOptions) {
        let record = self.graph.entity(owner);
        let Some(meta_field) = record.meta().field(field).copied() else {
            return;
        };
        if !meta_field.is_collection() || !record.is_persisted() {
            return;
        }
        if self.graph.is_loaded(owner, field) && !options.force_reload {
            return;
        }
        let cached = record
            .id()
            .is_some_and(|id| self.preload.get(id, meta_field.name).is_some());
        if !cached || options.force_reload {
            let entity = record.type_name();
            self.n1.record_load(entity, meta_field.name);
        }
    }

    /// Load the same collection of many owners in one window.
    pub async fn load_all(
        &mut self,
        cx: &Cx,
        owners: &[EntityHandle],
        field: &str,
        options: LoadOptions,
    ) -> Outcome<Vec<Vec<EntityHandle>>, Error> {
        let mut window = self.read_window();
        let mut requests = Vec::with_capacity(owners.len());
        for owner in owners {
            requests.push(try_result!(window.load_collection(*owner, field, options)));
        }
        let results = try_outcome!(window.dispatch(cx).await);
        Outcome::Ok(
            requests
                .into_iter()
                .map(|r| results.entities(r).to_vec())
                .collect(),
        )
    }

    /// Resolve a many-to-one reference to a resident entity, loading it if needed.
    pub async fn load_reference(
        &mut self,
        cx: &Cx,
        child: EntityHandle,
        field: &str,
    ) -> Outcome<Option<EntityHandle>, Error> {
        let mut window = self.read_window();
        let request = try_result!(window.load_reference(child, field));
        let results = try_outcome!(window.dispatch(cx).await);
        Outcome::Ok(results.entity(request))
    }

    /// Find an entity by id. Resident entities never reach the driver.
    pub async fn load_by_id(&mut self, cx: &Cx, id: &TaggedId) -> Outcome<Option<EntityHandle>, Error> {
        let mut window = self.read_window();
        let request = try_result!(window.load_by_id(id));
        let results = try_outcome!(window.dispatch(cx).await);
        Outcome::Ok(results.entity(request))
    }

    /// Run an entity find; locally deleted entities are left out.
    pub async fn find(&mut self, cx: &Cx, query: FindQuery) -> Outcome<Vec<EntityHandle>, Error> {
        let mut window = self.read_window();
        let request = try_result!(window.find(query));
        let results = try_outcome!(window.dispatch(cx).await);
        Outcome::Ok(results.entities(request).to_vec())
    }

    /// Run a find and load `hint` for the results.
    ///
    /// With a preload plugin installed, the plugin folds part of the hint into
    /// the find itself; the related rows it returns go to the preload cache,
    /// and the rest of the hint is loaded with ordinary batched windows.
    #[tracing::instrument(level = "debug", skip(self, cx, query, hint), fields(table = query.table))]
    pub async fn find_with_hint(
        &mut self,
        cx: &Cx,
        mut query: FindQuery,
        hint: &LoadHint,
    ) -> Outcome<Vec<EntityHandle>, Error> {
        let Some(entity) = query.entity else {
            return Outcome::Err(Error::config(format!(
                "find on {} does not name an entity type",
                query.table
            )));
        };
        let registry = Arc::clone(self.graph.registry());
        let meta = Arc::clone(try_result!(registry.get(entity)));

        let Some(plugin) = self.preload_plugin.as_ref() else {
            let handles = try_outcome!(self.find(cx, query).await);
            try_outcome!(self.populate(cx, &handles, hint).await);
            return Outcome::Ok(handles);
        };

        let (joined, _rest) = plugin.partition_hint(&meta, hint);
        if !joined.is_empty() {
            plugin.preload_populate(&meta, &joined, &mut query);
        }
        let rows = try_outcome!(self.driver.execute_find(cx, &query).await);

        let mut handles = Vec::with_capacity(rows.len());
        for row in &rows {
            let h = try_result!(self.graph.hydrate(&meta, row));
            if !self.graph.entity(h).is_deleted() && !handles.contains(&h) {
                handles.push(h);
            }
        }

        if !joined.is_empty() {
            let relations = try_result!(plugin.preload_load(&meta, &joined, &rows));
            for relation in relations {
                let other = try_result!(registry.get(relation.other));
                let mut members = Vec::with_capacity(relation.rows.len());
                for row in &relation.rows {
                    let h = try_result!(self.graph.hydrate(other, row));
                    if let Some(id) = self.graph.entity(h).id() {
                        members.push(id.clone());
                    }
                }
                tracing::trace!(
                    owner = %relation.owner,
                    field = relation.field,
                    members = members.len(),
                    "Cached preloaded relation"
                );
                self.preload.insert(relation.owner, relation.field, members);
            }
        }

        // The preloaded part of the hint is answered from the cache.
        try_outcome!(self.populate(cx, &handles, hint).await);
        Outcome::Ok(handles)
    }

    /// Load every relation named in `hint` for `owners`, one window per level.
    #[tracing::instrument(level = "debug", skip(self, cx, owners, hint), fields(owners = owners.len()))]
    pub async fn populate(
        &mut self,
        cx: &Cx,
        owners: &[EntityHandle],
        hint: &LoadHint,
    ) -> Outcome<(), Error> {
        let mut level: Vec<(EntityHandle, LoadHint)> =
            owners.iter().map(|h| (*h, hint.clone())).collect();
        let mut depth = 0;
        while !level.is_empty() {
            depth += 1;
            let mut wanted = Vec::new();
            let mut seen = HashSet::new();
            for (owner, hint) in &level {
                let meta = Arc::clone(self.graph.entity(*owner).meta());
                for (name, sub) in hint.fields() {
                    let field = *try_result!(meta.require_field(name));
                    if seen.insert((*owner, field.name)) {
                        wanted.push((*owner, field, sub.clone()));
                    }
                }
            }
            if wanted.is_empty() {
                break;
            }

            let mut window = self.read_window();
            let mut requests = Vec::with_capacity(wanted.len());
            for (owner, field, _) in &wanted {
                let request = match field.kind {
                    FieldKind::ManyToOne { .. } => window.load_reference(*owner, field.name),
                    _ => window.load_collection(*owner, field.name, LoadOptions::new()),
                };
                requests.push(try_result!(request));
            }
            let results = try_outcome!(window.dispatch(cx).await);
            tracing::trace!(depth, relations = wanted.len(), "Populated level");

            let mut next = Vec::new();
            for ((_, field, sub), request) in wanted.into_iter().zip(requests) {
                if sub.is_empty() {
                    continue;
                }
                if field.is_reference() {
                    next.extend(results.entity(request).map(|h| (h, sub.clone())));
                } else {
                    next.extend(results.entities(request).iter().map(|h| (*h, sub.clone())));
                }
            }
            level = next;
        }
        Outcome::Ok(())
    }

    /// Is `other` a member of `owner.field`? Answered from memory when possible.
    pub async fn includes(
        &mut self,
        cx: &Cx,
        owner: EntityHandle,
        field: &str,
        other: EntityHandle,
    ) -> Outcome<bool, Error> {
        let mut window = self.read_window();
        let request = try_result!(window.includes(owner, field, other));
        let results = try_outcome!(window.dispatch(cx).await);
        Outcome::Ok(results.includes(request))
    }

    /// The member of `owner.field` with the given id, if it is one.
    pub async fn find_in_collection(
        &mut self,
        cx: &Cx,
        owner: EntityHandle,
        field: &str,
        id: &TaggedId,
    ) -> Outcome<Option<EntityHandle>, Error> {
        let mut window = self.read_window();
        let request = try_result!(window.find_in_collection(owner, field, id));
        let results = try_outcome!(window.dispatch(cx).await);
        Outcome::Ok(results.entity(request))
    }

    /// Run raw SQL through the driver.
    pub async fn execute_query(
        &mut self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> Outcome<Vec<Row>, Error> {
        self.driver.execute_query(cx, sql, params).await
    }

    // ========================================================================
    // Flush
    // ========================================================================

    /// Write every pending change in one transaction.
    ///
    /// Passes repeat until one finds no work, running the reactive engine
    /// between passes. On any failure the transaction is rolled back and the
    /// graph is left as it was before the call.
    #[tracing::instrument(level = "info", skip(self, cx))]
    pub async fn flush(&mut self, cx: &Cx) -> Outcome<FlushSummary, Error> {
        let start = Instant::now();
        if let Err(e) = self.callbacks.fire(FlushEvent::BeforeFlush) {
            return Outcome::Err(e);
        }

        match self.driver.begin(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        let mut overlay = FlushOverlay::new();
        match self.run_passes(cx, &mut overlay).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => {
                self.abort(cx, overlay).await;
                return Outcome::Err(e);
            }
            Outcome::Cancelled(r) => {
                self.abort(cx, overlay).await;
                return Outcome::Cancelled(r);
            }
            Outcome::Panicked(p) => {
                self.abort(cx, overlay).await;
                return Outcome::Panicked(p);
            }
        }

        if let Err(e) = self.callbacks.fire(FlushEvent::AfterFlush) {
            self.abort(cx, overlay).await;
            return Outcome::Err(e);
        }

        match self.driver.commit(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => {
                self.abort(cx, overlay).await;
                return Outcome::Err(e);
            }
            Outcome::Cancelled(r) => {
                self.abort(cx, overlay).await;
                return Outcome::Cancelled(r);
            }
            Outcome::Panicked(p) => {
                self.abort(cx, overlay).await;
                return Outcome::Panicked(p);
            }
        }

        let summary = FlushSummary {
            passes: overlay.passes,
            result: overlay.result,
        };
        overlay.apply(&mut self.graph);
        tracing::info!(
            passes = summary.passes,
            inserted = summary.result.inserted,
            updated = summary.result.updated,
            deleted = summary.result.deleted,
            join_inserted = summary.result.join_inserted,
            join_deleted = summary.result.join_deleted,
            elapsed_ms = start.elapsed().as_millis(),
            "Flush committed"
        );

        if let Err(e) = self.callbacks.fire(FlushEvent::AfterCommit) {
            return Outcome::Err(e);
        }
        Outcome::Ok(summary)
    }

    async fn run_passes(&mut self, cx: &Cx, overlay: &mut FlushOverlay) -> Outcome<(), Error> {
        let deferred = self
            .config
            .deferred_constraints
            .unwrap_or_else(|| self.driver.supports_deferred_constraints());
        loop {
            try_outcome!(self.resolve_pending(cx).await);

            let requests = overlay.id_requests(&self.graph);
            if !requests.is_empty() {
                if overlay.passes >= self.config.max_flush_passes {
                    return Outcome::Err(self.flush_cycle(overlay));
                }
                let batch: Vec<_> = requests.iter().map(|(r, _)| r.clone()).collect();
                let ids = try_outcome!(self.driver.assign_new_ids(cx, &batch).await);
                try_result!(overlay.accept_ids(&self.graph, requests, ids));
            }

            let mut plan = try_result!(overlay.plan_pass(&self.graph, deferred));
            if !plan.has_work() {
                return Outcome::Ok(());
            }
            if overlay.passes >= self.config.max_flush_passes {
                return Outcome::Err(self.flush_cycle(overlay));
            }

            let result = try_outcome!(self.driver.flush(cx, &mut plan.batch).await);
            let summary = overlay.absorb(&mut self.graph, plan, result);
            tracing::debug!(
                pass = summary.pass,
                inserted = summary.inserted.len(),
                updated = summary.updated.len(),
                deleted = summary.deleted.len(),
                join_rows = summary.join_rows,
                "Flush pass written"
            );

            if let Some(engine) = self.reactive.as_mut() {
                try_result!(engine.react(&mut self.graph, &summary));
            }
        }
    }

    fn flush_cycle(&self, overlay: &FlushOverlay) -> Error {
        let pending = overlay.dirty_entities(&self.graph);
        tracing::warn!(
            passes = overlay.passes,
            pending = pending.len(),
            "Flush did not settle"
        );
        Error::FlushCycle {
            passes: overlay.passes,
            pending,
        }
    }

    /// Load what cascades and pending sets need, then cascade deletes until
    /// no new ones appear.
    async fn resolve_pending(&mut self, cx: &Cx) -> Outcome<(), Error> {
        loop {
            let cascades = self.graph.take_pending_cascades();
            let mut loads: Vec<(EntityHandle, &'static str)> = self.graph.ledger().pending_sets().to_vec();
            for h in &cascades {
                for field in self.graph.unloaded_collections(*h) {
                    if !loads.contains(&(*h, field.name)) {
                        loads.push((*h, field.name));
                    }
                }
            }
            if cascades.is_empty() && loads.is_empty() {
                return Outcome::Ok(());
            }

            if !loads.is_empty() {
                tracing::debug!(collections = loads.len(), "Loading collections before flush");
                let options = LoadOptions::new().include_deleted(true);
                let mut window = self.read_window();
                for (owner, field) in &loads {
                    try_result!(window.load_collection(*owner, field, options));
                }
                try_outcome!(window.dispatch(cx).await);
            }
            for h in cascades {
                try_result!(self.graph.cascade_delete(h));
            }
        }
    }

    async fn abort(&mut self, cx: &Cx, overlay: FlushOverlay) {
        match self.driver.rollback(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => tracing::warn!(error = %e, "Rollback after failed flush failed"),
            Outcome::Cancelled(_) => tracing::warn!("Rollback after failed flush was cancelled"),
            Outcome::Panicked(_) => tracing::warn!("Rollback after failed flush panicked"),
        }
        overlay.revert(&mut self.graph);
        if let Err(e) = self.callbacks.fire(FlushEvent::AfterRollback) {
            tracing::warn!(error = %e, "after_rollback callback failed");
        }
        tracing::debug!("Flush rolled back");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{StubDriver, library, unwrap_outcome};
    use crate::{EntityStatus, PassSummary};
    use asupersync::runtime::RuntimeBuilder;
    use joinery_core::Result;
    use std::sync::Mutex;

    fn author_row(id: i64) -> Row {
        Row::from_pairs([
            ("id", Value::BigInt(id)),
            ("first_name", Value::from("a")),
            ("version", Value::BigInt(1)),
        ])
    }

    fn book_row(id: i64, author: i64) -> Row {
        Row::from_pairs([
            ("id", Value::BigInt(id)),
            ("title", Value::from("t")),
            ("author_id", Value::BigInt(author)),
        ])
    }

    #[test]
    fn loading_many_owners_takes_one_round_trip() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let driver = StubDriver::with_rows("authors", vec![author_row(1), author_row(2)]);
        driver.add_rows("books", vec![book_row(10, 1), book_row(11, 2), book_row(12, 2)]);
        let mut uow = UnitOfWork::new(library(), driver.clone());

        rt.block_on(async {
            let authors = unwrap_outcome(
                uow.find(&cx, FindQuery::entity("Author", "authors").order_by("id", false))
                    .await,
            );
            assert_eq!(authors.len(), 2);
            let books = unwrap_outcome(
                uow.load_all(&cx, &authors, "books", LoadOptions::new()).await,
            );
            assert_eq!(books[0].len(), 1);
            assert_eq!(books[1].len(), 2);
            assert_eq!(driver.find_count(), 2);
        });
    }

    #[test]
    fn resident_ids_do_not_query() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let driver = StubDriver::with_rows("authors", vec![author_row(1)]);
        let mut uow = UnitOfWork::new(library(), driver.clone());

        rt.block_on(async {
            let id = TaggedId::int("a", 1);
            let first = unwrap_outcome(uow.load_by_id(&cx, &id).await);
            let second = unwrap_outcome(uow.load_by_id(&cx, &id).await);
            assert!(first.is_some());
            assert_eq!(first, second);
            assert_eq!(driver.find_count(), 1);
            assert!(unwrap_outcome(uow.load_by_id(&cx, &TaggedId::int("a", 9)).await).is_none());
        });
    }

    #[test]
    fn populate_walks_nested_hints() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let driver = StubDriver::with_rows("authors", vec![author_row(1)]);
        driver.add_rows("books", vec![book_row(10, 1), book_row(11, 1)]);
        driver.add_rows(
            "reviews",
            vec![Row::from_pairs([
                ("id", Value::BigInt(100)),
                ("rating", Value::Int(5)),
                ("book_id", Value::BigInt(11)),
            ])],
        );
        let mut uow = UnitOfWork::new(library(), driver.clone());

        rt.block_on(async {
            let author = unwrap_outcome(uow.load_by_id(&cx, &TaggedId::int("a", 1)).await)
                .expect("author exists");
            let hint = LoadHint::from_paths(["books.reviews"]);
            unwrap_outcome(uow.populate(&cx, &[author], &hint).await);
            // by-id, books, reviews
            assert_eq!(driver.find_count(), 3);
            let books = uow.graph().get(author, "books").unwrap();
            assert_eq!(books.len(), 2);
            let reviews: usize = books
                .iter()
                .map(|b| uow.graph().get(*b, "reviews").unwrap().len())
                .sum();
            assert_eq!(reviews, 1);
        });
    }

    #[test]
    fn single_loads_feed_n1_detection() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let driver = StubDriver::with_rows(
            "authors",
            vec![author_row(1), author_row(2), author_row(3)],
        );
        let config = UnitOfWorkConfig::default().n1_threshold(3);
        let mut uow = UnitOfWork::with_config(library(), driver, config);

        rt.block_on(async {
            let authors = unwrap_outcome(uow.find(&cx, FindQuery::entity("Author", "authors")).await);
            for a in &authors {
                unwrap_outcome(uow.load(&cx, *a, "books", LoadOptions::new()).await);
            }
            // Loaded now; no further counting.
            unwrap_outcome(uow.load(&cx, authors[0], "books", LoadOptions::new()).await);
        });
        assert_eq!(uow.n1_tracker().count_for("Author", "books"), 3);
        assert_eq!(uow.n1_tracker().stats().potential_n1, 1);
    }

    #[test]
    fn flush_inserts_and_applies_after_commit() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let driver = StubDriver::default();
        let mut uow = UnitOfWork::new(library(), driver.clone());
        let author = uow
            .graph_mut()
            .create("Author", [("first_name", Value::from("Ann"))])
            .unwrap();
        let book = uow.graph_mut().create("Book", []).unwrap();
        uow.graph_mut().set_reference(book, "author", Some(author)).unwrap();

        let summary = rt.block_on(async { unwrap_outcome(uow.flush(&cx).await) });
        assert_eq!(summary.passes, 1);
        assert_eq!(summary.result.inserted, 2);

        let state = driver.state.lock().expect("lock poisoned");
        assert_eq!((state.begins, state.commits, state.rollbacks), (1, 1, 0));
        assert_eq!(state.id_calls, 1);
        drop(state);
        assert_eq!(uow.graph().entity(author).status(), EntityStatus::Loaded);
        assert!(uow.graph().entity(book).id().is_some());
        assert!(uow.graph().pending_counts().is_empty());
    }

    #[test]
    fn empty_flush_writes_nothing() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let driver = StubDriver::default();
        let mut uow = UnitOfWork::new(library(), driver.clone());
        let summary = rt.block_on(async { unwrap_outcome(uow.flush(&cx).await) });
        assert_eq!(summary, FlushSummary::default());
        assert!(driver.state.lock().expect("lock poisoned").flushes.is_empty());
    }

    /// Touches every author written in the first pass once.
    struct TouchOnce {
        seen: Arc<Mutex<Vec<usize>>>,
    }

    impl ReactiveEngine for TouchOnce {
        fn react(&mut self, graph: &mut EntityGraph, pass: &PassSummary) -> Result<()> {
            self.seen.lock().expect("lock poisoned").push(pass.pass);
            if pass.pass == 1 {
                for h in pass.inserted.clone() {
                    graph.touch(h);
                }
            }
            Ok(())
        }
    }

    #[test]
    fn reactive_engine_runs_between_passes() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let driver = StubDriver::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut uow = UnitOfWork::new(library(), driver.clone());
        uow.set_reactive_engine(TouchOnce {
            seen: Arc::clone(&seen),
        });
        let author = uow.graph_mut().create("Author", []).unwrap();

        let summary = rt.block_on(async { unwrap_outcome(uow.flush(&cx).await) });
        assert_eq!(summary.passes, 2);
        assert_eq!(*seen.lock().expect("lock poisoned"), vec![1, 2]);
        // Insert wrote version 1, the touch bumped it.
        assert_eq!(uow.graph().entity(author).version(), Some(2));
    }

    /// Touches everything it sees, forever.
    struct Restless;

    impl ReactiveEngine for Restless {
        fn react(&mut self, graph: &mut EntityGraph, pass: &PassSummary) -> Result<()> {
            for h in pass.inserted.iter().chain(&pass.updated).copied().collect::<Vec<_>>() {
                graph.touch(h);
            }
            Ok(())
        }
    }

    #[test]
    fn flush_cycle_rolls_back() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let driver = StubDriver::default();
        let config = UnitOfWorkConfig::default().max_flush_passes(3);
        let mut uow = UnitOfWork::with_config(library(), driver.clone(), config);
        uow.set_reactive_engine(Restless);
        let rolled_back = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&rolled_back);
        uow.on_after_rollback(move || {
            *flag.lock().expect("lock poisoned") = true;
            Ok(())
        });
        let author = uow.graph_mut().create("Author", []).unwrap();

        let outcome = rt.block_on(async { uow.flush(&cx).await });
        match outcome {
            Outcome::Err(Error::FlushCycle { passes, pending }) => {
                assert_eq!(passes, 3);
                assert_eq!(pending.len(), 1);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(*rolled_back.lock().expect("lock poisoned"));
        assert_eq!(driver.state.lock().expect("lock poisoned").rollbacks, 1);
        let record = uow.graph().entity(author);
        assert!(record.is_new());
        assert!(record.id().is_none());
    }

    #[test]
    fn before_flush_callback_can_abort() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let driver = StubDriver::default();
        let mut uow = UnitOfWork::new(library(), driver.clone());
        uow.on_before_flush(|| Err(Error::Custom("not now".to_string())));
        uow.graph_mut().create("Tag", []).unwrap();

        let outcome = rt.block_on(async { uow.flush(&cx).await });
        assert!(matches!(outcome, Outcome::Err(Error::Custom(_))));
        assert_eq!(driver.state.lock().expect("lock poisoned").begins, 0);
    }
}

//! Batching windows over a unit of work.
//!
//! A [`ReadWindow`] collects collection loads, reference loads, finds and
//! membership checks, then answers all of them with as few round trips as the
//! read batcher allows. Requests are validated when they are added; nothing
//! reaches the driver until [`dispatch`](ReadWindow::dispatch).
//!
//! Dispatch runs in two rounds. The first round answers what memory and the
//! preload cache can, and batches everything else. The second round fetches
//! the far side of many-to-many rows that are not resident yet. Collection
//! baselines are folded into the graph only after both rounds, once per
//! `(owner, field)`.

use crate::collection::LoadOptions;
use crate::driver::{Driver, Filter, FindQuery};
use crate::entity::{EntityHandle, RefTarget};
use crate::graph::EntityGraph;
use crate::loader::{ReadBatcher, Ticket};
use crate::preload::PreloadCache;
use crate::unit_of_work::UnitOfWork;
use asupersync::{Cx, Outcome};
use joinery_core::{
    EntityMetadata, Error, FieldKind, FieldMeta, IdValue, MetadataRegistry, Result, Row,
    TaggedId, Value,
};
use std::collections::HashSet;
use std::sync::Arc;

/// Position of a request within its window.
pub type RequestId = usize;

#[derive(Debug, Clone)]
enum WindowRequest {
    Collection {
        owner: EntityHandle,
        field: FieldMeta,
        options: LoadOptions,
    },
    Reference {
        child: EntityHandle,
        field: FieldMeta,
    },
    ById(TaggedId),
    Find(FindQuery),
    Includes {
        owner: EntityHandle,
        field: FieldMeta,
        other: EntityHandle,
    },
    FindInCollection {
        owner: EntityHandle,
        field: FieldMeta,
        id: TaggedId,
    },
}

/// Answer to one window request.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Answer {
    Entities(Vec<EntityHandle>),
    Entity(Option<EntityHandle>),
    Flag(bool),
}

/// How a request is finished once its rows arrive.
#[derive(Debug)]
enum Step {
    Done(Answer),
    Collection {
        owner: EntityHandle,
        field: FieldMeta,
        options: LoadOptions,
        ticket: Ticket,
    },
    Entity {
        meta: Arc<EntityMetadata>,
        ticket: Ticket,
    },
    Find {
        meta: Arc<EntityMetadata>,
        ticket: Ticket,
    },
    ChildMembership {
        owner: EntityHandle,
        field: FieldMeta,
        meta: Arc<EntityMetadata>,
        ticket: Ticket,
        /// Answer with the entity rather than a flag.
        want_entity: bool,
    },
    LinkMembership {
        owner: EntityHandle,
        field: FieldMeta,
        link_ticket: Ticket,
        /// By-id load of the far side, for `find_in_collection`.
        other: Option<(Arc<EntityMetadata>, Option<Ticket>, TaggedId)>,
        resident: Option<EntityHandle>,
    },
}

/// Answers of a dispatched window, addressed by the ids the request methods
/// returned.
#[derive(Debug, Clone, Default)]
pub struct WindowResults {
    answers: Vec<Answer>,
}

impl WindowResults {
    /// Members of a loaded collection, or the rows of a find.
    pub fn entities(&self, request: RequestId) -> &[EntityHandle] {
        match self.answers.get(request) {
            Some(Answer::Entities(v)) => v,
            _ => &[],
        }
    }

    /// Target of a reference load, a by-id load, or a collection find.
    pub fn entity(&self, request: RequestId) -> Option<EntityHandle> {
        match self.answers.get(request) {
            Some(Answer::Entity(h)) => *h,
            _ => None,
        }
    }

    /// Answer of a membership check.
    pub fn includes(&self, request: RequestId) -> bool {
        matches!(self.answers.get(request), Some(Answer::Flag(true)))
    }

    pub fn len(&self) -> usize {
        self.answers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.answers.is_empty()
    }
}

/// One batching window. Requests added here are eligible to share round trips.
pub struct ReadWindow<'u, D: Driver> {
    uow: &'u mut UnitOfWork<D>,
    requests: Vec<WindowRequest>,
}

impl<D: Driver> std::fmt::Debug for ReadWindow<'_, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadWindow")
            .field("requests", &self.requests.len())
            .finish_non_exhaustive()
    }
}

impl<'u, D: Driver> ReadWindow<'u, D> {
    pub(crate) fn new(uow: &'u mut UnitOfWork<D>) -> Self {
        Self {
            uow,
            requests: Vec::new(),
        }
    }

    fn push(&mut self, request: WindowRequest) -> RequestId {
        self.requests.push(request);
        self.requests.len() - 1
    }

    fn collection_field(&self, owner: EntityHandle, name: &str) -> Result<FieldMeta> {
        let record = self.uow.graph.entity(owner);
        let field = *record.meta().require_field(name)?;
        if !field.is_collection() {
            return Err(Error::config(format!(
                "{}.{} is not a collection",
                record.type_name(),
                name
            )));
        }
        Ok(field)
    }

    /// Load `owner.field`.
    pub fn load_collection(
        &mut self,
        owner: EntityHandle,
        field: &str,
        options: LoadOptions,
    ) -> Result<RequestId> {
        let field = self.collection_field(owner, field)?;
        Ok(self.push(WindowRequest::Collection {
            owner,
            field,
            options,
        }))
    }

    /// Load the target of a many-to-one reference.
    pub fn load_reference(&mut self, child: EntityHandle, field: &str) -> Result<RequestId> {
        let record = self.uow.graph.entity(child);
        let field = *record.meta().require_field(field)?;
        if !field.is_reference() {
            return Err(Error::config(format!(
                "{}.{} is not a reference",
                record.type_name(),
                field.name
            )));
        }
        Ok(self.push(WindowRequest::Reference { child, field }))
    }

    /// Load one entity by id. Resident entities are answered without a query.
    pub fn load_by_id(&mut self, id: &TaggedId) -> Result<RequestId> {
        if self.uow.graph.registry().by_tag(id.tag()).is_none() {
            return Err(Error::InvalidId(id.to_string()));
        }
        Ok(self.push(WindowRequest::ById(id.clone())))
    }

    /// Run an entity find. The query must name its entity type.
    pub fn find(&mut self, query: FindQuery) -> Result<RequestId> {
        let Some(entity) = query.entity else {
            return Err(Error::config(format!(
                "find on {} does not name an entity type",
                query.table
            )));
        };
        self.uow.graph.registry().get(entity)?;
        Ok(self.push(WindowRequest::Find(query)))
    }

    /// Is `other` a member of `owner.field`?
    pub fn includes(
        &mut self,
        owner: EntityHandle,
        field: &str,
        other: EntityHandle,
    ) -> Result<RequestId> {
        let field = self.collection_field(owner, field)?;
        // Validates the member type.
        self.uow.graph.includes_known(owner, field.name, other)?;
        Ok(self.push(WindowRequest::Includes {
            owner,
            field,
            other,
        }))
    }

    /// The member of `owner.field` with id `id`, if it is one.
    pub fn find_in_collection(
        &mut self,
        owner: EntityHandle,
        field: &str,
        id: &TaggedId,
    ) -> Result<RequestId> {
        let field = self.collection_field(owner, field)?;
        let registry = self.uow.graph.registry();
        let other = field
            .other_type()
            .ok_or_else(|| Error::config(format!("{} has no target type", field.name)))?;
        if registry.get(other)?.tag != id.tag() {
            return Err(Error::InvalidId(id.to_string()));
        }
        Ok(self.push(WindowRequest::FindInCollection {
            owner,
            field,
            id: id.clone(),
        }))
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Answer every request, batching what needs storage.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(requests = self.requests.len()))]
    pub async fn dispatch(self, cx: &Cx) -> Outcome<WindowResults, Error> {
        let ReadWindow { uow, requests } = self;
        let UnitOfWork {
            graph,
            driver,
            preload,
            ..
        } = uow;

        let mut batcher = ReadBatcher::new();
        let mut steps = Vec::with_capacity(requests.len());
        for request in requests {
            steps.push(try_result!(plan(graph, preload, &mut batcher, request)));
        }
        if batcher.pending() > 0 {
            try_outcome!(batcher.dispatch(cx, &*driver).await);
        }

        // Entities first, so collection baselines can resolve them.
        let mut answers: Vec<Option<Answer>> = Vec::with_capacity(steps.len());
        for step in &steps {
            answers.push(try_result!(finish_entity_step(graph, &mut batcher, step)));
        }

        // Far sides of many-to-many rows that are not resident yet.
        let mut link_rows: Vec<Option<Vec<Row>>> = Vec::with_capacity(steps.len());
        let mut follow_up = ReadBatcher::new();
        let mut wanted: HashSet<TaggedId> = HashSet::new();
        let mut follow_tickets: Vec<(Ticket, Arc<EntityMetadata>)> = Vec::new();
        for step in &steps {
            let rows = match step {
                Step::Collection {
                    field: FieldMeta {
                        kind: FieldKind::ManyToMany { other, link, .. },
                        ..
                    },
                    ticket,
                    ..
                } => {
                    let rows = batcher.take(*ticket);
                    let meta = Arc::clone(try_result!(graph.registry().get(other)));
                    for row in &rows {
                        let Some(id) = link_target(&meta, row, link.remote_column) else {
                            continue;
                        };
                        if graph.find(&id).is_none() && wanted.insert(id.clone()) {
                            let ticket = follow_up.enqueue(by_id_query(&meta, &id));
                            follow_tickets.push((ticket, Arc::clone(&meta)));
                        }
                    }
                    Some(rows)
                }
                _ => None,
            };
            link_rows.push(rows);
        }
        if follow_up.pending() > 0 {
            tracing::debug!(entities = wanted.len(), "Loading far side of join rows");
            try_outcome!(follow_up.dispatch(cx, &*driver).await);
            for (ticket, meta) in &follow_tickets {
                for row in follow_up.take(*ticket) {
                    try_result!(graph.hydrate(meta, &row));
                }
            }
        }

        let mut applied: HashSet<(EntityHandle, &'static str)> = HashSet::new();
        for (i, step) in steps.iter().enumerate() {
            if answers[i].is_some() {
                continue;
            }
            let answer = match step {
                Step::Collection {
                    owner,
                    field,
                    options,
                    ticket,
                } => {
                    if applied.insert((*owner, field.name)) {
                        let rows = match link_rows[i].take() {
                            Some(rows) => rows,
                            None => batcher.take(*ticket),
                        };
                        try_result!(apply_collection_rows(graph, *owner, *field, &rows));
                    }
                    Answer::Entities(try_result!(members(graph, *owner, *field, *options)))
                }
                Step::ChildMembership {
                    owner,
                    field,
                    meta,
                    ticket,
                    want_entity,
                } => {
                    let mut found = None;
                    for row in batcher.take(*ticket) {
                        let h = try_result!(graph.hydrate(meta, &row));
                        if try_result!(graph.includes_known(*owner, field.name, h)) == Some(true) {
                            found = Some(h);
                        }
                    }
                    if *want_entity {
                        Answer::Entity(found)
                    } else {
                        Answer::Flag(found.is_some())
                    }
                }
                Step::LinkMembership {
                    owner,
                    field,
                    link_ticket,
                    other,
                    resident,
                } => {
                    let rows = batcher.take(*link_ticket);
                    let target = match (resident, other) {
                        (Some(h), _) => Some(*h),
                        (None, Some((meta, Some(ticket), _))) => {
                            let mut target = None;
                            for row in batcher.take(*ticket) {
                                target = Some(try_result!(graph.hydrate(meta, &row)));
                            }
                            target
                        }
                        (None, _) => None,
                    };
                    let in_storage = !rows.is_empty();
                    match target {
                        Some(h) => {
                            if let FieldKind::ManyToMany { link, .. } = field.kind {
                                for row in &rows {
                                    let id = row.get_by_name("id").and_then(Value::as_i64);
                                    graph.ledger.add_existing(link, id, *owner, h);
                                }
                            }
                            let known = try_result!(graph.includes_known(*owner, field.name, h));
                            let member = known.unwrap_or(in_storage);
                            if other.is_some() {
                                Answer::Entity(member.then_some(h))
                            } else {
                                Answer::Flag(member)
                            }
                        }
                        None if other.is_some() => Answer::Entity(None),
                        None => Answer::Flag(false),
                    }
                }
                Step::Done(_) | Step::Entity { .. } | Step::Find { .. } => continue,
            };
            answers[i] = Some(answer);
        }

        let answers = answers
            .into_iter()
            .map(|a| a.unwrap_or(Answer::Entity(None)))
            .collect();
        tracing::debug!(
            round_trips = batcher.round_trips() + follow_up.round_trips(),
            "Window dispatched"
        );
        Outcome::Ok(WindowResults { answers })
    }
}

fn by_id_query(meta: &EntityMetadata, id: &TaggedId) -> FindQuery {
    FindQuery::entity(meta.type_name, meta.table).filter(Filter::eq(meta.id_column, id.to_value()))
}

/// Metadata of the entity type on the far side of a relation.
fn target_meta<'r>(registry: &'r MetadataRegistry, field: &FieldMeta) -> Result<&'r Arc<EntityMetadata>> {
    let other = field
        .other_type()
        .ok_or_else(|| Error::config(format!("{} is not a relation", field.name)))?;
    registry.get(other)
}

fn link_target(meta: &EntityMetadata, row: &Row, column: &str) -> Option<TaggedId> {
    row.get_by_name(column)
        .and_then(IdValue::from_value)
        .map(|v| TaggedId::new(meta.tag, v))
}

fn stored_id(graph: &EntityGraph, owner: EntityHandle) -> Result<TaggedId> {
    graph.identity_map().id_of(owner).cloned().ok_or_else(|| {
        Error::config(format!(
            "{} is persisted but has no id",
            graph.describe(owner)
        ))
    })
}

/// Decide how a request is answered and enqueue what needs storage.
fn plan(
    graph: &mut EntityGraph,
    preload: &mut PreloadCache,
    batcher: &mut ReadBatcher,
    request: WindowRequest,
) -> Result<Step> {
    let registry = Arc::clone(graph.registry());
    match request {
        WindowRequest::Collection {
            owner,
            field,
            options,
        } => {
            let persisted = graph.entity(owner).is_persisted();
            let loaded = graph.is_loaded(owner, field.name);
            if !persisted || (loaded && !options.force_reload) {
                return Ok(Step::Done(Answer::Entities(members(
                    graph, owner, field, options,
                )?)));
            }
            let id = stored_id(graph, owner)?;
            if !options.force_reload {
                if let Some(baseline) = preloaded(graph, preload, owner, &id, field)? {
                    tracing::trace!(owner = %id, field = field.name, "Collection served from preload cache");
                    apply_baseline(graph, owner, field, baseline)?;
                    return Ok(Step::Done(Answer::Entities(members(
                        graph, owner, field, options,
                    )?)));
                }
            }
            let meta = Arc::clone(graph.entity(owner).meta());
            let query = match field.kind {
                FieldKind::ManyToMany { link, .. } => FindQuery::table(link.table_name)
                    .filter(Filter::eq(link.local_column, id.to_value())),
                _ => {
                    let other = target_meta(&registry, &field)?;
                    let column = registry.child_column(&meta, &field)?;
                    FindQuery::entity(other.type_name, other.table)
                        .filter(Filter::eq(column, id.to_value()))
                }
            };
            Ok(Step::Collection {
                owner,
                field,
                options,
                ticket: batcher.enqueue(query),
            })
        }
        WindowRequest::Reference { child, field } => {
            let target = graph.reference(child, field.name)?;
            let id = match target {
                RefTarget::Unset => return Ok(Step::Done(Answer::Entity(None))),
                RefTarget::Entity(h) => return Ok(Step::Done(Answer::Entity(Some(h)))),
                RefTarget::Id(id) => id,
            };
            if let Some(h) = graph.find(&id) {
                return Ok(Step::Done(Answer::Entity(Some(h))));
            }
            let meta = Arc::clone(target_meta(&registry, &field)?);
            Ok(Step::Entity {
                ticket: batcher.enqueue(by_id_query(&meta, &id)),
                meta,
            })
        }
        WindowRequest::ById(id) => {
            if let Some(h) = graph.find(&id) {
                return Ok(Step::Done(Answer::Entity(Some(h))));
            }
            let meta = registry
                .by_tag(id.tag())
                .map(Arc::clone)
                .ok_or_else(|| Error::InvalidId(id.to_string()))?;
            Ok(Step::Entity {
                ticket: batcher.enqueue(by_id_query(&meta, &id)),
                meta,
            })
        }
        WindowRequest::Find(query) => {
            let meta = Arc::clone(registry.get(query.entity.unwrap_or_default())?);
            Ok(Step::Find {
                meta,
                ticket: batcher.enqueue(query),
            })
        }
        WindowRequest::Includes {
            owner,
            field,
            other,
        } => {
            if let Some(known) = graph.includes_known(owner, field.name, other)? {
                return Ok(Step::Done(Answer::Flag(known)));
            }
            let owner_key = stored_id(graph, owner)?;
            let other_key = stored_id(graph, other)?;
            membership_step(graph, batcher, owner, field, &owner_key, &other_key, Some(other), false)
        }
        WindowRequest::FindInCollection { owner, field, id } => {
            if let Some(h) = graph.find(&id) {
                if let Some(known) = graph.includes_known(owner, field.name, h)? {
                    return Ok(Step::Done(Answer::Entity(known.then_some(h))));
                }
                let owner_key = stored_id(graph, owner)?;
                return membership_step(graph, batcher, owner, field, &owner_key, &id, Some(h), true);
            }
            // Every member of a loaded collection is resident.
            if !graph.entity(owner).is_persisted() || graph.is_loaded(owner, field.name) {
                return Ok(Step::Done(Answer::Entity(None)));
            }
            let owner_key = stored_id(graph, owner)?;
            membership_step(graph, batcher, owner, field, &owner_key, &id, None, true)
        }
    }
}

/// Single-row lookup deciding membership of `other_key` in `owner.field`.
#[allow(clippy::too_many_arguments)]
fn membership_step(
    graph: &EntityGraph,
    batcher: &mut ReadBatcher,
    owner: EntityHandle,
    field: FieldMeta,
    owner_key: &TaggedId,
    other_key: &TaggedId,
    resident: Option<EntityHandle>,
    want_entity: bool,
) -> Result<Step> {
    let registry = graph.registry();
    let other_meta = Arc::clone(target_meta(&registry, &field)?);
    match field.kind {
        FieldKind::ManyToMany { link, .. } => {
            let link_ticket = batcher.enqueue(
                FindQuery::table(link.table_name)
                    .filter(Filter::eq(link.local_column, owner_key.to_value()))
                    .filter(Filter::eq(link.remote_column, other_key.to_value())),
            );
            let other = if want_entity {
                let ticket = resident
                    .is_none()
                    .then(|| batcher.enqueue(by_id_query(&other_meta, other_key)));
                Some((other_meta, ticket, other_key.clone()))
            } else {
                None
            };
            Ok(Step::LinkMembership {
                owner,
                field,
                link_ticket,
                other,
                resident,
            })
        }
        _ => {
            let meta = graph.entity(owner).meta();
            let column = registry.child_column(meta, &field)?;
            let query = by_id_query(&other_meta, other_key)
                .filter(Filter::eq(column, owner_key.to_value()));
            Ok(Step::ChildMembership {
                owner,
                field,
                meta: other_meta,
                ticket: batcher.enqueue(query),
                want_entity,
            })
        }
    }
}

/// Members recorded in the preload cache, resolved to resident handles.
///
/// `None` when there is no entry or an entry names an entity that is not
/// resident.
fn preloaded(
    graph: &mut EntityGraph,
    preload: &mut PreloadCache,
    owner: EntityHandle,
    owner_key: &TaggedId,
    field: FieldMeta,
) -> Result<Option<Vec<EntityHandle>>> {
    let Some(ids) = preload.get(owner_key, field.name) else {
        return Ok(None);
    };
    let mut handles = Vec::with_capacity(ids.len());
    for id in ids {
        match graph.find(id) {
            Some(h) => handles.push(h),
            None => return Ok(None),
        }
    }
    preload.remove(owner_key, field.name);
    if let FieldKind::ManyToMany { link, .. } = field.kind {
        for h in &handles {
            graph.ledger.add_existing(link, None, owner, *h);
        }
    }
    Ok(Some(handles))
}

/// Finish steps that only hydrate entities. Collection and membership steps
/// are left for later.
fn finish_entity_step(
    graph: &mut EntityGraph,
    batcher: &mut ReadBatcher,
    step: &Step,
) -> Result<Option<Answer>> {
    match step {
        Step::Done(answer) => Ok(Some(answer.clone())),
        Step::Entity { meta, ticket } => {
            let mut found = None;
            for row in batcher.take(*ticket) {
                found = Some(graph.hydrate(meta, &row)?);
            }
            Ok(Some(Answer::Entity(found)))
        }
        Step::Find { meta, ticket } => {
            let mut handles = Vec::new();
            for row in batcher.take(*ticket) {
                let h = graph.hydrate(meta, &row)?;
                if !graph.entity(h).is_deleted() && !handles.contains(&h) {
                    handles.push(h);
                }
            }
            Ok(Some(Answer::Entities(handles)))
        }
        Step::Collection { .. } | Step::ChildMembership { .. } | Step::LinkMembership { .. } => {
            Ok(None)
        }
    }
}

/// Turn fetched rows into the stored membership of `owner.field` and fold it
/// into the graph.
fn apply_collection_rows(
    graph: &mut EntityGraph,
    owner: EntityHandle,
    field: FieldMeta,
    rows: &[Row],
) -> Result<()> {
    let registry = Arc::clone(graph.registry());
    let other = target_meta(&registry, &field)?;
    let mut baseline = Vec::with_capacity(rows.len());
    match field.kind {
        FieldKind::ManyToMany { link, .. } => {
            for row in rows {
                let Some(id) = link_target(other, row, link.remote_column) else {
                    continue;
                };
                let Some(h) = graph.find(&id) else {
                    tracing::warn!(
                        table = link.table_name,
                        id = %id,
                        "Join row points at a missing entity; skipped"
                    );
                    continue;
                };
                let row_id = row.get_by_name("id").and_then(Value::as_i64);
                graph.ledger.add_existing(link, row_id, owner, h);
                if !baseline.contains(&h) {
                    baseline.push(h);
                }
            }
        }
        _ => {
            let back = graph.reciprocal_field(owner, &field)?;
            for row in rows {
                let h = graph.hydrate(other, row)?;
                let points_here = graph
                    .entity(h)
                    .reference(back.name)
                    .is_some_and(|t| graph.identity_map().points_at(t, owner));
                if points_here && !baseline.contains(&h) {
                    baseline.push(h);
                }
            }
        }
    }
    apply_baseline(graph, owner, field, baseline)
}

fn apply_baseline(
    graph: &mut EntityGraph,
    owner: EntityHandle,
    field: FieldMeta,
    baseline: Vec<EntityHandle>,
) -> Result<()> {
    tracing::trace!(
        owner = %graph.describe(owner),
        field = field.name,
        stored = baseline.len(),
        "Applying loaded collection"
    );
    graph.apply_loaded(owner, field, baseline)
}

fn members(
    graph: &EntityGraph,
    owner: EntityHandle,
    field: FieldMeta,
    options: LoadOptions,
) -> Result<Vec<EntityHandle>> {
    if options.include_deleted {
        graph.get_with_deleted(owner, field.name)
    } else {
        graph.get(owner, field.name)
    }
}

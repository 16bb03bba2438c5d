//! Unit of work for joinery.
//!
//! The unit of work keeps one in-memory record per stored entity, tracks every
//! change made to the graph, and writes those changes back in a single
//! transaction on flush.
//!
//! # Pieces
//!
//! - [`EntityGraph`]: identity map, field values, references and relation
//!   collections, with reciprocal sides kept in step
//! - [`RelationCollection`]: the load state and pending adds/removes of one
//!   collection
//! - [`JoinRowLedger`]: many-to-many link rows, including rows still to be
//!   inserted or deleted
//! - [`ReadWindow`] and [`ReadBatcher`]: collect reads and send compatible
//!   ones as one query
//! - [`UnitOfWork`]: binds a graph to a [`Driver`] and runs flush passes
//!
//! # Example
//!
//! ```ignore
//! let mut uow = UnitOfWork::new(registry, driver);
//! let author = uow.load_by_id(&cx, &TaggedId::int("a", 1)).await?;
//! let book = uow.graph_mut().create("Book", [("title", Value::from("Dune"))])?;
//! uow.graph_mut().set_reference(book, "author", author)?;
//! uow.flush(&cx).await?;
//! ```

/// Return early from an `Outcome`-returning fn on `Err`.
macro_rules! try_result {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(e) => return ::asupersync::Outcome::Err(e),
        }
    };
}

/// Return early from an `Outcome`-returning fn on anything but `Ok`.
macro_rules! try_outcome {
    ($e:expr) => {
        match $e {
            ::asupersync::Outcome::Ok(v) => v,
            ::asupersync::Outcome::Err(e) => return ::asupersync::Outcome::Err(e),
            ::asupersync::Outcome::Cancelled(r) => return ::asupersync::Outcome::Cancelled(r),
            ::asupersync::Outcome::Panicked(p) => return ::asupersync::Outcome::Panicked(p),
        }
    };
}

pub mod change_tracker;
pub mod collection;
pub mod driver;
pub mod entity;
pub mod flush;
pub mod graph;
pub mod identity_map;
pub mod join_rows;
pub mod loader;
pub mod n1_detection;
pub mod preload;
pub mod unit_of_work;
pub mod window;

#[cfg(test)]
mod testing;

pub use change_tracker::{CollectionChanges, EntityChanges, FieldChange};
pub use collection::{CollectionState, LoadOptions, RelationCollection};
pub use driver::{
    CompareOp, DeleteRow, Driver, EntityTodo, Filter, FindQuery, FlushBatch, FlushResult,
    IdRequest, InsertRow, JoinRowTodo, JoinRowWrite, OrderBy, UpdateRow, compare_values,
};
pub use entity::{EntityHandle, EntityRecord, EntityStatus, RefTarget};
pub use flush::{FlushSummary, PassSummary};
pub use graph::{EntityGraph, PendingCounts};
pub use identity_map::IdentityMap;
pub use join_rows::{JoinRow, JoinRowLedger, JoinRowOp, JoinTableTodo};
pub use loader::{BatchKey, ReadBatcher, Ticket};
pub use n1_detection::{LoadSite, N1Stats, N1Tracker};
pub use preload::{LoadHint, PreloadCache, PreloadPlugin, PreloadedRelation};
pub use unit_of_work::UnitOfWork;
pub use window::{ReadWindow, RequestId, WindowResults};

use joinery_core::Result;

// ============================================================================
// Flush Events
// ============================================================================

/// Type alias for flush event callbacks.
///
/// Returning `Err` from a `before_flush` or `after_flush` callback aborts the
/// flush and rolls it back.
type FlushEventFn = Box<dyn FnMut() -> Result<()> + Send>;

/// Callbacks registered on a unit of work, one list per event.
#[derive(Default)]
pub struct FlushEventCallbacks {
    pub(crate) before_flush: Vec<FlushEventFn>,
    pub(crate) after_flush: Vec<FlushEventFn>,
    pub(crate) after_commit: Vec<FlushEventFn>,
    pub(crate) after_rollback: Vec<FlushEventFn>,
}

impl std::fmt::Debug for FlushEventCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushEventCallbacks")
            .field("before_flush", &self.before_flush.len())
            .field("after_flush", &self.after_flush.len())
            .field("after_commit", &self.after_commit.len())
            .field("after_rollback", &self.after_rollback.len())
            .finish()
    }
}

impl FlushEventCallbacks {
    #[allow(clippy::result_large_err)]
    pub(crate) fn fire(&mut self, event: FlushEvent) -> Result<()> {
        let callbacks = match event {
            FlushEvent::BeforeFlush => &mut self.before_flush,
            FlushEvent::AfterFlush => &mut self.after_flush,
            FlushEvent::AfterCommit => &mut self.after_commit,
            FlushEvent::AfterRollback => &mut self.after_rollback,
        };
        for cb in callbacks.iter_mut() {
            cb()?;
        }
        Ok(())
    }
}

/// Flush lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushEvent {
    /// Fired before the flush transaction begins.
    BeforeFlush,
    /// Fired after every pass has been written, before commit.
    AfterFlush,
    /// Fired after commit, once the graph reflects the flush.
    AfterCommit,
    /// Fired after a failed flush was rolled back.
    AfterRollback,
}

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for a [`UnitOfWork`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitOfWorkConfig {
    /// Flush passes allowed before the flush fails with `FlushCycle`.
    pub max_flush_passes: usize,
    /// Single-owner loads of one relation before an N+1 warning.
    pub n1_threshold: usize,
    /// Overrides the driver's answer to `supports_deferred_constraints`.
    pub deferred_constraints: Option<bool>,
}

impl Default for UnitOfWorkConfig {
    fn default() -> Self {
        Self {
            max_flush_passes: 10,
            n1_threshold: 3,
            deferred_constraints: None,
        }
    }
}

impl UnitOfWorkConfig {
    #[must_use]
    pub fn max_flush_passes(mut self, passes: usize) -> Self {
        self.max_flush_passes = passes.max(1);
        self
    }

    #[must_use]
    pub fn n1_threshold(mut self, threshold: usize) -> Self {
        self.n1_threshold = threshold;
        self
    }

    #[must_use]
    pub fn deferred_constraints(mut self, deferred: bool) -> Self {
        self.deferred_constraints = Some(deferred);
        self
    }
}

// ============================================================================
// Reactive Engine
// ============================================================================

/// Hook that runs between flush passes.
///
/// The engine sees what the pass wrote and may change the graph again, for
/// example to recompute derived fields or touch parents. Whatever it changes
/// is written by the next pass. A flush ends once a pass finds nothing to do.
pub trait ReactiveEngine: Send {
    fn react(&mut self, graph: &mut EntityGraph, pass: &PassSummary) -> Result<()>;
}

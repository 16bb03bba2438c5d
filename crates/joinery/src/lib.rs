//! Joinery - a unit of work for relational entity graphs.
//!
//! Joinery keeps one in-memory record per stored row, keeps both sides of
//! every relation in step, batches the reads a graph walk needs, and writes
//! all pending changes back in one transaction.
//!
//! - Identity map keyed by tagged ids (`"a:1"`)
//! - Relation collections that accept changes before they are loaded
//! - Many-to-many link rows tracked as first-class records
//! - Read windows that merge compatible finds into one round trip
//! - Flushes that reserve ids up front, order writes by foreign key, check
//!   versions, and repeat until reactive work settles
//!
//! # Quick Start
//!
//! ```ignore
//! use joinery::prelude::*;
//!
//! let registry = MetadataRegistry::new()
//!     .with(
//!         EntityMetadata::new("Author", "a", "authors")
//!             .primitive("first_name")
//!             .one_to_many("books", "Book", "author"),
//!     )?
//!     .with(
//!         EntityMetadata::new("Book", "b", "books")
//!             .primitive("title")
//!             .many_to_one("author", "author_id", "Author", "books"),
//!     )?
//!     .finish()?;
//!
//! let mut uow = UnitOfWork::new(registry, MemoryDriver::new());
//! let author = uow.graph_mut().create("Author", [("first_name", Value::from("Ursula"))])?;
//! let book = uow.graph_mut().create("Book", [("title", Value::from("The Dispossessed"))])?;
//! uow.graph_mut().add(author, "books", book)?;
//! uow.flush(&cx).await?;
//! ```
//!
//! # Drivers
//!
//! - [`MemoryDriver`]: tables held in process, for tests and prototyping
//! - [`SqlDriver`]: SQL text over any [`Connection`], with native sequences
//!   or a counter table for id reservation

pub use joinery_core::{
    // asupersync re-exports
    Cx,
    Outcome,
    // Core types
    Connection,
    Dialect,
    EntityMetadata,
    Error,
    FieldKind,
    FieldMeta,
    IdValue,
    LinkTableInfo,
    MetadataRegistry,
    Result,
    Row,
    TaggedId,
    Value,
};
pub use joinery_core::{
    NotLoadedError, OptimisticLockError, ReservationError, TransactionError,
    TransactionErrorKind,
};
pub use joinery_memory::{MemoryDriver, MemoryStats};
pub use joinery_session::{
    CollectionChanges, CollectionState, CompareOp, Driver, EntityChanges, EntityGraph,
    EntityHandle, EntityRecord, EntityStatus, FieldChange, Filter, FindQuery, FlushBatch,
    FlushEvent, FlushResult, FlushSummary, IdRequest, JoinRowLedger, LoadHint, LoadOptions,
    N1Stats, N1Tracker, PassSummary, PendingCounts, PreloadCache, PreloadPlugin,
    PreloadedRelation, ReactiveEngine, ReadWindow, RefTarget, RequestId, UnitOfWork,
    UnitOfWorkConfig, WindowResults,
};
pub use joinery_sql::{SequenceStrategy, SqlDriver, SqlDriverConfig};

/// A unit of work over the in-memory driver.
pub type MemoryUnitOfWork = UnitOfWork<MemoryDriver>;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::{
        Cx, EntityHandle, EntityMetadata, Error, FindQuery, LinkTableInfo, LoadHint,
        LoadOptions, MemoryDriver, MetadataRegistry, Outcome, RefTarget, Result, Row,
        SqlDriver, TaggedId, UnitOfWork, UnitOfWorkConfig, Value,
    };
}

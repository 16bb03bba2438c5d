//! Core types and traits for joinery.
//!
//! This crate provides the foundational pieces shared by the unit of work and
//! its drivers:
//!
//! - `Value` and `Row` for dynamically-typed column data
//! - `TaggedId` for addressing entities across types
//! - `EntityMetadata` and `MetadataRegistry` describing fields and relations
//! - `Connection` trait and `Dialect` for SQL backends
//! - `Outcome` re-export from asupersync for cancel-correct operations
//! - `Cx` context for structured concurrency

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod connection;
pub mod error;
pub mod id;
pub mod meta;
pub mod row;
pub mod value;

pub use connection::{Connection, Dialect};
pub use error::{
    ConfigError, ConnectionError, ConnectionErrorKind, Error, NotLoadedError,
    OptimisticLockError, QueryError, QueryErrorKind, ReservationError, Result,
    TransactionError, TransactionErrorKind, TypeError,
};
pub use id::{IdValue, TaggedId};
pub use meta::{EntityMetadata, FieldKind, FieldMeta, LinkTableInfo, MetadataRegistry};
pub use row::{ColumnInfo, Row};
pub use value::Value;

//! Error types for unit-of-work operations.

use std::fmt;

/// The primary error type for all joinery operations.
#[derive(Debug)]
pub enum Error {
    /// Connection-related errors (connect, disconnect, timeout)
    Connection(ConnectionError),
    /// Query execution errors raised by a driver
    Query(QueryError),
    /// Type conversion errors
    Type(TypeError),
    /// Transaction errors
    Transaction(TransactionError),
    /// Configuration and metadata errors
    Config(ConfigError),
    /// A relation was read synchronously before it was loaded
    NotLoaded(NotLoadedError),
    /// A versioned update or delete matched fewer rows than expected
    OptimisticLock(OptimisticLockError),
    /// The id reservation primitive returned fewer ids than requested
    Reservation(ReservationError),
    /// A deep clone was asked to copy a many-to-many relation
    UncloneableRelation {
        /// Entity type name
        entity: &'static str,
        /// Relation field name
        field: String,
    },
    /// A field name that the entity's metadata does not declare
    UnknownField {
        /// Entity type name
        entity: &'static str,
        /// The offending field name
        field: String,
    },
    /// A relation was given an entity of the wrong type
    WrongEntityType {
        /// Relation field name
        field: &'static str,
        /// Type declared by the relation
        expected: &'static str,
        /// Type of the entity that was passed
        actual: &'static str,
    },
    /// A string could not be parsed as a tagged id
    InvalidId(String),
    /// Flush passes kept producing work past the configured limit
    FlushCycle {
        /// Number of passes that ran before giving up
        passes: usize,
        /// Entities still dirty when the limit was hit
        pending: Vec<String>,
    },
    /// Entity types with mutually dependent foreign keys were written together
    /// on a connection without deferred constraints
    DependencyCycle {
        /// Types participating in the cycle
        types: Vec<&'static str>,
    },
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Serialization/deserialization errors
    Serde(String),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Connection lost during operation
    Disconnected,
    /// Connection refused
    Refused,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub sqlstate: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Deadlock detected
    Deadlock,
    /// Serialization failure (retry may succeed)
    Serialization,
    /// The driver cannot run this kind of statement
    Unsupported,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// Commit or rollback without a matching begin
    NotActive,
    /// Already rolled back
    AlreadyRolledBack,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

/// Raised by `get` on a collection whose membership has not been fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotLoadedError {
    /// Owner rendered as a tagged id (or `Type#new` for unsaved owners)
    pub entity: String,
    /// Relation field name
    pub field: &'static str,
}

/// Raised when a versioned write observes a concurrent modification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptimisticLockError {
    pub table: &'static str,
    /// Rows the statement was expected to touch
    pub expected: u64,
    /// Rows it actually touched
    pub actual: u64,
    /// Ids included in the failing statement
    pub ids: Vec<String>,
}

/// Raised when fewer ids come back than were requested for a type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationError {
    pub table: &'static str,
    pub requested: usize,
    pub received: usize,
}

impl Error {
    /// Is this error retryable (optimistic lock, deadlock, serialization failure)?
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::OptimisticLock(_) => true,
            Error::Query(q) => matches!(
                q.kind,
                QueryErrorKind::Deadlock | QueryErrorKind::Serialization
            ),
            _ => false,
        }
    }

    /// Is this a connection error that likely requires reconnection?
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Error::Connection(_))
    }

    /// Is this the error raised by a synchronous read of an unloaded relation?
    pub fn is_not_loaded(&self) -> bool {
        matches!(self, Error::NotLoaded(_))
    }

    /// Is this an optimistic-lock failure?
    pub fn is_optimistic_lock(&self) -> bool {
        matches!(self, Error::OptimisticLock(_))
    }

    /// Get SQLSTATE if available (e.g., "23505" for unique violation)
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sqlstate.as_deref(),
            _ => None,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            _ => None,
        }
    }

    /// Build a configuration error from a message.
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(ConfigError {
            message: message.into(),
            source: None,
        })
    }

    /// Build a query error of the given kind.
    pub fn query(kind: QueryErrorKind, message: impl Into<String>) -> Self {
        Error::Query(QueryError {
            kind,
            sql: None,
            sqlstate: None,
            message: message.into(),
            source: None,
        })
    }
}

impl QueryError {
    /// Is this a unique constraint violation?
    pub fn is_unique_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some("23505")
    }

    /// Is this a foreign key violation?
    pub fn is_foreign_key_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some("23503")
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => {
                if let Some(sqlstate) = &e.sqlstate {
                    write!(f, "Query error (SQLSTATE {}): {}", sqlstate, e.message)
                } else {
                    write!(f, "Query error: {}", e.message)
                }
            }
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::NotLoaded(e) => write!(f, "{}", e),
            Error::OptimisticLock(e) => write!(f, "{}", e),
            Error::Reservation(e) => write!(f, "{}", e),
            Error::UncloneableRelation { entity, field } => write!(
                f,
                "{}.{} is a many-to-many relation and cannot be deep cloned",
                entity, field
            ),
            Error::UnknownField { entity, field } => {
                write!(f, "{} has no field named '{}'", entity, field)
            }
            Error::WrongEntityType {
                field,
                expected,
                actual,
            } => write!(
                f,
                "relation '{}' expects {} entities, got {}",
                field, expected, actual
            ),
            Error::InvalidId(raw) => write!(f, "Invalid tagged id: '{}'", raw),
            Error::FlushCycle { passes, pending } => write!(
                f,
                "Flush did not settle after {} passes; still dirty: {}",
                passes,
                pending.join(", ")
            ),
            Error::DependencyCycle { types } => write!(
                f,
                "Foreign keys form a cycle between {} and the connection has no deferred constraints",
                types.join(" -> ")
            ),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sqlstate) = &self.sqlstate {
            write!(f, "{} (SQLSTATE {})", self.message, sqlstate)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for NotLoadedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{} was not loaded; call load() or populate() first",
            self.entity, self.field
        )
    }
}

impl fmt::Display for OptimisticLockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Oplock failure on {}: expected {} rows, updated {} (ids: {})",
            self.table,
            self.expected,
            self.actual,
            self.ids.join(", ")
        )
    }
}

impl fmt::Display for ReservationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Id reservation for {} returned {} ids, {} requested",
            self.table, self.received, self.requested
        )
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<NotLoadedError> for Error {
    fn from(err: NotLoadedError) -> Self {
        Error::NotLoaded(err)
    }
}

impl From<OptimisticLockError> for Error {
    fn from(err: OptimisticLockError) -> Self {
        Error::OptimisticLock(err)
    }
}

impl From<ReservationError> for Error {
    fn from(err: ReservationError) -> Self {
        Error::Reservation(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for joinery operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlstate_helpers() {
        let query = QueryError {
            kind: QueryErrorKind::Constraint,
            sql: Some("INSERT INTO books".to_string()),
            sqlstate: Some("23503".to_string()),
            message: "foreign key violation".to_string(),
            source: None,
        };

        assert!(query.is_foreign_key_violation());
        assert!(!query.is_unique_violation());

        let err = Error::Query(query);
        assert_eq!(err.sqlstate(), Some("23503"));
        assert_eq!(err.sql(), Some("INSERT INTO books"));
    }

    #[test]
    fn oplock_is_retryable() {
        let err = Error::from(OptimisticLockError {
            table: "authors",
            expected: 2,
            actual: 1,
            ids: vec!["a:1".to_string(), "a:2".to_string()],
        });
        assert!(err.is_retryable());
        assert!(err.is_optimistic_lock());
        assert_eq!(
            err.to_string(),
            "Oplock failure on authors: expected 2 rows, updated 1 (ids: a:1, a:2)"
        );
    }

    #[test]
    fn not_loaded_message_names_the_relation() {
        let err = Error::from(NotLoadedError {
            entity: "a:1".to_string(),
            field: "books",
        });
        assert!(err.is_not_loaded());
        assert!(err.to_string().starts_with("a:1.books was not loaded"));
    }

    #[test]
    fn deadlock_retryable_constraint_not() {
        assert!(Error::query(QueryErrorKind::Deadlock, "deadlock detected").is_retryable());
        assert!(!Error::query(QueryErrorKind::Constraint, "dup").is_retryable());
    }
}

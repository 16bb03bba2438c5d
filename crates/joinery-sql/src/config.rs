//! Configuration for [`SqlDriver`](crate::SqlDriver).

use joinery_core::{Dialect, Error, Result};

/// Default name of the table holding per-table id counters.
pub const DEFAULT_SEQUENCE_TABLE: &str = "joinery_sequences";

/// How fresh ids are reserved.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SequenceStrategy {
    /// Native sequences where the dialect has them, a counter table elsewhere.
    #[default]
    Auto,
    /// `nextval` on the table's `{table}_{id_column}_seq` sequence.
    Native,
    /// A counter table with `table_name` and `next_id` columns.
    Table(String),
}

/// Strategy after `Auto` has been decided for a dialect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ResolvedSequences {
    Native,
    Table(String),
}

/// Configuration for a SQL driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlDriverConfig {
    pub sequences: SequenceStrategy,
    /// Rows per multi-row statement; larger todos are split.
    pub max_rows_per_statement: usize,
}

impl Default for SqlDriverConfig {
    fn default() -> Self {
        Self {
            sequences: SequenceStrategy::Auto,
            max_rows_per_statement: 500,
        }
    }
}

impl SqlDriverConfig {
    #[must_use]
    pub fn sequences(mut self, strategy: SequenceStrategy) -> Self {
        self.sequences = strategy;
        self
    }

    #[must_use]
    pub fn max_rows_per_statement(mut self, rows: usize) -> Self {
        self.max_rows_per_statement = rows.max(1);
        self
    }

    pub(crate) fn resolve(&self, dialect: Dialect) -> Result<ResolvedSequences> {
        match &self.sequences {
            SequenceStrategy::Auto if dialect.supports_sequences() => Ok(ResolvedSequences::Native),
            SequenceStrategy::Auto => Ok(ResolvedSequences::Table(DEFAULT_SEQUENCE_TABLE.to_string())),
            SequenceStrategy::Native if dialect.supports_sequences() => Ok(ResolvedSequences::Native),
            SequenceStrategy::Native => Err(Error::config(format!(
                "{:?} has no native sequences; use a sequence table",
                dialect
            ))),
            SequenceStrategy::Table(name) if name.is_empty() => {
                Err(Error::config("sequence table name is empty"))
            }
            SequenceStrategy::Table(name) => Ok(ResolvedSequences::Table(name.clone())),
        }
    }
}

//! SQL storage driver for joinery.
//!
//! [`SqlDriver`] turns the unit of work's driver calls into SQL text and runs
//! it through any [`Connection`](joinery_core::Connection):
//!
//! - finds become one `SELECT` with lifted `IN` / row-value `IN` filters
//! - inserts are multi-row `INSERT` statements, chunked by
//!   [`SqlDriverConfig::max_rows_per_statement`]
//! - updates changing the same columns share one `UPDATE` with a `CASE` per
//!   column, matching on the version column when the type has one
//! - join rows are upserted by column pair and their ids read back
//! - ids come from native sequences or a counter table, per
//!   [`SequenceStrategy`]

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

pub mod config;
pub mod driver;
pub mod statements;

pub use config::{DEFAULT_SEQUENCE_TABLE, SequenceStrategy, SqlDriverConfig};
pub use driver::SqlDriver;
pub use statements::Statement;

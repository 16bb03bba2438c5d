//! In-memory storage driver for joinery.
//!
//! `MemoryDriver` implements the session's `Driver` trait over tables held in
//! process. It honours the same contract as the SQL driver: one round trip per
//! `execute_find`, id reservation per table, version-checked updates that fail
//! with `OptimisticLock`, join-row upserts by column pair, and transactions
//! whose rollback restores the store as of the outermost `begin`.
//!
//! It also carries hooks for exercising failure paths: an injected flush error,
//! a cap on reserved ids, and direct column writes standing in for a concurrent
//! writer.

pub mod driver;
mod store;

pub use driver::{MemoryDriver, MemoryStats};

//! ledgerindex-storage — relational ledger backends for LedgerIndex.
//!
//! Backends:
//! - [`MemoryLedgerStore`] (re-exported from core): in-memory, no persistence
//! - [`sqlite`]: SQLite via `sqlx` (embedded, single-file persistence)
//! - `postgres`: PostgreSQL via `sqlx` (`postgres` feature)
//!
//! Every backend implements [`LedgerStore`]: batch commits and rollbacks run
//! in one transaction each.

#[cfg(any(feature = "sqlite", feature = "postgres"))]
mod codec;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use ledgerindex_core::store::{LedgerStore, MemoryLedgerStore};

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteLedgerStore;

#[cfg(feature = "postgres")]
pub use postgres::PostgresLedgerStore;

//! Column encodings shared by the SQL backends.
//!
//! 256-bit amounts are stored as base-10 text (SQLite) or cast to and from
//! `NUMERIC(78, 0)` (Postgres). Balances are unbounded: text in SQLite,
//! unconstrained `NUMERIC` in Postgres. Heights are signed 64-bit columns.

use std::str::FromStr;

use alloy_primitives::U256;
use chrono::{DateTime, Utc};
use num_bigint::BigInt;

use ledgerindex_core::error::IndexerError;

/// Largest number of bound parameters per `IN (...)` lookup.
pub(crate) const LOOKUP_CHUNK: usize = 500;

pub(crate) fn db_err(e: sqlx::Error) -> IndexerError {
    IndexerError::Storage(e.to_string())
}

/// A stored value that cannot be read back is not transient.
fn corrupt(column: &str, value: &str) -> IndexerError {
    IndexerError::Other(format!("corrupt {column} value '{value}' in store"))
}

pub(crate) fn parse_u256(column: &str, value: &str) -> Result<U256, IndexerError> {
    U256::from_str_radix(value.trim(), 10).map_err(|_| corrupt(column, value))
}

pub(crate) fn parse_bigint(column: &str, value: &str) -> Result<BigInt, IndexerError> {
    BigInt::from_str(value.trim()).map_err(|_| corrupt(column, value))
}

pub(crate) fn to_timestamp(column: &str, secs: i64) -> Result<DateTime<Utc>, IndexerError> {
    DateTime::from_timestamp(secs, 0).ok_or_else(|| corrupt(column, &secs.to_string()))
}

pub(crate) fn to_height(column: &str, value: i64) -> Result<u64, IndexerError> {
    u64::try_from(value).map_err(|_| corrupt(column, &value.to_string()))
}

/// Height as a bind parameter. Heights above `i64::MAX` are refused rather
/// than stored wrapped.
pub(crate) fn to_db_height(column: &str, value: u64) -> Result<i64, IndexerError> {
    i64::try_from(value).map_err(|_| {
        IndexerError::Other(format!("{column} {value} does not fit a signed 64-bit column"))
    })
}

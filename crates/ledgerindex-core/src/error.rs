//! Error types for the ledgerindex pipeline.

use thiserror::Error;

/// Errors that can occur during indexing.
#[derive(Debug, Error)]
pub enum IndexerError {
    /// The chain source gave up or returned something it cannot recover from.
    #[error("Chain source error: {0}")]
    Source(String),

    /// Source data that cannot be turned into a ledger record. Never skipped.
    #[error("Malformed data at block {block_height}: {reason}")]
    MalformedData { block_height: u64, reason: String },

    /// A single store call failed (connection loss, write conflict, timeout).
    #[error("Storage error: {0}")]
    Storage(String),

    /// Store calls kept failing after every retry was spent.
    #[error("Store unavailable: '{operation}' failed after {attempts} attempts: {last_error}")]
    StoreUnavailable {
        operation: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Reorg at block {reorg_height} reaches finalized block {finalized_height}")]
    ReorgBelowFinality {
        reorg_height: u64,
        finalized_height: u64,
    },

    /// The stored checkpoint moved under a running indexer, e.g. an operator
    /// rollback. Nothing from the batch was written.
    #[error(
        "Checkpoint conflict for '{indexer_id}': batch extends {expected:?}, store holds {found:?}"
    )]
    CheckpointConflict {
        indexer_id: String,
        expected: Option<u64>,
        found: Option<u64>,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Indexer aborted: {reason}")]
    Aborted { reason: String },

    #[error("{0}")]
    Other(String),
}

impl IndexerError {
    /// Returns `true` for transient store failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(_))
    }

    /// Returns `true` if the error came from bad source data.
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::MalformedData { .. })
    }

    pub fn malformed(block_height: u64, reason: impl Into<String>) -> Self {
        Self::MalformedData {
            block_height,
            reason: reason.into(),
        }
    }
}

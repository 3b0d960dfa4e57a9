//! Checkpoint: the indexer's durable position, written in the same
//! transaction as each batch's ledger rows.
//!
//! On restart the run loop resumes strictly above the saved height. No
//! checkpoint means "start from the configured height".

use serde::{Deserialize, Serialize};

/// A persisted checkpoint for an indexer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Unique indexer identifier.
    pub indexer_id: String,
    /// Last processed block height.
    pub height: u64,
    /// Hash of the last processed block. Empty after a rollback.
    pub block_hash: String,
    /// `true` once `height` was at least `finality_depth` behind the head
    /// when the checkpoint was written.
    pub is_final: bool,
    /// Unix timestamp of when this checkpoint was saved.
    pub updated_at: i64,
}

impl Checkpoint {
    pub fn new(
        indexer_id: impl Into<String>,
        height: u64,
        block_hash: impl Into<String>,
        is_final: bool,
    ) -> Self {
        Self {
            indexer_id: indexer_id.into(),
            height,
            block_hash: block_hash.into(),
            is_final,
            updated_at: chrono::Utc::now().timestamp(),
        }
    }

    /// The checkpoint written after discarding every block at or above `from`.
    pub fn rolled_back(indexer_id: impl Into<String>, from: u64) -> Self {
        Self::new(indexer_id, from.saturating_sub(1), "", false)
    }
}

//! Indexer cursor: tracks the current position in the chain.

use serde::{Deserialize, Serialize};

use crate::checkpoint::Checkpoint;

/// The indexer's current position in the chain.
///
/// The cursor knows:
/// - Which block was last successfully committed
/// - The highest height known to be final (never rolled back)
/// - How many blocks behind the head a block must be to count as final
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cursor {
    /// Last committed block height.
    pub height: u64,
    /// Hash of the last committed block, empty when unknown.
    pub hash: String,
    /// Highest height that can no longer be reorganized.
    pub finalized_height: u64,
    /// Blocks behind head before a block is considered final.
    pub finality_depth: u64,
}

impl Cursor {
    /// Create a new cursor at the given starting position.
    pub fn new(height: u64, hash: impl Into<String>, finality_depth: u64) -> Self {
        Self {
            height,
            hash: hash.into(),
            finalized_height: height,
            finality_depth,
        }
    }

    /// Restore a cursor from a persisted checkpoint.
    ///
    /// A non-final checkpoint only proves that `start_height` is final.
    pub fn from_checkpoint(
        checkpoint: Option<&Checkpoint>,
        start_height: u64,
        finality_depth: u64,
    ) -> Self {
        match checkpoint {
            Some(cp) => Self {
                height: cp.height,
                hash: cp.block_hash.clone(),
                finalized_height: if cp.is_final {
                    cp.height
                } else {
                    start_height.min(cp.height)
                },
                finality_depth,
            },
            None => Self::new(start_height, "", finality_depth),
        }
    }

    /// Advance the cursor to a newly committed block seen with `chain_head`.
    pub fn advance(&mut self, height: u64, hash: impl Into<String>, chain_head: u64) {
        self.height = height;
        self.hash = hash.into();
        let final_now = height.min(chain_head.saturating_sub(self.finality_depth));
        self.finalized_height = self.finalized_height.max(final_now);
    }

    /// Move the cursor back after a rollback. The finalized height is kept.
    pub fn rewind_to(&mut self, height: u64) {
        self.height = height;
        self.hash.clear();
    }

    /// Returns `true` if `head` is far enough ahead for `target` to be final.
    pub fn is_confirmed(&self, target: u64, head: u64) -> bool {
        head.saturating_sub(target) >= self.finality_depth
    }

    /// Returns the next height to process (cursor + 1).
    pub fn next_height(&self) -> u64 {
        self.height.saturating_add(1)
    }
}

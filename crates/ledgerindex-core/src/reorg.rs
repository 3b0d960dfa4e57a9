//! Reorg detection over the hot (not yet final) part of the chain.
//!
//! Handles two scenarios:
//! 1. **Short reorg**: the next block's parent hash does not match the tracked head
//! 2. **Deep reorg / node switch**: a tracked hot block is no longer canonical

use crate::tracker::BlockTracker;
use crate::types::BlockSummary;

/// Describes a detected chain reorganization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReorgEvent {
    /// The block number at which the fork was noticed.
    pub detected_at: u64,
    /// Lowest height whose previously delivered block is no longer canonical.
    pub first_invalid_height: u64,
    /// Tracked blocks that were retracted, most recent first.
    pub dropped_blocks: Vec<BlockSummary>,
    /// Number of tracked blocks rolled back.
    pub depth: u64,
    pub reorg_type: ReorgType,
}

/// Classification of the reorg type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReorgType {
    /// Parent hash mismatch on the next block (1–3 blocks).
    ShortReorg,
    /// Tracked block replaced deeper in the hot window.
    DeepReorg,
}

impl std::fmt::Display for ReorgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ShortReorg => write!(f, "short reorg"),
            Self::DeepReorg => write!(f, "deep reorg"),
        }
    }
}

/// Detects chain reorganizations among hot blocks.
///
/// Owns a [`BlockTracker`] sized to the finality depth: anything older than
/// that is final and falls out of the window.
#[derive(Debug, Clone)]
pub struct ReorgDetector {
    tracker: BlockTracker,
}

impl ReorgDetector {
    pub fn new(finality_depth: u64) -> Self {
        Self {
            tracker: BlockTracker::new(finality_depth as usize + 1),
        }
    }

    pub fn tracker(&self) -> &BlockTracker {
        &self.tracker
    }

    /// Heights of every tracked hot block, oldest first.
    pub fn tracked_heights(&self) -> Vec<u64> {
        self.tracker.blocks().map(|b| b.number).collect()
    }

    /// Record the next delivered block.
    ///
    /// A block that does not directly follow the tracked head (a gap left by
    /// blocks nobody needed) restarts tracking from it. A block at or below
    /// the head must match the tracked header.
    pub fn observe(&mut self, block: BlockSummary) -> Result<(), ReorgEvent> {
        let Some(head) = self.tracker.head().map(|h| h.number) else {
            let _ = self.tracker.push(block);
            return Ok(());
        };

        if block.number > head + 1 {
            self.tracker.reset();
            let _ = self.tracker.push(block);
            return Ok(());
        }

        if block.number <= head {
            return match self.tracker.get(block.number) {
                Some(known) if known.hash == block.hash => Ok(()),
                Some(_) => Err(self.event_from(block.number, block.number)),
                None => {
                    // Older than the window: restart from here.
                    self.tracker.reset();
                    let _ = self.tracker.push(block);
                    Ok(())
                }
            };
        }

        let number = block.number;
        match self.tracker.push(block) {
            Ok(()) => Ok(()),
            Err(depth) => Err(self.event_from(number, number.saturating_sub(depth))),
        }
    }

    /// Compare tracked blocks with freshly fetched canonical headers.
    ///
    /// Returns the reorg rooted at the lowest tracked height whose hash
    /// changed. Heights missing from `canonical` are not judged.
    pub fn verify(&self, canonical: &[BlockSummary]) -> Option<ReorgEvent> {
        let first_invalid = self
            .tracker
            .blocks()
            .find(|tracked| {
                canonical
                    .iter()
                    .any(|c| c.number == tracked.number && c.hash != tracked.hash)
            })?
            .number;
        let detected_at = canonical.iter().map(|c| c.number).max().unwrap_or(first_invalid);
        Some(self.event_from(detected_at, first_invalid))
    }

    /// Forget every tracked block at or above the event's first invalid height.
    pub fn apply(&mut self, event: &ReorgEvent) {
        self.tracker
            .rewind_to(event.first_invalid_height.saturating_sub(1));
    }

    pub fn reset(&mut self) {
        self.tracker.reset();
    }

    fn event_from(&self, detected_at: u64, first_invalid_height: u64) -> ReorgEvent {
        let dropped_blocks: Vec<BlockSummary> = self
            .tracker
            .blocks()
            .rev()
            .filter(|b| b.number >= first_invalid_height)
            .cloned()
            .collect();
        let depth = dropped_blocks.len() as u64;
        let reorg_type = if depth <= 3 {
            ReorgType::ShortReorg
        } else {
            ReorgType::DeepReorg
        };
        tracing::warn!(
            depth,
            at = detected_at,
            first_invalid_height,
            reorg_type = %reorg_type,
            "Reorg detected"
        );
        ReorgEvent {
            detected_at,
            first_invalid_height,
            dropped_blocks,
            depth,
            reorg_type,
        }
    }
}

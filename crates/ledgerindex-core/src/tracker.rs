//! Block tracker: a sliding window of recent (hot) block headers used for
//! parent-hash chain verification.

use std::collections::VecDeque;

use crate::types::BlockSummary;

/// Hash-linked window over the hot part of the chain.
///
/// Every pushed header must name the current tip as its parent; anything
/// else is reported with the number of tracked blocks it would retract.
#[derive(Debug, Clone)]
pub struct BlockTracker {
    /// Oldest first.
    window: VecDeque<BlockSummary>,
    window_size: usize,
}

impl BlockTracker {
    /// Create a new tracker with the given window size (at least one block).
    pub fn new(window_size: usize) -> Self {
        let window_size = window_size.max(1);
        Self {
            window: VecDeque::with_capacity(window_size),
            window_size,
        }
    }

    /// Append `block` if it extends the tip, evicting the oldest entry when
    /// full. On a parent mismatch the window is left untouched and the error
    /// carries how many tracked blocks sit above the fork point.
    pub fn push(&mut self, block: BlockSummary) -> Result<(), u64> {
        if let Some(head) = self.window.back() {
            if !block.extends(head) {
                return Err(self.find_reorg_depth(&block));
            }
        }
        if self.window.len() >= self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(block);
        Ok(())
    }

    /// Most recently pushed header.
    pub fn head(&self) -> Option<&BlockSummary> {
        self.window.back()
    }

    pub fn get(&self, number: u64) -> Option<&BlockSummary> {
        self.window.iter().find(|b| b.number == number)
    }

    /// Tracked blocks, oldest first.
    pub fn blocks(&self) -> impl DoubleEndedIterator<Item = &BlockSummary> {
        self.window.iter()
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    /// Drop every header above `block_number`.
    pub fn rewind_to(&mut self, block_number: u64) {
        while let Some(back) = self.window.back() {
            if back.number > block_number {
                self.window.pop_back();
            } else {
                break;
            }
        }
    }

    /// Forget every tracked block.
    pub fn reset(&mut self) {
        self.window.clear();
    }

    fn find_reorg_depth(&self, new_block: &BlockSummary) -> u64 {
        for (i, tracked) in self.window.iter().enumerate().rev() {
            if tracked.hash == new_block.parent_hash {
                return (self.window.len() - 1 - i) as u64;
            }
        }
        // Fork point is older than the window.
        self.window.len() as u64
    }
}

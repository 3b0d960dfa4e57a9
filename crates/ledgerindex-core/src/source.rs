//! The chain source seam: where batches of blocks come from.

use std::collections::VecDeque;

use async_trait::async_trait;

use crate::checkpoint::Checkpoint;
use crate::error::IndexerError;
use crate::types::Batch;

/// Supplies ordered block batches.
///
/// `next_batch` suspends until blocks above `after` exist; there is no upper
/// bound on the wait. Transient failures are retried inside the source. An
/// `Err` is unrecoverable and halts the run loop.
///
/// The returned future may be dropped at any await point (cooperative stop),
/// so implementations must only mutate their own state once a batch is ready.
#[async_trait]
pub trait ChainSource: Send {
    async fn next_batch(&mut self, after: u64) -> Result<Batch, IndexerError>;

    /// Called once before the first `next_batch` with the stored checkpoint.
    fn resume(&mut self, _checkpoint: Option<&Checkpoint>) {}
}

#[async_trait]
impl<S: ChainSource + ?Sized> ChainSource for Box<S> {
    async fn next_batch(&mut self, after: u64) -> Result<Batch, IndexerError> {
        (**self).next_batch(after).await
    }

    fn resume(&mut self, checkpoint: Option<&Checkpoint>) {
        (**self).resume(checkpoint)
    }
}

/// Replays a fixed sequence of batches, then waits forever.
///
/// Batches are delivered as-is regardless of `after`, which lets tests feed
/// overlapping and reorg-replacement batches.
#[derive(Debug, Default)]
pub struct ReplaySource {
    batches: VecDeque<Batch>,
    delivered: usize,
}

impl ReplaySource {
    pub fn new(batches: impl IntoIterator<Item = Batch>) -> Self {
        Self {
            batches: batches.into_iter().collect(),
            delivered: 0,
        }
    }

    /// Queue another batch.
    pub fn push(&mut self, batch: Batch) {
        self.batches.push_back(batch);
    }

    pub fn remaining(&self) -> usize {
        self.batches.len()
    }

    pub fn delivered(&self) -> usize {
        self.delivered
    }
}

#[async_trait]
impl ChainSource for ReplaySource {
    async fn next_batch(&mut self, after: u64) -> Result<Batch, IndexerError> {
        match self.batches.pop_front() {
            Some(batch) => {
                tracing::trace!(after, blocks = batch.blocks.len(), "replaying batch");
                self.delivered += 1;
                Ok(batch)
            }
            None => futures::future::pending().await,
        }
    }
}

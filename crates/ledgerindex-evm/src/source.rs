//! `RpcChainSource`: a [`ChainSource`] over an EVM JSON-RPC node.
//!
//! Each call to `next_batch`:
//! 1. reads the chain head,
//! 2. re-checks the tracked hot blocks against the node and, if one was
//!    replaced, returns a reorg-replacement batch starting at the first
//!    replaced height,
//! 3. otherwise fetches `[after + 1, after + batch_size]` capped at the head.
//!
//! Node failures are retried here with capped backoff, forever. Only
//! malformed data escapes as an error.
//!
//! On resume only the checkpoint block's hash is known. If the node no longer
//! has that block, the fork point may lie anywhere above the last height that
//! was already final when the checkpoint was written, so the replacement
//! batch starts there.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use ledgerindex_core::checkpoint::Checkpoint;
use ledgerindex_core::error::IndexerError;
use ledgerindex_core::indexer::IndexerConfig;
use ledgerindex_core::reorg::{ReorgDetector, ReorgEvent};
use ledgerindex_core::retry::{RetryConfig, RetryPolicy};
use ledgerindex_core::source::ChainSource;
use ledgerindex_core::types::{Batch, BlockSummary, EventFilter, SourceBlock};

use crate::decoder::EvmEventDecoder;
use crate::fetcher::{EvmFetcher, EvmRpcClient};

/// Chain source backed by [`EvmFetcher`].
pub struct RpcChainSource<C> {
    fetcher: EvmFetcher<C>,
    filter: EventFilter,
    batch_size: u64,
    finality_depth: u64,
    poll_interval: Duration,
    backoff: RetryPolicy,
    detector: ReorgDetector,
    start_height: u64,
    /// `(checkpoint height, lowest height a fork below it can reach)`, set by
    /// `resume` until the checkpoint block has been checked.
    resume_floor: Option<(u64, u64)>,
}

impl<C: EvmRpcClient> RpcChainSource<C> {
    /// Build a source for the filter, batch size and finality depth of `config`.
    pub fn new(client: C, config: &IndexerConfig) -> Self {
        Self {
            fetcher: EvmFetcher::new(client),
            filter: config.event_filter(&EvmEventDecoder::new()),
            batch_size: config.batch_size.max(1),
            finality_depth: config.finality_depth,
            poll_interval: config.poll_interval(),
            backoff: RetryPolicy::new(RetryConfig {
                initial_backoff_ms: 500,
                max_backoff_ms: 30_000,
                ..RetryConfig::default()
            }),
            detector: ReorgDetector::new(config.finality_depth),
            start_height: config.start_height,
            resume_floor: None,
        }
    }

    /// Cap the block span of each `eth_getLogs` request.
    pub fn with_max_log_range(mut self, range: u64) -> Self {
        self.fetcher = self.fetcher.with_max_log_range(range);
        self
    }

    /// Backoff used between failed node requests.
    pub fn with_backoff(mut self, config: RetryConfig) -> Self {
        self.backoff = RetryPolicy::new(config);
        self
    }

    pub fn fetcher(&self) -> &EvmFetcher<C> {
        &self.fetcher
    }

    pub fn detector(&self) -> &ReorgDetector {
        &self.detector
    }

    /// Lowest height still considered hot for a chain at `head`.
    fn hot_start(&self, head: u64) -> u64 {
        head.saturating_add(1).saturating_sub(self.finality_depth)
    }

    /// One attempt at building the next batch. `Ok(None)` means caught up.
    ///
    /// Works on a copy of the detector and only stores it back once the batch
    /// is complete, so a dropped future leaves the source unchanged.
    async fn try_next(&mut self, after: u64) -> Result<Option<Batch>, IndexerError> {
        let head = self.fetcher.head_block_number().await?;
        let mut detector = self.detector.clone();

        if let Some(event) = self.check_hot_window(&detector, head).await? {
            let from = match self.resume_floor {
                Some((seed, floor)) if seed == event.first_invalid_height => {
                    warn!(
                        checkpoint = seed,
                        from = floor,
                        "Checkpoint block replaced while offline, replaying the unfinalized range"
                    );
                    floor
                }
                _ => event.first_invalid_height,
            };
            if from > head {
                debug!(from, head, "Replacement chain not long enough yet");
                return Ok(None);
            }
            let to = from.saturating_add(self.batch_size - 1).min(head);
            info!(
                first_invalid = from,
                depth = event.depth,
                reorg_type = %event.reorg_type,
                "Hot block replaced, emitting replacement batch"
            );
            detector.apply(&event);
            let blocks = self.fetch(from, to, head, Some(from)).await?;
            self.observe_hot(&mut detector, &blocks, head)?;
            self.detector = detector;
            self.resume_floor = None;
            return Ok(Some(Batch::new(blocks, head).reorg_replacement()));
        }

        if head <= after {
            return Ok(None);
        }
        let from = after + 1;
        let to = after.saturating_add(self.batch_size).min(head);
        let blocks = self.fetch(from, to, head, None).await?;
        self.observe_hot(&mut detector, &blocks, head)?;
        self.detector = detector;
        debug!(from, to, head, blocks = blocks.len(), "Fetched batch");
        Ok(Some(Batch::new(blocks, head)))
    }

    /// Re-fetch tracked hot headers, newest first, until one still matches.
    async fn check_hot_window(
        &self,
        detector: &ReorgDetector,
        head: u64,
    ) -> Result<Option<ReorgEvent>, IndexerError> {
        let mut canonical = Vec::new();
        for height in detector.tracked_heights().into_iter().rev() {
            if height > head {
                continue;
            }
            let header = self.fetcher.header(height).await?;
            let unchanged = detector
                .tracker()
                .get(height)
                .is_some_and(|tracked| tracked.hash == header.hash);
            canonical.push(header);
            if unchanged {
                break;
            }
        }
        Ok(detector.verify(&canonical))
    }

    /// Fetch `[from, to]`, always including `to`, every hot height, and
    /// `anchor` so the batch starts at the replaced height.
    async fn fetch(
        &self,
        from: u64,
        to: u64,
        head: u64,
        anchor: Option<u64>,
    ) -> Result<Vec<SourceBlock>, IndexerError> {
        let mut always: BTreeSet<u64> = (self.hot_start(head).max(from)..=to).collect();
        always.insert(to);
        always.extend(anchor);
        self.fetcher
            .fetch_range(from, to, &self.filter, &always)
            .await
    }

    fn observe_hot(
        &self,
        detector: &mut ReorgDetector,
        blocks: &[SourceBlock],
        head: u64,
    ) -> Result<(), IndexerError> {
        let hot_start = self.hot_start(head);
        for block in blocks.iter().filter(|b| b.number() >= hot_start) {
            detector.observe(block.header.clone()).map_err(|e| {
                IndexerError::Source(format!(
                    "chain changed while fetching: block {} does not extend tracked chain (first invalid {})",
                    block.number(),
                    e.first_invalid_height
                ))
            })?;
        }
        Ok(())
    }
}

#[async_trait]
impl<C: EvmRpcClient> ChainSource for RpcChainSource<C> {
    async fn next_batch(&mut self, after: u64) -> Result<Batch, IndexerError> {
        let mut attempt = 0u32;
        loop {
            match self.try_next(after).await {
                Ok(Some(batch)) => return Ok(batch),
                Ok(None) => {
                    attempt = 0;
                    tokio::time::sleep(self.poll_interval).await;
                }
                Err(IndexerError::Source(reason)) => {
                    attempt = attempt.saturating_add(1);
                    let delay = self.backoff.backoff(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %reason,
                        "Chain source request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn resume(&mut self, checkpoint: Option<&Checkpoint>) {
        self.detector.reset();
        self.resume_floor = None;
        if let Some(cp) = checkpoint.filter(|cp| !cp.block_hash.is_empty()) {
            // A non-final checkpoint was written with the head at or above it,
            // so nothing at or below `height - finality_depth` could change.
            let floor = if cp.is_final {
                cp.height
            } else {
                cp.height
                    .saturating_sub(self.finality_depth)
                    .saturating_add(1)
                    .max(self.start_height.saturating_add(1))
                    .min(cp.height)
            };
            self.resume_floor = Some((cp.height, floor));
            let _ = self.detector.observe(BlockSummary {
                number: cp.height,
                hash: cp.block_hash.clone(),
                parent_hash: String::new(),
                timestamp: 0,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::{RpcBlock, RpcLog};
    use ledgerindex_core::types::TxRef;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// An in-memory chain whose blocks can be replaced to simulate reorgs.
    #[derive(Default)]
    struct FakeChain {
        blocks: Mutex<HashMap<u64, (String, String)>>,
        head: Mutex<u64>,
        failures: Mutex<u32>,
    }

    impl FakeChain {
        fn with_head(head: u64) -> Self {
            let chain = Self::default();
            chain.extend_to(head, "a");
            chain
        }

        fn extend_to(&self, head: u64, fork: &str) {
            let mut blocks = self.blocks.lock().unwrap();
            let start = *self.head.lock().unwrap() + 1;
            for n in start..=head {
                let parent = blocks
                    .get(&(n - 1))
                    .map(|(h, _)| h.clone())
                    .unwrap_or_else(|| "0xgenesis".into());
                blocks.insert(n, (format!("0x{fork}{n}"), parent));
            }
            *self.head.lock().unwrap() = head;
        }

        /// Replace every block from `from` up with a fork tagged `fork`.
        fn reorg_from(&self, from: u64, fork: &str) {
            let head = *self.head.lock().unwrap();
            *self.head.lock().unwrap() = from - 1;
            self.extend_to(head, fork);
        }
    }

    #[async_trait]
    impl EvmRpcClient for FakeChain {
        async fn get_block_number(&self) -> Result<u64, IndexerError> {
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(IndexerError::Source("connection reset".into()));
            }
            Ok(*self.head.lock().unwrap())
        }

        async fn get_block(&self, number: u64) -> Result<Option<RpcBlock>, IndexerError> {
            let head = *self.head.lock().unwrap();
            if number > head {
                return Ok(None);
            }
            let blocks = self.blocks.lock().unwrap();
            Ok(blocks.get(&number).map(|(hash, parent)| RpcBlock {
                header: BlockSummary {
                    number,
                    hash: hash.clone(),
                    parent_hash: parent.clone(),
                    timestamp: number as i64,
                },
                transactions: vec![TxRef {
                    hash: format!("0xtx{number}"),
                    from: "0xsender".into(),
                }],
            }))
        }

        async fn get_logs(
            &self,
            _from: u64,
            _to: u64,
            _filter: &EventFilter,
        ) -> Result<Vec<RpcLog>, IndexerError> {
            Ok(vec![])
        }
    }

    fn config(depth: u64, batch_size: u64) -> IndexerConfig {
        IndexerConfig {
            finality_depth: depth,
            batch_size,
            poll_interval_ms: 5,
            ..IndexerConfig::default()
        }
    }

    fn heights(batch: &Batch) -> Vec<u64> {
        batch.blocks.iter().map(|b| b.number()).collect()
    }

    #[tokio::test]
    async fn batches_are_capped_by_size_and_head() {
        let mut source = RpcChainSource::new(FakeChain::with_head(25), &config(3, 10));
        let batch = source.next_batch(0).await.unwrap();
        assert!(!batch.is_reorg_replacement);
        assert_eq!(batch.chain_head, 25);
        assert_eq!(batch.highest_height(), Some(10));

        let batch = source.next_batch(20).await.unwrap();
        // 23, 24, 25 are hot and always delivered.
        assert_eq!(heights(&batch), vec![23, 24, 25]);
        assert_eq!(source.detector().tracked_heights(), vec![23, 24, 25]);
    }

    #[tokio::test]
    async fn replaced_hot_block_yields_replacement_batch() {
        let chain = std::sync::Arc::new(FakeChain::with_head(10));
        let mut source = RpcChainSource::new(chain.clone(), &config(4, 100));
        let first = source.next_batch(5).await.unwrap();
        assert_eq!(heights(&first), vec![7, 8, 9, 10]);

        chain.reorg_from(9, "b");
        let replacement = source.next_batch(10).await.unwrap();
        assert!(replacement.is_reorg_replacement);
        assert_eq!(heights(&replacement), vec![9, 10]);
        assert_eq!(replacement.blocks[0].header.hash, "0xb9");
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let chain = FakeChain::with_head(3);
        *chain.failures.lock().unwrap() = 2;
        let mut source = RpcChainSource::new(chain, &config(0, 10)).with_backoff(RetryConfig {
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            ..RetryConfig::default()
        });
        let batch = source.next_batch(0).await.unwrap();
        assert_eq!(batch.highest_height(), Some(3));
    }

    #[tokio::test]
    async fn waits_while_caught_up() {
        let mut source = RpcChainSource::new(FakeChain::with_head(5), &config(0, 10));
        let waited =
            tokio::time::timeout(Duration::from_millis(50), source.next_batch(5)).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn resume_seeds_detector_from_checkpoint() {
        let chain = std::sync::Arc::new(FakeChain::with_head(10));
        let mut source = RpcChainSource::new(chain.clone(), &config(4, 100));
        let cp = Checkpoint::new("default", 10, "0xa10", false);
        source.resume(Some(&cp));
        assert_eq!(source.detector().tracked_heights(), vec![10]);

        chain.reorg_from(10, "c");
        let replacement = source.next_batch(10).await.unwrap();
        assert!(replacement.is_reorg_replacement);
        // Heights 7..=10 were unfinalized when the checkpoint was written.
        assert_eq!(replacement.lowest_height(), Some(7));
        assert_eq!(replacement.highest_height(), Some(10));
    }

    #[tokio::test]
    async fn reorg_below_checkpoint_while_offline_is_replayed() {
        let chain = std::sync::Arc::new(FakeChain::with_head(12));
        let mut source = RpcChainSource::new(chain.clone(), &config(4, 100));
        source.resume(Some(&Checkpoint::new("default", 10, "0xa10", false)));

        // Fork at 8 while the indexer is down.
        chain.reorg_from(8, "c");
        let replacement = source.next_batch(10).await.unwrap();
        assert!(replacement.is_reorg_replacement);
        // 8 holds no logs and is below the hot window, so it is not delivered.
        assert_eq!(heights(&replacement), vec![7, 9, 10, 11, 12]);
        assert_eq!(replacement.blocks[1].header.hash, "0xc9");
    }

    #[tokio::test]
    async fn unchanged_checkpoint_resumes_normally() {
        let chain = std::sync::Arc::new(FakeChain::with_head(12));
        let mut source = RpcChainSource::new(chain.clone(), &config(4, 100));
        source.resume(Some(&Checkpoint::new("default", 10, "0xa10", false)));

        let batch = source.next_batch(10).await.unwrap();
        assert!(!batch.is_reorg_replacement);
        assert_eq!(heights(&batch), vec![11, 12]);
    }

    #[tokio::test]
    async fn resume_floor_stays_above_start_height() {
        let chain = std::sync::Arc::new(FakeChain::with_head(10));
        let mut cfg = config(12, 100);
        cfg.start_height = 8;
        let mut source = RpcChainSource::new(chain.clone(), &cfg);
        source.resume(Some(&Checkpoint::new("default", 10, "0xa10", false)));

        chain.reorg_from(10, "c");
        let replacement = source.next_batch(10).await.unwrap();
        assert_eq!(replacement.lowest_height(), Some(9));
    }
}

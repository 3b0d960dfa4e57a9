//! The run loop: drives fetch → extract → reconcile → commit, one batch at a
//! time, and rolls back retracted hot blocks.
//!
//! ```text
//! Idle → FetchingBatch → Extracting → Reconciling → Committing → Idle
//!              │
//!              └─ reorg replacement at or below the checkpoint → RolledBack
//!                 (rows ≥ K discarded, checkpoint = K-1, replacement applied)
//! ```
//!
//! Batches are processed strictly sequentially. A stop request is honoured
//! while waiting for the source or between batches, never during a commit.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::checkpoint::Checkpoint;
use crate::cursor::Cursor;
use crate::decoder::EventDecoder;
use crate::error::IndexerError;
use crate::extractor::BatchExtractor;
use crate::indexer::{IndexerConfig, IndexerState};
use crate::reconciler::LedgerReconciler;
use crate::retry::{retry_store_op, RetryPolicy};
use crate::source::ChainSource;
use crate::store::{BatchWrites, LedgerStore, RollbackSummary};
use crate::types::Batch;

/// What one committed batch did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSummary {
    pub from_height: u64,
    pub to_height: u64,
    pub events: usize,
    pub transfers: usize,
    pub payments: usize,
    pub skipped: usize,
    pub negative_balances: usize,
    /// Whether the new checkpoint is already final.
    pub is_final: bool,
}

/// Result of a single [`RunLoop::step`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// A batch was committed and the checkpoint advanced.
    Committed(CommitSummary),
    /// Retracted blocks were discarded; the replacement blocks, if any, were
    /// committed right after.
    RolledBack {
        rollback: RollbackSummary,
        committed: Option<CommitSummary>,
    },
    /// The batch held nothing above the checkpoint.
    Skipped { chain_head: u64 },
    /// A stop was requested.
    Stopped,
}

/// Snapshot of the loop for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopStatus {
    pub indexer_id: String,
    pub state: IndexerState,
    pub checkpoint_height: u64,
    pub finalized_height: u64,
}

/// Requests a cooperative stop of a [`RunLoop`]. Cheap to clone.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: watch::Sender<bool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }
}

/// The batch ingestion state machine.
pub struct RunLoop<S, D> {
    config: IndexerConfig,
    source: S,
    extractor: BatchExtractor<D>,
    reconciler: LedgerReconciler,
    store: Arc<dyn LedgerStore>,
    retry: RetryPolicy,
    cursor: Cursor,
    /// Checkpoint height this loop last read or wrote. Each commit must
    /// extend it, so a rollback made by another process halts the loop.
    stored_height: Option<u64>,
    state: IndexerState,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

impl<S: ChainSource, D: EventDecoder> RunLoop<S, D> {
    /// Validate `config` and resume from the stored checkpoint, if any.
    pub async fn open(
        config: IndexerConfig,
        mut source: S,
        decoder: D,
        store: Arc<dyn LedgerStore>,
    ) -> Result<Self, IndexerError> {
        let config = config.validate()?;
        let retry = RetryPolicy::new(config.store_retry.clone());
        let timeout = config.store_timeout();

        let checkpoint = retry_store_op(&retry, timeout, "load_checkpoint", || {
            store.load_checkpoint(&config.id)
        })
        .await?;
        let cursor = Cursor::from_checkpoint(
            checkpoint.as_ref(),
            config.start_height,
            config.finality_depth,
        );
        match &checkpoint {
            Some(cp) => info!(
                id = %config.id,
                height = cp.height,
                hash = %cp.block_hash,
                is_final = cp.is_final,
                "Resuming from checkpoint"
            ),
            None => info!(
                id = %config.id,
                start_height = config.start_height,
                "No checkpoint, starting from configured height"
            ),
        }
        source.resume(checkpoint.as_ref());
        let stored_height = checkpoint.as_ref().map(|cp| cp.height);

        let filter = config.event_filter(&decoder);
        let (stop_tx, stop_rx) = watch::channel(false);
        Ok(Self {
            extractor: BatchExtractor::new(decoder, filter),
            reconciler: LedgerReconciler::new(store.clone(), retry.clone(), timeout),
            store,
            retry,
            cursor,
            stored_height,
            state: IndexerState::Idle,
            stop_tx,
            stop_rx,
            source,
            config,
        })
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: self.stop_tx.clone(),
        }
    }

    pub fn state(&self) -> IndexerState {
        self.state
    }

    pub fn cursor(&self) -> &Cursor {
        &self.cursor
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    pub fn status(&self) -> LoopStatus {
        LoopStatus {
            indexer_id: self.config.id.clone(),
            state: self.state,
            checkpoint_height: self.cursor.height,
            finalized_height: self.cursor.finalized_height,
        }
    }

    /// Run until stopped. Returns `Err` on the first unrecoverable error,
    /// leaving the last committed checkpoint intact.
    pub async fn run(&mut self) -> Result<(), IndexerError> {
        info!(
            id = %self.config.id,
            next_height = self.cursor.next_height(),
            "Run loop started"
        );
        loop {
            if self.step().await? == StepOutcome::Stopped {
                info!(checkpoint = self.cursor.height, "Run loop stopped");
                return Ok(());
            }
        }
    }

    /// Fetch and process exactly one batch.
    pub async fn step(&mut self) -> Result<StepOutcome, IndexerError> {
        match self.try_step().await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                error!(
                    error = %e,
                    state = %self.state,
                    checkpoint = self.cursor.height,
                    "Run loop halted"
                );
                self.state = IndexerState::Halted;
                Err(e)
            }
        }
    }

    async fn try_step(&mut self) -> Result<StepOutcome, IndexerError> {
        if self.state == IndexerState::Halted {
            return Err(IndexerError::Aborted {
                reason: "run loop already halted".into(),
            });
        }
        if *self.stop_tx.borrow() {
            self.state = IndexerState::Stopped;
            return Ok(StepOutcome::Stopped);
        }

        self.state = IndexerState::FetchingBatch;
        let after = self.cursor.height;
        let fetched = tokio::select! {
            biased;
            _ = stop_requested(&mut self.stop_rx) => None,
            batch = self.source.next_batch(after) => Some(batch),
        };
        let Some(batch) = fetched else {
            self.state = IndexerState::Stopped;
            return Ok(StepOutcome::Stopped);
        };
        let mut batch = batch?;
        let chain_head = batch.chain_head;

        let mut rollback = None;
        if batch.is_reorg_replacement {
            if let Some(lowest) = batch.lowest_height() {
                if lowest <= self.cursor.height {
                    rollback = Some(self.roll_back(lowest).await?);
                }
            }
        }

        let delivered = batch.blocks.len();
        batch.retain_above(self.cursor.height);
        if batch.blocks.len() < delivered {
            debug!(
                dropped = delivered - batch.blocks.len(),
                checkpoint = self.cursor.height,
                "Dropped blocks at or below the checkpoint"
            );
        }

        let committed = if batch.is_empty() {
            None
        } else {
            Some(self.apply(&batch).await?)
        };
        self.state = IndexerState::Idle;

        Ok(match (rollback, committed) {
            (Some(rollback), committed) => StepOutcome::RolledBack {
                rollback,
                committed,
            },
            (None, Some(summary)) => StepOutcome::Committed(summary),
            (None, None) => StepOutcome::Skipped { chain_head },
        })
    }

    /// Discard every committed row at or above `from`.
    async fn roll_back(&mut self, from: u64) -> Result<RollbackSummary, IndexerError> {
        if from <= self.cursor.finalized_height {
            return Err(IndexerError::ReorgBelowFinality {
                reorg_height: from,
                finalized_height: self.cursor.finalized_height,
            });
        }

        self.state = IndexerState::RolledBack;
        warn!(
            from,
            checkpoint = self.cursor.height,
            "Reorg replacement received, rolling back"
        );

        let store = &self.store;
        let id = &self.config.id;
        let summary = retry_store_op(&self.retry, self.config.store_timeout(), "rollback_from", || {
            store.rollback_from(id, from)
        })
        .await?;
        self.cursor.rewind_to(from - 1);
        self.stored_height = Some(from - 1);

        info!(
            from,
            transfers_removed = summary.transfers_removed,
            payments_removed = summary.payments_removed,
            accounts_removed = summary.accounts_removed,
            checkpoint = self.cursor.height,
            "Rollback complete"
        );
        Ok(summary)
    }

    /// Extract, reconcile and commit a non-empty batch above the checkpoint.
    async fn apply(&mut self, batch: &Batch) -> Result<CommitSummary, IndexerError> {
        let (Some(from_height), Some(head)) = (batch.lowest_height(), batch.highest_block()) else {
            return Err(IndexerError::Other("cannot commit an empty batch".into()));
        };

        self.state = IndexerState::Extracting;
        let events = self.extractor.extract(batch)?;

        self.state = IndexerState::Reconciling;
        let changes = self.reconciler.reconcile(&events).await?;

        self.state = IndexerState::Committing;
        let is_final = self.cursor.is_confirmed(head.number, batch.chain_head);
        let summary = CommitSummary {
            from_height,
            to_height: head.number,
            events: events.len(),
            transfers: changes.transfers.len(),
            payments: changes.payments.len(),
            skipped: changes.skipped,
            negative_balances: changes.negative_balances,
            is_final,
        };
        let writes = BatchWrites {
            changes,
            checkpoint: Checkpoint::new(&self.config.id, head.number, &head.hash, is_final),
            parent: self.stored_height,
        };

        let store = &self.store;
        retry_store_op(&self.retry, self.config.store_timeout(), "commit_batch", || {
            store.commit_batch(&writes)
        })
        .await?;
        self.cursor.advance(head.number, &head.hash, batch.chain_head);
        self.stored_height = Some(head.number);

        info!(
            from = summary.from_height,
            to = summary.to_height,
            events = summary.events,
            transfers = summary.transfers,
            payments = summary.payments,
            skipped = summary.skipped,
            is_final,
            chain_head = batch.chain_head,
            "Batch committed"
        );
        Ok(summary)
    }
}

/// Resolves once a stop has been requested.
async fn stop_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        let stop = *rx.borrow_and_update();
        if stop {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone: nobody can ask for a stop any more.
            futures::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::tests::{source_block, transfer_log, StubDecoder, CONTRACT};
    use crate::retry::RetryConfig;
    use crate::source::ReplaySource;
    use crate::store::MemoryLedgerStore;
    use crate::types::SourceBlock;
    use num_bigint::BigInt;
    use std::time::Duration;

    const A: &str = "0xa";
    const B: &str = "0xb";
    const C: &str = "0xc";

    fn config() -> IndexerConfig {
        IndexerConfig {
            id: "test".into(),
            start_height: 100,
            contract_address: CONTRACT.into(),
            finality_depth: 10,
            store_timeout_ms: 1_000,
            store_retry: RetryConfig {
                max_retries: 3,
                initial_backoff_ms: 1,
                max_backoff_ms: 2,
                multiplier: 2.0,
                jitter_fraction: 0.0,
            },
            ..Default::default()
        }
    }

    fn batch(blocks: Vec<SourceBlock>, head: u64) -> Batch {
        Batch::new(blocks, head)
    }

    fn bal(v: i64) -> BigInt {
        BigInt::from(v)
    }

    async fn open(
        store: &Arc<MemoryLedgerStore>,
        batches: Vec<Batch>,
    ) -> RunLoop<ReplaySource, StubDecoder> {
        RunLoop::open(config(), ReplaySource::new(batches), StubDecoder, store.clone())
            .await
            .unwrap()
    }

    async fn balance(store: &MemoryLedgerStore, address: &str) -> Option<BigInt> {
        store.account(address).await.unwrap().map(|a| a.balance)
    }

    #[tokio::test]
    async fn mint_then_transfer_scenario() {
        let store = Arc::new(MemoryLedgerStore::new());
        let mut lp = open(
            &store,
            vec![
                batch(vec![source_block(101, vec![transfer_log(0, "", A, 50)])], 101),
                batch(vec![source_block(102, vec![transfer_log(0, A, B, 20)])], 102),
            ],
        )
        .await;
        assert_eq!(lp.cursor().height, 100);

        let first = lp.step().await.unwrap();
        assert!(matches!(first, StepOutcome::Committed(ref s) if s.to_height == 101));
        assert_eq!(balance(&store, A).await, Some(bal(50)));
        assert_eq!(store.dump().unwrap().accounts.len(), 1);

        lp.step().await.unwrap();
        assert_eq!(balance(&store, A).await, Some(bal(30)));
        assert_eq!(balance(&store, B).await, Some(bal(20)));
        let cp = store.load_checkpoint("test").await.unwrap().unwrap();
        assert_eq!(cp.height, 102);
        assert_eq!(cp.block_hash, "0xh102");
        assert_eq!(lp.status().checkpoint_height, 102);
        assert_eq!(lp.state(), IndexerState::Idle);
    }

    #[tokio::test]
    async fn overlapping_batch_is_skipped() {
        let store = Arc::new(MemoryLedgerStore::new());
        let blocks = vec![source_block(101, vec![transfer_log(0, "", A, 50)])];
        let mut lp = open(
            &store,
            vec![batch(blocks.clone(), 101), batch(blocks, 101)],
        )
        .await;
        lp.step().await.unwrap();
        let second = lp.step().await.unwrap();
        assert_eq!(second, StepOutcome::Skipped { chain_head: 101 });
        assert_eq!(balance(&store, A).await, Some(bal(50)));
        assert_eq!(store.transfer_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn reorg_replacement_rolls_back_and_reapplies() {
        let store = Arc::new(MemoryLedgerStore::new());
        let mut replacement = vec![
            source_block(102, vec![transfer_log(0, A, C, 5)]),
            source_block(103, vec![]),
        ];
        for b in &mut replacement {
            b.header.hash.push('b');
        }
        let mut lp = open(
            &store,
            vec![
                batch(
                    vec![
                        source_block(101, vec![transfer_log(0, "", A, 50)]),
                        source_block(102, vec![transfer_log(0, A, B, 20)]),
                        source_block(103, vec![transfer_log(0, B, C, 5)]),
                    ],
                    103,
                ),
                batch(replacement, 104).reorg_replacement(),
            ],
        )
        .await;

        lp.step().await.unwrap();
        assert_eq!(balance(&store, C).await, Some(bal(5)));

        let outcome = lp.step().await.unwrap();
        let StepOutcome::RolledBack { rollback, committed } = outcome else {
            panic!("expected rollback, got {outcome:?}");
        };
        assert_eq!(rollback.from_height, 102);
        assert_eq!(rollback.transfers_removed, 2);
        assert_eq!(committed.unwrap().to_height, 103);

        // Same state as if only 101 and the replacement were ever seen.
        assert_eq!(balance(&store, A).await, Some(bal(45)));
        assert_eq!(balance(&store, B).await, None);
        assert_eq!(balance(&store, C).await, Some(bal(5)));
        let cp = store.load_checkpoint("test").await.unwrap().unwrap();
        assert_eq!((cp.height, cp.block_hash.as_str()), (103, "0xh103b"));
    }

    #[tokio::test]
    async fn reorg_below_finality_halts() {
        let store = Arc::new(MemoryLedgerStore::new());
        let mut lp = open(
            &store,
            vec![
                // Head far ahead: 101..=105 are final once committed.
                batch(
                    (101..=105).map(|h| source_block(h, vec![])).collect(),
                    200,
                ),
                batch(vec![source_block(104, vec![])], 200).reorg_replacement(),
            ],
        )
        .await;
        lp.step().await.unwrap();
        assert_eq!(lp.status().finalized_height, 105);

        let err = lp.step().await.unwrap_err();
        assert!(matches!(
            err,
            IndexerError::ReorgBelowFinality {
                reorg_height: 104,
                finalized_height: 105
            }
        ));
        assert_eq!(lp.state(), IndexerState::Halted);
        assert!(lp.step().await.is_err());
    }

    #[tokio::test]
    async fn malformed_batch_commits_nothing() {
        let store = Arc::new(MemoryLedgerStore::new());
        let mut orphan = transfer_log(1, A, B, 1);
        orphan.transaction = None;
        let mut lp = open(
            &store,
            vec![batch(
                vec![source_block(101, vec![transfer_log(0, "", A, 50), orphan])],
                101,
            )],
        )
        .await;
        let err = lp.step().await.unwrap_err();
        assert!(err.is_malformed());
        assert_eq!(lp.state(), IndexerState::Halted);
        assert_eq!(store.transfer_count().await.unwrap(), 0);
        assert!(store.load_checkpoint("test").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn transient_commit_failures_are_retried() {
        let store = Arc::new(MemoryLedgerStore::new());
        store.fail_next_commits(2);
        let mut lp = open(
            &store,
            vec![batch(vec![source_block(101, vec![transfer_log(0, "", A, 50)])], 101)],
        )
        .await;
        lp.step().await.unwrap();
        assert_eq!(balance(&store, A).await, Some(bal(50)));
    }

    #[tokio::test]
    async fn store_unavailable_keeps_last_checkpoint() {
        let store = Arc::new(MemoryLedgerStore::new());
        let mut lp = open(
            &store,
            vec![
                batch(vec![source_block(101, vec![transfer_log(0, "", A, 50)])], 101),
                batch(vec![source_block(102, vec![transfer_log(0, A, B, 20)])], 102),
            ],
        )
        .await;
        lp.step().await.unwrap();
        store.fail_next_commits(100);
        let err = lp.step().await.unwrap_err();
        assert!(matches!(err, IndexerError::StoreUnavailable { attempts: 4, .. }));

        let cp = store.load_checkpoint("test").await.unwrap().unwrap();
        assert_eq!(cp.height, 101);
        assert_eq!(balance(&store, A).await, Some(bal(50)));
    }

    #[tokio::test]
    async fn external_rollback_halts_instead_of_overwriting() {
        let store = Arc::new(MemoryLedgerStore::new());
        let mut lp = open(
            &store,
            vec![
                batch(vec![source_block(101, vec![transfer_log(0, "", A, 50)])], 101),
                batch(vec![source_block(102, vec![transfer_log(0, A, B, 20)])], 102),
            ],
        )
        .await;
        lp.step().await.unwrap();

        // An operator rolls back 101 while the loop is between batches.
        store.rollback_from("test", 101).await.unwrap();
        assert_eq!(balance(&store, A).await, None);

        let err = lp.step().await.unwrap_err();
        assert!(matches!(
            err,
            IndexerError::CheckpointConflict {
                expected: Some(101),
                found: Some(100),
                ..
            }
        ));
        assert_eq!(lp.state(), IndexerState::Halted);
        assert_eq!(balance(&store, A).await, None);
        assert_eq!(balance(&store, B).await, None);
        let cp = store.load_checkpoint("test").await.unwrap().unwrap();
        assert_eq!(cp.height, 100);
    }

    #[tokio::test]
    async fn restart_resumes_from_checkpoint() {
        let store = Arc::new(MemoryLedgerStore::new());
        let mut lp = open(
            &store,
            vec![batch(vec![source_block(101, vec![transfer_log(0, "", A, 50)])], 101)],
        )
        .await;
        lp.step().await.unwrap();
        drop(lp);

        // The restarted source redelivers 101 alongside 102.
        let mut lp = open(
            &store,
            vec![batch(
                vec![
                    source_block(101, vec![transfer_log(0, "", A, 50)]),
                    source_block(102, vec![transfer_log(0, A, B, 20)]),
                ],
                102,
            )],
        )
        .await;
        assert_eq!(lp.cursor().next_height(), 102);
        lp.step().await.unwrap();
        assert_eq!(balance(&store, A).await, Some(bal(30)));
        assert_eq!(store.transfer_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn stop_interrupts_waiting_for_blocks() {
        let store = Arc::new(MemoryLedgerStore::new());
        let mut lp = open(&store, vec![]).await;
        let handle = lp.stop_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.stop();
        });
        tokio::time::timeout(Duration::from_secs(5), lp.run())
            .await
            .expect("run loop did not stop")
            .unwrap();
        assert_eq!(lp.state(), IndexerState::Stopped);
    }

    #[tokio::test]
    async fn stop_takes_effect_between_batches() {
        let store = Arc::new(MemoryLedgerStore::new());
        let mut lp = open(
            &store,
            vec![
                batch(vec![source_block(101, vec![transfer_log(0, "", A, 50)])], 101),
                batch(vec![source_block(102, vec![transfer_log(0, A, B, 20)])], 102),
            ],
        )
        .await;
        lp.step().await.unwrap();
        let handle = lp.stop_handle();
        handle.stop();
        assert!(handle.is_stopped());
        assert_eq!(lp.step().await.unwrap(), StepOutcome::Stopped);
        assert_eq!(lp.status().checkpoint_height, 101);
    }
}

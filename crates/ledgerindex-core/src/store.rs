//! The store gateway: transactional persistence of ledger entities and the
//! checkpoint.
//!
//! Implementations include [`MemoryLedgerStore`] (here) and the SQLite and
//! Postgres stores of `ledgerindex-storage`.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::checkpoint::Checkpoint;
use crate::entity::{reversal_deltas, OwnerAccount, PaymentRecord, TransferRecord};
use crate::error::IndexerError;
use crate::reconciler::LedgerChanges;

/// Everything a batch commits, atomically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchWrites {
    pub changes: LedgerChanges,
    pub checkpoint: Checkpoint,
    /// Checkpoint height the changes were folded against; `None` before the
    /// first commit. The store refuses the batch if its checkpoint moved.
    pub parent: Option<u64>,
}

impl BatchWrites {
    /// Check the stored checkpoint against this batch.
    ///
    /// `Ok(true)` means the batch applies; `Ok(false)` means this exact batch
    /// is already committed (a retried commit whose first attempt landed).
    pub fn check_parent(&self, stored: Option<&Checkpoint>) -> Result<bool, IndexerError> {
        if let Some(cp) = stored {
            if cp.height == self.checkpoint.height && cp.block_hash == self.checkpoint.block_hash {
                return Ok(false);
            }
        }
        let found = stored.map(|cp| cp.height);
        if found != self.parent {
            return Err(IndexerError::CheckpointConflict {
                indexer_id: self.checkpoint.indexer_id.clone(),
                expected: self.parent,
                found,
            });
        }
        Ok(true)
    }
}

/// Whether a rollback from `height` should rewrite `stored`.
///
/// A rollback never moves a checkpoint forward.
pub fn rollback_rewrites(stored: Option<&Checkpoint>, height: u64) -> bool {
    stored.map_or(true, |cp| cp.height >= height)
}

/// What a rollback discarded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackSummary {
    /// First discarded height.
    pub from_height: u64,
    pub transfers_removed: u64,
    pub payments_removed: u64,
    /// Accounts whose balance was restored.
    pub accounts_adjusted: u64,
    /// Accounts no remaining transfer referenced.
    pub accounts_removed: u64,
}

/// Transactional persistence for the ledger.
///
/// `commit_batch` and `rollback_from` are atomic: on error nothing they were
/// asked to do is visible.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Load the checkpoint of an indexer.
    async fn load_checkpoint(&self, indexer_id: &str) -> Result<Option<Checkpoint>, IndexerError>;

    /// Accounts among `addresses` that exist. Missing addresses are omitted.
    async fn find_accounts(&self, addresses: &[String]) -> Result<Vec<OwnerAccount>, IndexerError>;

    /// Ids among `ids` that already have a transfer row.
    async fn existing_transfer_ids(&self, ids: &[String]) -> Result<HashSet<String>, IndexerError>;

    /// Ids among `ids` that already have a payment row.
    async fn existing_payment_ids(&self, ids: &[String]) -> Result<HashSet<String>, IndexerError>;

    /// Upsert accounts, insert new records, and advance the checkpoint.
    ///
    /// Fails with [`IndexerError::CheckpointConflict`] when the stored
    /// checkpoint is not `writes.parent`.
    async fn commit_batch(&self, writes: &BatchWrites) -> Result<(), IndexerError>;

    /// Discard every record at or above `height` and reverse its balance
    /// effects, then point the checkpoint at `height - 1` unless it is
    /// already lower.
    async fn rollback_from(
        &self,
        indexer_id: &str,
        height: u64,
    ) -> Result<RollbackSummary, IndexerError>;

    async fn account(&self, address: &str) -> Result<Option<OwnerAccount>, IndexerError>;

    async fn transfer_count(&self) -> Result<u64, IndexerError>;

    async fn payment(&self, id: &str) -> Result<Option<PaymentRecord>, IndexerError>;

    async fn payment_count(&self) -> Result<u64, IndexerError>;
}

// ─── In-memory store (for testing) ────────────────────────────────────────────

/// Full contents of a [`MemoryLedgerStore`], ordered by key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerDump {
    pub accounts: BTreeMap<String, OwnerAccount>,
    pub transfers: BTreeMap<String, TransferRecord>,
    pub payments: BTreeMap<String, PaymentRecord>,
}

/// In-memory ledger store for tests and ephemeral indexers.
#[derive(Default)]
pub struct MemoryLedgerStore {
    ledger: Mutex<LedgerDump>,
    checkpoints: Mutex<HashMap<String, Checkpoint>>,
    failing_commits: AtomicU32,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` commits fail with a transient storage error.
    pub fn fail_next_commits(&self, n: u32) {
        self.failing_commits.store(n, Ordering::SeqCst);
    }

    /// Copy of every stored entity.
    pub fn dump(&self) -> Result<LedgerDump, IndexerError> {
        Ok(self.ledger()?.clone())
    }

    fn ledger(&self) -> Result<MutexGuard<'_, LedgerDump>, IndexerError> {
        self.ledger
            .lock()
            .map_err(|_| IndexerError::Other("memory store lock poisoned".into()))
    }

    fn checkpoints(&self) -> Result<MutexGuard<'_, HashMap<String, Checkpoint>>, IndexerError> {
        self.checkpoints
            .lock()
            .map_err(|_| IndexerError::Other("memory store lock poisoned".into()))
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn load_checkpoint(&self, indexer_id: &str) -> Result<Option<Checkpoint>, IndexerError> {
        Ok(self.checkpoints()?.get(indexer_id).cloned())
    }

    async fn find_accounts(&self, addresses: &[String]) -> Result<Vec<OwnerAccount>, IndexerError> {
        let ledger = self.ledger()?;
        Ok(addresses
            .iter()
            .filter_map(|a| ledger.accounts.get(a).cloned())
            .collect())
    }

    async fn existing_transfer_ids(&self, ids: &[String]) -> Result<HashSet<String>, IndexerError> {
        let ledger = self.ledger()?;
        Ok(ids
            .iter()
            .filter(|id| ledger.transfers.contains_key(*id))
            .cloned()
            .collect())
    }

    async fn existing_payment_ids(&self, ids: &[String]) -> Result<HashSet<String>, IndexerError> {
        let ledger = self.ledger()?;
        Ok(ids
            .iter()
            .filter(|id| ledger.payments.contains_key(*id))
            .cloned()
            .collect())
    }

    async fn commit_batch(&self, writes: &BatchWrites) -> Result<(), IndexerError> {
        let pending = self.failing_commits.load(Ordering::SeqCst);
        if pending > 0 {
            self.failing_commits.store(pending - 1, Ordering::SeqCst);
            return Err(IndexerError::Storage("injected commit failure".into()));
        }

        let mut ledger = self.ledger()?;
        let mut checkpoints = self.checkpoints()?;
        if !writes.check_parent(checkpoints.get(&writes.checkpoint.indexer_id))? {
            return Ok(());
        }
        for account in &writes.changes.accounts {
            ledger
                .accounts
                .insert(account.address.clone(), account.clone());
        }
        for t in &writes.changes.transfers {
            ledger.transfers.entry(t.id.clone()).or_insert_with(|| t.clone());
        }
        for p in &writes.changes.payments {
            ledger.payments.entry(p.id.clone()).or_insert_with(|| p.clone());
        }
        checkpoints.insert(writes.checkpoint.indexer_id.clone(), writes.checkpoint.clone());
        Ok(())
    }

    async fn rollback_from(
        &self,
        indexer_id: &str,
        height: u64,
    ) -> Result<RollbackSummary, IndexerError> {
        let mut ledger = self.ledger()?;
        let mut checkpoints = self.checkpoints()?;

        let discarded: Vec<TransferRecord> = ledger
            .transfers
            .values()
            .filter(|t| t.block_height >= height)
            .cloned()
            .collect();
        let deltas = reversal_deltas(&discarded);

        let mut accounts_adjusted = 0u64;
        for (address, delta) in &deltas {
            if let Some(account) = ledger.accounts.get_mut(address) {
                account.apply_delta(delta);
                accounts_adjusted += 1;
            }
        }
        ledger.transfers.retain(|_, t| t.block_height < height);
        let payments_before = ledger.payments.len();
        ledger.payments.retain(|_, p| p.block_height < height);
        let payments_removed = (payments_before - ledger.payments.len()) as u64;

        let referenced: BTreeSet<&String> = ledger
            .transfers
            .values()
            .flat_map(|t| t.from.iter().chain(t.to.iter()))
            .collect();
        let orphans: Vec<String> = deltas
            .keys()
            .filter(|a| !referenced.contains(a))
            .cloned()
            .collect();
        for address in &orphans {
            ledger.accounts.remove(address);
        }

        if rollback_rewrites(checkpoints.get(indexer_id), height) {
            checkpoints.insert(
                indexer_id.to_string(),
                Checkpoint::rolled_back(indexer_id, height),
            );
        }

        Ok(RollbackSummary {
            from_height: height,
            transfers_removed: discarded.len() as u64,
            payments_removed,
            accounts_adjusted,
            accounts_removed: orphans.len() as u64,
        })
    }

    async fn account(&self, address: &str) -> Result<Option<OwnerAccount>, IndexerError> {
        Ok(self.ledger()?.accounts.get(address).cloned())
    }

    async fn transfer_count(&self) -> Result<u64, IndexerError> {
        Ok(self.ledger()?.transfers.len() as u64)
    }

    async fn payment(&self, id: &str) -> Result<Option<PaymentRecord>, IndexerError> {
        Ok(self.ledger()?.payments.get(id).cloned())
    }

    async fn payment_count(&self) -> Result<u64, IndexerError> {
        Ok(self.ledger()?.payments.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::U256;
    use chrono::DateTime;
    use num_bigint::BigInt;

    fn transfer(id: &str, height: u64, from: Option<&str>, to: Option<&str>, amount: u64) -> TransferRecord {
        TransferRecord {
            id: id.into(),
            from: from.map(Into::into),
            to: to.map(Into::into),
            amount: U256::from(amount),
            block_height: height,
            timestamp: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            source_hash: "0xtx".into(),
        }
    }

    fn payment(id: &str, height: u64) -> PaymentRecord {
        PaymentRecord {
            id: id.into(),
            token: "0xtoken".into(),
            payer: "0xpayer".into(),
            amount: U256::from(100u64),
            merchant: "0xmerchant".into(),
            royalty_amount: U256::ZERO,
            block_height: height,
            timestamp: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            source_hash: "0xtx".into(),
        }
    }

    fn bal(v: i64) -> BigInt {
        BigInt::from(v)
    }

    async fn seeded() -> MemoryLedgerStore {
        let store = MemoryLedgerStore::new();
        store
            .commit_batch(&BatchWrites {
                changes: LedgerChanges {
                    accounts: vec![
                        OwnerAccount::with_balance("0xa", bal(30)),
                        OwnerAccount::with_balance("0xb", bal(20)),
                    ],
                    transfers: vec![
                        transfer("t1", 101, None, Some("0xa"), 50),
                        transfer("t2", 102, Some("0xa"), Some("0xb"), 20),
                    ],
                    payments: vec![payment("p1", 101), payment("p2", 102)],
                    ..Default::default()
                },
                checkpoint: Checkpoint::new("idx", 102, "0xh102", false),
                parent: None,
            })
            .await
            .unwrap();
        store
    }

    fn empty(height: u64, parent: Option<u64>) -> BatchWrites {
        BatchWrites {
            changes: LedgerChanges::default(),
            checkpoint: Checkpoint::new("idx", height, format!("0xh{height}"), false),
            parent,
        }
    }

    #[tokio::test]
    async fn commit_is_visible_through_reads() {
        let store = seeded().await;
        assert_eq!(store.transfer_count().await.unwrap(), 2);
        assert_eq!(store.payment_count().await.unwrap(), 2);
        assert_eq!(store.account("0xa").await.unwrap().unwrap().balance, bal(30));
        let found = store
            .find_accounts(&["0xa".into(), "0xzz".into()])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        let ids = store
            .existing_transfer_ids(&["t1".into(), "t9".into()])
            .await
            .unwrap();
        assert_eq!(ids, HashSet::from(["t1".to_string()]));
        let cp = store.load_checkpoint("idx").await.unwrap().unwrap();
        assert_eq!(cp.height, 102);
    }

    #[tokio::test]
    async fn rollback_reverses_discarded_blocks() {
        let store = seeded().await;
        let summary = store.rollback_from("idx", 102).await.unwrap();
        assert_eq!(summary.transfers_removed, 1);
        assert_eq!(summary.payments_removed, 1);
        assert_eq!(summary.accounts_removed, 1);

        assert_eq!(store.account("0xa").await.unwrap().unwrap().balance, bal(50));
        assert!(store.account("0xb").await.unwrap().is_none());
        assert!(store.payment("p2").await.unwrap().is_none());
        assert!(store.payment("p1").await.unwrap().is_some());

        let cp = store.load_checkpoint("idx").await.unwrap().unwrap();
        assert_eq!(cp.height, 101);
        assert!(!cp.is_final);
    }

    #[tokio::test]
    async fn injected_failures_are_transient() {
        let store = MemoryLedgerStore::new();
        store.fail_next_commits(1);
        let writes = empty(5, None);
        let err = store.commit_batch(&writes).await.unwrap_err();
        assert!(err.is_retryable());
        store.commit_batch(&writes).await.unwrap();
        assert_eq!(store.load_checkpoint("idx").await.unwrap().unwrap().height, 5);
    }

    #[tokio::test]
    async fn recommitting_the_same_batch_is_a_no_op() {
        let store = seeded().await;
        store.commit_batch(&empty(102, Some(101))).await.unwrap();
        assert_eq!(store.transfer_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn commit_against_a_moved_checkpoint_is_refused() {
        let store = seeded().await;
        store.rollback_from("idx", 102).await.unwrap();

        // Folded against the pre-rollback checkpoint.
        let mut stale = empty(103, Some(102));
        stale.changes.accounts = vec![OwnerAccount::with_balance("0xb", bal(20))];
        let err = store.commit_batch(&stale).await.unwrap_err();
        assert!(matches!(
            err,
            IndexerError::CheckpointConflict {
                expected: Some(102),
                found: Some(101),
                ..
            }
        ));
        assert!(!err.is_retryable());
        assert!(store.account("0xb").await.unwrap().is_none());
        assert_eq!(store.load_checkpoint("idx").await.unwrap().unwrap().height, 101);

        store.commit_batch(&empty(102, Some(101))).await.unwrap();
    }

    #[tokio::test]
    async fn rollback_never_advances_the_checkpoint() {
        let store = seeded().await;
        store.rollback_from("idx", 101).await.unwrap();
        store.rollback_from("idx", 102).await.unwrap();
        let cp = store.load_checkpoint("idx").await.unwrap().unwrap();
        assert_eq!(cp.height, 100);
    }
}

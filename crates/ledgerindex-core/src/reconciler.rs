//! Ledger reconciler: folds a batch of decoded events into the entity
//! changes that one atomic commit will persist.
//!
//! The work is split in two. [`LedgerReconciler`] performs the store reads (one
//! batched read per entity type) and builds a [`LedgerSnapshot`]; [`fold`] is
//! pure and applies the events to that snapshot in order.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::entity::{OwnerAccount, PaymentRecord, TransferRecord};
use crate::error::IndexerError;
use crate::event::{DomainEvent, EventKind, PaymentEvent, TransferEvent};
use crate::retry::{retry_store_op, RetryPolicy};
use crate::store::LedgerStore;

/// The persisted state a batch's events can observe.
#[derive(Debug, Clone, Default)]
pub struct LedgerSnapshot {
    /// Existing accounts keyed by address. Absent addresses start at zero.
    pub accounts: HashMap<String, OwnerAccount>,
    /// Transfer ids already committed.
    pub existing_transfers: HashSet<String>,
    /// Payment ids already committed.
    pub existing_payments: HashSet<String>,
}

/// Everything one batch writes, apart from the checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerChanges {
    /// Accounts touched by the batch with their final balances, ordered by address.
    pub accounts: Vec<OwnerAccount>,
    /// New transfer rows in source order.
    pub transfers: Vec<TransferRecord>,
    /// New payment rows in source order.
    pub payments: Vec<PaymentRecord>,
    /// Events dropped because their id was already applied.
    pub skipped: usize,
    /// Debits that left an account below zero.
    pub negative_balances: usize,
}

impl LedgerChanges {
    /// Returns `true` if there is nothing to write besides the checkpoint.
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty() && self.transfers.is_empty() && self.payments.is_empty()
    }

    /// Number of new transfer and payment rows.
    pub fn record_count(&self) -> usize {
        self.transfers.len() + self.payments.len()
    }
}

/// Apply `events` in order to `snapshot`.
///
/// An event whose id is already in the store or earlier in the batch is a
/// no-op.
pub fn fold(snapshot: LedgerSnapshot, events: &[DomainEvent]) -> LedgerChanges {
    let LedgerSnapshot {
        mut accounts,
        mut existing_transfers,
        mut existing_payments,
    } = snapshot;
    let mut touched: BTreeSet<String> = BTreeSet::new();
    let mut changes = LedgerChanges::default();

    for event in events {
        match &event.kind {
            EventKind::Transfer(transfer) => {
                if !existing_transfers.insert(event.id.clone()) {
                    debug!(id = %event.id, "transfer already applied");
                    changes.skipped += 1;
                    continue;
                }
                apply_transfer(event, transfer, &mut accounts, &mut touched, &mut changes);
            }
            EventKind::PaymentReceived(payment) => {
                if !existing_payments.insert(event.id.clone()) {
                    debug!(id = %event.id, "payment already recorded");
                    changes.skipped += 1;
                    continue;
                }
                changes.payments.push(payment_record(event, payment));
            }
        }
    }

    changes.accounts = touched
        .into_iter()
        .filter_map(|address| accounts.remove(&address))
        .collect();
    changes
}

fn apply_transfer(
    event: &DomainEvent,
    transfer: &TransferEvent,
    accounts: &mut HashMap<String, OwnerAccount>,
    touched: &mut BTreeSet<String>,
    changes: &mut LedgerChanges,
) {
    if let Some(from) = &transfer.from {
        let account = accounts
            .entry(from.clone())
            .or_insert_with(|| OwnerAccount::new(from.clone()));
        account.debit(transfer.amount);
        if account.is_negative() {
            warn!(
                address = %from,
                balance = %account.balance,
                event = %event.id,
                block = event.block_height,
                "Balance went negative; upstream data is inconsistent"
            );
            changes.negative_balances += 1;
        }
        touched.insert(from.clone());
    }

    if let Some(to) = &transfer.to {
        accounts
            .entry(to.clone())
            .or_insert_with(|| OwnerAccount::new(to.clone()))
            .credit(transfer.amount);
        touched.insert(to.clone());
    }

    changes.transfers.push(TransferRecord {
        id: event.id.clone(),
        from: transfer.from.clone(),
        to: transfer.to.clone(),
        amount: transfer.amount,
        block_height: event.block_height,
        timestamp: event.timestamp,
        source_hash: event.tx_hash.clone(),
    });
}

/// The payer is the sender of the emitting transaction.
fn payment_record(event: &DomainEvent, payment: &PaymentEvent) -> PaymentRecord {
    PaymentRecord {
        id: event.id.clone(),
        token: payment.token.clone(),
        payer: event.sender.clone(),
        amount: payment.amount,
        merchant: payment.merchant.clone(),
        royalty_amount: payment.royalty_amount,
        block_height: event.block_height,
        timestamp: event.timestamp,
        source_hash: event.tx_hash.clone(),
    }
}

/// Reads the state a batch depends on and folds the batch over it.
pub struct LedgerReconciler {
    store: Arc<dyn LedgerStore>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl LedgerReconciler {
    pub fn new(store: Arc<dyn LedgerStore>, retry: RetryPolicy, timeout: Duration) -> Self {
        Self {
            store,
            retry,
            timeout,
        }
    }

    /// Load every account and id `events` reference, one read per entity type.
    pub async fn snapshot(&self, events: &[DomainEvent]) -> Result<LedgerSnapshot, IndexerError> {
        let mut addresses = BTreeSet::new();
        let mut transfer_ids = Vec::new();
        let mut payment_ids = Vec::new();
        for event in events {
            match &event.kind {
                EventKind::Transfer(t) => {
                    transfer_ids.push(event.id.clone());
                    addresses.extend(t.from.iter().cloned());
                    addresses.extend(t.to.iter().cloned());
                }
                EventKind::PaymentReceived(_) => payment_ids.push(event.id.clone()),
            }
        }
        let addresses: Vec<String> = addresses.into_iter().collect();

        let mut snapshot = LedgerSnapshot::default();
        if !addresses.is_empty() {
            let found = retry_store_op(&self.retry, self.timeout, "find_accounts", || {
                self.store.find_accounts(&addresses)
            })
            .await?;
            snapshot.accounts = found
                .into_iter()
                .map(|a| (a.address.clone(), a))
                .collect();
        }
        if !transfer_ids.is_empty() {
            snapshot.existing_transfers =
                retry_store_op(&self.retry, self.timeout, "existing_transfer_ids", || {
                    self.store.existing_transfer_ids(&transfer_ids)
                })
                .await?;
        }
        if !payment_ids.is_empty() {
            snapshot.existing_payments =
                retry_store_op(&self.retry, self.timeout, "existing_payment_ids", || {
                    self.store.existing_payment_ids(&payment_ids)
                })
                .await?;
        }
        Ok(snapshot)
    }

    /// Compute the changes `events` make against the current store state.
    pub async fn reconcile(&self, events: &[DomainEvent]) -> Result<LedgerChanges, IndexerError> {
        let snapshot = self.snapshot(events).await?;
        Ok(fold(snapshot, events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::Checkpoint;
    use crate::store::{BatchWrites, MemoryLedgerStore};
    use alloy_primitives::U256;
    use chrono::DateTime;
    use num_bigint::BigInt;

    fn transfer(height: u64, index: u32, from: Option<&str>, to: Option<&str>, amount: u64) -> DomainEvent {
        DomainEvent::new(
            height,
            index,
            DateTime::from_timestamp(1_700_000_000 + height as i64, 0).unwrap(),
            format!("0xtx{height}{index}"),
            "0xsender",
            EventKind::Transfer(TransferEvent {
                from: from.map(Into::into),
                to: to.map(Into::into),
                amount: U256::from(amount),
            }),
        )
    }

    fn payment(height: u64, index: u32, id: &str, amount: u64) -> DomainEvent {
        DomainEvent::new(
            height,
            index,
            DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            "0xtx",
            "0xsender",
            EventKind::PaymentReceived(PaymentEvent {
                payment_id: id.into(),
                token: "0xtoken".into(),
                from: "0xlogfrom".into(),
                amount: U256::from(amount),
                merchant: "0xmerchant".into(),
                royalty_amount: U256::from(1u64),
            }),
        )
    }

    fn bal(v: i64) -> BigInt {
        BigInt::from(v)
    }

    fn balance_of(changes: &LedgerChanges, address: &str) -> Option<BigInt> {
        changes
            .accounts
            .iter()
            .find(|a| a.address == address)
            .map(|a| a.balance.clone())
    }

    #[test]
    fn mint_then_transfer() {
        let events = vec![
            transfer(101, 0, None, Some("0xa"), 50),
            transfer(102, 0, Some("0xa"), Some("0xb"), 20),
        ];
        let changes = fold(LedgerSnapshot::default(), &events);
        assert_eq!(balance_of(&changes, "0xa"), Some(bal(30)));
        assert_eq!(balance_of(&changes, "0xb"), Some(bal(20)));
        assert_eq!(changes.accounts.len(), 2);
        assert_eq!(changes.transfers.len(), 2);
        assert_eq!(changes.negative_balances, 0);
    }

    #[test]
    fn burn_debits_only_source() {
        let mut snapshot = LedgerSnapshot::default();
        snapshot
            .accounts
            .insert("0xa".into(), OwnerAccount::with_balance("0xa", bal(10)));
        let changes = fold(snapshot, &[transfer(101, 0, Some("0xa"), None, 4)]);
        assert_eq!(changes.accounts, vec![OwnerAccount::with_balance("0xa", bal(6))]);
        assert_eq!(changes.transfers[0].to, None);
    }

    #[test]
    fn zero_amount_is_recorded_without_balance_change() {
        let changes = fold(
            LedgerSnapshot::default(),
            &[transfer(101, 0, Some("0xa"), Some("0xb"), 0)],
        );
        assert_eq!(changes.transfers.len(), 1);
        assert_eq!(balance_of(&changes, "0xa"), Some(bal(0)));
        assert_eq!(balance_of(&changes, "0xb"), Some(bal(0)));
    }

    #[test]
    fn duplicates_in_store_and_batch_are_skipped() {
        let mut snapshot = LedgerSnapshot::default();
        let first = transfer(101, 0, None, Some("0xa"), 50);
        snapshot.existing_transfers.insert(first.id.clone());
        let second = transfer(101, 1, None, Some("0xa"), 7);
        let changes = fold(snapshot, &[first, second.clone(), second]);
        assert_eq!(changes.transfers.len(), 1);
        assert_eq!(changes.skipped, 2);
        assert_eq!(balance_of(&changes, "0xa"), Some(bal(7)));
    }

    #[test]
    fn payments_dedup_by_business_key() {
        let changes = fold(
            LedgerSnapshot::default(),
            &[payment(101, 0, "p1", 100), payment(101, 3, "p1", 100)],
        );
        assert_eq!(changes.payments.len(), 1);
        assert_eq!(changes.payments[0].id, "p1");
        assert_eq!(changes.payments[0].block_height, 101);
        assert_eq!(changes.skipped, 1);
        assert!(changes.accounts.is_empty());
    }

    #[test]
    fn order_matters_and_source_order_stays_non_negative() {
        // A receives 10 then sends 10: fine in order, negative if reversed.
        let receive = transfer(101, 0, None, Some("0xa"), 10);
        let send = transfer(101, 1, Some("0xa"), Some("0xb"), 10);

        let in_order = fold(LedgerSnapshot::default(), &[receive.clone(), send.clone()]);
        assert_eq!(in_order.negative_balances, 0);
        assert_eq!(balance_of(&in_order, "0xa"), Some(bal(0)));

        let reversed = fold(LedgerSnapshot::default(), &[send, receive]);
        assert_eq!(reversed.negative_balances, 1);
    }

    #[test]
    fn amounts_beyond_signed_256_bits_fold_exactly() {
        let huge = U256::from(1u64) << 255usize;
        let mint = |index, to: &str| {
            let mut ev = transfer(101, index, None, Some(to), 0);
            if let EventKind::Transfer(t) = &mut ev.kind {
                t.amount = huge;
            }
            ev
        };
        let mut send = transfer(101, 2, Some("0xa"), Some("0xb"), 0);
        if let EventKind::Transfer(t) = &mut send.kind {
            t.amount = huge;
        }

        let changes = fold(LedgerSnapshot::default(), &[mint(0, "0xa"), mint(1, "0xa"), send]);
        let two_pow_255 = BigInt::from(1) << 255usize;
        assert_eq!(balance_of(&changes, "0xa"), Some(two_pow_255.clone()));
        assert_eq!(balance_of(&changes, "0xb"), Some(two_pow_255));
        assert_eq!(changes.negative_balances, 0);
    }

    #[test]
    fn payment_payer_is_the_transaction_sender() {
        let changes = fold(LedgerSnapshot::default(), &[payment(101, 0, "p1", 100)]);
        assert_eq!(changes.payments[0].payer, "0xsender");
        assert_eq!(changes.payments[0].token, "0xtoken");
    }

    #[test]
    fn accounts_are_ordered_by_address() {
        let changes = fold(
            LedgerSnapshot::default(),
            &[
                transfer(101, 0, None, Some("0xc"), 1),
                transfer(101, 1, None, Some("0xa"), 1),
                transfer(101, 2, None, Some("0xb"), 1),
            ],
        );
        let order: Vec<_> = changes.accounts.iter().map(|a| a.address.as_str()).collect();
        assert_eq!(order, vec!["0xa", "0xb", "0xc"]);
    }

    #[tokio::test]
    async fn reconcile_reads_persisted_state() {
        let store = Arc::new(MemoryLedgerStore::new());
        let reconciler = LedgerReconciler::new(
            store.clone(),
            RetryPolicy::default(),
            Duration::from_secs(1),
        );

        let first = vec![transfer(101, 0, None, Some("0xa"), 50), payment(101, 1, "p1", 100)];
        let changes = reconciler.reconcile(&first).await.unwrap();
        store
            .commit_batch(&BatchWrites {
                changes,
                checkpoint: Checkpoint::new("idx", 101, "0xh101", false),
                parent: None,
            })
            .await
            .unwrap();

        // Replay of the same events plus one new transfer.
        let mut second = first.clone();
        second.push(transfer(102, 0, Some("0xa"), Some("0xb"), 20));
        let changes = reconciler.reconcile(&second).await.unwrap();
        assert_eq!(changes.skipped, 2);
        assert_eq!(changes.transfers.len(), 1);
        assert!(changes.payments.is_empty());
        assert_eq!(balance_of(&changes, "0xa"), Some(bal(30)));
        assert_eq!(balance_of(&changes, "0xb"), Some(bal(20)));
    }
}

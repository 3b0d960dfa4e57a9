//! Persisted ledger entities.

use std::collections::BTreeMap;

use alloy_primitives::U256;
use chrono::{DateTime, Utc};
use num_bigint::{BigInt, Sign};
use serde::{Deserialize, Serialize};

/// A token holder. Created lazily with a zero balance, never deleted by
/// normal processing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerAccount {
    /// Primary key, canonical address form.
    pub address: String,
    /// Credits minus debits, unbounded. Negative only if upstream data is
    /// inconsistent.
    pub balance: BigInt,
}

impl OwnerAccount {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            balance: BigInt::default(),
        }
    }

    pub fn with_balance(address: impl Into<String>, balance: impl Into<BigInt>) -> Self {
        Self {
            address: address.into(),
            balance: balance.into(),
        }
    }

    pub fn credit(&mut self, amount: U256) {
        self.balance += to_signed(amount);
    }

    pub fn debit(&mut self, amount: U256) {
        self.balance -= to_signed(amount);
    }

    pub fn apply_delta(&mut self, delta: &BigInt) {
        self.balance += delta;
    }

    pub fn is_negative(&self) -> bool {
        self.balance.sign() == Sign::Minus
    }
}

/// Lossless widening of an on-chain amount.
pub fn to_signed(amount: U256) -> BigInt {
    BigInt::from_bytes_be(Sign::Plus, &amount.to_be_bytes::<32>())
}

/// One applied transfer. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    /// Source event id.
    pub id: String,
    pub from: Option<String>,
    pub to: Option<String>,
    pub amount: U256,
    pub block_height: u64,
    pub timestamp: DateTime<Utc>,
    /// Hash of the transaction that emitted the event.
    pub source_hash: String,
}

/// One received payment. At most one row per `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRecord {
    /// Business payment id.
    pub id: String,
    pub token: String,
    pub payer: String,
    pub amount: U256,
    pub merchant: String,
    pub royalty_amount: U256,
    pub block_height: u64,
    pub timestamp: DateTime<Utc>,
    pub source_hash: String,
}

/// Per-account balance adjustments that undo `transfers`.
///
/// Used by every store backend when discarding retracted blocks.
pub fn reversal_deltas(transfers: &[TransferRecord]) -> BTreeMap<String, BigInt> {
    let mut deltas: BTreeMap<String, BigInt> = BTreeMap::new();
    for t in transfers {
        let amount = to_signed(t.amount);
        if let Some(from) = &t.from {
            *deltas.entry(from.clone()).or_default() += &amount;
        }
        if let Some(to) = &t.to {
            *deltas.entry(to.clone()).or_default() -= &amount;
        }
    }
    deltas
}

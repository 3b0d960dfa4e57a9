//! Decoded domain events.
//!
//! Decoders produce an [`EventKind`]; the extractor wraps it into a
//! [`DomainEvent`] carrying block provenance. Events live for one batch only.

use alloy_primitives::U256;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An ERC-20 style transfer. `from = None` is a mint, `to = None` a burn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferEvent {
    pub from: Option<String>,
    pub to: Option<String>,
    pub amount: U256,
}

/// A payment receipt emitted by the payment processor contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentEvent {
    /// Business identifier, unique per payment across retries.
    pub payment_id: String,
    pub token: String,
    /// Indexed `from` argument of the log. The ledger records the
    /// transaction sender as payer, not this value.
    pub from: String,
    pub amount: U256,
    pub merchant: String,
    pub royalty_amount: U256,
}

/// The closed set of events the ledger understands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    Transfer(TransferEvent),
    PaymentReceived(PaymentEvent),
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Transfer(_) => "Transfer",
            Self::PaymentReceived(_) => "PaymentReceived",
        }
    }
}

/// One decoded occurrence of interest, with its provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainEvent {
    /// Stable identifier. See [`event_id`] and [`DomainEvent::new`].
    pub id: String,
    pub block_height: u64,
    pub log_index: u32,
    pub timestamp: DateTime<Utc>,
    /// Hash of the parent transaction.
    pub tx_hash: String,
    /// Sender of the parent transaction.
    pub sender: String,
    pub kind: EventKind,
}

impl DomainEvent {
    /// Build an event, deriving its id from the payload or the source position.
    ///
    /// Payments are keyed by their business id so resends collapse onto one
    /// row; everything else is keyed by `(block_height, log_index)`.
    pub fn new(
        block_height: u64,
        log_index: u32,
        timestamp: DateTime<Utc>,
        tx_hash: impl Into<String>,
        sender: impl Into<String>,
        kind: EventKind,
    ) -> Self {
        let id = match &kind {
            EventKind::PaymentReceived(p) => p.payment_id.clone(),
            EventKind::Transfer(_) => event_id(block_height, log_index),
        };
        Self {
            id,
            block_height,
            log_index,
            timestamp,
            tx_hash: tx_hash.into(),
            sender: sender.into(),
            kind,
        }
    }

    /// Source-order sort key.
    pub fn position(&self) -> (u64, u32) {
        (self.block_height, self.log_index)
    }
}

/// Deterministic id for a log at `(block_height, log_index)`.
///
/// Zero-padded so lexicographic order equals source order.
pub fn event_id(block_height: u64, log_index: u32) -> String {
    format!("{block_height:010}-{log_index:06}")
}

//! `EvmEventDecoder`: the [`EventDecoder`] for EVM logs.
//!
//! Holds a signature table keyed by topic0. Indexed parameters are read from
//! `topics[1..]`; the rest are ABI-decoded from the data payload with
//! alloy's `DynSolType`.

use std::collections::HashMap;

use alloy_core::dyn_abi::{DynSolType, DynSolValue};
use alloy_primitives::Address;
use ledgerindex_core::decoder::{DecodeError, EventDecoder};
use ledgerindex_core::event::{EventKind, PaymentEvent, TransferEvent};

use crate::{fingerprint, normalizer};

/// ERC-20 transfer. `from` and `to` are indexed.
pub const TRANSFER_SIGNATURE: &str = "Transfer(address,address,uint256)";

/// Payment processor receipt. `token` and `from` are indexed.
pub const PAYMENT_RECEIVED_SIGNATURE: &str =
    "ERC20PaymentReceived(address,address,uint256,string,address,uint256)";

/// The signatures this crate knows how to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KnownEvent {
    Transfer,
    PaymentReceived,
}

impl KnownEvent {
    pub const ALL: [KnownEvent; 2] = [KnownEvent::Transfer, KnownEvent::PaymentReceived];

    pub fn signature(self) -> &'static str {
        match self {
            Self::Transfer => TRANSFER_SIGNATURE,
            Self::PaymentReceived => PAYMENT_RECEIVED_SIGNATURE,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Transfer => "Transfer",
            Self::PaymentReceived => "ERC20PaymentReceived",
        }
    }

    /// keccak256 of the signature, i.e. the expected topic0.
    pub fn topic0(self) -> String {
        fingerprint::keccak256_signature(self.signature())
    }
}

/// Decodes the events of [`KnownEvent`]. Thread-safe and cheap to clone.
#[derive(Debug, Clone)]
pub struct EvmEventDecoder {
    table: HashMap<String, KnownEvent>,
}

impl Default for EvmEventDecoder {
    fn default() -> Self {
        Self::with_events(KnownEvent::ALL)
    }
}

impl EvmEventDecoder {
    /// A decoder for every known event.
    pub fn new() -> Self {
        Self::default()
    }

    /// A decoder that only recognizes `events`; everything else is ignored.
    pub fn with_events(events: impl IntoIterator<Item = KnownEvent>) -> Self {
        Self {
            table: events.into_iter().map(|e| (e.topic0(), e)).collect(),
        }
    }

    /// Look up the event a topic0 belongs to.
    pub fn lookup(&self, topic0: &str) -> Option<KnownEvent> {
        self.table.get(&topic0.to_ascii_lowercase()).copied()
    }

    fn decode_transfer(topics: &[String], data: &[u8]) -> Result<EventKind, DecodeError> {
        const EVENT: &str = "Transfer";
        expect_topics(EVENT, topics, 3)?;
        let from = topic_address(EVENT, &topics[1])?;
        let to = topic_address(EVENT, &topics[2])?;
        let values = decode_data(EVENT, &[DynSolType::Uint(256)], data)?;
        let amount = normalizer::uint(&values[0]).ok_or(DecodeError::TypeMismatch {
            event: EVENT,
            field: "value",
        })?;

        Ok(EventKind::Transfer(TransferEvent {
            from: normalizer::owner(from),
            to: normalizer::owner(to),
            amount,
        }))
    }

    fn decode_payment(topics: &[String], data: &[u8]) -> Result<EventKind, DecodeError> {
        const EVENT: &str = "ERC20PaymentReceived";
        expect_topics(EVENT, topics, 3)?;
        let token = topic_address(EVENT, &topics[1])?;
        let from = topic_address(EVENT, &topics[2])?;
        let values = decode_data(
            EVENT,
            &[
                DynSolType::Uint(256),
                DynSolType::String,
                DynSolType::Address,
                DynSolType::Uint(256),
            ],
            data,
        )?;

        let mismatch = |field| DecodeError::TypeMismatch {
            event: EVENT,
            field,
        };
        let amount = normalizer::uint(&values[0]).ok_or_else(|| mismatch("amount"))?;
        let payment_id = normalizer::string(&values[1]).ok_or_else(|| mismatch("paymentId"))?;
        let merchant = normalizer::address(&values[2]).ok_or_else(|| mismatch("merchant"))?;
        let royalty_amount =
            normalizer::uint(&values[3]).ok_or_else(|| mismatch("royaltyAmount"))?;

        Ok(EventKind::PaymentReceived(PaymentEvent {
            payment_id: payment_id.to_string(),
            token: normalizer::address_string(&token),
            from: normalizer::address_string(&from),
            amount,
            merchant: normalizer::address_string(&merchant),
            royalty_amount,
        }))
    }
}

impl EventDecoder for EvmEventDecoder {
    fn decode(&self, topics: &[String], data: &[u8]) -> Result<Option<EventKind>, DecodeError> {
        let Some(event) = topics.first().and_then(|t| self.lookup(t)) else {
            return Ok(None);
        };
        let kind = match event {
            KnownEvent::Transfer => Self::decode_transfer(topics, data)?,
            KnownEvent::PaymentReceived => Self::decode_payment(topics, data)?,
        };
        Ok(Some(kind))
    }

    fn known_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.table.keys().cloned().collect();
        topics.sort();
        topics
    }
}

fn expect_topics(event: &'static str, topics: &[String], expected: usize) -> Result<(), DecodeError> {
    if topics.len() != expected {
        return Err(DecodeError::TopicCount {
            event,
            expected,
            got: topics.len(),
        });
    }
    Ok(())
}

/// Decode an indexed address (a 32-byte left-padded word).
fn topic_address(event: &'static str, topic: &str) -> Result<Address, DecodeError> {
    let hex_str = topic.strip_prefix("0x").unwrap_or(topic);
    let bytes = hex::decode(hex_str).map_err(|e| DecodeError::InvalidTopic(format!("{topic}: {e}")))?;
    if bytes.len() != 32 {
        return Err(DecodeError::InvalidTopic(format!(
            "{topic}: expected 32 bytes, got {}",
            bytes.len()
        )));
    }
    if bytes[..12].iter().any(|b| *b != 0) {
        return Err(DecodeError::AbiDecodeFailed {
            event,
            reason: format!("topic {topic} is not a padded address"),
        });
    }
    let value = DynSolType::Address
        .abi_decode(&bytes)
        .map_err(|e| DecodeError::AbiDecodeFailed {
            event,
            reason: format!("topic decode: {e}"),
        })?;
    normalizer::address(&value).ok_or(DecodeError::TypeMismatch {
        event,
        field: "topic",
    })
}

/// Decode the data payload as the parameter list `types`.
fn decode_data(
    event: &'static str,
    types: &[DynSolType],
    data: &[u8],
) -> Result<Vec<DynSolValue>, DecodeError> {
    let decoded = DynSolType::Tuple(types.to_vec())
        .abi_decode_params(data)
        .map_err(|e| DecodeError::AbiDecodeFailed {
            event,
            reason: e.to_string(),
        })?;
    let values = match decoded {
        DynSolValue::Tuple(values) => values,
        other => vec![other],
    };
    if values.len() != types.len() {
        return Err(DecodeError::AbiDecodeFailed {
            event,
            reason: format!("expected {} data fields, got {}", types.len(), values.len()),
        });
    }
    Ok(values)
}

//! Shared types for the ingestion pipeline: blocks, raw logs, batches, filters.

use serde::{Deserialize, Serialize};

// ─── BlockSummary ─────────────────────────────────────────────────────────────

/// A minimal block header: enough for ordering, timestamps and reorg checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSummary {
    /// Block number.
    pub number: u64,
    /// Block hash (`0x…`).
    pub hash: String,
    /// Parent block hash (`0x…`).
    pub parent_hash: String,
    /// Unix timestamp of the block (seconds since epoch).
    pub timestamp: i64,
}

impl BlockSummary {
    /// Returns `true` if `parent` is the direct parent of `self`.
    pub fn extends(&self, parent: &BlockSummary) -> bool {
        self.number == parent.number + 1 && self.parent_hash == parent.hash
    }
}

// ─── Raw logs ─────────────────────────────────────────────────────────────────

/// The transaction a log was emitted by.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRef {
    /// Transaction hash.
    pub hash: String,
    /// Transaction sender.
    pub from: String,
}

/// A raw, undecoded log as delivered by the chain source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLog {
    /// Emitting contract address.
    pub address: String,
    /// `topics[0]` is the event signature hash; the rest are indexed params.
    pub topics: Vec<String>,
    /// ABI-encoded non-indexed params.
    pub data: Vec<u8>,
    /// Position of the log within its block.
    pub log_index: u32,
    /// Parent transaction. `None` means the source lost provenance.
    pub transaction: Option<TxRef>,
}

impl RawLog {
    /// Returns topics[0], if present.
    pub fn topic0(&self) -> Option<&str> {
        self.topics.first().map(String::as_str)
    }
}

/// A block plus the logs the source selected from it, ascending by `log_index`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceBlock {
    pub header: BlockSummary,
    pub logs: Vec<RawLog>,
}

impl SourceBlock {
    pub fn number(&self) -> u64 {
        self.header.number
    }
}

// ─── Batch ────────────────────────────────────────────────────────────────────

/// An ordered group of blocks processed as one atomic unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// Blocks ascending by height. Heights may skip blocks without logs.
    pub blocks: Vec<SourceBlock>,
    /// `true` when these blocks supersede previously delivered hot blocks.
    pub is_reorg_replacement: bool,
    /// Chain head height observed by the source when building the batch.
    pub chain_head: u64,
}

impl Batch {
    pub fn new(blocks: Vec<SourceBlock>, chain_head: u64) -> Self {
        Self {
            blocks,
            is_reorg_replacement: false,
            chain_head,
        }
    }

    /// Mark this batch as replacing retracted hot blocks.
    pub fn reorg_replacement(mut self) -> Self {
        self.is_reorg_replacement = true;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn lowest_height(&self) -> Option<u64> {
        self.blocks.iter().map(SourceBlock::number).min()
    }

    pub fn highest_height(&self) -> Option<u64> {
        self.blocks.iter().map(SourceBlock::number).max()
    }

    /// The block with the greatest height.
    pub fn highest_block(&self) -> Option<&BlockSummary> {
        self.blocks
            .iter()
            .max_by_key(|b| b.number())
            .map(|b| &b.header)
    }

    /// Drop every block at or below `height`.
    pub fn retain_above(&mut self, height: u64) {
        self.blocks.retain(|b| b.number() > height);
    }

    pub fn log_count(&self) -> usize {
        self.blocks.iter().map(|b| b.logs.len()).sum()
    }
}

// ─── EventFilter ──────────────────────────────────────────────────────────────

/// Filter for which logs the extractor considers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    /// Only consider logs from these contract addresses (empty = all addresses).
    pub addresses: Vec<String>,
    /// Only consider logs with this topic[0] value (empty = all events).
    pub topic0_values: Vec<String>,
    /// First block height considered (inclusive).
    pub from_block: Option<u64>,
}

impl EventFilter {
    /// Create a filter for a single contract address.
    pub fn address(addr: impl Into<String>) -> Self {
        Self {
            addresses: vec![addr.into()],
            ..Default::default()
        }
    }

    /// Add a topic0 filter (event signature hash).
    pub fn topic0(mut self, topic: impl Into<String>) -> Self {
        self.topic0_values.push(topic.into());
        self
    }

    /// Set the first block height considered.
    pub fn from_block(mut self, block: u64) -> Self {
        self.from_block = Some(block);
        self
    }

    /// Returns `true` if `address` matches this filter.
    pub fn matches_address(&self, address: &str) -> bool {
        self.addresses.is_empty()
            || self.addresses.iter().any(|a| a.eq_ignore_ascii_case(address))
    }

    /// Returns `true` if `topic0` matches this filter.
    pub fn matches_topic0(&self, topic0: &str) -> bool {
        self.topic0_values.is_empty()
            || self.topic0_values.iter().any(|t| t.eq_ignore_ascii_case(topic0))
    }

    /// Returns `true` if `height` is at or above the filter's start.
    pub fn matches_height(&self, height: u64) -> bool {
        self.from_block.map_or(true, |from| height >= from)
    }
}

/// Canonical storage form of a hex address: lowercase, `0x`-prefixed.
pub fn canonical_address(address: &str) -> String {
    lower_hex(address)
}

/// Canonical form of a 32-byte hash (block hash, topic): lowercase, `0x`-prefixed.
pub fn canonical_hash(hash: &str) -> String {
    lower_hex(hash)
}

fn lower_hex(value: &str) -> String {
    let hex = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    format!("0x{}", hex.to_ascii_lowercase())
}

// ─── Tests ────────────────────────────────────────────────────────────────────

//! Indexer configuration and state types.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::decoder::EventDecoder;
use crate::error::IndexerError;
use crate::retry::RetryConfig;
use crate::types::{canonical_address, canonical_hash, EventFilter};

/// Environment variable overriding [`IndexerConfig::start_height`].
pub const ENV_START_HEIGHT: &str = "LEDGERINDEX_START_HEIGHT";
/// Environment variable overriding [`IndexerConfig::contract_address`].
pub const ENV_CONTRACT_ADDRESS: &str = "LEDGERINDEX_CONTRACT_ADDRESS";
/// Environment variable overriding [`IndexerConfig::finality_depth`].
pub const ENV_FINALITY_DEPTH: &str = "LEDGERINDEX_FINALITY_DEPTH";

/// Configuration for an indexer instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Unique name for this indexer (used for checkpoint keys).
    pub id: String,
    /// Chain to index (e.g. `"moonbeam"`).
    pub chain: String,
    /// Anchor height. Indexing starts strictly above it.
    pub start_height: u64,
    /// Contract whose logs are extracted.
    pub contract_address: String,
    /// Accepted topic0 values. When empty, [`IndexerConfig::event_filter`]
    /// falls back to the decoder's known signatures.
    pub topic_filter: Vec<String>,
    /// Blocks behind the head before a block is considered final.
    /// Typical values: 12 (Ethereum PoS), 75 (Moonbeam), 1 (fast chains).
    pub finality_depth: u64,
    /// Maximum number of blocks per batch.
    pub batch_size: u64,
    /// Head polling interval while caught up (milliseconds).
    pub poll_interval_ms: u64,
    /// Timeout applied to each store call (milliseconds).
    pub store_timeout_ms: u64,
    /// Bounded retry applied to store calls.
    pub store_retry: RetryConfig,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            id: "default".into(),
            chain: "ethereum".into(),
            start_height: 0,
            contract_address: String::new(),
            topic_filter: Vec::new(),
            finality_depth: 12,
            batch_size: 1000,
            poll_interval_ms: 2000,
            store_timeout_ms: 10_000,
            store_retry: RetryConfig::default(),
        }
    }
}

impl IndexerConfig {
    /// Load a config from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, IndexerError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| IndexerError::Config(format!("{}: {e}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|e| IndexerError::Config(format!("{}: {e}", path.display())))
    }

    /// Apply `LEDGERINDEX_*` overrides from the process environment.
    pub fn apply_env(self) -> Result<Self, IndexerError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key/value lookup.
    pub fn apply_overrides<F>(mut self, lookup: F) -> Result<Self, IndexerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_START_HEIGHT) {
            self.start_height = parse_u64(ENV_START_HEIGHT, &v)?;
        }
        if let Some(v) = lookup(ENV_CONTRACT_ADDRESS) {
            self.contract_address = v;
        }
        if let Some(v) = lookup(ENV_FINALITY_DEPTH) {
            self.finality_depth = parse_u64(ENV_FINALITY_DEPTH, &v)?;
        }
        Ok(self)
    }

    /// Check the config is usable and normalize addresses and topics.
    pub fn validate(mut self) -> Result<Self, IndexerError> {
        if self.id.trim().is_empty() {
            return Err(IndexerError::Config("id must not be empty".into()));
        }
        if !is_hex_of_len(&self.contract_address, 40) {
            return Err(IndexerError::Config(format!(
                "contract_address '{}' is not a 20-byte hex address",
                self.contract_address
            )));
        }
        if let Some(bad) = self.topic_filter.iter().find(|t| !is_hex_of_len(t, 64)) {
            return Err(IndexerError::Config(format!(
                "topic_filter entry '{bad}' is not a 32-byte hex hash"
            )));
        }
        if self.batch_size == 0 {
            return Err(IndexerError::Config("batch_size must be at least 1".into()));
        }
        if self.store_timeout_ms == 0 {
            return Err(IndexerError::Config("store_timeout_ms must be at least 1".into()));
        }
        self.contract_address = canonical_address(&self.contract_address);
        self.topic_filter = self.topic_filter.iter().map(|t| canonical_hash(t)).collect();
        Ok(self)
    }

    /// The log filter: this contract, above the anchor, restricted to
    /// `topic_filter` or, when that is empty, to what `decoder` recognizes.
    pub fn event_filter<D: EventDecoder + ?Sized>(&self, decoder: &D) -> EventFilter {
        let mut filter = EventFilter::address(self.contract_address.clone())
            .from_block(self.start_height.saturating_add(1));
        filter.topic0_values = if self.topic_filter.is_empty() {
            decoder.known_topics().iter().map(|t| canonical_hash(t)).collect()
        } else {
            self.topic_filter.clone()
        };
        filter
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

fn parse_u64(key: &str, value: &str) -> Result<u64, IndexerError> {
    value
        .trim()
        .parse()
        .map_err(|e| IndexerError::Config(format!("{key}='{value}': {e}")))
}

fn is_hex_of_len(s: &str, len: usize) -> bool {
    let hex = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    hex.len() == len && hex.chars().all(|c| c.is_ascii_hexdigit())
}

/// Runtime state of the run loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexerState {
    /// Between batches.
    Idle,
    /// Waiting for the chain source.
    FetchingBatch,
    /// Decoding the batch into domain events.
    Extracting,
    /// Folding events against persisted state.
    Reconciling,
    /// Writing the batch and checkpoint.
    Committing,
    /// Discarding retracted blocks.
    RolledBack,
    /// Stopped on request.
    Stopped,
    /// Encountered an unrecoverable error.
    Halted,
}

impl std::fmt::Display for IndexerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::FetchingBatch => write!(f, "fetching-batch"),
            Self::Extracting => write!(f, "extracting"),
            Self::Reconciling => write!(f, "reconciling"),
            Self::Committing => write!(f, "committing"),
            Self::RolledBack => write!(f, "rolled-back"),
            Self::Stopped => write!(f, "stopped"),
            Self::Halted => write!(f, "halted"),
        }
    }
}

//! Fluent builder API for creating EVM indexers.
//!
//! # Example
//!
//! ```rust,no_run
//! use ledgerindex_evm::IndexerBuilder;
//!
//! let config = IndexerBuilder::new()
//!     .chain("moonbeam")
//!     .contract("0xaEdA429fba8C1e83488dCCCa9aC43a63aF2AC5E1")
//!     .start_height(3_000_000)
//!     .finality_depth(75)
//!     .batch_size(500)
//!     .build_config();
//! ```

use std::sync::Arc;

use ledgerindex_core::error::IndexerError;
use ledgerindex_core::index_loop::RunLoop;
use ledgerindex_core::indexer::IndexerConfig;
use ledgerindex_core::retry::RetryConfig;
use ledgerindex_core::store::LedgerStore;

use crate::decoder::{EvmEventDecoder, KnownEvent};
use crate::fetcher::EvmRpcClient;
use crate::http::HttpRpcClient;
use crate::source::RpcChainSource;

/// The run loop an [`IndexerBuilder`] produces.
pub type EvmRunLoop<C> = RunLoop<RpcChainSource<C>, EvmEventDecoder>;

/// Fluent builder for `IndexerConfig`.
#[derive(Default)]
pub struct IndexerBuilder {
    config: IndexerConfig,
}

impl IndexerBuilder {
    pub fn new() -> Self {
        Self {
            config: IndexerConfig::default(),
        }
    }

    /// Start from an existing config (e.g. loaded from a file).
    pub fn from_config(config: IndexerConfig) -> Self {
        Self { config }
    }

    /// Set the indexer ID (used for checkpoint keys).
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.config.id = id.into();
        self
    }

    /// Set the chain label.
    pub fn chain(mut self, chain: impl Into<String>) -> Self {
        self.config.chain = chain.into();
        self
    }

    /// Set the anchor height; processing starts at the next block.
    pub fn start_height(mut self, height: u64) -> Self {
        self.config.start_height = height;
        self
    }

    /// Set the contract whose logs are indexed.
    pub fn contract(mut self, address: impl Into<String>) -> Self {
        self.config.contract_address = address.into();
        self
    }

    /// Only index logs whose topic0 is one of these events.
    pub fn events(mut self, events: impl IntoIterator<Item = KnownEvent>) -> Self {
        self.config.topic_filter = events.into_iter().map(KnownEvent::topic0).collect();
        self
    }

    /// Set finality depth (blocks behind head before a block is final).
    pub fn finality_depth(mut self, depth: u64) -> Self {
        self.config.finality_depth = depth;
        self
    }

    /// Set the number of blocks per batch.
    pub fn batch_size(mut self, size: u64) -> Self {
        self.config.batch_size = size;
        self
    }

    /// Set live mode polling interval in milliseconds.
    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    /// Set the per-call store timeout in milliseconds.
    pub fn store_timeout_ms(mut self, ms: u64) -> Self {
        self.config.store_timeout_ms = ms;
        self
    }

    /// Set the retry policy for store calls.
    pub fn store_retry(mut self, retry: RetryConfig) -> Self {
        self.config.store_retry = retry;
        self
    }

    /// Build the `IndexerConfig`.
    pub fn build_config(self) -> IndexerConfig {
        self.config
    }

    /// Open a run loop reading from `client` and writing to `store`.
    pub async fn build_with_client<C: EvmRpcClient>(
        self,
        client: C,
        store: Arc<dyn LedgerStore>,
    ) -> Result<EvmRunLoop<C>, IndexerError> {
        let config = self.config.validate()?;
        let source = RpcChainSource::new(client, &config);
        RunLoop::open(config, source, EvmEventDecoder::new(), store).await
    }

    /// Open a run loop reading from the JSON-RPC endpoint at `rpc_url`.
    pub async fn build_http(
        self,
        rpc_url: &str,
        store: Arc<dyn LedgerStore>,
    ) -> Result<EvmRunLoop<HttpRpcClient>, IndexerError> {
        let client = HttpRpcClient::new(rpc_url)?;
        self.build_with_client(client, store).await
    }
}

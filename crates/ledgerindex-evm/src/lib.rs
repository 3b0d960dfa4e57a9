//! ledgerindex-evm — EVM event decoding, JSON-RPC chain source and builder.

pub mod builder;
pub mod decoder;
pub mod fetcher;
pub mod fingerprint;
pub mod http;
pub mod normalizer;
pub mod source;

pub use builder::{EvmRunLoop, IndexerBuilder};
pub use decoder::{EvmEventDecoder, KnownEvent, PAYMENT_RECEIVED_SIGNATURE, TRANSFER_SIGNATURE};
pub use fetcher::{EvmFetcher, EvmRpcClient, RpcBlock, RpcLog};
pub use http::HttpRpcClient;
pub use source::RpcChainSource;

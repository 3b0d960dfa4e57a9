//! EVM block and log fetcher.
//!
//! Uses JSON-RPC `eth_getBlockByNumber` and `eth_getLogs` with range batching
//! to fetch the logs of a height range together with the headers and
//! transaction senders the extractor needs.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use ledgerindex_core::error::IndexerError;
use ledgerindex_core::types::{BlockSummary, EventFilter, RawLog, SourceBlock, TxRef};

/// A log as returned by `eth_getLogs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcLog {
    pub address: String,
    pub topics: Vec<String>,
    #[serde(rename = "data")]
    pub data: String,
    #[serde(rename = "blockNumber")]
    pub block_number: String,
    #[serde(rename = "blockHash")]
    pub block_hash: String,
    #[serde(rename = "transactionHash")]
    pub tx_hash: String,
    #[serde(rename = "logIndex")]
    pub log_index: String,
    #[serde(rename = "removed", default)]
    pub removed: Option<bool>,
}

impl RpcLog {
    pub fn block_number_u64(&self) -> Option<u64> {
        parse_hex_u64(&self.block_number)
    }

    pub fn log_index_u32(&self) -> Option<u32> {
        parse_hex_u64(&self.log_index).and_then(|i| u32::try_from(i).ok())
    }

    /// Returns `true` if this log was removed by a reorg.
    pub fn is_removed(&self) -> bool {
        self.removed.unwrap_or(false)
    }
}

/// A block header plus the sender of each of its transactions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcBlock {
    pub header: BlockSummary,
    pub transactions: Vec<TxRef>,
}

/// Trait for fetching EVM data from a JSON-RPC provider.
#[async_trait]
pub trait EvmRpcClient: Send + Sync {
    async fn get_block_number(&self) -> Result<u64, IndexerError>;
    async fn get_block(&self, number: u64) -> Result<Option<RpcBlock>, IndexerError>;
    async fn get_logs(
        &self,
        from: u64,
        to: u64,
        filter: &EventFilter,
    ) -> Result<Vec<RpcLog>, IndexerError>;
}

#[async_trait]
impl<C: EvmRpcClient + ?Sized> EvmRpcClient for std::sync::Arc<C> {
    async fn get_block_number(&self) -> Result<u64, IndexerError> {
        (**self).get_block_number().await
    }

    async fn get_block(&self, number: u64) -> Result<Option<RpcBlock>, IndexerError> {
        (**self).get_block(number).await
    }

    async fn get_logs(
        &self,
        from: u64,
        to: u64,
        filter: &EventFilter,
    ) -> Result<Vec<RpcLog>, IndexerError> {
        (**self).get_logs(from, to, filter).await
    }
}

/// EVM fetcher that wraps an `EvmRpcClient` and adds batching logic.
pub struct EvmFetcher<C> {
    client: C,
    max_log_range: u64,
}

impl<C: EvmRpcClient> EvmFetcher<C> {
    /// Default widest block range per `eth_getLogs` call.
    pub const DEFAULT_MAX_LOG_RANGE: u64 = 2_000;

    pub fn new(client: C) -> Self {
        Self {
            client,
            max_log_range: Self::DEFAULT_MAX_LOG_RANGE,
        }
    }

    /// Cap the block span of each `eth_getLogs` request.
    pub fn with_max_log_range(mut self, range: u64) -> Self {
        self.max_log_range = range.max(1);
        self
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Fetch the current chain head block number.
    pub async fn head_block_number(&self) -> Result<u64, IndexerError> {
        self.client.get_block_number().await
    }

    /// Fetch a block by number. A block the node does not know yet is a
    /// source error: the height was below the head a moment ago.
    pub async fn block(&self, number: u64) -> Result<RpcBlock, IndexerError> {
        self.client
            .get_block(number)
            .await?
            .ok_or_else(|| IndexerError::Source(format!("block {number} not available")))
    }

    /// Fetch just the header at `number`.
    pub async fn header(&self, number: u64) -> Result<BlockSummary, IndexerError> {
        Ok(self.block(number).await?.header)
    }

    /// Fetch all logs in `[from, to]` matching the filter, split into
    /// requests of at most `max_log_range` blocks.
    pub async fn logs(
        &self,
        from: u64,
        to: u64,
        filter: &EventFilter,
    ) -> Result<Vec<RpcLog>, IndexerError> {
        if to < from {
            return Ok(vec![]);
        }
        let mut all_logs = Vec::new();
        let mut start = from;
        while start <= to {
            let end = start.saturating_add(self.max_log_range - 1).min(to);
            let chunk = self.client.get_logs(start, end, filter).await?;
            all_logs.extend(chunk);
            if end == u64::MAX {
                break;
            }
            start = end + 1;
        }
        Ok(all_logs)
    }

    /// Fetch the blocks of `[from, to]` that carry matching logs.
    ///
    /// Headers are also fetched for every height in `always`, so the caller
    /// gets those blocks back even when they hold no logs. Removed logs are
    /// dropped. A log whose `blockHash` disagrees with the fetched header
    /// means the chain moved mid-fetch and is reported as a source error.
    pub async fn fetch_range(
        &self,
        from: u64,
        to: u64,
        filter: &EventFilter,
        always: &BTreeSet<u64>,
    ) -> Result<Vec<SourceBlock>, IndexerError> {
        let mut by_height: BTreeMap<u64, Vec<RpcLog>> = BTreeMap::new();
        for log in self.logs(from, to, filter).await? {
            if log.is_removed() {
                continue;
            }
            let height = log.block_number_u64().ok_or_else(|| {
                IndexerError::Source(format!("log has bad blockNumber '{}'", log.block_number))
            })?;
            if height < from || height > to {
                continue;
            }
            by_height.entry(height).or_default().push(log);
        }
        for h in always.range(from..=to) {
            by_height.entry(*h).or_default();
        }

        let mut blocks = Vec::with_capacity(by_height.len());
        for (height, logs) in by_height {
            let block = self.block(height).await?;
            blocks.push(assemble_block(block, logs)?);
        }
        Ok(blocks)
    }
}

/// Join a fetched block with its logs.
fn assemble_block(block: RpcBlock, logs: Vec<RpcLog>) -> Result<SourceBlock, IndexerError> {
    let height = block.header.number;
    let senders: HashMap<String, &TxRef> = block
        .transactions
        .iter()
        .map(|tx| (tx.hash.to_ascii_lowercase(), tx))
        .collect();

    let mut raw_logs = Vec::with_capacity(logs.len());
    for log in logs {
        if !log.block_hash.eq_ignore_ascii_case(&block.header.hash) {
            return Err(IndexerError::Source(format!(
                "log at block {height} has blockHash {} but header hash is {}",
                log.block_hash, block.header.hash
            )));
        }
        let log_index = log.log_index_u32().ok_or_else(|| {
            IndexerError::malformed(height, format!("bad logIndex '{}'", log.log_index))
        })?;
        let data = decode_hex_data(&log.data)
            .map_err(|e| IndexerError::malformed(height, format!("log {log_index} data: {e}")))?;
        let transaction = senders
            .get(&log.tx_hash.to_ascii_lowercase())
            .map(|tx| (*tx).clone());
        raw_logs.push(RawLog {
            address: log.address,
            topics: log.topics,
            data,
            log_index,
            transaction,
        });
    }
    raw_logs.sort_by_key(|l| l.log_index);

    Ok(SourceBlock {
        header: block.header,
        logs: raw_logs,
    })
}

/// Parse a hex-encoded quantity (with or without `0x`).
pub fn parse_hex_u64(s: &str) -> Option<u64> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(s, 16).ok()
}

/// Decode a `0x`-prefixed hex byte string.
pub fn decode_hex_data(s: &str) -> Result<Vec<u8>, hex::FromHexError> {
    hex::decode(s.strip_prefix("0x").unwrap_or(s))
}

/// Convert an `eth_getBlockByNumber` response (with full transactions) to an
/// [`RpcBlock`]. Returns `None` for `null` or a response missing header fields.
pub fn block_from_json(v: &Value) -> Option<RpcBlock> {
    let header = BlockSummary {
        number: parse_hex_u64(v["number"].as_str()?)?,
        hash: v["hash"].as_str()?.to_string(),
        parent_hash: v["parentHash"].as_str()?.to_string(),
        timestamp: i64::try_from(parse_hex_u64(v["timestamp"].as_str()?)?).ok()?,
    };
    let transactions = v["transactions"]
        .as_array()
        .map(|txs| {
            txs.iter()
                .filter_map(|tx| {
                    Some(TxRef {
                        hash: tx["hash"].as_str()?.to_string(),
                        from: tx["from"].as_str()?.to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    Some(RpcBlock {
        header,
        transactions,
    })
}

/// The `eth_getLogs` filter object for `[from, to]`.
pub fn log_filter_json(from: u64, to: u64, filter: &EventFilter) -> Value {
    let mut obj = json!({
        "fromBlock": format!("0x{from:x}"),
        "toBlock": format!("0x{to:x}"),
    });
    if !filter.addresses.is_empty() {
        obj["address"] = json!(filter.addresses);
    }
    if !filter.topic0_values.is_empty() {
        obj["topics"] = json!([filter.topic0_values]);
    }
    obj
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn rpc_log(height: u64, hash: &str, index: u32, tx: &str) -> RpcLog {
        RpcLog {
            address: "0xc0ffee".into(),
            topics: vec!["0xtopic".into()],
            data: "0x0a".into(),
            block_number: format!("0x{height:x}"),
            block_hash: hash.into(),
            tx_hash: tx.into(),
            log_index: format!("0x{index:x}"),
            removed: None,
        }
    }

    fn rpc_block(height: u64) -> RpcBlock {
        RpcBlock {
            header: BlockSummary {
                number: height,
                hash: format!("0xh{height}"),
                parent_hash: format!("0xh{}", height.saturating_sub(1)),
                timestamp: 1_700_000_000 + height as i64,
            },
            transactions: vec![TxRef {
                hash: format!("0xtx{height}"),
                from: "0xsender".into(),
            }],
        }
    }

    #[derive(Default)]
    struct FakeClient {
        logs: Vec<RpcLog>,
        log_calls: Mutex<Vec<(u64, u64)>>,
    }

    #[async_trait]
    impl EvmRpcClient for FakeClient {
        async fn get_block_number(&self) -> Result<u64, IndexerError> {
            Ok(100)
        }

        async fn get_block(&self, number: u64) -> Result<Option<RpcBlock>, IndexerError> {
            Ok((number <= 100).then(|| rpc_block(number)))
        }

        async fn get_logs(
            &self,
            from: u64,
            to: u64,
            _filter: &EventFilter,
        ) -> Result<Vec<RpcLog>, IndexerError> {
            self.log_calls.lock().unwrap().push((from, to));
            Ok(self
                .logs
                .iter()
                .filter(|l| (from..=to).contains(&l.block_number_u64().unwrap()))
                .cloned()
                .collect())
        }
    }

    #[test]
    fn parse_hex_u64_basic() {
        assert_eq!(parse_hex_u64("0x1"), Some(1));
        assert_eq!(parse_hex_u64("0xff"), Some(255));
        assert_eq!(parse_hex_u64("1234"), Some(0x1234));
        assert_eq!(parse_hex_u64("0xzz"), None);
    }

    #[test]
    fn rpc_log_fields() {
        let log = rpc_log(5_000_000_000, "0xh", 5, "0xtx");
        assert_eq!(log.block_number_u64(), Some(5_000_000_000));
        assert_eq!(log.log_index_u32(), Some(5));
        assert!(!log.is_removed());
    }

    #[test]
    fn rpc_log_deserializes_node_json() {
        let v = json!({
            "address": "0xaeda429fba8c1e83488dccca9ac43a63af2ac5e1",
            "topics": ["0x7f308a618b5e1b09db055d62fa8ee5afe9d78d2a8dd739cb587b7b7b2092f16b"],
            "data": "0x",
            "blockNumber": "0x10",
            "blockHash": "0xabc",
            "transactionHash": "0xdef",
            "logIndex": "0x0",
            "transactionIndex": "0x0"
        });
        let log: RpcLog = serde_json::from_value(v).unwrap();
        assert_eq!(log.block_number_u64(), Some(16));
        assert_eq!(log.removed, None);
    }

    #[test]
    fn block_from_json_reads_senders() {
        let v = json!({
            "number": "0x2a",
            "hash": "0xabc",
            "parentHash": "0xabb",
            "timestamp": "0x6553f100",
            "transactions": [
                { "hash": "0xt1", "from": "0xa" },
                { "hash": "0xt2", "from": "0xb" }
            ]
        });
        let block = block_from_json(&v).unwrap();
        assert_eq!(block.header.number, 42);
        assert_eq!(block.header.timestamp, 0x6553f100);
        assert_eq!(block.transactions.len(), 2);
        assert_eq!(block.transactions[1].from, "0xb");
        assert!(block_from_json(&Value::Null).is_none());
    }

    #[test]
    fn log_filter_json_shape() {
        let filter = EventFilter::address("0xc0ffee").topic0("0xtopic");
        let v = log_filter_json(16, 31, &filter);
        assert_eq!(v["fromBlock"], "0x10");
        assert_eq!(v["toBlock"], "0x1f");
        assert_eq!(v["address"], json!(["0xc0ffee"]));
        assert_eq!(v["topics"], json!([["0xtopic"]]));

        let open = log_filter_json(1, 1, &EventFilter::default());
        assert!(open.get("address").is_none());
        assert!(open.get("topics").is_none());
    }

    #[tokio::test]
    async fn logs_are_split_into_ranges() {
        let fetcher = EvmFetcher::new(FakeClient::default()).with_max_log_range(10);
        fetcher.logs(1, 25, &EventFilter::default()).await.unwrap();
        let calls = fetcher.client().log_calls.lock().unwrap().clone();
        assert_eq!(calls, vec![(1, 10), (11, 20), (21, 25)]);
    }

    #[tokio::test]
    async fn fetch_range_groups_logs_and_attaches_senders() {
        let mut removed = rpc_log(12, "0xh12", 0, "0xtx12");
        removed.removed = Some(true);
        let client = FakeClient {
            logs: vec![
                rpc_log(11, "0xh11", 3, "0xtx11"),
                rpc_log(11, "0xh11", 1, "0xtx11"),
                removed,
                rpc_log(14, "0xh14", 0, "0xunknown"),
            ],
            ..Default::default()
        };
        let fetcher = EvmFetcher::new(client);
        let always: BTreeSet<u64> = [15].into_iter().collect();
        let blocks = fetcher
            .fetch_range(10, 15, &EventFilter::default(), &always)
            .await
            .unwrap();

        let heights: Vec<u64> = blocks.iter().map(|b| b.number()).collect();
        assert_eq!(heights, vec![11, 14, 15]);
        assert_eq!(blocks[0].logs.len(), 2);
        assert_eq!(blocks[0].logs[0].log_index, 1);
        assert_eq!(blocks[0].logs[0].data, vec![0x0a]);
        assert_eq!(blocks[0].logs[0].transaction.as_ref().unwrap().from, "0xsender");
        assert!(blocks[1].logs[0].transaction.is_none());
        assert!(blocks[2].logs.is_empty());
    }

    #[tokio::test]
    async fn hash_mismatch_is_a_source_error() {
        let client = FakeClient {
            logs: vec![rpc_log(11, "0xstale", 0, "0xtx11")],
            ..Default::default()
        };
        let err = EvmFetcher::new(client)
            .fetch_range(10, 12, &EventFilter::default(), &BTreeSet::new())
            .await
            .unwrap_err();
        assert!(matches!(err, IndexerError::Source(_)));
    }

    #[tokio::test]
    async fn bad_log_data_is_malformed() {
        let mut log = rpc_log(11, "0xh11", 0, "0xtx11");
        log.data = "0xnothex".into();
        let client = FakeClient {
            logs: vec![log],
            ..Default::default()
        };
        let err = EvmFetcher::new(client)
            .fetch_range(10, 12, &EventFilter::default(), &BTreeSet::new())
            .await
            .unwrap_err();
        assert!(err.is_malformed());
    }
}

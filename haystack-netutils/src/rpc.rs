//! Daemon RPC wire types and their conversion into scan engine primitives

use serde::{Deserialize, Serialize};

use haystack_sync::error::NodeError;
use haystack_sync::primitives::{
    Block, BlockHash, BlockHeader, GlobalIndex, OneTimeKey, Transaction, TxId,
};

#[derive(Debug, Serialize)]
pub(crate) struct JsonRpcRequest<P> {
    pub jsonrpc: &'static str,
    pub id: &'static str,
    pub method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<P>,
}

impl<P> JsonRpcRequest<P> {
    pub(crate) fn new(method: &'static str, params: Option<P>) -> Self {
        Self {
            jsonrpc: "2.0",
            id: "0",
            method,
            params,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct JsonRpcResponse<R> {
    pub result: Option<R>,
    pub error: Option<JsonRpcError>,
}

impl<R> JsonRpcResponse<R> {
    pub(crate) fn into_result(self, method: &str) -> Result<R, NodeError> {
        if let Some(error) = self.error {
            return Err(NodeError::Protocol(format!(
                "{method} failed with code {}: {}",
                error.code, error.message
            )));
        }
        self.result
            .ok_or_else(|| NodeError::Protocol(format!("{method} returned no result")))
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct GetBlockParams {
    pub height: u64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GetInfoResponse {
    pub height: u64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RpcBlockHeader {
    pub height: u64,
    pub hash: String,
    pub prev_hash: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GetBlockResult {
    pub block_header: RpcBlockHeader,
    // omitted by the daemon when the block only holds the coinbase
    pub tx_hashes: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
pub(crate) struct GetTransactionsRequest<'a> {
    pub txs_hashes: &'a [String],
    pub decode_as_json: bool,
    pub prune: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GetTransactionsResponse {
    pub txs: Option<Vec<TxEntry>>,
    #[serde(default)]
    pub missed_tx: Vec<String>,
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TxEntry {
    pub tx_hash: String,
    #[serde(default)]
    pub block_height: u64,
    #[serde(default)]
    pub block_timestamp: u64,
    pub as_json: String,
}

#[derive(Debug, Deserialize)]
struct TxJson {
    #[serde(default)]
    vin: Vec<TxInput>,
    #[serde(default)]
    vout: Vec<TxOutput>,
}

#[derive(Debug, Deserialize)]
struct TxInput {
    // coinbase inputs carry `gen` instead
    key: Option<KeyInput>,
}

#[derive(Debug, Deserialize)]
struct KeyInput {
    key_offsets: Vec<u64>,
}

#[derive(Debug, Deserialize)]
struct TxOutput {
    target: OutputTarget,
}

#[derive(Debug, Deserialize)]
struct OutputTarget {
    key: Option<String>,
    tagged_key: Option<TaggedKey>,
}

#[derive(Debug, Deserialize)]
struct TaggedKey {
    key: String,
}

fn protocol(context: &str, e: impl std::fmt::Display) -> NodeError {
    NodeError::Protocol(format!("{context}: {e}"))
}

/// Ring member global indexes from relative key offsets. The first offset is absolute and each
/// following one is relative to the previous member.
pub fn ring_members(key_offsets: &[u64]) -> Vec<GlobalIndex> {
    key_offsets
        .iter()
        .scan(0u64, |global_index, offset| {
            *global_index = global_index.saturating_add(*offset);
            Some(*global_index)
        })
        .collect()
}

pub(crate) fn parse_block(result: GetBlockResult) -> Result<Block, NodeError> {
    let header = BlockHeader::from_parts(
        result.block_header.height,
        BlockHash::from_hex(&result.block_header.hash).map_err(|e| protocol("block hash", e))?,
        BlockHash::from_hex(&result.block_header.prev_hash)
            .map_err(|e| protocol("block prev_hash", e))?,
    );
    let tx_hashes = result
        .tx_hashes
        .map(|hashes| {
            hashes
                .iter()
                .map(|hash| TxId::from_hex(hash).map_err(|e| protocol("block tx hash", e)))
                .collect::<Result<Vec<_>, _>>()
        })
        .transpose()?;

    Ok(Block::from_parts(header, tx_hashes))
}

pub(crate) fn parse_transaction(entry: TxEntry) -> Result<Transaction, NodeError> {
    let hash = TxId::from_hex(&entry.tx_hash).map_err(|e| protocol("tx hash", e))?;
    let tx_json: TxJson =
        serde_json::from_str(&entry.as_json).map_err(|e| protocol("tx as_json", e))?;

    let inputs = tx_json
        .vin
        .iter()
        .filter_map(|input| input.key.as_ref())
        .flat_map(|key| ring_members(&key.key_offsets))
        .collect();
    let outputs = tx_json
        .vout
        .iter()
        .map(|output| {
            let key = output
                .target
                .key
                .as_deref()
                .or(output.target.tagged_key.as_ref().map(|tagged| tagged.key.as_str()))
                .ok_or_else(|| NodeError::Protocol(format!("output of {hash} has no key")))?;
            OneTimeKey::from_hex(key).map_err(|e| protocol("output key", e))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Transaction::from_parts(
        hash,
        entry.block_height,
        entry.block_timestamp,
        inputs,
        outputs,
    ))
}

pub(crate) fn parse_transactions(
    response: GetTransactionsResponse,
) -> Result<Vec<Transaction>, NodeError> {
    if !response.missed_tx.is_empty() {
        return Err(NodeError::Protocol(format!(
            "node is missing {} requested transactions",
            response.missed_tx.len()
        )));
    }
    let Some(txs) = response.txs else {
        return Err(NodeError::Protocol(format!(
            "get_transactions returned no txs, status {}. The request may be too large.",
            response.status.as_deref().unwrap_or("unknown")
        )));
    };

    txs.into_iter().map(parse_transaction).collect()
}

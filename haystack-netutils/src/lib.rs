//! Haystack-Netutils
//!
//! This crate provides the `DaemonConnector` struct, a [`LedgerNode`] that talks to a Monero
//! daemon over its HTTP and JSON-RPC interface.

#![warn(missing_docs)]
use http::Uri;
use serde::{de::DeserializeOwned, Serialize};

use haystack_sync::error::NodeError;
use haystack_sync::primitives::{Block, Transaction, TxId};
use haystack_sync::traits::LedgerNode;

use crate::rpc::{
    GetBlockParams, GetBlockResult, GetInfoResponse, GetTransactionsRequest,
    GetTransactionsResponse, JsonRpcRequest, JsonRpcResponse,
};

pub mod rpc;

/// The connector, containing the URI of the daemon and a pooled HTTP client.
#[derive(Debug, Clone)]
pub struct DaemonConnector {
    uri: Uri,
    client: reqwest::Client,
}

impl DaemonConnector {
    /// Takes a URI, and wraps in a DaemonConnector
    pub fn new(uri: Uri) -> Self {
        Self {
            uri,
            client: reqwest::Client::new(),
        }
    }

    /// Connector for the node configured in `config`.
    pub fn from_config(config: &haystack_config::HaystackConfig) -> Self {
        Self::new(config.node_uri.clone())
    }

    /// The URI to connect to
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    fn url(&self, endpoint: &str) -> String {
        format!(
            "{}://{}{}",
            self.uri.scheme_str().unwrap_or("http"),
            self.uri.authority().map(|a| a.as_str()).unwrap_or_default(),
            endpoint
        )
    }

    async fn get_json<R: DeserializeOwned>(&self, endpoint: &str) -> Result<R, NodeError> {
        let response = self
            .client
            .get(self.url(endpoint))
            .send()
            .await
            .map_err(transport)?;
        decode(response).await
    }

    async fn post_json<B: Serialize, R: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<R, NodeError> {
        let response = self
            .client
            .post(self.url(endpoint))
            .json(body)
            .send()
            .await
            .map_err(transport)?;
        decode(response).await
    }

    async fn json_rpc<P: Serialize, R: DeserializeOwned>(
        &self,
        method: &'static str,
        params: Option<P>,
    ) -> Result<R, NodeError> {
        let response: JsonRpcResponse<R> = self
            .post_json("/json_rpc", &JsonRpcRequest::new(method, params))
            .await?;
        response.into_result(method)
    }
}

fn transport(e: reqwest::Error) -> NodeError {
    if e.is_decode() {
        NodeError::Protocol(e.to_string())
    } else {
        NodeError::Unreachable(e.to_string())
    }
}

async fn decode<R: DeserializeOwned>(response: reqwest::Response) -> Result<R, NodeError> {
    let status = response.status();
    if !status.is_success() {
        return Err(NodeError::Protocol(format!("daemon answered HTTP {status}")));
    }
    let bytes = response.bytes().await.map_err(transport)?;
    serde_json::from_slice(&bytes).map_err(|e| NodeError::Protocol(format!("bad json: {e}")))
}

impl LedgerNode for DaemonConnector {
    async fn get_chain_height(&self) -> Result<u64, NodeError> {
        let info: GetInfoResponse = self.get_json("/get_info").await?;
        Ok(info.height)
    }

    async fn get_block(&self, height: u64) -> Result<Block, NodeError> {
        let result: GetBlockResult = self
            .json_rpc("get_block", Some(GetBlockParams { height }))
            .await?;
        rpc::parse_block(result)
    }

    async fn get_transactions(&self, tx_hashes: Vec<TxId>) -> Result<Vec<Transaction>, NodeError> {
        let txs_hashes: Vec<String> = tx_hashes.iter().map(TxId::to_hex).collect();
        let response: GetTransactionsResponse = self
            .post_json(
                "/get_transactions",
                &GetTransactionsRequest {
                    txs_hashes: &txs_hashes,
                    decode_as_json: true,
                    prune: true,
                },
            )
            .await?;
        rpc::parse_transactions(response)
    }

    // restricted daemons refuse `sync_info`
    async fn is_restricted(&self) -> Result<bool, NodeError> {
        let response = self
            .client
            .post(self.url("/json_rpc"))
            .json(&JsonRpcRequest::<()>::new("sync_info", None))
            .send()
            .await
            .map_err(transport)?;
        if !response.status().is_success() {
            return Ok(true);
        }
        let restricted = match response.json::<JsonRpcResponse<serde_json::Value>>().await {
            Ok(body) => body.into_result("sync_info").is_err(),
            Err(_) => true,
        };
        tracing::debug!("Daemon restricted RPC: {}", restricted);

        Ok(restricted)
    }
}

//! Bitcoin Core JSON-RPC client.
//!
//! The daemon needs exactly two calls: `getblocktemplate` to derive work and
//! `submitblock` to publish a solved block. Requests go over HTTP with basic
//! auth in the JSON-RPC 1.0 framing Bitcoin Core expects. The client is
//! cheaply cloneable and serializes nothing itself; callers decide how to
//! schedule requests.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::config::RpcConfig;

/// Errors from talking to the node.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Transport-level failure (connection refused, timeout, bad HTTP)
    #[error("rpc transport error: {0}")]
    Http(#[from] reqwest::Error),

    /// The node answered with a JSON-RPC error object
    #[error("node error: {0}")]
    Node(String),

    /// The node answered with a null result where one was required
    #[error("node returned an empty result for {0}")]
    EmptyResult(&'static str),
}

/// A `getblocktemplate` reply, reduced to the fields the pool consumes.
#[derive(Debug, Clone, Deserialize)]
pub struct GetBlockTemplate {
    pub height: u64,
    pub previousblockhash: String,
    pub coinbasevalue: u64,
    #[serde(default)]
    pub default_witness_commitment: Option<String>,
    pub bits: String,
    pub target: String,
    pub mintime: u32,
    pub curtime: u32,
    pub version: i32,
    #[serde(default)]
    pub transactions: Vec<GbtTransaction>,
}

/// One non-coinbase transaction from the template.
#[derive(Debug, Clone, Deserialize)]
pub struct GbtTransaction {
    /// Raw transaction, hex
    pub data: String,

    /// Transaction id, display (big-endian) hex
    pub txid: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<Value>,
}

/// HTTP client for the node's JSON-RPC interface.
#[derive(Debug, Clone)]
pub struct CoreRpcClient {
    http: reqwest::Client,
    url: String,
    user: String,
    password: String,
}

impl CoreRpcClient {
    pub fn new(config: &RpcConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_s))
            .build()?;

        Ok(Self {
            http,
            url: config.url.clone(),
            user: config.user.clone(),
            password: config.password.clone(),
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<Option<T>, RpcError> {
        let payload = json!({
            "jsonrpc": "1.0",
            "id": "tanuki-pool",
            "method": method,
            "params": params,
        });

        let response: RpcResponse<T> = self
            .http
            .post(&self.url)
            .basic_auth(&self.user, Some(&self.password))
            .json(&payload)
            .send()
            .await?
            .json()
            .await?;

        match response.error {
            Some(e) if !e.is_null() => Err(RpcError::Node(e.to_string())),
            _ => Ok(response.result),
        }
    }

    /// Fetch a block template with the segwit rule, as every post-2017 node
    /// requires.
    pub async fn get_block_template(&self) -> Result<GetBlockTemplate, RpcError> {
        self.call("getblocktemplate", json!([{"rules": ["segwit"]}]))
            .await?
            .ok_or(RpcError::EmptyResult("getblocktemplate"))
    }

    /// Submit a serialized block. Returns `None` on acceptance, or the
    /// node's rejection reason string.
    pub async fn submit_block(&self, block_hex: &str) -> Result<Option<String>, RpcError> {
        self.call::<String>("submitblock", json!([block_hex])).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_template_reply() {
        let raw = r#"{
            "height": 2500,
            "previousblockhash": "4ec23ba63b4bd7c96b372845633f2a4d5f45be24d98b2a8a44e9bbab36caf00f",
            "coinbasevalue": 625000000,
            "default_witness_commitment": "6a24aa21a9ede2f61c3f71d1defd3fa999dfa36953755c690689799962b48bebd836974e8cf9",
            "bits": "207fffff",
            "target": "7fffff0000000000000000000000000000000000000000000000000000000000",
            "mintime": 1700000000,
            "curtime": 1700000600,
            "version": 536870912,
            "transactions": [
                {"data": "0100", "txid": "aa00000000000000000000000000000000000000000000000000000000000000", "fee": 100}
            ],
            "capabilities": ["proposal"]
        }"#;

        let gbt: GetBlockTemplate = serde_json::from_str(raw).unwrap();
        assert_eq!(gbt.height, 2500);
        assert_eq!(gbt.coinbasevalue, 625_000_000);
        assert_eq!(gbt.version, 0x20000000);
        assert_eq!(gbt.transactions.len(), 1);
        assert!(gbt.default_witness_commitment.is_some());
    }

    #[test]
    fn test_parse_template_without_optionals() {
        let raw = r#"{
            "height": 1,
            "previousblockhash": "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206",
            "coinbasevalue": 5000000000,
            "bits": "207fffff",
            "target": "7fffff0000000000000000000000000000000000000000000000000000000000",
            "mintime": 1296688602,
            "curtime": 1296688702,
            "version": 536870912
        }"#;

        let gbt: GetBlockTemplate = serde_json::from_str(raw).unwrap();
        assert!(gbt.default_witness_commitment.is_none());
        assert!(gbt.transactions.is_empty());
    }

    #[test]
    fn test_rpc_error_surfaces() {
        let raw = r#"{"result": null, "error": {"code": -32601, "message": "Method not found"}, "id": "x"}"#;
        let response: RpcResponse<String> = serde_json::from_str(raw).unwrap();
        assert!(response.result.is_none());
        assert!(response.error.is_some());
    }
}

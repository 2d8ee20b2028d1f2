//! Node RPC boundary.
//!
//! The only component allowed to speak to a chain node. Exposes the three
//! calls the Block Normalizer (C4) and Reorg Resolver (C6) need, and nothing
//! else — no mempool polling, no wallet RPCs.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use crate::config::RpcConfig;
use crate::errors::IndexerError;

#[async_trait]
pub trait NodeRpcClient: Send + Sync {
    async fn get_block_count(&self) -> Result<u64, IndexerError>;
    async fn get_block_hash(&self, height: u64) -> Result<String, IndexerError>;
    /// Raw block bytes (verbosity 0), hex-decoded.
    async fn get_block_raw(&self, block_hash: &str) -> Result<Vec<u8>, IndexerError>;
}

pub struct JsonRpcClient {
    url: String,
    user: String,
    password: String,
    max_retries: u32,
    http: reqwest::Client,
}

impl JsonRpcClient {
    pub fn new(cfg: &RpcConfig) -> Result<Self, IndexerError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .map_err(|e| IndexerError::transient("building rpc http client", e))?;

        Ok(Self {
            url: cfg.url.clone(),
            user: cfg.user.clone(),
            password: cfg.password.clone(),
            max_retries: cfg.max_retries,
            http,
        })
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, IndexerError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self.call_once(method, params.clone()).await;
            match result {
                Ok(v) => return Ok(v),
                Err(e) if attempt < self.max_retries => {
                    crate::metrics::increment_rpc_errors();
                    tracing::warn!(method, attempt, error = %e, "rpc call failed, retrying");
                    tokio::time::sleep(Duration::from_millis(200 * attempt as u64)).await;
                }
                Err(e) => {
                    crate::metrics::increment_rpc_errors();
                    return Err(e);
                }
            }
        }
    }

    async fn call_once(&self, method: &str, params: Value) -> Result<Value, IndexerError> {
        let body = serde_json::json!({
            "jsonrpc": "1.0",
            "id": "utxoshard",
            "method": method,
            "params": params,
        });

        let response = self
            .http
            .post(&self.url)
            .basic_auth(&self.user, Some(&self.password))
            .json(&body)
            .send()
            .await
            .map_err(|e| IndexerError::transient(format!("rpc {method}"), e))?;

        let json: Value = response
            .json()
            .await
            .map_err(|e| IndexerError::transient(format!("rpc {method} decode"), e))?;

        if let Some(err) = json.get("error") {
            if !err.is_null() {
                return Err(IndexerError::transient(
                    format!("rpc {method}"),
                    std::io::Error::other(err.to_string()),
                ));
            }
        }

        json.get("result")
            .cloned()
            .ok_or_else(|| IndexerError::corrupt("rpc", method, "missing result field"))
    }
}

#[async_trait]
impl NodeRpcClient for JsonRpcClient {
    async fn get_block_count(&self) -> Result<u64, IndexerError> {
        let result = self.call("getblockcount", serde_json::json!([])).await?;
        result
            .as_u64()
            .ok_or_else(|| IndexerError::corrupt("rpc", "getblockcount", "not a u64"))
    }

    async fn get_block_hash(&self, height: u64) -> Result<String, IndexerError> {
        let result = self.call("getblockhash", serde_json::json!([height])).await?;
        result
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| IndexerError::corrupt("rpc", "getblockhash", "not a string"))
    }

    async fn get_block_raw(&self, block_hash: &str) -> Result<Vec<u8>, IndexerError> {
        let result = self.call("getblock", serde_json::json!([block_hash, 0])).await?;
        let hex_str = result
            .as_str()
            .ok_or_else(|| IndexerError::corrupt("rpc", "getblock", "not a string"))?;
        hex::decode(hex_str)
            .map_err(|e| IndexerError::corrupt("rpc", "getblock", format!("invalid hex: {e}")))
    }
}

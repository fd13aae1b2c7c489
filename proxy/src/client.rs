// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::time::Duration;

use rpc_core::block::parse_quantity;
use rpc_core::jsonrpc::{CallId, RpcCall, RpcResponse};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChainClientError {
    #[error("chain client transport error")]
    Transport {
        #[source]
        source: reqwest::Error,
    },
    #[error("chain client returned rpc error: {0}")]
    Rpc(rpc_core::error::RpcError),
    #[error("chain client returned unusable result: {reason}")]
    BadResult { reason: String },
}

/// Thin JSON-RPC client for the block-sync node. Only used as a scalar
/// source (block number, gas price) by the last-value caches.
pub struct ChainClient {
    url: String,
    http: reqwest::Client,
}

impl ChainClient {
    pub fn new(url: String, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { url, http })
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, ChainClientError> {
        let call = RpcCall::new(CallId::Number(1), method, Some(params));
        let response: RpcResponse = self
            .http
            .post(&self.url)
            .json(&call)
            .send()
            .await
            .map_err(|source| ChainClientError::Transport { source })?
            .json()
            .await
            .map_err(|source| ChainClientError::Transport { source })?;
        if let Some(error) = response.error {
            return Err(ChainClientError::Rpc(error));
        }
        response.result.ok_or(ChainClientError::BadResult {
            reason: "missing result".to_string(),
        })
    }

    async fn call_quantity(&self, method: &str) -> Result<u64, ChainClientError> {
        let result = self.call(method, Value::Array(Vec::new())).await?;
        let text = result.as_str().ok_or_else(|| ChainClientError::BadResult {
            reason: format!("{method} result is not a string"),
        })?;
        parse_quantity(text).map_err(|err| ChainClientError::BadResult {
            reason: err.to_string(),
        })
    }

    pub async fn block_number(&self) -> Result<u64, ChainClientError> {
        self.call_quantity("eth_blockNumber").await
    }

    pub async fn gas_price(&self) -> Result<u64, ChainClientError> {
        self.call_quantity("eth_gasPrice").await
    }
}

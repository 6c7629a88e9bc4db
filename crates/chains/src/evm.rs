//! EVM JSON-RPC access.
//!
//! Only the four calls the signing pipeline needs: head block, receipts,
//! log queries and read-only contract calls.

use std::time::Duration;

use alloy_primitives::{Address, Bytes, B256, U64};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::error::ChainError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Log {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    #[serde(default)]
    pub block_number: Option<U64>,
    #[serde(default)]
    pub transaction_hash: Option<B256>,
    #[serde(default)]
    pub removed: bool,
}

impl Log {
    pub fn block(&self) -> Option<u64> {
        self.block_number.map(|b| b.to::<u64>())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionReceipt {
    pub transaction_hash: B256,
    pub block_number: U64,
    /// `0x1` on success. Absent on pre-Byzantium chains.
    #[serde(default)]
    pub status: Option<U64>,
    #[serde(default)]
    pub logs: Vec<Log>,
}

impl TransactionReceipt {
    pub fn block(&self) -> u64 {
        self.block_number.to::<u64>()
    }

    pub fn succeeded(&self) -> bool {
        self.status.map(|s| s == U64::from(1)).unwrap_or(true)
    }
}

/// `eth_getLogs` filter. `None` topics match anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogFilter {
    pub address: Address,
    pub topics: Vec<Option<B256>>,
    pub from_block: U64,
    pub to_block: U64,
}

impl LogFilter {
    pub fn new(address: Address, from_block: u64, to_block: u64) -> Self {
        Self {
            address,
            topics: Vec::new(),
            from_block: U64::from(from_block),
            to_block: U64::from(to_block),
        }
    }

    pub fn topic(mut self, index: usize, topic: B256) -> Self {
        if self.topics.len() <= index {
            self.topics.resize(index + 1, None);
        }
        self.topics[index] = Some(topic);
        self
    }
}

#[cfg_attr(any(test, feature = "test-util"), mockall::automock)]
#[async_trait]
pub trait EvmClient: Send + Sync {
    async fn block_number(&self) -> Result<u64, ChainError>;

    /// `None` while the transaction is pending or unknown.
    async fn transaction_receipt(
        &self,
        tx_hash: B256,
    ) -> Result<Option<TransactionReceipt>, ChainError>;

    async fn logs(&self, filter: &LogFilter) -> Result<Vec<Log>, ChainError>;

    /// `eth_call` against the latest block.
    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, ChainError>;
}

/// JSON-RPC over HTTP.
pub struct RpcClient {
    url: String,
    client: reqwest::Client,
}

impl RpcClient {
    pub fn new(url: impl Into<String>) -> Result<Self, ChainError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<Option<T>, ChainError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        debug!(method, url = %self.url, "RPC call");

        let response = self.client.post(&self.url).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(ChainError::Status(response.status().as_u16()));
        }

        let result: RpcResponse<T> = response
            .json()
            .await
            .map_err(|e| ChainError::decode("rpc response", e))?;
        if let Some(error) = result.error {
            return Err(ChainError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        Ok(result.result)
    }

    async fn request_some<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, ChainError> {
        self.request(method, params)
            .await?
            .ok_or_else(|| ChainError::NotFound(format!("{} result", method)))
    }
}

#[async_trait]
impl EvmClient for RpcClient {
    async fn block_number(&self) -> Result<u64, ChainError> {
        let block: U64 = self.request_some("eth_blockNumber", json!([])).await?;
        Ok(block.to::<u64>())
    }

    async fn transaction_receipt(
        &self,
        tx_hash: B256,
    ) -> Result<Option<TransactionReceipt>, ChainError> {
        self.request("eth_getTransactionReceipt", json!([tx_hash]))
            .await
    }

    async fn logs(&self, filter: &LogFilter) -> Result<Vec<Log>, ChainError> {
        Ok(self
            .request("eth_getLogs", json!([filter]))
            .await?
            .unwrap_or_default())
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, ChainError> {
        self.request_some("eth_call", json!([{ "to": to, "data": data }, "latest"]))
            .await
    }
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receipt_decodes_hex_quantities() {
        let json = r#"{
            "transactionHash": "0x1111111111111111111111111111111111111111111111111111111111111111",
            "blockNumber": "0x1a",
            "status": "0x1",
            "logs": []
        }"#;
        let receipt: TransactionReceipt = serde_json::from_str(json).unwrap();
        assert_eq!(receipt.block(), 26);
        assert!(receipt.succeeded());
    }

    #[test]
    fn test_filter_pads_unset_topics() {
        let filter = LogFilter::new(Address::ZERO, 10, 20).topic(2, B256::repeat_byte(7));
        assert_eq!(filter.topics, vec![None, None, Some(B256::repeat_byte(7))]);

        let value = serde_json::to_value(&filter).unwrap();
        assert_eq!(value["fromBlock"], "0xa");
        assert_eq!(value["topics"][0], Value::Null);
    }
}

//! Escrow order API client.
//!
//! `GET {base}/orders/{orderId}` returns the signed order plus its
//! sponsor and allocator signatures and the API's view of its status.

use std::time::Duration;

use alloy_primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::abi::{MandateOutput, StandardOrder};
use crate::error::ChainError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderOutput {
    pub oracle: B256,
    pub settler: B256,
    pub chain_id: U256,
    pub token: B256,
    pub amount: U256,
    pub recipient: B256,
    #[serde(default)]
    pub call: Bytes,
    #[serde(default)]
    pub context: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub user: Address,
    pub nonce: U256,
    pub origin_chain_id: U256,
    pub expires: u32,
    pub fill_deadline: u32,
    pub input_oracle: Address,
    /// `[lockId, amount]` pairs.
    pub inputs: Vec<[U256; 2]>,
    pub outputs: Vec<OrderOutput>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Signed,
    Delivered,
    Settled,
    Refunded,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderMeta {
    pub order_identifier: B256,
    pub order_status: OrderStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedOrder {
    pub order: Order,
    pub sponsor_signature: Bytes,
    pub allocator_signature: Bytes,
    pub meta: OrderMeta,
}

impl From<&OrderOutput> for MandateOutput {
    fn from(o: &OrderOutput) -> Self {
        MandateOutput {
            oracle: o.oracle,
            settler: o.settler,
            chainId: o.chain_id,
            token: o.token,
            amount: o.amount,
            recipient: o.recipient,
            call: o.call.clone(),
            context: o.context.clone(),
        }
    }
}

impl From<&Order> for StandardOrder {
    fn from(o: &Order) -> Self {
        StandardOrder {
            user: o.user,
            nonce: o.nonce,
            originChainId: o.origin_chain_id,
            expires: o.expires,
            fillDeadline: o.fill_deadline,
            inputOracle: o.input_oracle,
            inputs: o.inputs.clone(),
            outputs: o.outputs.iter().map(MandateOutput::from).collect(),
        }
    }
}

#[cfg_attr(any(test, feature = "test-util"), mockall::automock)]
#[async_trait]
pub trait OrderApi: Send + Sync {
    async fn order(&self, order_id: B256) -> Result<SignedOrder, ChainError>;
}

pub struct LifiOrderClient {
    base_url: String,
    client: reqwest::Client,
}

impl LifiOrderClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ChainError> {
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()?,
        })
    }
}

#[async_trait]
impl OrderApi for LifiOrderClient {
    async fn order(&self, order_id: B256) -> Result<SignedOrder, ChainError> {
        let url = format!("{}/orders/{}", self.base_url, order_id);
        debug!(%url, "Fetching order");
        let response = self.client.get(&url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ChainError::NotFound(format!("order {}", order_id)));
        }
        if !response.status().is_success() {
            return Err(ChainError::Status(response.status().as_u16()));
        }
        response
            .json()
            .await
            .map_err(|e| ChainError::decode("order", e))
    }
}

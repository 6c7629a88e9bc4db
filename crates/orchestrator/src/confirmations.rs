//! Confirmation depth per order value.
//!
//! Each chain maps USD ceilings to the confirmations a deposit of that size
//! needs. A deposit uses the smallest ceiling strictly above its value.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, B256, U256};
use threshold_chains::tokens::to_units;
use threshold_chains::{Chain, ChainRegistry, PriceOracle, TokenStore};
use threshold_types::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(600);

pub struct ConfirmationWatcher {
    chains: ChainRegistry,
    tokens: Arc<TokenStore>,
    oracle: Arc<dyn PriceOracle>,
    max_wait: Duration,
}

impl ConfirmationWatcher {
    pub fn new(chains: ChainRegistry, tokens: Arc<TokenStore>, oracle: Arc<dyn PriceOracle>) -> Self {
        Self {
            chains,
            tokens,
            oracle,
            max_wait: DEFAULT_MAX_WAIT,
        }
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// USD ceiling → confirmations for `chain_id`.
    pub fn buckets(&self, chain_id: u64) -> Result<BTreeMap<u64, u64>, Error> {
        let chain = self.chains.require(chain_id)?;
        Ok(chain
            .config
            .confirmations
            .iter()
            .map(|b| (b.usd, b.confirmations))
            .collect())
    }

    pub async fn order_value(
        &self,
        chain_id: u64,
        token: &Address,
        amount: U256,
    ) -> Result<f64, Error> {
        let info = self.tokens.token(chain_id, token).ok_or_else(|| {
            Error::policy(format!("token {} not supported on chain {}", token, chain_id))
        })?;
        let price = self.oracle.usd_price(&info.symbol).await?;
        Ok(to_units(amount, info.decimals) * price)
    }

    pub async fn required_confirmations(
        &self,
        chain_id: u64,
        token: &Address,
        amount: U256,
    ) -> Result<u64, Error> {
        let buckets = self.buckets(chain_id)?;
        let value = self.order_value(chain_id, token, amount).await?;
        buckets
            .iter()
            .find(|(usd, _)| **usd as f64 > value)
            .map(|(_, confirmations)| *confirmations)
            .ok_or_else(|| Error::unavailable("value exceeds buckets"))
    }

    /// Block until `tx_hash` is buried deep enough for its value.
    pub async fn wait(
        &self,
        chain_id: u64,
        tx_hash: B256,
        token: &Address,
        amount: U256,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let required = self.required_confirmations(chain_id, token, amount).await?;
        let chain = self.chains.require(chain_id)?;
        debug!(chain_id, %tx_hash, required, "Waiting for confirmations");

        match tokio::time::timeout(self.max_wait, wait_for_depth(chain, tx_hash, required, self.max_wait, cancel))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::unavailable(format!(
                "transaction {} not confirmed in time",
                tx_hash
            ))),
        }
    }
}

/// Time for `remaining` more blocks, never longer than `max_wait`.
fn depth_pause(blocktime: Duration, remaining: u64, max_wait: Duration) -> Duration {
    let blocks = u32::try_from(remaining).unwrap_or(u32::MAX);
    blocktime.saturating_mul(blocks).min(max_wait)
}

async fn wait_for_depth(
    chain: &Chain,
    tx_hash: B256,
    required: u64,
    max_wait: Duration,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    let blocktime = Duration::from_millis(chain.config.blocktime_ms.max(1));
    loop {
        let pause = match chain.client.transaction_receipt(tx_hash).await? {
            Some(receipt) => {
                if !receipt.succeeded() {
                    return Err(Error::unavailable(format!(
                        "transaction {} reverted",
                        tx_hash
                    )));
                }
                let latest = chain.client.block_number().await?;
                let depth = latest.saturating_sub(receipt.block());
                if depth >= required {
                    info!(chain_id = chain.id(), %tx_hash, depth, required, "Transaction confirmed");
                    return Ok(());
                }
                depth_pause(blocktime, required - depth, max_wait)
            }
            None => blocktime,
        };
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Coordination("cancelled".to_string())),
            _ = tokio::time::sleep(pause) => {}
        }
    }
}

//! Spoke pool deposit indexer.
//!
//! Follows `FundsDeposited` logs on every chain with a spoke pool and
//! remembers the block each deposit landed in, so the deposit handler can
//! query a single block instead of a wide lookback window. Progress is
//! persisted per chain in the [`BlockStore`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy_primitives::{B256, U256};
use alloy_sol_types::SolEvent;
use threshold_chains::abi::FundsDeposited;
use threshold_chains::{Chain, ChainRegistry, LogFilter};
use threshold_storage::BlockStore;
use threshold_types::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const WATERMARK_KEY: &str = "across-deposits";
/// Blocks scanned on first start when no watermark exists.
pub const DEFAULT_LOOKBACK: u64 = 10_000;
/// Upper bound on one `eth_getLogs` range.
pub const MAX_QUERY_BLOCK_RANGE: u64 = 2_000;
const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// `(origin chain, deposit id) → block`.
#[derive(Default)]
pub struct DepositIndex {
    blocks: Mutex<HashMap<(u64, U256), u64>>,
}

impl DepositIndex {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, chain_id: u64, deposit_id: U256, block: u64) {
        if let Ok(mut blocks) = self.blocks.lock() {
            blocks.insert((chain_id, deposit_id), block);
        }
    }

    pub fn block_of(&self, chain_id: u64, deposit_id: U256) -> Option<u64> {
        self.blocks
            .lock()
            .ok()
            .and_then(|b| b.get(&(chain_id, deposit_id)).copied())
    }

    pub fn len(&self) -> usize {
        self.blocks.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct DepositListener {
    chain: Chain,
    store: Arc<BlockStore>,
    index: Arc<DepositIndex>,
    lookback: u64,
}

impl DepositListener {
    pub fn new(chain: Chain, store: Arc<BlockStore>, index: Arc<DepositIndex>) -> Self {
        Self {
            chain,
            store,
            index,
            lookback: DEFAULT_LOOKBACK,
        }
    }

    pub fn with_lookback(mut self, lookback: u64) -> Self {
        self.lookback = lookback;
        self
    }

    /// Scan from the watermark to the chain head. Returns the number of
    /// deposits indexed.
    pub async fn poll_once(&self) -> Result<usize, Error> {
        let chain_id = self.chain.id();
        let Some(spoke_pool) = self.chain.config.spoke_pool else {
            return Ok(0);
        };

        let latest = self.chain.client.block_number().await?;
        let from = match self.store.get_watermark(chain_id, WATERMARK_KEY)? {
            Some(done) => done + 1,
            None => latest.saturating_sub(self.lookback),
        };
        if from > latest {
            return Ok(0);
        }

        let mut indexed = 0;
        let mut start = from;
        while start <= latest {
            let end = (start + MAX_QUERY_BLOCK_RANGE - 1).min(latest);
            let filter = LogFilter::new(spoke_pool, start, end)
                .topic(0, FundsDeposited::SIGNATURE_HASH);

            for log in self.chain.client.logs(&filter).await? {
                if log.removed {
                    continue;
                }
                let (Some(id_topic), Some(block)) = (log.topics.get(2), log.block()) else {
                    warn!(chain_id, "Deposit log without id or block");
                    continue;
                };
                self.index
                    .insert(chain_id, U256::from_be_bytes(id_topic.0), block);
                indexed += 1;
            }

            self.store.set_watermark(chain_id, WATERMARK_KEY, end)?;
            start = end + 1;
        }

        if indexed > 0 {
            debug!(chain_id, from, to = latest, indexed, "Indexed deposits");
        }
        Ok(indexed)
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        let interval =
            Duration::from_millis(self.chain.config.blocktime_ms).max(MIN_POLL_INTERVAL);
        tokio::spawn(async move {
            info!(chain_id = self.chain.id(), "Deposit listener started");
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        if let Err(e) = self.poll_once().await {
                            warn!(chain_id = self.chain.id(), error = %e, "Deposit poll failed");
                        }
                    }
                }
            }
        })
    }
}

/// One listener per chain with a spoke pool.
pub fn spawn_deposit_listeners(
    chains: &ChainRegistry,
    store: Arc<BlockStore>,
    index: Arc<DepositIndex>,
    cancel: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    chains
        .iter()
        .filter(|c| c.config.spoke_pool.is_some())
        .map(|c| {
            DepositListener::new(c.clone(), store.clone(), index.clone())
                .spawn(cancel.child_token())
        })
        .collect()
}

/// Topic filter value for an indexed `uint256`.
pub fn uint_topic(value: U256) -> B256 {
    B256::from(value.to_be_bytes::<32>())
}

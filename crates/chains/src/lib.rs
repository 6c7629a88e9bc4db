//! Chain access for the signer.
//!
//! - [`evm`]: JSON-RPC client behind the [`EvmClient`] trait
//! - [`abi`]: spoke pool, settler, compact and liquidity pool ABIs
//! - [`tokens`] and [`price`]: token metadata and USD prices
//! - [`lifi`]: escrow order API

pub mod abi;
pub mod error;
pub mod evm;
pub mod lifi;
pub mod price;
pub mod tokens;

use std::collections::HashMap;
use std::sync::Arc;

use common::ChainConfig;

pub use error::ChainError;
pub use evm::{EvmClient, Log, LogFilter, RpcClient, TransactionReceipt};
pub use lifi::{LifiOrderClient, Order, OrderApi, OrderOutput, OrderStatus, SignedOrder};
pub use price::{HttpPriceOracle, PriceOracle, StaticPriceOracle};
pub use tokens::{TokenInfo, TokenStore};

#[cfg(any(test, feature = "test-util"))]
pub use evm::MockEvmClient;
#[cfg(any(test, feature = "test-util"))]
pub use lifi::MockOrderApi;
#[cfg(any(test, feature = "test-util"))]
pub use price::MockPriceOracle;

/// A configured chain and its RPC client.
#[derive(Clone)]
pub struct Chain {
    pub config: ChainConfig,
    pub client: Arc<dyn EvmClient>,
}

impl Chain {
    pub fn id(&self) -> u64 {
        self.config.id
    }
}

/// Every chain this node serves, by id.
#[derive(Clone, Default)]
pub struct ChainRegistry {
    chains: HashMap<u64, Chain>,
}

impl ChainRegistry {
    /// One [`RpcClient`] per configured chain.
    pub fn connect(configs: &[ChainConfig]) -> Result<Self, ChainError> {
        let mut registry = Self::default();
        for config in configs {
            let client = Arc::new(RpcClient::new(config.rpc_url.clone())?);
            registry.insert(config.clone(), client);
        }
        Ok(registry)
    }

    pub fn insert(&mut self, config: ChainConfig, client: Arc<dyn EvmClient>) {
        self.chains.insert(config.id, Chain { config, client });
    }

    pub fn get(&self, chain_id: u64) -> Option<&Chain> {
        self.chains.get(&chain_id)
    }

    /// Like [`get`](Self::get) but reports an unsupported chain.
    pub fn require(&self, chain_id: u64) -> Result<&Chain, threshold_types::Error> {
        self.get(chain_id)
            .ok_or_else(|| threshold_types::Error::chain_not_supported(chain_id))
    }

    pub fn ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.chains.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn iter(&self) -> impl Iterator<Item = &Chain> {
        self.chains.values()
    }
}

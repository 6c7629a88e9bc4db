//! Fixtures shared by the orchestrator unit tests.

use alloy_primitives::{address, Address};
use common::{ChainConfig, ConfirmationBucket, TokenConfig, TokenDeployment};
use threshold_chains::TokenStore;

pub const BASE: u64 = 8453;
pub const ARBITRUM: u64 = 42161;

pub const USDC_BASE: Address = address!("1111111111111111111111111111111111111111");
pub const USDC_ARBITRUM: Address = address!("2222222222222222222222222222222222222222");

pub const POOL: Address = address!("a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0");
pub const CALLER: Address = address!("c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0");
pub const SPOKE_POOL: Address = address!("5050505050505050505050505050505050505050");
pub const OUTPUT_SETTLER: Address = address!("6060606060606060606060606060606060606060");
pub const INPUT_SETTLER: Address = address!("7070707070707070707070707070707070707070");
pub const COMPACT: Address = address!("8080808080808080808080808080808080808080");

/// A fast chain with every contract configured and buckets
/// 500 → 2, 5 000 → 5, 50 000 → 12.
pub fn chain_config(id: u64) -> ChainConfig {
    ChainConfig {
        id,
        name: format!("chain-{}", id),
        rpc_url: "http://127.0.0.1:8545".to_string(),
        blocktime_ms: 10,
        liquidity_pool: POOL,
        caller: CALLER,
        spoke_pool: Some(SPOKE_POOL),
        lifi_settler: Some(OUTPUT_SETTLER),
        lifi_compact: Some(COMPACT),
        lifi_input_settler: Some(INPUT_SETTLER),
        confirmations: vec![
            ConfirmationBucket {
                usd: 500,
                confirmations: 2,
            },
            ConfirmationBucket {
                usd: 5_000,
                confirmations: 5,
            },
            ConfirmationBucket {
                usd: 50_000,
                confirmations: 12,
            },
        ],
    }
}

/// USDC at one dollar with six decimals on Base and Arbitrum.
pub fn token_store() -> TokenStore {
    TokenStore::from_config(&[TokenConfig {
        symbol: "usdc".to_string(),
        price_usd: Some(1.0),
        deployments: vec![
            TokenDeployment {
                chain_id: BASE,
                address: USDC_BASE,
                decimals: 6,
            },
            TokenDeployment {
                chain_id: ARBITRUM,
                address: USDC_ARBITRUM,
                decimals: 6,
            },
        ],
    }])
}

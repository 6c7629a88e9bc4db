//! Token registry built from config.

use std::collections::HashMap;

use alloy_primitives::{Address, U256};
use common::TokenConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct TokenInfo {
    pub symbol: String,
    pub chain_id: u64,
    pub address: Address,
    pub decimals: u8,
}

#[derive(Debug, Clone, Default)]
pub struct TokenStore {
    by_address: HashMap<(u64, Address), TokenInfo>,
    by_symbol: HashMap<(String, u64), TokenInfo>,
    prices: HashMap<String, f64>,
}

impl TokenStore {
    pub fn from_config(tokens: &[TokenConfig]) -> Self {
        let mut store = Self::default();
        for token in tokens {
            let symbol = token.symbol.to_uppercase();
            if let Some(price) = token.price_usd {
                store.prices.insert(symbol.clone(), price);
            }
            for d in &token.deployments {
                let info = TokenInfo {
                    symbol: symbol.clone(),
                    chain_id: d.chain_id,
                    address: d.address,
                    decimals: d.decimals,
                };
                store.by_address.insert((d.chain_id, d.address), info.clone());
                store.by_symbol.insert((symbol.clone(), d.chain_id), info);
            }
        }
        store
    }

    pub fn token(&self, chain_id: u64, address: &Address) -> Option<&TokenInfo> {
        self.by_address.get(&(chain_id, *address))
    }

    pub fn by_symbol(&self, symbol: &str, chain_id: u64) -> Option<&TokenInfo> {
        self.by_symbol.get(&(symbol.to_uppercase(), chain_id))
    }

    /// Configured fallback prices, keyed by upper-case symbol.
    pub fn static_prices(&self) -> &HashMap<String, f64> {
        &self.prices
    }
}

/// Whole-token amount as a float. Precision loss is fine for bucket lookup.
pub fn to_units(amount: U256, decimals: u8) -> f64 {
    let raw: f64 = amount.to_string().parse().unwrap_or(f64::MAX);
    raw / 10f64.powi(decimals as i32)
}

/// Rescale `amount` from `from` decimals to `to` decimals, truncating.
pub fn rescale(amount: U256, from: u8, to: u8) -> U256 {
    if from == to {
        amount
    } else if from < to {
        amount.saturating_mul(U256::from(10).pow(U256::from(to - from)))
    } else {
        amount / U256::from(10).pow(U256::from(from - to))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::TokenDeployment;

    fn usdc() -> TokenConfig {
        TokenConfig {
            symbol: "usdc".to_string(),
            price_usd: Some(1.0),
            deployments: vec![
                TokenDeployment {
                    chain_id: 8453,
                    address: Address::repeat_byte(0x11),
                    decimals: 6,
                },
                TokenDeployment {
                    chain_id: 56,
                    address: Address::repeat_byte(0x22),
                    decimals: 18,
                },
            ],
        }
    }

    #[test]
    fn test_lookup_by_address_and_symbol() {
        let store = TokenStore::from_config(&[usdc()]);

        let token = store.token(8453, &Address::repeat_byte(0x11)).unwrap();
        assert_eq!(token.symbol, "USDC");
        assert_eq!(token.decimals, 6);
        assert_eq!(store.by_symbol("USDC", 56).unwrap().decimals, 18);
        assert!(store.token(1, &Address::repeat_byte(0x11)).is_none());
        assert_eq!(store.static_prices().get("USDC"), Some(&1.0));
    }

    #[test]
    fn test_units_and_rescale() {
        assert_eq!(to_units(U256::from(499_000_000u64), 6), 499.0);
        assert_eq!(
            rescale(U256::from(1_000_000u64), 6, 18),
            U256::from(10).pow(U256::from(18))
        );
        assert_eq!(rescale(U256::from(1_500_000u64), 6, 3), U256::from(1_500u64));
    }
}

//! USD price sources for confirmation buckets.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::error::ChainError;

#[cfg_attr(any(test, feature = "test-util"), mockall::automock)]
#[async_trait]
pub trait PriceOracle: Send + Sync {
    async fn usd_price(&self, symbol: &str) -> Result<f64, ChainError>;
}

/// `GET {base_url}/{symbol}` returning `{"usd": <f64>}`.
pub struct HttpPriceOracle {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct PriceResponse {
    usd: f64,
}

impl HttpPriceOracle {
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
impl PriceOracle for HttpPriceOracle {
    async fn usd_price(&self, symbol: &str) -> Result<f64, ChainError> {
        let url = format!("{}/{}", self.base_url, symbol.to_uppercase());
        debug!(%url, "Fetching price");
        let response = self.client.get(&url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ChainError::PriceUnavailable(symbol.to_string()));
        }
        if !response.status().is_success() {
            return Err(ChainError::Status(response.status().as_u16()));
        }
        let body: PriceResponse = response
            .json()
            .await
            .map_err(|e| ChainError::decode("price response", e))?;
        Ok(body.usd)
    }
}

/// Fixed prices from the token config.
#[derive(Debug, Clone, Default)]
pub struct StaticPriceOracle {
    prices: HashMap<String, f64>,
}

impl StaticPriceOracle {
    pub fn new(prices: HashMap<String, f64>) -> Self {
        Self {
            prices: prices
                .into_iter()
                .map(|(k, v)| (k.to_uppercase(), v))
                .collect(),
        }
    }
}

#[async_trait]
impl PriceOracle for StaticPriceOracle {
    async fn usd_price(&self, symbol: &str) -> Result<f64, ChainError> {
        self.prices
            .get(&symbol.to_uppercase())
            .copied()
            .ok_or_else(|| ChainError::PriceUnavailable(symbol.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_prices_are_case_insensitive() {
        let oracle = StaticPriceOracle::new(HashMap::from([("usdc".to_string(), 1.0)]));
        assert_eq!(oracle.usd_price("USDC").await.unwrap(), 1.0);
        assert!(matches!(
            oracle.usd_price("WETH").await,
            Err(ChainError::PriceUnavailable(_))
        ));
    }
}

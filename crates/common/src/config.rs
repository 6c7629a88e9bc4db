//! Node configuration.
//!
//! Layering: built-in defaults, then the TOML file (or a TOML document
//! fetched from `--config-url`), then `SIGNER__SECTION__KEY` environment
//! variables. `--name` applies the matching `[nodes.<name>]` block on top
//! and `--staging` swaps in the staging chain set.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const ENV_PREFIX: &str = "SIGNER";
const ENV_SEPARATOR: &str = "__";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load config: {0}")]
    Load(#[from] config::ConfigError),

    #[error("unknown node name '{0}'")]
    UnknownNode(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub node: NodeConfig,
    pub http: HttpConfig,
    pub topology: TopologyConfig,
    pub tss: TssConfig,
    pub election: ElectionConfig,
    pub chains: Vec<ChainConfig>,
    pub staging_chains: Vec<ChainConfig>,
    pub tokens: Vec<TokenConfig>,
    pub price: PriceConfig,
    pub lifi: LifiConfig,
    pub logging: LoggingConfig,
    /// Per-node overrides selected with `--name`.
    pub nodes: HashMap<String, NodeOverride>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// File holding the hex-encoded ed25519 secret key.
    pub key_path: PathBuf,
    /// TCP address the peer listener binds to.
    pub listen_addr: String,
    pub keyshare_path: PathBuf,
    pub block_store_path: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            key_path: PathBuf::from("data/peer.key"),
            listen_addr: "0.0.0.0:9000".to_string(),
            keyshare_path: PathBuf::from("data/keyshare.json"),
            block_store_path: PathBuf::from("data/blocks.db"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeOverride {
    pub key_path: Option<PathBuf>,
    pub listen_addr: Option<String>,
    pub http_listen_addr: Option<String>,
    pub keyshare_path: Option<PathBuf>,
    pub block_store_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub listen_addr: String,
    /// Upper bound for requests that wait on a signature.
    pub request_timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            request_timeout_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    /// `http(s)://` URL or local path of the encrypted blob.
    pub url: String,
    /// Where the decrypted topology is persisted.
    pub path: PathBuf,
    /// Hex-encoded 32-byte AES key.
    pub encryption_key: String,
    /// Hex SHA-256 of the encrypted blob. Empty disables the check.
    pub expected_hash: String,
    /// Re-fetch period in seconds; 0 keeps the startup topology.
    pub refresh_secs: u64,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            path: PathBuf::from("data/topology.json"),
            encryption_key: String::new(),
            expected_hash: String::new(),
            refresh_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TssConfig {
    pub initiate_period_secs: u64,
    pub session_timeout_secs: u64,
    pub unlock_timeout_secs: u64,
    pub signature_ttl_secs: u64,
    pub fetch_timeout_secs: u64,
}

impl Default for TssConfig {
    fn default() -> Self {
        Self {
            initiate_period_secs: 15,
            session_timeout_secs: 600,
            unlock_timeout_secs: 15,
            signature_ttl_secs: 600,
            fetch_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectionConfig {
    pub ping_interval_ms: u64,
    pub ping_wait_ms: u64,
    pub ping_backoff_ms: u64,
    pub election_wait_ms: u64,
    pub bully_wait_ms: u64,
    pub election_timeout_ms: u64,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: 1_000,
            ping_wait_ms: 1_000,
            ping_backoff_ms: 1_000,
            election_wait_ms: 2_000,
            bully_wait_ms: 3_000,
            election_timeout_ms: 15_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationBucket {
    /// Order value ceiling in whole USD.
    pub usd: u64,
    pub confirmations: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    pub id: u64,
    pub name: String,
    pub rpc_url: String,
    #[serde(default = "default_blocktime_ms")]
    pub blocktime_ms: u64,
    /// Liquidity pool the borrow signatures authorize.
    pub liquidity_pool: Address,
    /// Address allowed to submit the borrow on this chain.
    pub caller: Address,
    /// Across spoke pool (origin deposits and destination fills).
    #[serde(default)]
    pub spoke_pool: Option<Address>,
    /// Output settler for escrow orders filled on this chain.
    #[serde(default)]
    pub lifi_settler: Option<Address>,
    /// Compact contract holding escrowed inputs on this chain.
    #[serde(default)]
    pub lifi_compact: Option<Address>,
    /// Escrow input settler on this chain (the unlock target).
    #[serde(default)]
    pub lifi_input_settler: Option<Address>,
    #[serde(default)]
    pub confirmations: Vec<ConfirmationBucket>,
}

fn default_blocktime_ms() -> u64 {
    2_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenDeployment {
    pub chain_id: u64,
    pub address: Address,
    pub decimals: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    pub symbol: String,
    /// Fallback USD price when no oracle is configured.
    #[serde(default)]
    pub price_usd: Option<f64>,
    pub deployments: Vec<TokenDeployment>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PriceConfig {
    /// Base URL of the price service. `GET {url}/{symbol}` returns `{"usd": f64}`.
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifiConfig {
    pub order_api_url: String,
}

impl Default for LifiConfig {
    fn default() -> Self {
        Self {
            order_api_url: "https://order.li.fi".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `json` or `pretty`.
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

impl AppConfig {
    /// Load from a TOML file (optional) plus environment overrides.
    pub fn load(path: Option<&Path>, name: Option<&str>, staging: bool) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let settings = builder
            .add_source(Self::env_source())
            .build()?;
        Self::finish(settings, name, staging)
    }

    /// Load from an in-memory TOML document, e.g. one fetched from `--config-url`.
    pub fn from_toml(contents: &str, name: Option<&str>, staging: bool) -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(contents, config::FileFormat::Toml))
            .add_source(Self::env_source())
            .build()?;
        Self::finish(settings, name, staging)
    }

    fn env_source() -> config::Environment {
        config::Environment::with_prefix(ENV_PREFIX)
            .separator(ENV_SEPARATOR)
            .try_parsing(true)
    }

    fn finish(
        settings: config::Config,
        name: Option<&str>,
        staging: bool,
    ) -> Result<Self, ConfigError> {
        let mut cfg: AppConfig = settings.try_deserialize()?;
        if let Some(name) = name {
            cfg.apply_node_override(name)?;
        }
        if staging {
            cfg.chains = std::mem::take(&mut cfg.staging_chains);
        }
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_node_override(&mut self, name: &str) -> Result<(), ConfigError> {
        let over = self
            .nodes
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownNode(name.to_string()))?;

        if let Some(v) = over.key_path {
            self.node.key_path = v;
        }
        if let Some(v) = over.listen_addr {
            self.node.listen_addr = v;
        }
        if let Some(v) = over.http_listen_addr {
            self.http.listen_addr = v;
        }
        if let Some(v) = over.keyshare_path {
            self.node.keyshare_path = v;
        }
        if let Some(v) = over.block_store_path {
            self.node.block_store_path = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.listen_addr.is_empty() {
            return Err(ConfigError::Invalid("node.listen_addr cannot be empty".to_string()));
        }

        if !self.topology.encryption_key.is_empty() {
            let key = hex::decode(&self.topology.encryption_key)
                .map_err(|e| ConfigError::Invalid(format!("topology.encryption_key: {}", e)))?;
            if key.len() != 32 {
                return Err(ConfigError::Invalid(
                    "topology.encryption_key must be 32 bytes".to_string(),
                ));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for chain in &self.chains {
            if !seen.insert(chain.id) {
                return Err(ConfigError::Invalid(format!("duplicate chain id {}", chain.id)));
            }
            if chain.blocktime_ms == 0 {
                return Err(ConfigError::Invalid(format!(
                    "chain {}: blocktime_ms must be > 0",
                    chain.id
                )));
            }
            let mut last = None;
            for bucket in &chain.confirmations {
                if last.is_some_and(|prev| bucket.usd <= prev) {
                    return Err(ConfigError::Invalid(format!(
                        "chain {}: confirmation buckets must be strictly increasing",
                        chain.id
                    )));
                }
                last = Some(bucket.usd);
            }
        }

        let e = &self.election;
        if e.ping_wait_ms == 0 || e.election_wait_ms == 0 || e.election_timeout_ms == 0 {
            return Err(ConfigError::Invalid("election timeouts must be > 0".to_string()));
        }

        if self.tss.signature_ttl_secs == 0 {
            return Err(ConfigError::Invalid("tss.signature_ttl_secs must be > 0".to_string()));
        }

        Ok(())
    }

    pub fn chain(&self, chain_id: u64) -> Option<&ChainConfig> {
        self.chains.iter().find(|c| c.id == chain_id)
    }
}

//! Cluster topology: the authoritative peer set and threshold.
//!
//! The topology is published as an encrypted blob:
//!
//! ```text
//! +----------------+-------------------------------+
//! | IV (16 bytes)  | AES-256-CTR(JSON topology)    |
//! +----------------+-------------------------------+
//! ```
//!
//! The provider fetches the blob, checks its SHA-256 against the configured
//! hash, decrypts it, validates the peer list and persists the cleartext.
//! Snapshots are immutable and shared behind `Arc`; replacing the topology
//! publishes a new snapshot on a watch channel.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use aes::Aes256;
use cipher::{KeyIvInit, StreamCipher};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use threshold_types::PeerId;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::TopologyConfig;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

const IV_LEN: usize = 16;
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("failed to fetch topology: {0}")]
    Fetch(String),

    #[error("topology hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("invalid encryption key: {0}")]
    InvalidKey(String),

    #[error("encrypted topology too short")]
    Truncated,

    #[error("failed to parse topology: {0}")]
    Parse(String),

    #[error("invalid peer address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("invalid topology: {0}")]
    Invalid(String),

    #[error("topology io error: {0}")]
    Io(#[from] std::io::Error),
}

/// One peer multi-address: `/ip4|ip6|dns|dns4|dns6/<host>/tcp/<port>/p2p/<peer_id>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddress {
    pub host: String,
    pub port: u16,
    pub peer_id: PeerId,
    ip6: bool,
}

impl PeerAddress {
    pub fn new(host: impl Into<String>, port: u16, peer_id: PeerId) -> Self {
        Self {
            host: host.into(),
            port,
            peer_id,
            ip6: false,
        }
    }

    /// `host:port` suitable for `TcpStream::connect`.
    pub fn dial_addr(&self) -> String {
        if self.ip6 {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for PeerAddress {
    type Err = TopologyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| TopologyError::InvalidAddress {
            address: s.to_string(),
            reason: reason.to_string(),
        };

        let parts: Vec<&str> = s.split('/').collect();
        // ["", proto, host, "tcp", port, "p2p", id]
        if parts.len() != 7 || !parts[0].is_empty() {
            return Err(invalid("expected /<proto>/<host>/tcp/<port>/p2p/<id>"));
        }

        let ip6 = match parts[1] {
            "ip4" | "dns" | "dns4" | "dns6" => false,
            "ip6" => true,
            _ => return Err(invalid("unsupported address protocol")),
        };
        if parts[2].is_empty() {
            return Err(invalid("empty host"));
        }
        if parts[3] != "tcp" {
            return Err(invalid("only tcp is supported"));
        }
        let port: u16 = parts[4].parse().map_err(|_| invalid("bad port"))?;
        if parts[5] != "p2p" {
            return Err(invalid("missing /p2p/ component"));
        }
        let peer_id: PeerId = parts[6].parse().map_err(|_| invalid("bad peer id"))?;

        Ok(Self {
            host: parts[2].to_string(),
            port,
            peer_id,
            ip6,
        })
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let proto = if self.ip6 {
            "ip6"
        } else if self.host.parse::<std::net::Ipv4Addr>().is_ok() {
            "ip4"
        } else {
            "dns"
        };
        write!(
            f,
            "/{}/{}/tcp/{}/p2p/{}",
            proto, self.host, self.port, self.peer_id
        )
    }
}

#[derive(Serialize, Deserialize)]
struct RawTopology {
    peers: Vec<String>,
    threshold: u16,
}

/// Immutable topology snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    peers: Vec<PeerAddress>,
    threshold: u16,
}

impl Topology {
    pub fn new(peers: Vec<PeerAddress>, threshold: u16) -> Result<Self, TopologyError> {
        let n = peers.len();
        if threshold < 1 || threshold as usize >= n {
            return Err(TopologyError::Invalid(format!(
                "threshold {} out of range [1, {}]",
                threshold,
                n.saturating_sub(1)
            )));
        }

        let mut seen = HashSet::new();
        for p in &peers {
            if !seen.insert(p.peer_id) {
                return Err(TopologyError::Invalid(format!("duplicate peer {}", p.peer_id)));
            }
        }

        Ok(Self { peers, threshold })
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, TopologyError> {
        let raw: RawTopology =
            serde_json::from_slice(bytes).map_err(|e| TopologyError::Parse(e.to_string()))?;
        let peers = raw
            .peers
            .iter()
            .map(|s| s.parse())
            .collect::<Result<Vec<PeerAddress>, _>>()?;
        Self::new(peers, raw.threshold)
    }

    pub fn to_json(&self) -> Vec<u8> {
        let raw = RawTopology {
            peers: self.peers.iter().map(|p| p.to_string()).collect(),
            threshold: self.threshold,
        };
        // A Vec<String> + u16 always serializes.
        serde_json::to_vec_pretty(&raw).unwrap_or_default()
    }

    pub fn peers(&self) -> &[PeerAddress] {
        &self.peers
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.iter().map(|p| p.peer_id).collect()
    }

    pub fn threshold(&self) -> u16 {
        self.threshold
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.peers.iter().any(|p| &p.peer_id == peer)
    }

    pub fn address_of(&self, peer: &PeerId) -> Option<&PeerAddress> {
        self.peers.iter().find(|p| &p.peer_id == peer)
    }
}

/// Read side of the current topology.
pub type SharedTopology = watch::Receiver<Arc<Topology>>;

/// Write side: replaces the snapshot atomically for every reader.
#[derive(Clone)]
pub struct TopologyHandle {
    tx: Arc<watch::Sender<Arc<Topology>>>,
}

impl TopologyHandle {
    pub fn new(initial: Topology) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(initial));
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> Arc<Topology> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> SharedTopology {
        self.tx.subscribe()
    }

    pub fn replace(&self, next: Topology) {
        info!(peers = next.len(), threshold = next.threshold(), "Topology replaced");
        self.tx.send_replace(Arc::new(next));
    }
}

fn parse_key(key_hex: &str) -> Result<[u8; 32], TopologyError> {
    let bytes = hex::decode(key_hex).map_err(|e| TopologyError::InvalidKey(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| TopologyError::InvalidKey("expected 32 bytes".to_string()))
}

/// Encrypt a cleartext topology document, returning `iv || ciphertext`.
pub fn encrypt(plaintext: &[u8], key_hex: &str) -> Result<Vec<u8>, TopologyError> {
    let key = parse_key(key_hex)?;
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);

    let mut buf = plaintext.to_vec();
    let mut cipher = Aes256Ctr::new(&key.into(), &iv.into());
    cipher.apply_keystream(&mut buf);

    let mut out = Vec::with_capacity(IV_LEN + buf.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&buf);
    Ok(out)
}

pub fn decrypt(blob: &[u8], key_hex: &str) -> Result<Vec<u8>, TopologyError> {
    let key = parse_key(key_hex)?;
    if blob.len() < IV_LEN {
        return Err(TopologyError::Truncated);
    }
    let (iv, ciphertext) = blob.split_at(IV_LEN);
    let iv: [u8; IV_LEN] = iv.try_into().map_err(|_| TopologyError::Truncated)?;

    let mut buf = ciphertext.to_vec();
    let mut cipher = Aes256Ctr::new(&key.into(), &iv.into());
    cipher.apply_keystream(&mut buf);
    Ok(buf)
}

/// Hex SHA-256 of the encrypted blob.
pub fn hash(blob: &[u8]) -> String {
    hex::encode(Sha256::digest(blob))
}

/// Fetches and decodes the published topology.
pub struct TopologyProvider {
    config: TopologyConfig,
    client: reqwest::Client,
}

impl TopologyProvider {
    pub fn new(config: TopologyConfig) -> Result<Self, TopologyError> {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(|e| TopologyError::Fetch(e.to_string()))?;
        Ok(Self { config, client })
    }

    async fn fetch_blob(&self) -> Result<Vec<u8>, TopologyError> {
        let url = &self.config.url;
        if url.starts_with("http://") || url.starts_with("https://") {
            debug!("Fetching topology from {}", url);
            let response = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|e| TopologyError::Fetch(e.to_string()))?;
            if !response.status().is_success() {
                return Err(TopologyError::Fetch(format!(
                    "topology endpoint returned status {}",
                    response.status()
                )));
            }
            let bytes = response
                .bytes()
                .await
                .map_err(|e| TopologyError::Fetch(e.to_string()))?;
            Ok(bytes.to_vec())
        } else {
            Ok(tokio::fs::read(url).await?)
        }
    }

    /// Decode a blob already in hand: hash check, decrypt, parse.
    pub fn decode(&self, blob: &[u8]) -> Result<Topology, TopologyError> {
        if !self.config.expected_hash.is_empty() {
            let actual = hash(blob);
            let expected = self.config.expected_hash.trim_start_matches("0x").to_lowercase();
            if actual != expected {
                return Err(TopologyError::HashMismatch { expected, actual });
            }
        }
        let plaintext = decrypt(blob, &self.config.encryption_key)?;
        Topology::from_json(&plaintext)
    }

    /// Fetch, verify and persist the topology.
    pub async fn fetch(&self) -> Result<Topology, TopologyError> {
        let blob = self.fetch_blob().await?;
        let topology = self.decode(&blob)?;
        self.persist(&topology).await?;
        info!(
            peers = topology.len(),
            threshold = topology.threshold(),
            "Topology loaded"
        );
        Ok(topology)
    }

    async fn persist(&self, topology: &Topology) -> Result<(), TopologyError> {
        let path = &self.config.path;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(path, topology.to_json()).await?;
        Ok(())
    }

    /// Read the cleartext copy written by a previous fetch.
    pub async fn load_cached(path: &Path) -> Result<Topology, TopologyError> {
        let bytes = tokio::fs::read(path).await?;
        Topology::from_json(&bytes)
    }
}

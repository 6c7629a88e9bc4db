//! Peer identity.
//!
//! A peer is identified by its long-lived ed25519 public key. The textual
//! peer id is the lowercase hex encoding of the 32 key bytes and is what
//! appears in topology multi-addresses, logs and session parameters.

use std::fmt;
use std::str::FromStr;

use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Session identifier. Non-empty; derived from the intent (e.g. `"8453-100"`).
pub type SessionId = String;

/// Errors produced while parsing a peer id.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PeerIdError {
    #[error("invalid peer id hex: {0}")]
    Hex(String),

    #[error("invalid peer id length: expected 32 bytes, got {0}")]
    Length(usize),

    #[error("peer id is not a valid ed25519 public key")]
    InvalidKey,
}

/// Identity of a peer: the raw ed25519 public key bytes.
///
/// Ordering is by raw bytes, which is the tie-break used whenever two
/// peers hash to the same rank.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; 32]);

impl PeerId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_public_key(key: &VerifyingKey) -> Self {
        Self(key.to_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Recover the ed25519 verifying key this id was derived from.
    pub fn verifying_key(&self) -> Result<VerifyingKey, PeerIdError> {
        VerifyingKey::from_bytes(&self.0).map_err(|_| PeerIdError::InvalidKey)
    }

    /// Abbreviated form for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl FromStr for PeerId {
    type Err = PeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim_start_matches("0x"))
            .map_err(|e| PeerIdError::Hex(e.to_string()))?;
        let len = bytes.len();
        let arr: [u8; 32] = bytes.try_into().map_err(|_| PeerIdError::Length(len))?;
        Ok(Self(arr))
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

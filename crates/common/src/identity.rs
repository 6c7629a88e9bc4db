//! Long-lived node identity (ed25519).

use std::path::Path;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use thiserror::Error;
use threshold_types::PeerId;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("failed to read key file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write key file {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed key file: {0}")]
    Malformed(String),
}

/// The node's signing key. The file format is the hex-encoded 32-byte secret.
#[derive(Clone)]
pub struct NodeKey {
    signing: SigningKey,
}

impl NodeKey {
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret(secret: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&secret),
        }
    }

    pub fn load(path: &Path) -> Result<Self, IdentityError> {
        let text = std::fs::read_to_string(path).map_err(|e| IdentityError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        let bytes =
            hex::decode(text.trim()).map_err(|e| IdentityError::Malformed(e.to_string()))?;
        let secret: [u8; 32] = bytes
            .try_into()
            .map_err(|_| IdentityError::Malformed("expected 32 bytes".to_string()))?;
        Ok(Self::from_secret(secret))
    }

    pub fn save(&self, path: &Path) -> Result<(), IdentityError> {
        let write_err = |e| IdentityError::Write {
            path: path.display().to_string(),
            source: e,
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(write_err)?;
            }
        }
        std::fs::write(path, hex::encode(self.signing.to_bytes())).map_err(write_err)
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId::from_public_key(&self.signing.verifying_key())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    pub fn sign(&self, msg: &[u8]) -> Signature {
        self.signing.sign(msg)
    }

    /// Verify `sig` over `msg` against the key behind `peer`.
    pub fn verify(peer: &PeerId, msg: &[u8], sig: &Signature) -> bool {
        match peer.verifying_key() {
            Ok(key) => key.verify(msg, sig).is_ok(),
            Err(_) => false,
        }
    }
}

impl std::fmt::Debug for NodeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeKey")
            .field("peer_id", &self.peer_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys/peer.key");

        let key = NodeKey::generate();
        key.save(&path).unwrap();
        let loaded = NodeKey::load(&path).unwrap();
        assert_eq!(loaded.peer_id(), key.peer_id());
    }

    #[test]
    fn test_sign_verify() {
        let key = NodeKey::from_secret([3u8; 32]);
        let sig = key.sign(b"hello");
        assert!(NodeKey::verify(&key.peer_id(), b"hello", &sig));
        assert!(!NodeKey::verify(&key.peer_id(), b"other", &sig));
    }

    #[test]
    fn test_load_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.key");
        std::fs::write(&path, "nothex").unwrap();
        assert!(matches!(NodeKey::load(&path), Err(IdentityError::Malformed(_))));
    }
}

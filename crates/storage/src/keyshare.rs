//! File-backed keyshare store.
//!
//! Reads take the shared lock, writes the exclusive one. A write goes to a
//! sibling temp file which is fsynced and renamed over the target, so a
//! crash mid-reshare leaves either the old or the new share, never a mix.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use threshold_types::PeerId;
use tokio::io::AsyncWriteExt;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, info};

use crate::error::StorageError;

/// What a successful keygen leaves on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredKeyshare {
    /// Signing threshold `t`; `t + 1` parties sign.
    pub threshold: u16,
    /// Keygen party order. A peer's position is its party index.
    pub peers: Vec<PeerId>,
    /// Compressed SEC1 shared public key, hex.
    pub public_key: String,
    /// Opaque key material (incomplete share plus aux info).
    pub share: serde_json::Value,
}

impl StoredKeyshare {
    pub fn party_index(&self, peer: &PeerId) -> Option<u16> {
        self.peers.iter().position(|p| p == peer).map(|i| i as u16)
    }
}

#[derive(Clone)]
pub struct KeyshareStore {
    path: PathBuf,
    lock: Arc<RwLock<()>>,
}

impl KeyshareStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Arc::new(RwLock::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn get(&self) -> Result<StoredKeyshare, StorageError> {
        let _guard = self.lock.read().await;
        read_file(&self.path).await
    }

    pub async fn exists(&self) -> bool {
        let _guard = self.lock.read().await;
        tokio::fs::metadata(&self.path).await.is_ok()
    }

    pub async fn store(&self, share: &StoredKeyshare) -> Result<(), StorageError> {
        let _guard = self.lock.write().await;
        write_file(&self.path, share).await
    }

    /// Hold the exclusive lock across a read-modify-write, as reshare does.
    pub async fn lock(&self) -> KeyshareGuard {
        KeyshareGuard {
            path: self.path.clone(),
            _guard: self.lock.clone().write_owned().await,
        }
    }
}

/// Exclusive access to the keyshare file until dropped.
pub struct KeyshareGuard {
    path: PathBuf,
    _guard: OwnedRwLockWriteGuard<()>,
}

impl KeyshareGuard {
    pub async fn get(&self) -> Result<StoredKeyshare, StorageError> {
        read_file(&self.path).await
    }

    pub async fn store(&self, share: &StoredKeyshare) -> Result<(), StorageError> {
        write_file(&self.path, share).await
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        path: path.display().to_string(),
        source,
    }
}

async fn read_file(path: &Path) -> Result<StoredKeyshare, StorageError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(StorageError::NotInitialized)
        }
        Err(e) => return Err(io_err(path)(e)),
    };
    debug!("Loaded keyshare from {}", path.display());
    Ok(serde_json::from_slice(&bytes)?)
}

async fn write_file(path: &Path, share: &StoredKeyshare) -> Result<(), StorageError> {
    let bytes = serde_json::to_vec_pretty(share)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err(parent))?;
        }
    }

    let tmp = path.with_extension("tmp");
    let mut file = tokio::fs::File::create(&tmp).await.map_err(io_err(&tmp))?;
    file.write_all(&bytes).await.map_err(io_err(&tmp))?;
    file.sync_all().await.map_err(io_err(&tmp))?;
    drop(file);

    tokio::fs::rename(&tmp, path).await.map_err(io_err(path))?;
    info!("Stored keyshare at {}", path.display());
    Ok(())
}

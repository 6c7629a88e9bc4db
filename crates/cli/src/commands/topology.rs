//! Topology publishing helpers.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use common::{topology, AppConfig, Topology, TopologyHandle, TopologyProvider};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Fetch the published topology, falling back to the cleartext copy from a
/// previous run when the source is unreachable.
pub async fn load_topology(config: &AppConfig) -> Result<Topology> {
    let provider = TopologyProvider::new(config.topology.clone())?;
    match provider.fetch().await {
        Ok(topology) => Ok(topology),
        Err(e) if config.topology.path.exists() => {
            warn!(error = %e, "Topology fetch failed, using cached copy");
            Ok(TopologyProvider::load_cached(&config.topology.path).await?)
        }
        Err(e) => Err(e).context("Failed to load topology"),
    }
}

/// Re-fetch the topology every `every` and publish it when it changed.
/// Fetch failures keep the current snapshot.
pub async fn watch_topology(
    provider: TopologyProvider,
    handle: TopologyHandle,
    every: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(every) => {}
        }
        match provider.fetch().await {
            Ok(next) if *handle.current() != next => handle.replace(next),
            Ok(_) => debug!("Topology unchanged"),
            Err(e) => warn!(error = %e, "Topology refresh failed, keeping current"),
        }
    }
}

/// Encrypt a cleartext topology with the configured key and print the hash
/// to publish as `topology.expected_hash`.
pub async fn encrypt_topology(
    config: &AppConfig,
    path: &Path,
    out: Option<PathBuf>,
) -> Result<()> {
    let plaintext = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let parsed = Topology::from_json(&plaintext).context("Invalid topology document")?;

    let blob = topology::encrypt(&plaintext, &config.topology.encryption_key)?;
    let out = out.unwrap_or_else(|| path.with_extension("enc"));
    tokio::fs::write(&out, &blob)
        .await
        .with_context(|| format!("Failed to write {}", out.display()))?;

    println!("Encrypted topology written to {}", out.display());
    println!("  Peers:     {}", parsed.len());
    println!("  Threshold: {}", parsed.threshold());
    println!("  Hash:      {}", topology::hash(&blob));
    Ok(())
}

/// Fetch and decode the configured topology without starting the node.
pub async fn test_topology(config: &AppConfig) -> Result<()> {
    let provider = TopologyProvider::new(config.topology.clone())?;
    let topology = provider.fetch().await?;

    println!("Topology OK ({} of {})", topology.threshold() + 1, topology.len());
    for peer in topology.peers() {
        println!("  {}", peer);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{NodeKey, PeerAddress};

    const KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    fn sample_topology() -> Topology {
        let peers = (0..3)
            .map(|i| PeerAddress::new("127.0.0.1", 9100 + i, NodeKey::generate().peer_id()))
            .collect();
        Topology::new(peers, 1).unwrap()
    }

    fn config_for(dir: &Path, url: String) -> AppConfig {
        let mut config = AppConfig::default();
        config.topology.encryption_key = KEY.to_string();
        config.topology.url = url;
        config.topology.path = dir.join("topology.json");
        config
    }

    #[tokio::test]
    async fn test_encrypt_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let clear = dir.path().join("peers.json");
        let expected = sample_topology();
        std::fs::write(&clear, expected.to_json()).unwrap();

        let blob_path = dir.path().join("peers.enc");
        let config = config_for(dir.path(), blob_path.display().to_string());
        encrypt_topology(&config, &clear, None).await.unwrap();

        let loaded = load_topology(&config).await.unwrap();
        assert_eq!(loaded, expected);
        // The cleartext copy is persisted for later runs.
        assert!(config.topology.path.exists());
    }

    #[tokio::test]
    async fn test_encrypt_rejects_invalid_document() {
        let dir = tempfile::tempdir().unwrap();
        let clear = dir.path().join("peers.json");
        std::fs::write(&clear, br#"{"peers": [], "threshold": 1}"#).unwrap();

        let config = config_for(dir.path(), String::new());
        assert!(encrypt_topology(&config, &clear, None).await.is_err());
        assert!(!dir.path().join("peers.enc").exists());
    }

    #[tokio::test]
    async fn test_watch_publishes_changed_topology() {
        let dir = tempfile::tempdir().unwrap();
        let blob_path = dir.path().join("peers.enc");
        let config = config_for(dir.path(), blob_path.display().to_string());

        let first = sample_topology();
        std::fs::write(&blob_path, topology::encrypt(&first.to_json(), KEY).unwrap()).unwrap();
        let handle = TopologyHandle::new(first.clone());
        let mut updates = handle.subscribe();

        let cancel = CancellationToken::new();
        let provider = TopologyProvider::new(config.topology.clone()).unwrap();
        let watcher = tokio::spawn(watch_topology(
            provider,
            handle.clone(),
            Duration::from_millis(20),
            cancel.clone(),
        ));

        let second = sample_topology();
        std::fs::write(&blob_path, topology::encrypt(&second.to_json(), KEY).unwrap()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), updates.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*handle.current(), second);

        // A broken blob leaves the last good topology in place.
        std::fs::write(&blob_path, b"garbage").unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*handle.current(), second);

        cancel.cancel();
        watcher.await.unwrap();
    }

    #[tokio::test]
    async fn test_load_falls_back_to_cache() {
        let dir = tempfile::tempdir().unwrap();
        let expected = sample_topology();
        let config = config_for(dir.path(), dir.path().join("missing.enc").display().to_string());

        assert!(load_topology(&config).await.is_err());

        std::fs::write(&config.topology.path, expected.to_json()).unwrap();
        assert_eq!(load_topology(&config).await.unwrap(), expected);
    }
}

//! Key generation and refresh ceremonies.
//!
//! Every node in the topology runs the same ceremony with the same session
//! id; the leader is elected.

use std::sync::Arc;

use common::Topology;
use protocols::{Coordinator, KeygenProcess, ReshareProcess};
use threshold_storage::{KeyshareStore, StoredKeyshare};
use threshold_types::Error;
use tracing::info;

pub const KEYGEN_SESSION: &str = "keygen";
pub const REFRESH_SESSION: &str = "refresh";

/// Generate a fresh shared key among every topology peer.
pub async fn run_keygen(
    coordinator: &Coordinator,
    topology: &Topology,
    store: KeyshareStore,
    session_id: &str,
) -> Result<StoredKeyshare, Error> {
    if store.exists().await {
        return Err(Error::invalid(format!(
            "keyshare already present at {}",
            store.path().display()
        )));
    }
    let peers = topology.peer_ids();
    info!(
        session_id,
        parties = peers.len(),
        threshold = topology.threshold(),
        "Starting keygen"
    );
    let process = Arc::new(KeygenProcess::new(
        session_id,
        coordinator.self_id(),
        peers.clone(),
        topology.threshold(),
        store,
    ));
    finish(coordinator.execute(process, &peers, None).await?, session_id)
}

/// Regenerate auxiliary material for the existing key. The shared public
/// key is unchanged.
pub async fn run_refresh(
    coordinator: &Coordinator,
    store: KeyshareStore,
    session_id: &str,
) -> Result<StoredKeyshare, Error> {
    let current = store.get().await?;
    let peers = current.peers.clone();
    info!(session_id, parties = peers.len(), "Starting refresh");
    let process = Arc::new(ReshareProcess::new(
        session_id,
        coordinator.self_id(),
        peers.clone(),
        store,
    ));
    finish(coordinator.execute(process, &peers, None).await?, session_id)
}

fn finish(result: Option<StoredKeyshare>, session_id: &str) -> Result<StoredKeyshare, Error> {
    let share = result.ok_or_else(|| {
        Error::Coordination(format!("session {} already running", session_id))
    })?;
    info!(session_id, public_key = %share.public_key, "Ceremony complete");
    Ok(share)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::PeerAddress;
    use protocols::CoordinatorConfig;
    use threshold_consensus::{BullyElector, LeaderElector};
    use threshold_network::{CommBus, LocalNetwork};
    use threshold_types::PeerId;
    use tokio_util::sync::CancellationToken;

    fn coordinator() -> Coordinator {
        let net = LocalNetwork::new();
        let bus: Arc<dyn CommBus> = net.bus(PeerId::from_bytes([1; 32]));
        let elector: Arc<dyn LeaderElector> =
            Arc::new(BullyElector::new(bus.clone(), Default::default()));
        Coordinator::new(bus, elector, CoordinatorConfig::default(), CancellationToken::new())
    }

    #[tokio::test]
    async fn test_keygen_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keyshare.json");
        tokio::fs::write(&path, b"{}").await.unwrap();

        let topology = Topology::new(
            vec![
                PeerAddress::new("127.0.0.1", 9001, PeerId::from_bytes([1; 32])),
                PeerAddress::new("127.0.0.1", 9002, PeerId::from_bytes([2; 32])),
            ],
            1,
        )
        .unwrap();
        let err = run_keygen(&coordinator(), &topology, KeyshareStore::new(&path), KEYGEN_SESSION)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_refresh_needs_existing_share() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyshareStore::new(dir.path().join("keyshare.json"));
        let err = run_refresh(&coordinator(), store, REFRESH_SESSION)
            .await
            .unwrap_err();
        assert_eq!(err, Error::Internal("keyshare not initialized".to_string()));
    }
}

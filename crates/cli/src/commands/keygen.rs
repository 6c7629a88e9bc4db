//! Key ceremonies. Every peer in the topology runs the same command with the
//! same session id.

use std::sync::Arc;

use anyhow::Result;
use common::{AppConfig, NodeKey, TopologyHandle};
use protocols::{Coordinator, CoordinatorConfig};
use threshold_consensus::{BullyElector, LeaderElector};
use threshold_network::{CommBus, P2pBus};
use threshold_orchestrator::{run_keygen, run_refresh, KEYGEN_SESSION, REFRESH_SESSION};
use threshold_storage::KeyshareStore;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::topology::load_topology;

pub async fn keygen(config: AppConfig, refresh: bool, session_id: Option<String>) -> Result<()> {
    let key = NodeKey::load(&config.node.key_path)?;
    let topology = TopologyHandle::new(load_topology(&config).await?);
    let default_session = if refresh { REFRESH_SESSION } else { KEYGEN_SESSION };
    let session_id = session_id.unwrap_or_else(|| default_session.to_string());

    let cancel = CancellationToken::new();
    let bus: Arc<dyn CommBus> = P2pBus::start(
        key,
        &config.node.listen_addr,
        topology.subscribe(),
        cancel.child_token(),
    )
    .await?;
    let elector: Arc<dyn LeaderElector> =
        Arc::new(BullyElector::new(bus.clone(), config.election.clone()));
    let coordinator = Coordinator::new(
        bus,
        elector,
        CoordinatorConfig::from(&config.tss),
        cancel.child_token(),
    );
    let store = KeyshareStore::new(config.node.keyshare_path.clone());

    info!(%session_id, refresh, "Waiting for peers");
    let result = if refresh {
        run_refresh(&coordinator, store, &session_id).await
    } else {
        run_keygen(&coordinator, &topology.current(), store, &session_id).await
    };
    cancel.cancel();
    let share = result?;

    println!();
    println!("Keyshare written to {}", config.node.keyshare_path.display());
    println!("  Public key: {}", share.public_key);
    println!("  Threshold:  {}", share.threshold);
    println!("  Parties:    {}", share.peers.len());
    Ok(())
}

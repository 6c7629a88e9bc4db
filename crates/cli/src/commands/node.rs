//! The long-running signer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use common::{AppConfig, NodeKey, TopologyHandle, TopologyProvider};
use threshold_api::{start_server, AppState};
use threshold_chains::{
    ChainRegistry, HttpPriceOracle, LifiOrderClient, PriceOracle, StaticPriceOracle, TokenStore,
};
use threshold_network::{CommBus, P2pBus};
use threshold_orchestrator::{ServiceConfig, ServiceDeps, SigningService};
use threshold_storage::{BlockStore, KeyshareStore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::topology::{load_topology, watch_topology};

/// Start every node component and serve until Ctrl-C.
pub async fn run(config: AppConfig) -> Result<()> {
    info!("========================================");
    info!("  Signer Node Starting");
    info!("========================================");

    let key = NodeKey::load(&config.node.key_path)
        .with_context(|| "Node key missing, run `signer peer gen-key` first")?;
    let peer_id = key.peer_id();

    let topology = load_topology(&config).await?;
    if !topology.contains(&peer_id) {
        warn!(%peer_id, "This node is not part of the topology");
    }
    let topology = TopologyHandle::new(topology);

    let http_addr: SocketAddr = config
        .http
        .listen_addr
        .parse()
        .with_context(|| format!("Invalid http.listen_addr '{}'", config.http.listen_addr))?;

    let cancel = CancellationToken::new();

    let bus: Arc<dyn CommBus> = P2pBus::start(
        key,
        &config.node.listen_addr,
        topology.subscribe(),
        cancel.child_token(),
    )
    .await?;

    if config.topology.refresh_secs > 0 {
        let provider = TopologyProvider::new(config.topology.clone())?;
        tokio::spawn(watch_topology(
            provider,
            topology.clone(),
            Duration::from_secs(config.topology.refresh_secs),
            cancel.child_token(),
        ));
    }

    let chains = ChainRegistry::connect(&config.chains)?;
    let tokens = Arc::new(TokenStore::from_config(&config.tokens));
    let oracle: Arc<dyn PriceOracle> = match &config.price.url {
        Some(url) => Arc::new(HttpPriceOracle::new(url.clone())?),
        None => Arc::new(StaticPriceOracle::new(tokens.static_prices().clone())),
    };
    let orders = Arc::new(LifiOrderClient::new(config.lifi.order_api_url.clone())?);
    let blocks = Arc::new(BlockStore::open(&config.node.block_store_path)?);

    info!("Node configuration:");
    info!("  - Peer ID: {}", peer_id);
    info!("  - Peer listener: {}", config.node.listen_addr);
    info!("  - HTTP: {}", http_addr);
    info!("  - Chains: {:?}", chains.ids());
    info!("  - Keyshare: {}", config.node.keyshare_path.display());

    let deps = ServiceDeps {
        bus,
        topology,
        keyshare: KeyshareStore::new(config.node.keyshare_path.clone()),
        chains,
        tokens,
        oracle,
        orders,
        blocks,
    };
    let running = SigningService::start(deps, ServiceConfig::from(&config), cancel.clone());

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
        }
        shutdown.cancel();
    });

    let state = AppState::new(running.service.clone());
    let served = start_server(state, http_addr, cancel.clone()).await;

    cancel.cancel();
    for task in running.tasks {
        let _ = task.await;
    }
    info!("Signer stopped");
    served
}

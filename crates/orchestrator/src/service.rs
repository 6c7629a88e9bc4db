//! Node wiring and the facade the HTTP surface calls into.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::Address;
use common::{AppConfig, ElectionConfig, TopologyHandle};
use protocols::{Coordinator, CoordinatorConfig};
use serde::Serialize;
use threshold_chains::{ChainRegistry, OrderApi, PriceOracle, TokenStore};
use threshold_consensus::{BullyElector, LeaderElector};
use threshold_network::CommBus;
use threshold_storage::{BlockStore, KeyshareStore};
use threshold_types::{Error, MessageType, PeerId};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache::SignatureCache;
use crate::confirmations::ConfirmationWatcher;
use crate::digest::{address_from_public_key, recover_signer};
use crate::handlers::{
    AcrossPipeline, HandlerContext, LifiEscrowPipeline, LifiUnlockPipeline, PipelineHandler,
};
use crate::listener::{spawn_deposit_listeners, DepositIndex};
use crate::message::{Accepted, Intent, IntentMessage, IntentRequest};
use crate::relayer::{Relayer, DEFAULT_QUEUE_CAPACITY};

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub coordinator: CoordinatorConfig,
    pub election: ElectionConfig,
    pub unlock_timeout: Duration,
    /// How long `/status` waits for a signature that is not cached yet.
    pub status_wait: Duration,
    pub fetch_timeout: Duration,
    pub signature_ttl: Duration,
}

impl From<&AppConfig> for ServiceConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            coordinator: CoordinatorConfig::from(&config.tss),
            election: config.election.clone(),
            unlock_timeout: Duration::from_secs(config.tss.unlock_timeout_secs),
            status_wait: Duration::from_secs(config.http.request_timeout_secs),
            fetch_timeout: Duration::from_secs(config.tss.fetch_timeout_secs),
            signature_ttl: Duration::from_secs(config.tss.signature_ttl_secs),
        }
    }
}

/// Everything a running node needs from the outside world.
pub struct ServiceDeps {
    pub bus: Arc<dyn CommBus>,
    pub topology: TopologyHandle,
    pub keyshare: KeyshareStore,
    pub chains: ChainRegistry,
    pub tokens: Arc<TokenStore>,
    pub oracle: Arc<dyn PriceOracle>,
    pub orders: Arc<dyn OrderApi>,
    pub blocks: Arc<BlockStore>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignatureResponse {
    pub id: String,
    #[serde(with = "crate::message::hex_bytes")]
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub peer_id: String,
    pub peers: usize,
    pub keyshare: bool,
}

pub struct SigningService {
    ctx: Arc<HandlerContext>,
    intents: mpsc::Sender<IntentRequest>,
    unlock_timeout: Duration,
    status_wait: Duration,
}

/// A started node: the facade, the coordinator (for ceremonies) and the
/// background tasks.
pub struct RunningService {
    pub service: Arc<SigningService>,
    pub coordinator: Arc<Coordinator>,
    pub tasks: Vec<JoinHandle<()>>,
}

impl SigningService {
    /// Build every component and spawn the background tasks under `cancel`.
    pub fn start(deps: ServiceDeps, config: ServiceConfig, cancel: CancellationToken) -> RunningService {
        let elector: Arc<dyn LeaderElector> =
            Arc::new(BullyElector::new(deps.bus.clone(), config.election.clone()));
        let coordinator = Arc::new(Coordinator::new(
            deps.bus.clone(),
            elector,
            config.coordinator.clone(),
            cancel.child_token(),
        ));

        let mut tasks = Vec::new();
        let cache = SignatureCache::new(config.signature_ttl);
        tasks.push(cache.spawn_sweeper(cancel.child_token()));
        tasks.push(cache.spawn_gossip_listener(deps.bus.clone(), cancel.child_token()));

        let watcher = Arc::new(ConfirmationWatcher::new(
            deps.chains.clone(),
            deps.tokens.clone(),
            deps.oracle.clone(),
        ));
        let index = DepositIndex::new();
        tasks.extend(spawn_deposit_listeners(
            &deps.chains,
            deps.blocks.clone(),
            index.clone(),
            &cancel,
        ));

        let ctx = Arc::new(HandlerContext {
            bus: deps.bus.clone(),
            coordinator: coordinator.clone(),
            keyshare: deps.keyshare,
            topology: deps.topology,
            cache,
            chains: deps.chains,
            tokens: deps.tokens,
            watcher,
            fetch_timeout: config.fetch_timeout,
            cancel: cancel.child_token(),
        });

        let mut relayer = Relayer::new(DEFAULT_QUEUE_CAPACITY);
        relayer.register(
            MessageType::AcrossMsg,
            Arc::new(PipelineHandler::new(ctx.clone(), AcrossPipeline::new(ctx.clone(), index))),
        );
        relayer.register(
            MessageType::LifiEscrowMsg,
            Arc::new(PipelineHandler::new(
                ctx.clone(),
                LifiEscrowPipeline::new(ctx.clone(), deps.orders.clone()),
            )),
        );
        relayer.register(
            MessageType::LifiUnlockMsg,
            Arc::new(PipelineHandler::new(
                ctx.clone(),
                LifiUnlockPipeline::new(ctx.clone(), deps.orders),
            )),
        );
        tasks.extend(relayer.bridge(deps.bus, &cancel));
        let intents = relayer.sender();
        tasks.push(tokio::spawn(relayer.run(cancel.child_token())));

        info!(peer_id = %ctx.self_id(), "Signing service started");
        RunningService {
            service: Arc::new(Self {
                ctx,
                intents,
                unlock_timeout: config.unlock_timeout,
                status_wait: config.status_wait,
            }),
            coordinator,
            tasks,
        }
    }

    pub fn self_id(&self) -> PeerId {
        self.ctx.self_id()
    }

    /// Hand an intent to its handler and wait for the verdict.
    pub async fn submit(&self, intent: Intent) -> Result<Accepted, Error> {
        self.ctx.chains.require(intent.chain_id())?;
        let (tx, rx) = oneshot::channel();
        self.intents
            .send(IntentRequest {
                message: IntentMessage::new(intent),
                ack: Some(tx),
            })
            .await
            .map_err(|_| Error::internal("relayer stopped"))?;
        rx.await
            .map_err(|_| Error::internal("intent dropped without a verdict"))?
    }

    /// Submit an unlock and wait for its signature, which must recover to
    /// the shared key's address.
    pub async fn unlock(&self, intent: Intent) -> Result<SignatureResponse, Error> {
        let work = async {
            let accepted = self.submit(intent).await?;
            let cancel = self.ctx.cancel.child_token();
            let signature = self
                .ctx
                .cache
                .subscribe(&accepted.session_id, &cancel)
                .await
                .ok_or_else(|| Error::internal("service shutting down"))?;
            Ok::<_, Error>((accepted, signature))
        };
        let (accepted, signature) = tokio::time::timeout(self.unlock_timeout, work)
            .await
            .map_err(|_| Error::Timeout)??;

        let expected = self.mpc_address().await?;
        let signer = recover_signer(&accepted.digest, &signature)?;
        if signer != expected {
            warn!(session_id = %accepted.session_id, %signer, %expected, "Unlock signature from wrong key");
            return Err(Error::internal("invalid signature"));
        }
        Ok(SignatureResponse {
            id: accepted.session_id,
            signature,
        })
    }

    /// A cached signature, waiting briefly for one still in flight.
    pub async fn status(&self, id: &str) -> Result<Vec<u8>, Error> {
        if let Some(signature) = self.ctx.cache.signature(id) {
            return Ok(signature);
        }
        let cancel = self.ctx.cancel.child_token();
        match tokio::time::timeout(self.status_wait, self.ctx.cache.subscribe(id, &cancel)).await {
            Ok(Some(signature)) => Ok(signature),
            _ => Err(Error::NotFound(format!("signature {} not found", id))),
        }
    }

    pub fn confirmations(&self, chain_id: u64) -> Result<BTreeMap<u64, u64>, Error> {
        let buckets = self.ctx.watcher.buckets(chain_id)?;
        if buckets.is_empty() {
            return Err(Error::NotFound(format!(
                "no confirmation buckets for chain '{}'",
                chain_id
            )));
        }
        Ok(buckets)
    }

    pub async fn mpc_address(&self) -> Result<Address, Error> {
        let share = self.ctx.keyshare.get().await?;
        address_from_public_key(&share.public_key)
    }

    pub async fn health(&self) -> Health {
        Health {
            status: "ok",
            peer_id: self.self_id().to_string(),
            peers: self.ctx.topology.current().len(),
            keyshare: self.ctx.keyshare.exists().await,
        }
    }
}

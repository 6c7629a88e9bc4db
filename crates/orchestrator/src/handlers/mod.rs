//! Intent handlers.
//!
//! Every family runs the same pipeline:
//!
//! 1. notify peers (once, by the node that first saw the intent)
//! 2. fetch and validate the intent's evidence, wait for confirmations
//! 3. acknowledge the caller
//! 4. sign the resulting digest and publish the signature
//!
//! Submodules implement step 2 per family:
//! - `across`: spoke pool deposits
//! - `lifi_escrow`: escrow orders backed by resource locks
//! - `lifi_unlock`: input settler unlocks

mod across;
mod lifi_escrow;
mod lifi_unlock;

pub use across::AcrossPipeline;
pub use lifi_escrow::{order_identifier, LifiEscrowPipeline};
pub use lifi_unlock::LifiUnlockPipeline;

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, Bytes, B256};
use alloy_sol_types::SolCall;
use async_trait::async_trait;
use common::{EventType, LogEvent, TopologyHandle};
use protocols::{Coordinator, ProtocolError, SigningProcess};
use threshold_chains::{Chain, ChainRegistry, TokenStore};
use threshold_network::CommBus;
use threshold_storage::KeyshareStore;
use threshold_types::{Error, MessageType, PeerId};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::SignatureCache;
use crate::confirmations::ConfirmationWatcher;
use crate::message::{Accepted, Ack, IntentMessage, SignatureMessage, INTENT_TOPIC, SIGNATURE_TOPIC};

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything a handler touches, shared by all families.
pub struct HandlerContext {
    pub bus: Arc<dyn CommBus>,
    pub coordinator: Arc<Coordinator>,
    pub keyshare: KeyshareStore,
    pub topology: TopologyHandle,
    pub cache: Arc<SignatureCache>,
    pub chains: ChainRegistry,
    pub tokens: Arc<TokenStore>,
    pub watcher: Arc<ConfirmationWatcher>,
    pub fetch_timeout: Duration,
    pub cancel: CancellationToken,
}

impl HandlerContext {
    pub fn self_id(&self) -> PeerId {
        self.bus.self_id()
    }

    fn others(&self) -> Vec<PeerId> {
        let self_id = self.self_id();
        self.topology
            .current()
            .peer_ids()
            .into_iter()
            .filter(|p| *p != self_id)
            .collect()
    }

    /// Forward an intent nobody has claimed yet, naming this node as its
    /// coordinator. Intents that already carry a coordinator are left alone.
    pub async fn notify(&self, message: &mut IntentMessage) {
        if message.coordinator.is_some() {
            return;
        }
        message.coordinator = Some(self.self_id());
        let others = self.others();
        debug!(
            session_id = %message.intent.session_id(),
            peers = others.len(),
            "Notifying peers of intent"
        );
        self.bus
            .broadcast(&others, message.encode(), message.intent.msg_type(), INTENT_TOPIC)
            .await;
    }

    /// Await an external lookup, reporting `"{what} not found"` when it
    /// outlives the fetch timeout.
    pub async fn fetch<T, E, F>(&self, what: impl Display, fut: F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<Error>,
    {
        match tokio::time::timeout(self.fetch_timeout, fut).await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => Err(Error::NotFound(format!("{} not found", what))),
        }
    }

    /// Run a signing session for `digest`. Returns `None` when this node
    /// was not needed (duplicate session or outside the signer subset).
    pub async fn sign(
        &self,
        session_id: &str,
        digest: B256,
        coordinator: Option<PeerId>,
    ) -> Result<Option<Vec<u8>>, Error> {
        let keyshare = self.keyshare.get().await?;
        let topology = self.topology.current();
        let peers: Vec<PeerId> = keyshare
            .peers
            .iter()
            .filter(|p| topology.contains(p))
            .copied()
            .collect();

        let process = Arc::new(SigningProcess::new(
            session_id,
            self.self_id(),
            digest.0,
            keyshare,
        ));
        match self.coordinator.execute(process, &peers, coordinator).await {
            Ok(Some(result)) => {
                self.publish(&result.id, result.signature.clone(), &peers)
                    .await;
                Ok(Some(result.signature))
            }
            Ok(None) | Err(ProtocolError::NotInSubset) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Cache a finished signature and gossip it to `peers`.
    pub async fn publish(&self, id: &str, signature: Vec<u8>, peers: &[PeerId]) {
        self.cache.insert(id, signature.clone());
        let self_id = self.self_id();
        let others: Vec<PeerId> = peers.iter().filter(|p| **p != self_id).copied().collect();
        let msg = SignatureMessage {
            id: id.to_string(),
            signature,
        };
        self.bus
            .broadcast(&others, msg.encode(), MessageType::SignatureMsg, SIGNATURE_TOPIC)
            .await;
    }
}

/// Call a view function on `to` and decode its return.
pub async fn call_contract<C: SolCall>(chain: &Chain, to: Address, call: &C) -> Result<C::Return, Error> {
    let data = chain
        .client
        .call(to, Bytes::from(call.abi_encode()))
        .await?;
    C::abi_decode_returns(&data)
        .map_err(|e| Error::unavailable(format!("failed to decode {}: {}", C::SIGNATURE, e)))
}

pub fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// Output of a family's validation step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prepared {
    pub session_id: String,
    pub digest: B256,
}

/// Family-specific fetch, validation and digest construction.
#[async_trait]
pub trait IntentPipeline: Send + Sync {
    fn family(&self) -> &'static str;

    async fn prepare(&self, message: &IntentMessage) -> Result<Prepared, Error>;
}

#[async_trait]
pub trait IntentHandler: Send + Sync {
    async fn handle(&self, message: IntentMessage, ack: Ack) -> Result<(), Error>;
}

/// Runs an [`IntentPipeline`] through notify, ack and sign.
pub struct PipelineHandler<P> {
    ctx: Arc<HandlerContext>,
    pipeline: P,
}

impl<P: IntentPipeline> PipelineHandler<P> {
    pub fn new(ctx: Arc<HandlerContext>, pipeline: P) -> Self {
        Self { ctx, pipeline }
    }
}

#[async_trait]
impl<P: IntentPipeline> IntentHandler for PipelineHandler<P> {
    async fn handle(&self, mut message: IntentMessage, mut ack: Ack) -> Result<(), Error> {
        let session_id = message.intent.session_id();
        self.ctx.notify(&mut message).await;

        let prepared = match self.pipeline.prepare(&message).await {
            Ok(prepared) => prepared,
            Err(e) => {
                LogEvent::new(EventType::IntentRejected)
                    .session(&session_id)
                    .protocol(self.pipeline.family())
                    .error(&e)
                    .emit();
                ack.reject(e.clone());
                return Err(e);
            }
        };

        LogEvent::new(EventType::IntentAccepted)
            .session(&prepared.session_id)
            .protocol(self.pipeline.family())
            .field("digest", prepared.digest)
            .emit();
        ack.accept(Accepted {
            session_id: prepared.session_id.clone(),
            digest: prepared.digest,
        });

        match self
            .ctx
            .sign(&prepared.session_id, prepared.digest, message.coordinator)
            .await
        {
            Ok(Some(_)) => {
                info!(session_id = %prepared.session_id, "Signature produced");
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                warn!(session_id = %prepared.session_id, error = %e, "Signing failed");
                Err(e)
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::harness;
    use super::*;
    use crate::message::Intent;
    use alloy_primitives::U256;
    use threshold_chains::MockEvmClient;
    use tokio::sync::oneshot;

    struct FixedPipeline(Result<Prepared, Error>);

    #[async_trait]
    impl IntentPipeline for FixedPipeline {
        fn family(&self) -> &'static str {
            "fixed"
        }

        async fn prepare(&self, _message: &IntentMessage) -> Result<Prepared, Error> {
            self.0.clone()
        }
    }

    fn intent() -> IntentMessage {
        IntentMessage::new(Intent::Across {
            chain_id: 8453,
            deposit_id: U256::from(100),
        })
    }

    #[tokio::test]
    async fn test_notify_claims_coordinator_once() {
        let h = harness(MockEvmClient::new(), MockEvmClient::new());
        let mut sub = h.peer.subscribe(INTENT_TOPIC, MessageType::AcrossMsg);

        let mut msg = intent();
        h.ctx.notify(&mut msg).await;
        assert_eq!(msg.coordinator, Some(h.ctx.self_id()));

        let env = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .unwrap()
            .unwrap();
        let forwarded = IntentMessage::decode(&env.payload).unwrap();
        assert_eq!(forwarded, msg);

        // Already claimed: nothing else goes out.
        h.ctx.notify(&mut msg).await;
        assert!(
            tokio::time::timeout(Duration::from_millis(100), sub.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_fetch_timeout_reports_not_found() {
        let h = harness(MockEvmClient::new(), MockEvmClient::new());
        let err = h
            .ctx
            .fetch("order 0x01", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<(), Error>(())
            })
            .await
            .unwrap_err();
        assert_eq!(err, Error::NotFound("order 0x01 not found".to_string()));
    }

    #[tokio::test]
    async fn test_rejection_reaches_caller() {
        let h = harness(MockEvmClient::new(), MockEvmClient::new());
        let handler = PipelineHandler::new(
            h.ctx.clone(),
            FixedPipeline(Err(Error::policy("fill deadline passed"))),
        );

        let (tx, rx) = oneshot::channel();
        let err = handler.handle(intent(), Ack::new(Some(tx))).await.unwrap_err();
        assert_eq!(err, Error::policy("fill deadline passed"));
        assert_eq!(rx.await.unwrap(), Err(Error::policy("fill deadline passed")));
        assert!(h.ctx.cache.is_empty());
    }

    #[tokio::test]
    async fn test_accept_then_sign_without_keyshare_fails() {
        let h = harness(MockEvmClient::new(), MockEvmClient::new());
        let prepared = Prepared {
            session_id: "8453-100".to_string(),
            digest: B256::repeat_byte(0x42),
        };
        let handler = PipelineHandler::new(h.ctx.clone(), FixedPipeline(Ok(prepared.clone())));

        let (tx, rx) = oneshot::channel();
        let err = handler.handle(intent(), Ack::new(Some(tx))).await.unwrap_err();
        assert_eq!(
            rx.await.unwrap(),
            Ok(Accepted {
                session_id: prepared.session_id,
                digest: prepared.digest,
            })
        );
        assert_eq!(err, Error::Internal("keyshare not initialized".to_string()));
    }

    #[tokio::test]
    async fn test_publish_caches_and_gossips() {
        let h = harness(MockEvmClient::new(), MockEvmClient::new());
        let mut sub = h.peer.subscribe(SIGNATURE_TOPIC, MessageType::SignatureMsg);
        let peers = h.ctx.topology.current().peer_ids();

        h.ctx.publish("8453-100", vec![5; 65], &peers).await;
        assert_eq!(h.ctx.cache.signature("8453-100"), Some(vec![5; 65]));

        let env = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(env.from, h.bus.self_id());
        let msg = SignatureMessage::decode(&env.payload).unwrap();
        assert_eq!(msg.id, "8453-100");
    }
}

//! Routes intents to their family handler.
//!
//! Intents arrive from two places: the HTTP surface (with an ack channel)
//! and peers forwarding on the intent topic (without one). Both end up on
//! one queue; each request runs in its own task.

use std::collections::HashMap;
use std::sync::Arc;

use threshold_network::CommBus;
use threshold_types::MessageType;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::handlers::IntentHandler;
use crate::message::{Ack, IntentMessage, IntentRequest, INTENT_TOPIC};

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

pub struct Relayer {
    handlers: HashMap<MessageType, Arc<dyn IntentHandler>>,
    tx: mpsc::Sender<IntentRequest>,
    rx: mpsc::Receiver<IntentRequest>,
}

impl Relayer {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            handlers: HashMap::new(),
            tx,
            rx,
        }
    }

    pub fn sender(&self) -> mpsc::Sender<IntentRequest> {
        self.tx.clone()
    }

    pub fn register(&mut self, msg_type: MessageType, handler: Arc<dyn IntentHandler>) {
        self.handlers.insert(msg_type, handler);
    }

    /// Feed intents forwarded by peers into the queue, one listener per
    /// registered family.
    pub fn bridge(&self, bus: Arc<dyn CommBus>, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        self.handlers
            .keys()
            .map(|msg_type| {
                let mut sub = bus.subscribe(INTENT_TOPIC, *msg_type);
                let tx = self.tx.clone();
                let cancel = cancel.clone();
                let msg_type = *msg_type;
                tokio::spawn(async move {
                    loop {
                        let env = tokio::select! {
                            _ = cancel.cancelled() => return,
                            env = sub.recv() => match env {
                                Some(env) => env,
                                None => return,
                            },
                        };
                        let Some(message) = IntentMessage::decode(&env.payload) else {
                            warn!(peer = %env.from.short(), ?msg_type, "Malformed intent");
                            continue;
                        };
                        if message.intent.msg_type() != msg_type || message.coordinator.is_none() {
                            warn!(peer = %env.from.short(), ?msg_type, "Dropping inconsistent intent");
                            continue;
                        }
                        debug!(
                            peer = %env.from.short(),
                            session_id = %message.intent.session_id(),
                            "Intent received from peer"
                        );
                        if tx.send(IntentRequest { message, ack: None }).await.is_err() {
                            return;
                        }
                    }
                })
            })
            .collect()
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        info!(families = self.handlers.len(), "Relayer started");
        loop {
            let request = tokio::select! {
                _ = cancel.cancelled() => break,
                request = self.rx.recv() => match request {
                    Some(r) => r,
                    None => break,
                },
            };
            self.dispatch(request);
        }
        info!("Relayer stopped");
    }

    fn dispatch(&self, request: IntentRequest) {
        let IntentRequest { message, ack } = request;
        let msg_type = message.intent.msg_type();
        let mut ack = Ack::new(ack);

        let Some(handler) = self.handlers.get(&msg_type).cloned() else {
            warn!(?msg_type, "No handler for intent type");
            ack.reject(threshold_types::Error::invalid(format!(
                "unsupported message type {:?}",
                msg_type
            )));
            return;
        };

        tokio::spawn(async move {
            let session_id = message.intent.session_id();
            if let Err(e) = handler.handle(message, ack).await {
                debug!(session_id = %session_id, error = %e, "Intent handling ended with error");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Accepted, Intent};
    use alloy_primitives::{B256, U256};
    use async_trait::async_trait;
    use std::time::Duration;
    use threshold_network::LocalNetwork;
    use threshold_types::{Error, PeerId};
    use tokio::sync::oneshot;

    /// Accepts everything and reports what it saw.
    struct Recording(mpsc::UnboundedSender<IntentMessage>);

    #[async_trait]
    impl IntentHandler for Recording {
        async fn handle(&self, message: IntentMessage, mut ack: Ack) -> Result<(), Error> {
            ack.accept(Accepted {
                session_id: message.intent.session_id(),
                digest: B256::ZERO,
            });
            let _ = self.0.send(message);
            Ok(())
        }
    }

    fn across() -> IntentMessage {
        IntentMessage::new(Intent::Across {
            chain_id: 8453,
            deposit_id: U256::from(1),
        })
    }

    #[tokio::test]
    async fn test_routes_by_type_and_acks() {
        let (seen_tx, mut seen) = mpsc::unbounded_channel();
        let mut relayer = Relayer::new(16);
        relayer.register(MessageType::AcrossMsg, Arc::new(Recording(seen_tx)));
        let tx = relayer.sender();
        let cancel = CancellationToken::new();
        tokio::spawn(relayer.run(cancel.clone()));

        let (ack_tx, ack_rx) = oneshot::channel();
        tx.send(IntentRequest {
            message: across(),
            ack: Some(ack_tx),
        })
        .await
        .unwrap();

        assert_eq!(ack_rx.await.unwrap().unwrap().session_id, "8453-1");
        assert_eq!(seen.recv().await.unwrap(), across());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_unknown_type_is_rejected() {
        let relayer = Relayer::new(16);
        let tx = relayer.sender();
        let cancel = CancellationToken::new();
        tokio::spawn(relayer.run(cancel.clone()));

        let (ack_tx, ack_rx) = oneshot::channel();
        tx.send(IntentRequest {
            message: across(),
            ack: Some(ack_tx),
        })
        .await
        .unwrap();
        assert!(matches!(ack_rx.await.unwrap(), Err(Error::InvalidInput(_))));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_bridges_peer_intents() {
        let net = LocalNetwork::new();
        let a = PeerId::from_bytes([1; 32]);
        let b = PeerId::from_bytes([2; 32]);
        let bus_a = net.bus(a);
        let bus_b: Arc<dyn CommBus> = net.bus(b);

        let (seen_tx, mut seen) = mpsc::unbounded_channel();
        let mut relayer = Relayer::new(16);
        relayer.register(MessageType::AcrossMsg, Arc::new(Recording(seen_tx)));
        let cancel = CancellationToken::new();
        let _bridges = relayer.bridge(bus_b, &cancel);
        tokio::spawn(relayer.run(cancel.clone()));

        // Without a coordinator the intent is not trusted.
        bus_a
            .broadcast(&[b], across().encode(), MessageType::AcrossMsg, INTENT_TOPIC)
            .await;
        let mut claimed = across();
        claimed.coordinator = Some(a);
        bus_a
            .broadcast(&[b], claimed.encode(), MessageType::AcrossMsg, INTENT_TOPIC)
            .await;

        let got = tokio::time::timeout(Duration::from_secs(1), seen.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.coordinator, Some(a));
        assert!(seen.try_recv().is_err());
        cancel.cancel();
    }
}

//! TCP implementation of the communication bus.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use common::{NodeKey, SharedTopology};
use threshold_types::{MessageType, PeerId};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::{CommBus, Envelope, Subscription, SubscriptionId, SubscriptionRegistry};
use crate::connection::ConnectionManager;
use crate::error::NetworkError;
use crate::frame::Frame;
use crate::listener::spawn_listener;
use crate::queue::{DeliveryQueue, DEFAULT_QUEUE_CAPACITY};

type Outbox = Arc<DeliveryQueue<Frame>>;

pub struct P2pBus {
    self_id: PeerId,
    registry: Arc<SubscriptionRegistry>,
    connections: Arc<ConnectionManager>,
    outboxes: Mutex<HashMap<PeerId, Outbox>>,
    local_addr: SocketAddr,
    cancel: CancellationToken,
}

impl P2pBus {
    /// Bind the listener and start the topology watcher.
    pub async fn start(
        key: NodeKey,
        listen_addr: &str,
        topology: SharedTopology,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>, NetworkError> {
        let registry = SubscriptionRegistry::new();
        let (local_addr, _listener) = spawn_listener(
            listen_addr,
            key.clone(),
            topology.clone(),
            registry.clone(),
            cancel.clone(),
        )
        .await?;

        let bus = Arc::new(Self {
            self_id: key.peer_id(),
            registry,
            connections: Arc::new(ConnectionManager::new(key, topology.clone())),
            outboxes: Mutex::new(HashMap::new()),
            local_addr,
            cancel,
        });

        tokio::spawn(watch_topology(Arc::downgrade(&bus), topology));
        Ok(bus)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    fn outbox(&self, peer: &PeerId) -> Outbox {
        let mut outboxes = match self.outboxes.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        outboxes
            .entry(*peer)
            .or_insert_with(|| {
                let queue: Outbox = Arc::new(DeliveryQueue::new(DEFAULT_QUEUE_CAPACITY));
                tokio::spawn(drain_outbox(
                    *peer,
                    queue.clone(),
                    self.connections.clone(),
                    self.cancel.clone(),
                ));
                queue
            })
            .clone()
    }

    fn enqueue(&self, peer: &PeerId, frame: Frame) -> Result<(), NetworkError> {
        if *peer == self.self_id {
            self.registry.deliver(Envelope {
                from: self.self_id,
                session_id: frame.session_id,
                msg_type: frame.msg_type,
                payload: frame.payload,
            });
            return Ok(());
        }
        if self.outbox(peer).push(frame) {
            Ok(())
        } else {
            Err(NetworkError::PeerUnavailable { peer: *peer })
        }
    }

    async fn close_removed(&self, topology: &common::Topology) {
        let removed: Vec<(PeerId, Outbox)> = {
            let mut outboxes = match self.outboxes.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            let gone: Vec<PeerId> = outboxes
                .keys()
                .filter(|p| !topology.contains(p))
                .copied()
                .collect();
            gone.into_iter()
                .filter_map(|p| outboxes.remove(&p).map(|q| (p, q)))
                .collect()
        };
        for (_, queue) in removed {
            queue.close();
        }
        self.connections.prune().await;
    }
}

async fn drain_outbox(
    peer: PeerId,
    queue: Outbox,
    connections: Arc<ConnectionManager>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return,
            frame = queue.recv() => match frame {
                Some(f) => f,
                None => return,
            },
        };
        if let Err(e) = connections.send(&peer, &frame).await {
            warn!(
                "Dropping {} for peer {} (session {}): {}",
                frame.msg_type,
                peer.short(),
                frame.session_id,
                e
            );
        }
    }
}

async fn watch_topology(bus: std::sync::Weak<P2pBus>, mut topology: SharedTopology) {
    while topology.changed().await.is_ok() {
        let Some(bus) = bus.upgrade() else { return };
        let snapshot = topology.borrow_and_update().clone();
        debug!("Topology changed, pruning peer streams");
        bus.close_removed(&snapshot).await;
    }
}

#[async_trait]
impl CommBus for P2pBus {
    fn self_id(&self) -> PeerId {
        self.self_id
    }

    async fn broadcast(
        &self,
        peers: &[PeerId],
        payload: Vec<u8>,
        msg_type: MessageType,
        session_id: &str,
    ) {
        for peer in peers {
            let frame = Frame::new(session_id, msg_type, payload.clone());
            if let Err(e) = self.enqueue(peer, frame) {
                warn!("Broadcast to peer {} failed: {}", peer.short(), e);
            }
        }
    }

    async fn send(
        &self,
        peer: &PeerId,
        payload: Vec<u8>,
        msg_type: MessageType,
        session_id: &str,
    ) -> Result<(), NetworkError> {
        self.enqueue(peer, Frame::new(session_id, msg_type, payload))
    }

    fn subscribe(&self, session_id: &str, msg_type: MessageType) -> Subscription {
        self.registry.subscribe(session_id, msg_type)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.registry.unsubscribe(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{PeerAddress, Topology, TopologyHandle};
    use std::time::Duration;

    async fn cluster(n: usize) -> (Vec<Arc<P2pBus>>, TopologyHandle, Vec<NodeKey>) {
        // Bind first on ephemeral ports, then publish the real addresses.
        let keys: Vec<NodeKey> = (0..n).map(|_| NodeKey::generate()).collect();
        let placeholder = Topology::new(
            keys.iter()
                .map(|k| PeerAddress::new("127.0.0.1", 1, k.peer_id()))
                .collect(),
            1,
        )
        .unwrap();
        let handle = TopologyHandle::new(placeholder);

        let mut buses = Vec::new();
        for k in &keys {
            let bus = P2pBus::start(
                k.clone(),
                "127.0.0.1:0",
                handle.subscribe(),
                CancellationToken::new(),
            )
            .await
            .unwrap();
            buses.push(bus);
        }

        let real = Topology::new(
            keys.iter()
                .zip(&buses)
                .map(|(k, b)| PeerAddress::new("127.0.0.1", b.local_addr().port(), k.peer_id()))
                .collect(),
            1,
        )
        .unwrap();
        handle.replace(real);
        (buses, handle, keys)
    }

    #[tokio::test]
    async fn test_broadcast_reaches_subscribers_with_sender_identity() {
        let (buses, _handle, keys) = cluster(3).await;
        let mut sub1 = buses[1].subscribe("s", MessageType::TssInitiateMsg);
        let mut sub2 = buses[2].subscribe("s", MessageType::TssInitiateMsg);

        let peers: Vec<PeerId> = keys.iter().map(|k| k.peer_id()).collect();
        buses[0]
            .broadcast(&peers[1..], b"hi".to_vec(), MessageType::TssInitiateMsg, "s")
            .await;

        for sub in [&mut sub1, &mut sub2] {
            let env = tokio::time::timeout(Duration::from_secs(5), sub.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(env.from, keys[0].peer_id());
            assert_eq!(env.payload, b"hi");
        }
    }

    #[tokio::test]
    async fn test_send_to_self_is_local() {
        let (buses, _handle, keys) = cluster(2).await;
        let mut sub = buses[0].subscribe("s", MessageType::TssReadyMsg);
        buses[0]
            .send(&keys[0].peer_id(), vec![1], MessageType::TssReadyMsg, "s")
            .await
            .unwrap();
        let env = sub.recv().await.unwrap();
        assert_eq!(env.from, keys[0].peer_id());
    }

    #[tokio::test]
    async fn test_frames_preserve_order_per_stream() {
        let (buses, _handle, keys) = cluster(2).await;
        let mut sub = buses[1].subscribe("s", MessageType::TssKeySignMsg);
        for i in 0..20u8 {
            buses[0]
                .send(&keys[1].peer_id(), vec![i], MessageType::TssKeySignMsg, "s")
                .await
                .unwrap();
        }
        for i in 0..20u8 {
            let env = tokio::time::timeout(Duration::from_secs(5), sub.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(env.payload, vec![i]);
        }
    }

    #[tokio::test]
    async fn test_send_outside_topology_is_dropped() {
        let (buses, _handle, _keys) = cluster(2).await;
        let stranger = NodeKey::generate().peer_id();
        // Enqueue succeeds; the outbox logs the gate refusal and drops the frame.
        buses[0]
            .send(&stranger, vec![1], MessageType::TssReadyMsg, "s")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!buses[0].connections().connected_peers().await.contains(&stranger));
    }
}

//! In-process bus for multi-node tests.
//!
//! Every node gets its own `LocalBus`; delivery goes straight into the
//! target's subscription registry. Nodes can be taken offline to simulate
//! crashes: an offline node neither sends nor receives.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use threshold_types::{MessageType, PeerId};

use crate::bus::{CommBus, Envelope, Subscription, SubscriptionId, SubscriptionRegistry};
use crate::error::NetworkError;

#[derive(Default)]
pub struct LocalNetwork {
    nodes: Mutex<HashMap<PeerId, Arc<SubscriptionRegistry>>>,
    offline: Mutex<HashSet<PeerId>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn bus(self: &Arc<Self>, id: PeerId) -> Arc<LocalBus> {
        let registry = SubscriptionRegistry::new();
        self.lock_nodes().insert(id, registry.clone());
        Arc::new(LocalBus {
            id,
            net: self.clone(),
            registry,
        })
    }

    pub fn set_offline(&self, id: PeerId, offline: bool) {
        let mut set = match self.offline.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        if offline {
            set.insert(id);
        } else {
            set.remove(&id);
        }
    }

    fn is_offline(&self, id: &PeerId) -> bool {
        match self.offline.lock() {
            Ok(g) => g.contains(id),
            Err(p) => p.into_inner().contains(id),
        }
    }

    fn lock_nodes(&self) -> std::sync::MutexGuard<'_, HashMap<PeerId, Arc<SubscriptionRegistry>>> {
        match self.nodes.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }

    fn deliver(&self, from: PeerId, to: &PeerId, envelope: Envelope) -> Result<(), NetworkError> {
        if self.is_offline(&from) || self.is_offline(to) {
            return Err(NetworkError::PeerUnavailable { peer: *to });
        }
        let registry = self
            .lock_nodes()
            .get(to)
            .cloned()
            .ok_or(NetworkError::PeerUnavailable { peer: *to })?;
        registry.deliver(envelope);
        Ok(())
    }
}

pub struct LocalBus {
    id: PeerId,
    net: Arc<LocalNetwork>,
    registry: Arc<SubscriptionRegistry>,
}

#[async_trait]
impl CommBus for LocalBus {
    fn self_id(&self) -> PeerId {
        self.id
    }

    async fn broadcast(
        &self,
        peers: &[PeerId],
        payload: Vec<u8>,
        msg_type: MessageType,
        session_id: &str,
    ) {
        for peer in peers {
            let envelope = Envelope {
                from: self.id,
                session_id: session_id.to_string(),
                msg_type,
                payload: payload.clone(),
            };
            let _ = self.net.deliver(self.id, peer, envelope);
        }
    }

    async fn send(
        &self,
        peer: &PeerId,
        payload: Vec<u8>,
        msg_type: MessageType,
        session_id: &str,
    ) -> Result<(), NetworkError> {
        self.net.deliver(
            self.id,
            peer,
            Envelope {
                from: self.id,
                session_id: session_id.to_string(),
                msg_type,
                payload,
            },
        )
    }

    fn subscribe(&self, session_id: &str, msg_type: MessageType) -> Subscription {
        self.registry.subscribe(session_id, msg_type)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.registry.unsubscribe(id);
    }
}

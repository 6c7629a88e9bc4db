//! Communication bus contract and subscription registry.
//!
//! Subscriptions are keyed by `(session_id, message_type)`. A message that
//! arrives before anyone subscribed to its key is dropped, so callers must
//! subscribe before they trigger the traffic they expect.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use threshold_types::{MessageType, PeerId};
use tracing::trace;

use crate::error::NetworkError;
use crate::queue::{DeliveryQueue, DEFAULT_QUEUE_CAPACITY};

pub type SubscriptionId = u64;

/// A delivered message with the authenticated sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub from: PeerId,
    pub session_id: String,
    pub msg_type: MessageType,
    pub payload: Vec<u8>,
}

#[async_trait]
pub trait CommBus: Send + Sync {
    fn self_id(&self) -> PeerId;

    /// Fan `payload` out to `peers`. Never fails; per-peer problems are logged.
    async fn broadcast(
        &self,
        peers: &[PeerId],
        payload: Vec<u8>,
        msg_type: MessageType,
        session_id: &str,
    );

    /// Unicast to one peer.
    async fn send(
        &self,
        peer: &PeerId,
        payload: Vec<u8>,
        msg_type: MessageType,
        session_id: &str,
    ) -> Result<(), NetworkError>;

    fn subscribe(&self, session_id: &str, msg_type: MessageType) -> Subscription;

    /// Idempotent.
    fn unsubscribe(&self, id: SubscriptionId);
}

type Key = (String, MessageType);

/// Maps `(session_id, type)` to subscriber queues.
pub struct SubscriptionRegistry {
    subs: Mutex<HashMap<Key, Vec<(SubscriptionId, Arc<DeliveryQueue<Envelope>>)>>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl SubscriptionRegistry {
    pub fn new() -> Arc<Self> {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            subs: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            capacity,
        })
    }

    pub fn subscribe(self: &Arc<Self>, session_id: &str, msg_type: MessageType) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(DeliveryQueue::new(self.capacity));
        {
            let mut subs = self.lock();
            subs.entry((session_id.to_string(), msg_type))
                .or_default()
                .push((id, queue.clone()));
        }
        trace!(session_id, %msg_type, id, "Subscribed");
        Subscription {
            id,
            queue,
            registry: Arc::downgrade(self),
        }
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut subs = self.lock();
        subs.retain(|_, list| {
            list.retain(|(sid, queue)| {
                if *sid == id {
                    queue.close();
                    false
                } else {
                    true
                }
            });
            !list.is_empty()
        });
    }

    /// Deliver to every matching subscriber. Returns how many received it.
    pub fn deliver(&self, envelope: Envelope) -> usize {
        let targets: Vec<Arc<DeliveryQueue<Envelope>>> = {
            let subs = self.lock();
            subs.get(&(envelope.session_id.clone(), envelope.msg_type))
                .map(|list| list.iter().map(|(_, q)| q.clone()).collect())
                .unwrap_or_default()
        };

        if targets.is_empty() {
            trace!(
                session_id = %envelope.session_id,
                msg_type = %envelope.msg_type,
                "No subscriber, dropping message"
            );
            return 0;
        }

        let n = targets.len();
        for q in targets {
            q.push(envelope.clone());
        }
        n
    }

    pub fn subscription_count(&self) -> usize {
        self.lock().values().map(Vec::len).sum()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Key, Vec<(SubscriptionId, Arc<DeliveryQueue<Envelope>>)>>> {
        match self.subs.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Receiving end of a subscription. Unsubscribes on drop.
pub struct Subscription {
    id: SubscriptionId,
    queue: Arc<DeliveryQueue<Envelope>>,
    registry: Weak<SubscriptionRegistry>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Next message; `None` after unsubscribe.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.queue.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unsubscribe(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(session: &str, t: MessageType) -> Envelope {
        Envelope {
            from: PeerId::from_bytes([9; 32]),
            session_id: session.to_string(),
            msg_type: t,
            payload: vec![1, 2, 3],
        }
    }

    #[tokio::test]
    async fn test_routes_by_session_and_type() {
        let reg = SubscriptionRegistry::new();
        let mut ready = reg.subscribe("s1", MessageType::TssReadyMsg);
        let mut start = reg.subscribe("s1", MessageType::TssStartMsg);

        assert_eq!(reg.deliver(env("s1", MessageType::TssReadyMsg)), 1);
        assert_eq!(reg.deliver(env("s2", MessageType::TssReadyMsg)), 0);
        assert_eq!(reg.deliver(env("s1", MessageType::TssStartMsg)), 1);

        assert_eq!(ready.recv().await.unwrap().msg_type, MessageType::TssReadyMsg);
        assert_eq!(start.recv().await.unwrap().msg_type, MessageType::TssStartMsg);
    }

    #[tokio::test]
    async fn test_late_subscriber_misses_earlier_messages() {
        let reg = SubscriptionRegistry::new();
        reg.deliver(env("s", MessageType::SignatureMsg));
        let _sub = reg.subscribe("s", MessageType::SignatureMsg);
        assert_eq!(reg.deliver(env("s", MessageType::SignatureMsg)), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent_and_closes() {
        let reg = SubscriptionRegistry::new();
        let mut sub = reg.subscribe("s", MessageType::TssFailMsg);
        reg.unsubscribe(sub.id());
        reg.unsubscribe(sub.id());
        assert_eq!(reg.subscription_count(), 0);
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let reg = SubscriptionRegistry::new();
        {
            let _a = reg.subscribe("s", MessageType::TssFailMsg);
            let _b = reg.subscribe("s", MessageType::TssFailMsg);
            assert_eq!(reg.subscription_count(), 2);
        }
        assert_eq!(reg.subscription_count(), 0);
    }
}

//! TTL cache of finished signatures.
//!
//! Fed by local session results and by `Signature` messages gossiped from
//! peers. The first value written for an id sticks until it expires.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use common::{EventType, LogEvent};
use threshold_network::CommBus;
use threshold_types::MessageType;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::message::{SignatureMessage, SIGNATURE_TOPIC};

pub const DEFAULT_SIGNATURE_TTL: Duration = Duration::from_secs(600);
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

struct Entry {
    signature: Vec<u8>,
    expires_at: Instant,
}

pub struct SignatureCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, Entry>>,
    inserted: broadcast::Sender<(String, Vec<u8>)>,
}

impl SignatureCache {
    pub fn new(ttl: Duration) -> Arc<Self> {
        let (inserted, _) = broadcast::channel(256);
        Arc::new(Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
            inserted,
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        match self.entries.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Returns `false` when a live value already exists for `id`.
    pub fn insert(&self, id: &str, signature: Vec<u8>) -> bool {
        let now = Instant::now();
        {
            let mut entries = self.lock();
            if let Some(existing) = entries.get(id) {
                if existing.expires_at > now {
                    return false;
                }
            }
            entries.insert(
                id.to_string(),
                Entry {
                    signature: signature.clone(),
                    expires_at: now + self.ttl,
                },
            );
        }

        LogEvent::new(EventType::SignatureCached).session(id).emit();
        let _ = self.inserted.send((id.to_string(), signature));
        true
    }

    pub fn signature(&self, id: &str) -> Option<Vec<u8>> {
        let entries = self.lock();
        entries
            .get(id)
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.signature.clone())
    }

    /// The current value, or the first one inserted before `cancel` fires.
    pub async fn subscribe(&self, id: &str, cancel: &CancellationToken) -> Option<Vec<u8>> {
        let mut rx = self.inserted.subscribe();
        if let Some(sig) = self.signature(id) {
            return Some(sig);
        }
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return None,
                msg = rx.recv() => match msg {
                    Ok((inserted, sig)) if inserted == id => return Some(sig),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if let Some(sig) = self.signature(id) {
                            return Some(sig);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
            }
        }
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let removed = cache.sweep();
                        if removed > 0 {
                            debug!(removed, "Swept expired signatures");
                        }
                    }
                }
            }
        })
    }

    /// Insert signatures gossiped by peers.
    pub fn spawn_gossip_listener(
        self: &Arc<Self>,
        bus: Arc<dyn CommBus>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        let mut sub = bus.subscribe(SIGNATURE_TOPIC, MessageType::SignatureMsg);
        tokio::spawn(async move {
            loop {
                let env = tokio::select! {
                    _ = cancel.cancelled() => return,
                    env = sub.recv() => match env {
                        Some(env) => env,
                        None => return,
                    },
                };
                match SignatureMessage::decode(&env.payload) {
                    Some(msg) if msg.signature.len() == 65 => {
                        if cache.insert(&msg.id, msg.signature) {
                            debug!(id = %msg.id, peer = %env.from.short(), "Cached gossiped signature");
                        }
                    }
                    _ => warn!(peer = %env.from.short(), "Malformed signature message"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use threshold_network::LocalNetwork;
    use threshold_types::PeerId;

    #[test]
    fn test_first_write_wins() {
        let cache = SignatureCache::new(DEFAULT_SIGNATURE_TTL);
        assert!(cache.insert("8453-100", vec![1; 65]));
        assert!(!cache.insert("8453-100", vec![2; 65]));
        assert_eq!(cache.signature("8453-100"), Some(vec![1; 65]));
        assert_eq!(cache.signature("8453-101"), None);
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let cache = SignatureCache::new(Duration::from_millis(50));
        cache.insert("id", vec![1; 65]);
        assert!(cache.signature("id").is_some());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(cache.signature("id").is_none());
        assert_eq!(cache.sweep(), 1);
        assert!(cache.is_empty());

        // An expired slot can be written again.
        assert!(cache.insert("id", vec![2; 65]));
    }

    #[tokio::test]
    async fn test_subscribe_waits_for_insert() {
        let cache = SignatureCache::new(DEFAULT_SIGNATURE_TTL);
        let cancel = CancellationToken::new();

        let waiter = {
            let cache = cache.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { cache.subscribe("late", &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cache.insert("other", vec![0; 65]);
        cache.insert("late", vec![9; 65]);

        assert_eq!(waiter.await.unwrap(), Some(vec![9; 65]));
        assert_eq!(cache.subscribe("late", &cancel).await, Some(vec![9; 65]));
    }

    #[tokio::test]
    async fn test_subscribe_returns_on_cancel() {
        let cache = SignatureCache::new(DEFAULT_SIGNATURE_TTL);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(cache.subscribe("never", &cancel).await, None);
    }

    #[tokio::test]
    async fn test_gossiped_signatures_are_cached() {
        let net = LocalNetwork::new();
        let a = PeerId::from_bytes([1; 32]);
        let b = PeerId::from_bytes([2; 32]);
        let bus_a = net.bus(a);
        let bus_b: Arc<dyn CommBus> = net.bus(b);

        let cache = SignatureCache::new(DEFAULT_SIGNATURE_TTL);
        let cancel = CancellationToken::new();
        let _listener = cache.spawn_gossip_listener(bus_b, cancel.clone());

        let msg = SignatureMessage {
            id: "10-1".to_string(),
            signature: vec![7; 65],
        };
        bus_a
            .broadcast(&[b], msg.encode(), MessageType::SignatureMsg, SIGNATURE_TOPIC)
            .await;

        let got = tokio::time::timeout(Duration::from_secs(1), cache.subscribe("10-1", &cancel))
            .await
            .unwrap();
        assert_eq!(got, Some(vec![7; 65]));
        cancel.cancel();
    }
}

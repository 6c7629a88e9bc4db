//! Elections over real TCP buses.

use std::sync::Arc;
use std::time::Duration;

use common::{sort_by_rank, ElectionConfig, NodeKey, PeerAddress, Topology, TopologyHandle};
use threshold_consensus::{BullyElector, ElectionError, LeaderElector};
use threshold_network::{CommBus, P2pBus};
use threshold_types::PeerId;
use tokio_util::sync::CancellationToken;

fn fast_config() -> ElectionConfig {
    ElectionConfig {
        ping_interval_ms: 50,
        ping_wait_ms: 200,
        ping_backoff_ms: 50,
        election_wait_ms: 300,
        bully_wait_ms: 300,
        election_timeout_ms: 5_000,
    }
}

/// Starts a bus for each of `live` keys. `offline` keys are listed in the
/// topology on a port nobody listens on.
async fn cluster(
    live: &[NodeKey],
    offline: &[NodeKey],
    cancel: &CancellationToken,
) -> (Vec<Arc<P2pBus>>, TopologyHandle) {
    let all: Vec<&NodeKey> = live.iter().chain(offline).collect();
    let placeholder = Topology::new(
        all.iter()
            .map(|k| PeerAddress::new("127.0.0.1", 1, k.peer_id()))
            .collect(),
        1,
    )
    .unwrap();
    let handle = TopologyHandle::new(placeholder);

    let mut buses = Vec::new();
    for key in live {
        let bus = P2pBus::start(key.clone(), "127.0.0.1:0", handle.subscribe(), cancel.child_token())
            .await
            .unwrap();
        buses.push(bus);
    }

    let mut addresses: Vec<PeerAddress> = live
        .iter()
        .zip(&buses)
        .map(|(k, b)| PeerAddress::new("127.0.0.1", b.local_addr().port(), k.peer_id()))
        .collect();
    addresses.extend(
        offline
            .iter()
            .map(|k| PeerAddress::new("127.0.0.1", 1, k.peer_id())),
    );
    handle.replace(Topology::new(addresses, 1).unwrap());
    (buses, handle)
}

async fn elect_all(buses: &[Arc<P2pBus>], peers: &[PeerId], session: &str) -> Vec<PeerId> {
    let mut handles = Vec::new();
    for bus in buses {
        let bus: Arc<dyn CommBus> = bus.clone();
        let peers = peers.to_vec();
        let session = session.to_string();
        handles.push(tokio::spawn(async move {
            let elector = BullyElector::new(bus, fast_config());
            let election = elector
                .elect(&session, &peers, &CancellationToken::new())
                .await?;
            let coordinator = election.coordinator();
            tokio::time::sleep(Duration::from_millis(800)).await;
            election.leave().await;
            Ok::<_, ElectionError>(coordinator)
        }));
    }

    let mut out = Vec::new();
    for handle in handles {
        out.push(handle.await.unwrap().unwrap());
    }
    out
}

#[tokio::test]
async fn test_tcp_cluster_agrees_on_coordinator() {
    let cancel = CancellationToken::new();
    let keys: Vec<NodeKey> = (0..3).map(|_| NodeKey::generate()).collect();
    let (buses, _handle) = cluster(&keys, &[], &cancel).await;
    let peers: Vec<PeerId> = keys.iter().map(|k| k.peer_id()).collect();

    let coordinators = elect_all(&buses, &peers, "8453-100").await;

    let expected = sort_by_rank(&peers, "8453-100")[0];
    assert!(coordinators.iter().all(|c| *c == expected));
    cancel.cancel();
}

#[tokio::test]
async fn test_tcp_cluster_skips_unreachable_peer() {
    let cancel = CancellationToken::new();
    let keys: Vec<NodeKey> = (0..4).map(|_| NodeKey::generate()).collect();
    let peers: Vec<PeerId> = keys.iter().map(|k| k.peer_id()).collect();

    // Take the best-ranked peer for this session offline.
    let session = "10-7";
    let best = sort_by_rank(&peers, session)[0];
    let (offline, live): (Vec<NodeKey>, Vec<NodeKey>) =
        keys.into_iter().partition(|k| k.peer_id() == best);
    let (buses, _handle) = cluster(&live, &offline, &cancel).await;

    let coordinators = elect_all(&buses, &peers, session).await;

    let live_ids: Vec<PeerId> = live.iter().map(|k| k.peer_id()).collect();
    let expected = sort_by_rank(&live_ids, session)[0];
    assert!(coordinators.iter().all(|c| *c == expected));
    cancel.cancel();
}

//! Bully elector.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{compare_rank, sort_by_rank, ElectionConfig};
use threshold_network::{CommBus, Envelope, Subscription};
use threshold_types::{MessageType, PeerId};
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ElectionError;
use crate::message::ElectionMessage;

#[async_trait]
pub trait LeaderElector: Send + Sync {
    /// Agree on a coordinator for `session_id` among `peers`.
    async fn elect(
        &self,
        session_id: &str,
        peers: &[PeerId],
        cancel: &CancellationToken,
    ) -> Result<Election, ElectionError>;
}

/// Outcome of an election.
///
/// While held, the node keeps answering `Ping` and `Election` for the
/// session so late peers converge on the same coordinator.
pub struct Election {
    coordinator: PeerId,
    responder: Option<Responder>,
}

struct Responder {
    bus: Arc<dyn CommBus>,
    session_id: String,
    peers: Vec<PeerId>,
    cancel: CancellationToken,
}

impl Election {
    /// A coordinator chosen by the caller; no election traffic is involved.
    pub fn fixed(coordinator: PeerId) -> Self {
        Self {
            coordinator,
            responder: None,
        }
    }

    pub fn coordinator(&self) -> PeerId {
        self.coordinator
    }

    /// Stop responding and tell the other peers we are done with the session.
    pub async fn leave(mut self) {
        if let Some(responder) = self.responder.take() {
            responder.cancel.cancel();
            let msg = ElectionMessage::Leave;
            responder
                .bus
                .broadcast(
                    &responder.peers,
                    msg.encode(),
                    msg.msg_type(),
                    &responder.session_id,
                )
                .await;
        }
    }
}

impl Drop for Election {
    fn drop(&mut self) {
        if let Some(responder) = &self.responder {
            responder.cancel.cancel();
        }
    }
}

pub struct BullyElector {
    bus: Arc<dyn CommBus>,
    config: ElectionConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Waiting before the next ping.
    Idle,
    AwaitPong(PeerId),
    Candidate,
    /// A `Select` was accepted; collecting better ones until the bully window closes.
    Decided,
}

impl BullyElector {
    pub fn new(bus: Arc<dyn CommBus>, config: ElectionConfig) -> Self {
        Self { bus, config }
    }

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    async fn send(&self, peer: &PeerId, msg: ElectionMessage, session_id: &str) {
        if let Err(e) = self
            .bus
            .send(peer, msg.encode(), msg.msg_type(), session_id)
            .await
        {
            debug!(session_id, peer = %peer.short(), "Election send failed: {}", e);
        }
    }

    async fn broadcast(&self, peers: &[PeerId], msg: ElectionMessage, session_id: &str) {
        self.bus
            .broadcast(peers, msg.encode(), msg.msg_type(), session_id)
            .await;
    }

    async fn run(
        &self,
        session_id: &str,
        ranked: &[PeerId],
        my_pos: usize,
        subs: &mut Inbound,
    ) -> PeerId {
        let self_id = self.bus.self_id();
        let better = &ranked[..my_pos];
        let others: Vec<PeerId> = ranked.iter().filter(|p| **p != self_id).copied().collect();

        let mut dead: HashSet<PeerId> = HashSet::new();
        let mut phase = Phase::Idle;
        let mut accepted: Option<PeerId> = None;
        let mut wake = Instant::now() + Self::ms(self.config.ping_backoff_ms);

        loop {
            let event = tokio::select! {
                _ = sleep_until(wake) => Event::Timer,
                Some(env) = subs.selects.recv() => Event::Message(env),
                Some(env) = subs.alives.recv() => Event::Message(env),
                Some(env) = subs.pongs.recv() => Event::Message(env),
                Some(env) = subs.leaves.recv() => Event::Message(env),
            };

            match event {
                Event::Timer => match phase {
                    Phase::Decided => {
                        if let Some(coordinator) = accepted {
                            return coordinator;
                        }
                    }
                    Phase::Candidate => {
                        info!(session_id, "No better peer answered, claiming coordination");
                        self.broadcast(
                            &others,
                            ElectionMessage::Select {
                                coordinator: self_id,
                            },
                            session_id,
                        )
                        .await;
                        return self_id;
                    }
                    Phase::AwaitPong(target) => {
                        warn!(session_id, peer = %target.short(), "Ping unanswered, starting election");
                        dead.insert(target);
                        phase = self.become_candidate(session_id, better, &others).await;
                        if phase == Phase::Decided {
                            return self_id;
                        }
                        wake = Instant::now() + Self::ms(self.config.election_wait_ms);
                    }
                    Phase::Idle => {
                        match better.iter().rev().find(|p| !dead.contains(*p)) {
                            Some(target) => {
                                self.send(target, ElectionMessage::Ping, session_id).await;
                                phase = Phase::AwaitPong(*target);
                                wake = Instant::now() + Self::ms(self.config.ping_wait_ms);
                            }
                            None => {
                                phase = self.become_candidate(session_id, better, &others).await;
                                if phase == Phase::Decided {
                                    return self_id;
                                }
                                wake = Instant::now() + Self::ms(self.config.election_wait_ms);
                            }
                        }
                    }
                },
                Event::Message(env) => {
                    let Some(msg) = ElectionMessage::decode(&env.payload) else {
                        warn!(session_id, peer = %env.from.short(), "Malformed election message");
                        continue;
                    };
                    if !ranked.contains(&env.from) {
                        continue;
                    }
                    match msg {
                        ElectionMessage::Select { coordinator }
                        | ElectionMessage::PingResponse {
                            coordinator: Some(coordinator),
                        } => {
                            if !ranked.contains(&coordinator) {
                                continue;
                            }
                            match accepted {
                                None => {
                                    debug!(session_id, coordinator = %coordinator.short(), "Accepted coordinator");
                                    accepted = Some(coordinator);
                                    if coordinator == ranked[0] {
                                        return coordinator;
                                    }
                                    phase = Phase::Decided;
                                    wake = Instant::now() + Self::ms(self.config.bully_wait_ms);
                                }
                                Some(current) => {
                                    if compare_rank(&coordinator, &current, session_id).is_lt() {
                                        debug!(session_id, coordinator = %coordinator.short(), "Better coordinator within bully window");
                                        accepted = Some(coordinator);
                                    }
                                }
                            }
                        }
                        ElectionMessage::PingResponse { coordinator: None } => {
                            if phase == Phase::AwaitPong(env.from) {
                                phase = Phase::Idle;
                                wake = Instant::now() + Self::ms(self.config.ping_interval_ms);
                            }
                        }
                        ElectionMessage::Alive => {
                            if phase == Phase::Candidate {
                                debug!(session_id, peer = %env.from.short(), "Better peer alive, withdrawing candidacy");
                                dead.remove(&env.from);
                                phase = Phase::Idle;
                                wake = Instant::now() + Self::ms(self.config.ping_interval_ms);
                            }
                        }
                        ElectionMessage::Leave => {
                            dead.insert(env.from);
                            if phase == Phase::AwaitPong(env.from) {
                                wake = Instant::now();
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    /// Ask every better-ranked peer. Returns `Decided` when there is nobody
    /// to ask and `Select` went out already.
    async fn become_candidate(
        &self,
        session_id: &str,
        better: &[PeerId],
        others: &[PeerId],
    ) -> Phase {
        if better.is_empty() {
            let self_id = self.bus.self_id();
            info!(session_id, "Best-ranked peer, claiming coordination");
            self.broadcast(
                others,
                ElectionMessage::Select {
                    coordinator: self_id,
                },
                session_id,
            )
            .await;
            return Phase::Decided;
        }
        self.broadcast(better, ElectionMessage::Election, session_id)
            .await;
        Phase::Candidate
    }
}

enum Event {
    Timer,
    Message(Envelope),
}

struct Inbound {
    selects: Subscription,
    alives: Subscription,
    pongs: Subscription,
    leaves: Subscription,
}

#[async_trait]
impl LeaderElector for BullyElector {
    async fn elect(
        &self,
        session_id: &str,
        peers: &[PeerId],
        cancel: &CancellationToken,
    ) -> Result<Election, ElectionError> {
        let self_id = self.bus.self_id();
        let ranked = sort_by_rank(peers, session_id);
        let my_pos = ranked
            .iter()
            .position(|p| *p == self_id)
            .ok_or_else(|| ElectionError::NotAllowed(self_id.to_string()))?;

        // Subscribe before the first message can arrive.
        let mut inbound = Inbound {
            selects: self.bus.subscribe(session_id, MessageType::CoordinatorSelectMsg),
            alives: self.bus.subscribe(session_id, MessageType::CoordinatorAliveMsg),
            pongs: self
                .bus
                .subscribe(session_id, MessageType::CoordinatorPingResponseMsg),
            leaves: self.bus.subscribe(session_id, MessageType::CoordinatorLeaveMsg),
        };
        let pings = self.bus.subscribe(session_id, MessageType::CoordinatorPingMsg);
        let elections = self
            .bus
            .subscribe(session_id, MessageType::CoordinatorElectionMsg);

        let (decided_tx, decided_rx) = watch::channel(None);
        let responder_cancel = cancel.child_token();
        tokio::spawn(respond(
            self.bus.clone(),
            session_id.to_string(),
            pings,
            elections,
            decided_rx,
            responder_cancel.clone(),
        ));

        let deadline = Instant::now() + Self::ms(self.config.election_timeout_ms);
        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(ElectionError::Cancelled),
            r = tokio::time::timeout_at(deadline, self.run(session_id, &ranked, my_pos, &mut inbound)) => {
                r.map_err(|_| ElectionError::DeadlineExceeded)
            }
        };

        match outcome {
            Ok(coordinator) => {
                info!(session_id, coordinator = %coordinator.short(), "Coordinator elected");
                let _ = decided_tx.send(Some(coordinator));
                Ok(Election {
                    coordinator,
                    responder: Some(Responder {
                        bus: self.bus.clone(),
                        session_id: session_id.to_string(),
                        peers: ranked.into_iter().filter(|p| *p != self_id).collect(),
                        cancel: responder_cancel,
                    }),
                })
            }
            Err(e) => {
                warn!(session_id, "Election failed: {}", e);
                responder_cancel.cancel();
                Err(e)
            }
        }
    }
}

async fn respond(
    bus: Arc<dyn CommBus>,
    session_id: String,
    mut pings: Subscription,
    mut elections: Subscription,
    decided: watch::Receiver<Option<PeerId>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(env) = pings.recv() => {
                let coordinator = *decided.borrow();
                let msg = ElectionMessage::PingResponse { coordinator };
                let _ = bus.send(&env.from, msg.encode(), msg.msg_type(), &session_id).await;
            }
            Some(env) = elections.recv() => {
                let alive = ElectionMessage::Alive;
                let _ = bus.send(&env.from, alive.encode(), alive.msg_type(), &session_id).await;
                let coordinator = *decided.borrow();
                if let Some(coordinator) = coordinator {
                    let select = ElectionMessage::Select { coordinator };
                    let _ = bus.send(&env.from, select.encode(), select.msg_type(), &session_id).await;
                }
            }
            else => break,
        }
    }
    debug!(session_id = %session_id, "Election responder stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use threshold_network::LocalNetwork;

    fn fast_config() -> ElectionConfig {
        ElectionConfig {
            ping_interval_ms: 50,
            ping_wait_ms: 100,
            ping_backoff_ms: 50,
            election_wait_ms: 150,
            bully_wait_ms: 200,
            election_timeout_ms: 3_000,
        }
    }

    fn peers(n: u8) -> Vec<PeerId> {
        (1..=n).map(|i| PeerId::from_bytes([i; 32])).collect()
    }

    async fn run_all(
        net: &Arc<LocalNetwork>,
        live: &[PeerId],
        all: &[PeerId],
        session: &str,
    ) -> Vec<Result<PeerId, ElectionError>> {
        let mut handles = Vec::new();
        for id in live {
            let bus: Arc<dyn CommBus> = net.bus(*id);
            let all = all.to_vec();
            let session = session.to_string();
            handles.push(tokio::spawn(async move {
                let elector = BullyElector::new(bus, fast_config());
                let election = elector
                    .elect(&session, &all, &CancellationToken::new())
                    .await?;
                let coordinator = election.coordinator();
                // Keep responding long enough for slower peers.
                tokio::time::sleep(Duration::from_millis(500)).await;
                election.leave().await;
                Ok::<_, ElectionError>(coordinator)
            }));
        }
        let mut out = Vec::new();
        for h in handles {
            out.push(h.await.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_all_nodes_agree_on_best_ranked() {
        let net = LocalNetwork::new();
        let all = peers(4);
        let results = run_all(&net, &all, &all, "1-42").await;
        let expected = sort_by_rank(&all, "1-42")[0];
        for r in results {
            assert_eq!(r.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn test_failover_when_best_ranked_is_offline() {
        let net = LocalNetwork::new();
        let all = peers(4);
        let ranked = sort_by_rank(&all, "1-7");
        let offline = ranked[0];
        // Register the node so sends to it fail instead of vanishing.
        let _ = net.bus(offline);
        net.set_offline(offline, true);

        let live: Vec<PeerId> = all.iter().filter(|p| **p != offline).copied().collect();
        let results = run_all(&net, &live, &all, "1-7").await;
        for r in results {
            assert_eq!(r.unwrap(), ranked[1]);
        }
    }

    #[tokio::test]
    async fn test_not_allowed_peer_is_rejected() {
        let net = LocalNetwork::new();
        let outsider = PeerId::from_bytes([99; 32]);
        let elector = BullyElector::new(net.bus(outsider), fast_config());
        let err = elector
            .elect("s", &peers(3), &CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ElectionError::NotAllowed(_)));
    }

    #[tokio::test]
    async fn test_deadline_exceeded_when_alone_behind_live_silent_peer() {
        // A better-ranked peer answers pings but never selects anyone.
        let net = LocalNetwork::new();
        let all = peers(2);
        let ranked = sort_by_rank(&all, "s");
        let silent = net.bus(ranked[0]);
        let mut pings = silent.subscribe("s", MessageType::CoordinatorPingMsg);
        tokio::spawn(async move {
            while let Some(env) = pings.recv().await {
                let msg = ElectionMessage::PingResponse { coordinator: None };
                let _ = silent
                    .send(&env.from, msg.encode(), msg.msg_type(), "s")
                    .await;
            }
        });

        let mut config = fast_config();
        config.election_timeout_ms = 500;
        let elector = BullyElector::new(net.bus(ranked[1]), config);
        let err = elector
            .elect("s", &all, &CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert_eq!(err, ElectionError::DeadlineExceeded);
    }

    #[tokio::test]
    async fn test_fixed_election_skips_traffic() {
        let coordinator = PeerId::from_bytes([5; 32]);
        let election = Election::fixed(coordinator);
        assert_eq!(election.coordinator(), coordinator);
        election.leave().await;
    }
}

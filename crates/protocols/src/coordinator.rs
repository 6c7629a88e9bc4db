//! TSS session coordinator.
//!
//! One `execute` call drives one session on this node:
//!
//! ```text
//! Idle ─► Electing ─┬─ self is leader ─► Initiating ─ ready ─► Starting ─► Running
//!                   └─ otherwise ──────► Waiting ─── Start ──────────────► Running
//! Running ─► Done | Failed
//! ```
//!
//! All subscriptions are installed before the election so no `Initiate`,
//! `Start` or round message can slip past. Everything the session owns is
//! released when `execute` returns.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{compare_rank, EventType, LogEvent, SessionSpan, TssConfig};
use threshold_consensus::{Election, LeaderElector};
use threshold_network::{CommBus, Envelope, Subscription};
use threshold_types::{MessageType, PeerId};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ProtocolError;
use crate::process::{Outbound, StartContext, TssProcess};
use crate::session::{SessionMessage, TssWire};

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Interval between `Initiate` broadcasts while waiting for `Ready`.
    pub initiate_period: Duration,
    /// Upper bound for a whole session, election included.
    pub session_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            initiate_period: Duration::from_secs(15),
            session_timeout: Duration::from_secs(600),
        }
    }
}

impl From<&TssConfig> for CoordinatorConfig {
    fn from(config: &TssConfig) -> Self {
        Self {
            initiate_period: Duration::from_secs(config.initiate_period_secs),
            session_timeout: Duration::from_secs(config.session_timeout_secs),
        }
    }
}

pub struct Coordinator {
    bus: Arc<dyn CommBus>,
    elector: Arc<dyn LeaderElector>,
    config: CoordinatorConfig,
    active: Arc<Mutex<HashSet<String>>>,
    cancel: CancellationToken,
}

/// Marks a session id as live until dropped.
struct ActiveGuard {
    active: Arc<Mutex<HashSet<String>>>,
    session_id: String,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        match self.active.lock() {
            Ok(mut set) => set.remove(&self.session_id),
            Err(poisoned) => poisoned.into_inner().remove(&self.session_id),
        };
    }
}

struct SessionSubs {
    initiate: Subscription,
    ready: Subscription,
    start: Subscription,
    fail: Subscription,
    tss: Subscription,
}

/// Per-session state shared by the leader and follower paths.
struct Session<'a, P> {
    process: &'a Arc<P>,
    session_id: &'a str,
    self_id: PeerId,
    peers: &'a [PeerId],
    others: Vec<PeerId>,
    cancel: &'a CancellationToken,
}

impl Coordinator {
    pub fn new(
        bus: Arc<dyn CommBus>,
        elector: Arc<dyn LeaderElector>,
        config: CoordinatorConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            bus,
            elector,
            config,
            active: Arc::new(Mutex::new(HashSet::new())),
            cancel,
        }
    }

    pub fn self_id(&self) -> PeerId {
        self.bus.self_id()
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        match self.active.lock() {
            Ok(set) => set.contains(session_id),
            Err(poisoned) => poisoned.into_inner().contains(session_id),
        }
    }

    fn claim(&self, session_id: &str) -> Option<ActiveGuard> {
        let inserted = match self.active.lock() {
            Ok(mut set) => set.insert(session_id.to_string()),
            Err(poisoned) => poisoned.into_inner().insert(session_id.to_string()),
        };
        inserted.then(|| ActiveGuard {
            active: self.active.clone(),
            session_id: session_id.to_string(),
        })
    }

    /// Run `process` as one session among `peers`.
    ///
    /// Returns `Ok(None)` without doing anything when a session with the
    /// same id is already live on this node. `coordinator` bypasses the
    /// election.
    pub async fn execute<P: TssProcess>(
        &self,
        process: Arc<P>,
        peers: &[PeerId],
        coordinator: Option<PeerId>,
    ) -> Result<Option<P::Output>, ProtocolError> {
        let session_id = process.session_id().to_string();
        let Some(_guard) = self.claim(&session_id) else {
            debug!(session_id = %session_id, "Session already running, ignoring");
            return Ok(None);
        };

        let cancel = self.cancel.child_token();
        let span = SessionSpan::new(&session_id, process.protocol());
        let self_id = self.bus.self_id();
        let session = Session {
            process: &process,
            session_id: &session_id,
            self_id,
            peers,
            others: peers.iter().filter(|p| **p != self_id).copied().collect(),
            cancel: &cancel,
        };

        let result = match tokio::time::timeout(
            self.config.session_timeout,
            self.run(&session, coordinator, &span),
        )
        .await
        {
            Ok(r) => r,
            Err(_) => {
                LogEvent::new(EventType::SessionTimeout)
                    .session(&session_id)
                    .protocol(process.protocol())
                    .emit();
                Err(ProtocolError::Timeout)
            }
        };

        cancel.cancel();
        process.stop();

        match &result {
            Ok(_) => {
                span.complete();
            }
            Err(ProtocolError::NotInSubset) => {
                debug!(session_id = %session_id, "Not a signer for this session");
            }
            Err(e) => {
                if should_announce(e) {
                    self.send_control(
                        &session.others,
                        &session_id,
                        SessionMessage::Fail {
                            reason: e.to_string(),
                        },
                    )
                    .await;
                }
                span.fail(e.to_string());
            }
        }
        result.map(Some)
    }

    async fn run<P: TssProcess>(
        &self,
        s: &Session<'_, P>,
        coordinator: Option<PeerId>,
        span: &SessionSpan,
    ) -> Result<P::Output, ProtocolError> {
        let sid = s.session_id;
        let mut subs = SessionSubs {
            initiate: self.bus.subscribe(sid, MessageType::TssInitiateMsg),
            ready: self.bus.subscribe(sid, MessageType::TssReadyMsg),
            start: self.bus.subscribe(sid, MessageType::TssStartMsg),
            fail: self.bus.subscribe(sid, MessageType::TssFailMsg),
            tss: self.bus.subscribe(sid, s.process.message_type()),
        };

        let election = match coordinator {
            Some(c) => Election::fixed(c),
            None => self.elector.elect(sid, s.peers, s.cancel).await?,
        };
        let leader = election.coordinator();
        span.record_coordinator(&leader.to_string(), leader == s.self_id);

        let outcome = if leader == s.self_id {
            self.lead(s, &mut subs).await
        } else {
            self.follow(s, &mut subs, leader, false).await
        };
        election.leave().await;
        outcome
    }

    async fn lead<P: TssProcess>(
        &self,
        s: &Session<'_, P>,
        subs: &mut SessionSubs,
    ) -> Result<P::Output, ProtocolError> {
        let sid = s.session_id;
        info!(session_id = %sid, "Leading session");
        let mut ready = vec![s.self_id];
        let mut ticker = tokio::time::interval(self.config.initiate_period);

        while !s.process.ready(&ready) {
            tokio::select! {
                _ = s.cancel.cancelled() => return Err(ProtocolError::Cancelled),
                _ = ticker.tick() => {
                    debug!(session_id = %sid, ready = ready.len(), "Broadcasting initiate");
                    self.send_control(&s.others, sid, SessionMessage::Initiate).await;
                }
                Some(env) = subs.ready.recv() => {
                    if s.peers.contains(&env.from) && !ready.contains(&env.from) {
                        LogEvent::new(EventType::ReadyReceived)
                            .session(sid)
                            .peer(env.from.to_string())
                            .emit();
                        ready.push(env.from);
                    }
                }
                Some(env) = subs.initiate.recv() => {
                    if s.peers.contains(&env.from)
                        && compare_rank(&env.from, &s.self_id, sid).is_lt()
                    {
                        info!(session_id = %sid, leader = %env.from.short(), "Better-ranked peer is leading, stepping down");
                        return Box::pin(self.follow(s, subs, env.from, true)).await;
                    }
                }
                Some(env) = subs.fail.recv() => {
                    if let Some(err) = abort_from(s.peers, &env) {
                        return Err(err);
                    }
                }
            }
        }

        let params = s.process.start_params(&ready)?;
        info!(session_id = %sid, parties = ready.len(), "Ready set complete, starting");
        self.send_control(&s.others, sid, SessionMessage::Start {
            params: params.clone(),
        })
        .await;
        self.run_process(s, subs, true, params).await
    }

    async fn follow<P: TssProcess>(
        &self,
        s: &Session<'_, P>,
        subs: &mut SessionSubs,
        mut leader: PeerId,
        initiated: bool,
    ) -> Result<P::Output, ProtocolError> {
        let sid = s.session_id;
        debug!(session_id = %sid, leader = %leader.short(), "Waiting for leader");
        if initiated {
            self.send_ready(&leader, sid).await;
        }

        let params = loop {
            tokio::select! {
                _ = s.cancel.cancelled() => return Err(ProtocolError::Cancelled),
                Some(env) = subs.initiate.recv() => {
                    if !s.peers.contains(&env.from) {
                        continue;
                    }
                    if env.from == leader || compare_rank(&env.from, &leader, sid).is_lt() {
                        leader = env.from;
                        self.send_ready(&leader, sid).await;
                    }
                }
                Some(env) = subs.start.recv() => {
                    let from_leader = env.from == leader
                        || (s.peers.contains(&env.from) && compare_rank(&env.from, &leader, sid).is_lt());
                    if !from_leader {
                        continue;
                    }
                    match SessionMessage::decode(&env.payload) {
                        Some(SessionMessage::Start { params }) => break params,
                        _ => warn!(session_id = %sid, "Malformed start message"),
                    }
                }
                Some(env) = subs.fail.recv() => {
                    if let Some(err) = abort_from(s.peers, &env) {
                        return Err(err);
                    }
                }
            }
        };

        self.run_process(s, subs, false, params).await
    }

    async fn run_process<P: TssProcess>(
        &self,
        s: &Session<'_, P>,
        subs: &mut SessionSubs,
        is_coordinator: bool,
        params: Vec<u8>,
    ) -> Result<P::Output, ProtocolError> {
        let sid = s.session_id;
        let msg_type = s.process.message_type();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let ctx = StartContext {
            cancel: s.cancel.child_token(),
            is_coordinator,
            params,
            outbound: out_tx,
        };

        let run = s.process.start(ctx);
        tokio::pin!(run);

        let result = loop {
            tokio::select! {
                r = &mut run => break r,
                Some(out) = out_rx.recv() => self.forward(s, msg_type, out).await,
                Some(env) = subs.tss.recv() => match TssWire::decode(&env.payload) {
                    Some(wire) => s.process.update_from_bytes(&wire.data, env.from, wire.broadcast),
                    None => warn!(session_id = %sid, peer = %env.from.short(), "Malformed round message"),
                },
                Some(env) = subs.fail.recv() => {
                    if let Some(err) = abort_from(s.peers, &env) {
                        s.process.stop();
                        break Err(err);
                    }
                }
                _ = s.cancel.cancelled() => {
                    s.process.stop();
                    break Err(ProtocolError::Cancelled);
                }
            }
        };

        // Rounds produced right before completion.
        while let Ok(out) = out_rx.try_recv() {
            self.forward(s, msg_type, out).await;
        }
        result
    }

    async fn forward<P: TssProcess>(&self, s: &Session<'_, P>, msg_type: MessageType, out: Outbound) {
        let wire = TssWire {
            broadcast: out.to.is_none(),
            data: out.payload,
        };
        match out.to {
            None => {
                self.bus
                    .broadcast(&s.others, wire.encode(), msg_type, s.session_id)
                    .await
            }
            Some(peer) => {
                if let Err(e) = self
                    .bus
                    .send(&peer, wire.encode(), msg_type, s.session_id)
                    .await
                {
                    warn!(session_id = %s.session_id, peer = %peer.short(), "Round message not sent: {}", e);
                }
            }
        }
    }

    async fn send_ready(&self, leader: &PeerId, session_id: &str) {
        let msg = SessionMessage::Ready;
        if let Err(e) = self
            .bus
            .send(leader, msg.encode(), msg.msg_type(), session_id)
            .await
        {
            warn!(session_id, leader = %leader.short(), "Ready not sent: {}", e);
        }
    }

    async fn send_control(&self, peers: &[PeerId], session_id: &str, msg: SessionMessage) {
        self.bus
            .broadcast(peers, msg.encode(), msg.msg_type(), session_id)
            .await;
    }
}

/// Errors worth telling the other participants about. Timeouts and
/// election failures are local views; peers reach their own verdict.
fn should_announce(err: &ProtocolError) -> bool {
    !matches!(
        err,
        ProtocolError::NotInSubset
            | ProtocolError::Aborted { .. }
            | ProtocolError::Timeout
            | ProtocolError::Cancelled
            | ProtocolError::Election(_)
    )
}

fn abort_from(peers: &[PeerId], env: &Envelope) -> Option<ProtocolError> {
    if !peers.contains(&env.from) {
        return None;
    }
    let reason = match SessionMessage::decode(&env.payload) {
        Some(SessionMessage::Fail { reason }) => reason,
        _ => "unspecified".to_string(),
    };
    warn!(session_id = %env.session_id, peer = %env.from.short(), "Session aborted by peer: {}", reason);
    Some(ProtocolError::Aborted {
        peer: env.from.to_string(),
        reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use common::ElectionConfig;
    use threshold_consensus::BullyElector;
    use threshold_network::LocalNetwork;

    /// Every participant broadcasts once and finishes after hearing from
    /// all the others named in the start params.
    struct EchoProcess {
        session_id: String,
        self_id: PeerId,
        need: usize,
        fail: bool,
        tx: mpsc::UnboundedSender<PeerId>,
        rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<PeerId>>,
    }

    impl EchoProcess {
        fn new(session_id: &str, self_id: PeerId, need: usize) -> Arc<Self> {
            let (tx, rx) = mpsc::unbounded_channel();
            Arc::new(Self {
                session_id: session_id.to_string(),
                self_id,
                need,
                fail: false,
                tx,
                rx: tokio::sync::Mutex::new(rx),
            })
        }

        fn failing(session_id: &str, self_id: PeerId, need: usize) -> Arc<Self> {
            let (tx, rx) = mpsc::unbounded_channel();
            Arc::new(Self {
                session_id: session_id.to_string(),
                self_id,
                need,
                fail: true,
                tx,
                rx: tokio::sync::Mutex::new(rx),
            })
        }
    }

    #[async_trait]
    impl TssProcess for EchoProcess {
        type Output = Vec<PeerId>;

        fn session_id(&self) -> &str {
            &self.session_id
        }

        fn message_type(&self) -> MessageType {
            MessageType::TssKeySignMsg
        }

        fn protocol(&self) -> &'static str {
            "echo"
        }

        fn ready(&self, ready: &[PeerId]) -> bool {
            ready.len() >= self.need
        }

        fn start_params(&self, ready: &[PeerId]) -> Result<Vec<u8>, ProtocolError> {
            let mut parties = ready.to_vec();
            parties.sort();
            Ok(serde_json::to_vec(&parties)?)
        }

        async fn start(&self, ctx: StartContext) -> Result<Vec<PeerId>, ProtocolError> {
            let parties: Vec<PeerId> = serde_json::from_slice(&ctx.params)?;
            if !parties.contains(&self.self_id) {
                return Err(ProtocolError::NotInSubset);
            }
            if self.fail {
                return Err(ProtocolError::Mpc("round 1 failed".to_string()));
            }
            let _ = ctx.outbound.send(Outbound {
                to: None,
                payload: vec![1],
            });
            let mut heard = HashSet::new();
            let mut rx = self.rx.lock().await;
            while heard.len() < parties.len() - 1 {
                tokio::select! {
                    _ = ctx.cancel.cancelled() => return Err(ProtocolError::Cancelled),
                    Some(from) = rx.recv() => {
                        if parties.contains(&from) {
                            heard.insert(from);
                        }
                    }
                }
            }
            Ok(parties)
        }

        fn update_from_bytes(&self, _bytes: &[u8], from: PeerId, _is_broadcast: bool) {
            let _ = self.tx.send(from);
        }

        fn stop(&self) {}
    }

    fn fast_config() -> CoordinatorConfig {
        CoordinatorConfig {
            initiate_period: Duration::from_millis(100),
            session_timeout: Duration::from_secs(10),
        }
    }

    fn fast_election() -> ElectionConfig {
        ElectionConfig {
            ping_interval_ms: 50,
            ping_wait_ms: 100,
            ping_backoff_ms: 50,
            election_wait_ms: 150,
            bully_wait_ms: 200,
            election_timeout_ms: 3_000,
        }
    }

    fn node(net: &Arc<LocalNetwork>, id: PeerId, config: CoordinatorConfig) -> Arc<Coordinator> {
        let bus: Arc<dyn CommBus> = net.bus(id);
        let elector = Arc::new(BullyElector::new(bus.clone(), fast_election()));
        Arc::new(Coordinator::new(bus, elector, config, CancellationToken::new()))
    }

    fn peers(n: u8) -> Vec<PeerId> {
        (1..=n).map(|i| PeerId::from_bytes([i; 32])).collect()
    }

    #[tokio::test]
    async fn test_all_nodes_complete_with_same_party_set() {
        let net = LocalNetwork::new();
        let ids = peers(3);
        let mut handles = Vec::new();
        for id in &ids {
            let coordinator = node(&net, *id, fast_config());
            let process = EchoProcess::new("1-42", *id, 3);
            let ids = ids.clone();
            handles.push(tokio::spawn(async move {
                coordinator.execute(process, &ids, None).await
            }));
        }
        for h in handles {
            let parties = h.await.unwrap().unwrap().unwrap();
            assert_eq!(parties.len(), 3);
        }
    }

    #[tokio::test]
    async fn test_manual_coordinator_bypasses_election() {
        let net = LocalNetwork::new();
        let ids = peers(3);
        let leader = ids[2];
        let mut handles = Vec::new();
        for id in &ids {
            let coordinator = node(&net, *id, fast_config());
            let process = EchoProcess::new("manual", *id, 2);
            let ids = ids.clone();
            handles.push(tokio::spawn(async move {
                coordinator.execute(process, &ids, Some(leader)).await
            }));
        }
        let mut completed = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(Some(parties)) => {
                    assert!(parties.contains(&leader));
                    completed += 1;
                }
                Err(ProtocolError::NotInSubset) => {}
                other => panic!("unexpected outcome: {:?}", other.map(|_| ())),
            }
        }
        assert!(completed >= 2);
    }

    #[tokio::test]
    async fn test_duplicate_session_is_ignored() {
        let net = LocalNetwork::new();
        let ids = peers(2);
        let config = CoordinatorConfig {
            initiate_period: Duration::from_millis(100),
            session_timeout: Duration::from_millis(500),
        };
        let coordinator = node(&net, ids[0], config);

        // The fixed leader never shows up, so the first run stays live.
        let first = {
            let coordinator = coordinator.clone();
            let ids = ids.clone();
            tokio::spawn(async move {
                coordinator
                    .execute(EchoProcess::new("dup", ids[0], 2), &ids, Some(ids[1]))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(coordinator.is_active("dup"));

        let second = coordinator
            .execute(EchoProcess::new("dup", ids[0], 2), &ids, Some(ids[1]))
            .await
            .unwrap();
        assert!(second.is_none());

        assert!(matches!(first.await.unwrap(), Err(ProtocolError::Timeout)));
        assert!(!coordinator.is_active("dup"));
    }

    #[tokio::test]
    async fn test_local_failure_aborts_peers() {
        let net = LocalNetwork::new();
        let ids = peers(3);
        let leader = ids[0];
        let mut handles = Vec::new();
        for (i, id) in ids.iter().enumerate() {
            let coordinator = node(&net, *id, fast_config());
            let process = if i == 1 {
                EchoProcess::failing("boom", *id, 3)
            } else {
                EchoProcess::new("boom", *id, 3)
            };
            let ids = ids.clone();
            handles.push(tokio::spawn(async move {
                coordinator.execute(process, &ids, Some(leader)).await
            }));
        }
        for (i, h) in handles.into_iter().enumerate() {
            let err = h.await.unwrap().err().unwrap();
            if i == 1 {
                assert!(matches!(err, ProtocolError::Mpc(_)));
            } else {
                assert!(matches!(err, ProtocolError::Aborted { .. }));
            }
        }
    }
}

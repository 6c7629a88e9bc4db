//! Distributed key generation and share refresh.
//!
//! Keygen runs two protocols back to back over the same session: threshold
//! keygen (phase 0) then auxiliary info generation (phase 1). Both need the
//! whole topology, and party indices follow the topology's peer order.
//!
//! Refresh keeps the secret shares and regenerates the auxiliary info
//! (Paillier keys and ring-Pedersen parameters) over the same party set,
//! holding the keyshare lock until the new share is on disk.

use std::sync::Arc;

use async_trait::async_trait;
use cggmp24::key_share::Validate;
use cggmp24::security_level::SecurityLevel128;
use cggmp24::supported_curves::Secp256k1;
use cggmp24::PregeneratedPrimes;
use rand::rngs::OsRng;
use threshold_storage::{KeyshareStore, StoredKeyshare};
use threshold_types::{MessageType, PeerId};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::delivery::{connect, demux, Inbox};
use crate::error::ProtocolError;
use crate::process::{StartContext, TssProcess};
use crate::signing::{decode_parties, encode_parties, DirtyIncomplete, SharePayload};

async fn generate_primes() -> Result<PregeneratedPrimes<SecurityLevel128>, ProtocolError> {
    info!("Generating safe primes, this can take a while");
    tokio::task::spawn_blocking(|| PregeneratedPrimes::<SecurityLevel128>::generate(&mut OsRng))
        .await
        .map_err(|e| ProtocolError::Mpc(format!("prime generation aborted: {}", e)))
}

fn full_set_ready(peers: &[PeerId], ready: &[PeerId]) -> bool {
    peers.iter().all(|p| ready.contains(p))
}

fn same_set(a: &[PeerId], b: &[PeerId]) -> bool {
    let mut a = a.to_vec();
    let mut b = b.to_vec();
    a.sort();
    b.sort();
    a == b
}

pub struct KeygenProcess {
    session_id: String,
    self_id: PeerId,
    peers: Vec<PeerId>,
    threshold: u16,
    store: KeyshareStore,
    inbox: Inbox,
    cancel: CancellationToken,
}

impl KeygenProcess {
    pub fn new(
        session_id: impl Into<String>,
        self_id: PeerId,
        peers: Vec<PeerId>,
        threshold: u16,
        store: KeyshareStore,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            self_id,
            peers,
            threshold,
            store,
            inbox: Inbox::new(),
            cancel: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl TssProcess for KeygenProcess {
    type Output = StoredKeyshare;

    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn message_type(&self) -> MessageType {
        MessageType::TssKeyGenMsg
    }

    fn protocol(&self) -> &'static str {
        "cggmp24-keygen"
    }

    fn ready(&self, ready: &[PeerId]) -> bool {
        full_set_ready(&self.peers, ready)
    }

    fn start_params(&self, _ready: &[PeerId]) -> Result<Vec<u8>, ProtocolError> {
        encode_parties(&self.peers)
    }

    async fn start(&self, ctx: StartContext) -> Result<StoredKeyshare, ProtocolError> {
        let parties = decode_parties(&ctx.params)?;
        if !same_set(&parties, &self.peers) {
            return Err(ProtocolError::InvalidParams(
                "keygen party set differs from topology".to_string(),
            ));
        }
        let i = parties
            .iter()
            .position(|p| *p == self.self_id)
            .ok_or_else(|| ProtocolError::InvalidParams("self not in party set".to_string()))?
            as u16;
        let n = parties.len() as u16;
        let t = self.threshold + 1;
        info!(session_id = %self.session_id, i, n, t, "Starting distributed key generation");

        let inbound = self
            .inbox
            .take()
            .ok_or_else(|| ProtocolError::Mpc("keygen process already started".to_string()))?;
        let cancel = ctx.cancel.child_token();
        let mut phases = demux(inbound, 2, cancel.clone()).into_iter();
        let (Some(keygen_rx), Some(aux_rx)) = (phases.next(), phases.next()) else {
            return Err(ProtocolError::Mpc("phase queues missing".to_string()));
        };
        let parties = Arc::new(parties);
        let mut rng = OsRng;

        // Phase 0: threshold keygen
        let (incoming, outgoing, flush) = connect(
            0,
            parties.clone(),
            keygen_rx,
            ctx.outbound.clone(),
            cancel.clone(),
        );
        let party = round_based::MpcParty::connected((incoming, outgoing));
        let eid_bytes = format!("{}/keygen", self.session_id);
        let eid = cggmp24::ExecutionId::new(eid_bytes.as_bytes());
        let keygen = cggmp24::keygen::<Secp256k1>(eid, i, n)
            .set_threshold(t)
            .start(&mut rng, party);
        let incomplete = tokio::select! {
            _ = cancel.cancelled() => return Err(ProtocolError::Cancelled),
            _ = self.cancel.cancelled() => return Err(ProtocolError::Cancelled),
            r = keygen => r.map_err(|e| ProtocolError::Mpc(format!("keygen: {:?}", e)))?,
        };
        let _ = flush.await;
        info!(session_id = %self.session_id, "Keygen phase complete");

        // Phase 1: auxiliary info
        let primes = generate_primes().await?;
        let (incoming, outgoing, flush) =
            connect(1, parties.clone(), aux_rx, ctx.outbound.clone(), cancel.clone());
        let party = round_based::MpcParty::connected((incoming, outgoing));
        let eid_bytes = format!("{}/aux", self.session_id);
        let eid = cggmp24::ExecutionId::new(eid_bytes.as_bytes());
        let aux_gen = cggmp24::aux_info_gen(eid, i, n, primes).start(&mut rng, party);
        let aux = tokio::select! {
            _ = cancel.cancelled() => return Err(ProtocolError::Cancelled),
            _ = self.cancel.cancelled() => return Err(ProtocolError::Cancelled),
            r = aux_gen => r.map_err(|e| ProtocolError::Mpc(format!("aux info: {:?}", e)))?,
        };
        let _ = flush.await;

        let public_key = hex::encode(incomplete.shared_public_key.to_bytes(true));
        let share = serde_json::to_value(SharePayload {
            incomplete: &incomplete,
            aux: &aux,
        })?;
        cggmp24::KeyShare::from_parts((incomplete, aux))
            .map_err(|e| ProtocolError::InvalidKeyShare(format!("{:?}", e)))?;

        let stored = StoredKeyshare {
            threshold: self.threshold,
            peers: parties.to_vec(),
            public_key,
            share,
        };
        self.store.store(&stored).await?;
        info!(session_id = %self.session_id, public_key = %stored.public_key, "Key generation complete");
        Ok(stored)
    }

    fn update_from_bytes(&self, bytes: &[u8], from: PeerId, is_broadcast: bool) {
        self.inbox.push(bytes, from, is_broadcast);
    }

    fn stop(&self) {
        self.cancel.cancel();
    }
}

pub struct ReshareProcess {
    session_id: String,
    self_id: PeerId,
    peers: Vec<PeerId>,
    store: KeyshareStore,
    inbox: Inbox,
    cancel: CancellationToken,
}

impl ReshareProcess {
    pub fn new(
        session_id: impl Into<String>,
        self_id: PeerId,
        peers: Vec<PeerId>,
        store: KeyshareStore,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            self_id,
            peers,
            store,
            inbox: Inbox::new(),
            cancel: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl TssProcess for ReshareProcess {
    type Output = StoredKeyshare;

    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn message_type(&self) -> MessageType {
        MessageType::TssReshareMsg
    }

    fn protocol(&self) -> &'static str {
        "cggmp24-refresh"
    }

    fn ready(&self, ready: &[PeerId]) -> bool {
        full_set_ready(&self.peers, ready)
    }

    fn start_params(&self, _ready: &[PeerId]) -> Result<Vec<u8>, ProtocolError> {
        encode_parties(&self.peers)
    }

    async fn start(&self, ctx: StartContext) -> Result<StoredKeyshare, ProtocolError> {
        let guard = self.store.lock().await;
        let current = guard.get().await?;

        let parties = decode_parties(&ctx.params)?;
        if parties != current.peers {
            return Err(ProtocolError::InvalidParams(
                "refresh requires the keygen party set".to_string(),
            ));
        }
        let i = current
            .party_index(&self.self_id)
            .ok_or_else(|| ProtocolError::InvalidParams("self not in party set".to_string()))?;
        let n = parties.len() as u16;

        let payload: SharePayload<DirtyIncomplete, serde_json::Value> =
            serde_json::from_value(current.share.clone())?;
        let incomplete = payload
            .incomplete
            .validate()
            .map_err(|e| ProtocolError::InvalidKeyShare(format!("{:?}", e)))?;

        let inbound = self
            .inbox
            .take()
            .ok_or_else(|| ProtocolError::Mpc("refresh process already started".to_string()))?;
        let cancel = ctx.cancel.child_token();
        let aux_rx = demux(inbound, 1, cancel.clone()).remove(0);

        let primes = generate_primes().await?;
        info!(session_id = %self.session_id, i, n, "Refreshing auxiliary key material");
        let (incoming, outgoing, flush) = connect(
            0,
            Arc::new(parties),
            aux_rx,
            ctx.outbound.clone(),
            cancel.clone(),
        );
        let party = round_based::MpcParty::connected((incoming, outgoing));
        let eid_bytes = format!("{}/refresh", self.session_id);
        let eid = cggmp24::ExecutionId::new(eid_bytes.as_bytes());
        let mut rng = OsRng;
        let aux_gen = cggmp24::aux_info_gen(eid, i, n, primes).start(&mut rng, party);
        let aux = tokio::select! {
            _ = cancel.cancelled() => return Err(ProtocolError::Cancelled),
            _ = self.cancel.cancelled() => return Err(ProtocolError::Cancelled),
            r = aux_gen => r.map_err(|e| ProtocolError::Mpc(format!("refresh: {:?}", e)))?,
        };
        let _ = flush.await;

        let share = serde_json::to_value(SharePayload {
            incomplete: &incomplete,
            aux: &aux,
        })?;
        cggmp24::KeyShare::from_parts((incomplete, aux))
            .map_err(|e| ProtocolError::InvalidKeyShare(format!("{:?}", e)))?;

        let refreshed = StoredKeyshare { share, ..current };
        guard.store(&refreshed).await?;
        info!(session_id = %self.session_id, "Key share refreshed");
        Ok(refreshed)
    }

    fn update_from_bytes(&self, bytes: &[u8], from: PeerId, is_broadcast: bool) {
        self.inbox.push(bytes, from, is_broadcast);
    }

    fn stop(&self) {
        self.cancel.cancel();
    }
}

//! CGGMP24 threshold signing process.
//!
//! Ready once `threshold + 1` peers (self included) answered. The leader
//! fixes the signer subset as the best-ranked `threshold + 1` ready peers,
//! re-ordered by keygen index; a signer's protocol index is its position in
//! that list.

use std::sync::Arc;

use async_trait::async_trait;
use cggmp24::key_share::Validate;
use cggmp24::security_level::SecurityLevel128;
use cggmp24::supported_curves::Secp256k1;
use common::select_signers;
use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use threshold_storage::StoredKeyshare;
use threshold_types::{MessageType, PeerId};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::delivery::{connect, demux, Inbox};
use crate::error::ProtocolError;
use crate::process::{StartContext, TssProcess};

/// Final output of a signing session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureResult {
    pub id: String,
    /// `r || s || v` with low `s` and `v ∈ {27, 28}`.
    pub signature: Vec<u8>,
}

/// On-disk layout of `StoredKeyshare::share`.
#[derive(Serialize, Deserialize)]
pub(crate) struct SharePayload<I, A> {
    pub incomplete: I,
    pub aux: A,
}

pub(crate) type DirtyIncomplete = cggmp24::key_share::DirtyIncompleteKeyShare<Secp256k1>;
pub(crate) type DirtyAux = cggmp24::key_share::DirtyAuxInfo<SecurityLevel128>;

/// Rebuild a usable key share from its stored JSON.
pub(crate) fn load_key_share(
    stored: &StoredKeyshare,
) -> Result<cggmp24::KeyShare<Secp256k1>, ProtocolError> {
    let payload: SharePayload<DirtyIncomplete, DirtyAux> =
        serde_json::from_value(stored.share.clone())?;
    let incomplete = payload
        .incomplete
        .validate()
        .map_err(|e| ProtocolError::InvalidKeyShare(format!("{:?}", e)))?;
    let aux = payload
        .aux
        .validate()
        .map_err(|e| ProtocolError::InvalidKeyShare(format!("{:?}", e)))?;
    cggmp24::KeyShare::from_parts((incomplete, aux))
        .map_err(|e| ProtocolError::InvalidKeyShare(format!("{:?}", e)))
}

/// Canonical encoding of a party list.
pub(crate) fn encode_parties(parties: &[PeerId]) -> Result<Vec<u8>, ProtocolError> {
    Ok(serde_json::to_vec(parties)?)
}

pub(crate) fn decode_parties(params: &[u8]) -> Result<Vec<PeerId>, ProtocolError> {
    serde_json::from_slice(params).map_err(|e| ProtocolError::InvalidParams(e.to_string()))
}

/// Turn raw `(r, s)` into a 65-byte Ethereum signature over `digest`,
/// checking it against the shared public key.
pub fn finalize_signature(
    r: &[u8],
    s: &[u8],
    digest: &[u8; 32],
    public_key: &VerifyingKey,
) -> Result<Vec<u8>, ProtocolError> {
    let mut rs = [0u8; 64];
    if r.len() > 32 || s.len() > 32 {
        return Err(ProtocolError::InvalidSignature);
    }
    rs[32 - r.len()..32].copy_from_slice(r);
    rs[64 - s.len()..].copy_from_slice(s);

    let sig = Signature::from_slice(&rs).map_err(|_| ProtocolError::InvalidSignature)?;
    let sig = sig.normalize_s().unwrap_or(sig);
    let recid = RecoveryId::trial_recovery_from_prehash(public_key, digest, &sig)
        .map_err(|_| ProtocolError::InvalidSignature)?;

    let mut out = sig.to_bytes().to_vec();
    out.push(27 + recid.to_byte());
    Ok(out)
}

pub struct SigningProcess {
    session_id: String,
    self_id: PeerId,
    digest: [u8; 32],
    keyshare: StoredKeyshare,
    inbox: Inbox,
    cancel: CancellationToken,
}

impl SigningProcess {
    pub fn new(
        session_id: impl Into<String>,
        self_id: PeerId,
        digest: [u8; 32],
        keyshare: StoredKeyshare,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            self_id,
            digest,
            keyshare,
            inbox: Inbox::new(),
            cancel: CancellationToken::new(),
        }
    }

    fn threshold(&self) -> usize {
        self.keyshare.threshold as usize
    }

    fn public_key(&self) -> Result<VerifyingKey, ProtocolError> {
        let bytes = hex::decode(&self.keyshare.public_key)
            .map_err(|e| ProtocolError::InvalidKeyShare(e.to_string()))?;
        VerifyingKey::from_sec1_bytes(&bytes)
            .map_err(|e| ProtocolError::InvalidKeyShare(e.to_string()))
    }

    /// Validate the leader's subset and map it to keygen indices.
    fn signers(&self, params: &[u8]) -> Result<(Vec<PeerId>, Vec<u16>), ProtocolError> {
        let signers = decode_parties(params)?;
        if signers.len() != self.threshold() + 1 {
            return Err(ProtocolError::InvalidParams(format!(
                "expected {} signers, got {}",
                self.threshold() + 1,
                signers.len()
            )));
        }
        let indices = signers
            .iter()
            .map(|p| {
                self.keyshare
                    .party_index(p)
                    .ok_or_else(|| ProtocolError::InvalidParams(format!("unknown signer {}", p)))
            })
            .collect::<Result<Vec<u16>, _>>()?;
        Ok((signers, indices))
    }
}

#[async_trait]
impl TssProcess for SigningProcess {
    type Output = SignatureResult;

    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn message_type(&self) -> MessageType {
        MessageType::TssKeySignMsg
    }

    fn protocol(&self) -> &'static str {
        "cggmp24-signing"
    }

    fn ready(&self, ready: &[PeerId]) -> bool {
        ready.len() >= self.threshold() + 1 && ready.contains(&self.self_id)
    }

    fn start_params(&self, ready: &[PeerId]) -> Result<Vec<u8>, ProtocolError> {
        let mut subset = select_signers(ready, &self.session_id, self.threshold())
            .map_err(|e| ProtocolError::InvalidParams(e.to_string()))?;
        subset.sort_by_key(|p| self.keyshare.party_index(p).unwrap_or(u16::MAX));
        encode_parties(&subset)
    }

    async fn start(&self, ctx: StartContext) -> Result<SignatureResult, ProtocolError> {
        let (signers, parties_at_keygen) = self.signers(&ctx.params)?;
        let Some(signer_index) = signers.iter().position(|p| *p == self.self_id) else {
            debug!(session_id = %self.session_id, "Not selected as signer");
            return Err(ProtocolError::NotInSubset);
        };
        let key_share = load_key_share(&self.keyshare)?;
        let public_key = self.public_key()?;

        info!(
            session_id = %self.session_id,
            signer_index,
            parties = ?parties_at_keygen,
            is_coordinator = ctx.is_coordinator,
            "Starting threshold signing"
        );

        let inbound = self.inbox.take().ok_or_else(|| {
            ProtocolError::Mpc("signing process already started".to_string())
        })?;
        let cancel = ctx.cancel.child_token();
        let inbound = demux(inbound, 1, cancel.clone()).remove(0);
        let (incoming, outgoing, flush) = connect(
            0,
            Arc::new(signers),
            inbound,
            ctx.outbound.clone(),
            cancel.clone(),
        );
        let party = round_based::MpcParty::connected((incoming, outgoing));

        let eid = cggmp24::ExecutionId::new(self.session_id.as_bytes());
        let scalar =
            cggmp24::generic_ec::Scalar::<Secp256k1>::from_be_bytes_mod_order(&self.digest);
        let message = cggmp24::PrehashedDataToSign::from_scalar(scalar);

        let mut rng = OsRng;
        let signing = cggmp24::signing(eid, signer_index as u16, &parties_at_keygen, &key_share)
            .sign(&mut rng, party, &message);
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(ProtocolError::Cancelled),
            _ = self.cancel.cancelled() => return Err(ProtocolError::Cancelled),
            r = signing => r,
        };

        let signature = match result {
            Ok(sig) => sig,
            Err(e) => {
                error!(session_id = %self.session_id, "Signing failed: {:?}", e);
                return Err(ProtocolError::Mpc(format!("{:?}", e)));
            }
        };
        let _ = flush.await;

        let r = (*signature.r).to_be_bytes().to_vec();
        let s = (*signature.s).to_be_bytes().to_vec();
        let signature = finalize_signature(&r, &s, &self.digest, &public_key)?;
        info!(session_id = %self.session_id, "Signature produced");

        Ok(SignatureResult {
            id: self.session_id.clone(),
            signature,
        })
    }

    fn update_from_bytes(&self, bytes: &[u8], from: PeerId, is_broadcast: bool) {
        self.inbox.push(bytes, from, is_broadcast);
    }

    fn stop(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::sort_by_rank;
    use k256::ecdsa::SigningKey;

    fn peer(b: u8) -> PeerId {
        PeerId::from_bytes([b; 32])
    }

    fn keyshare(peers: Vec<PeerId>, threshold: u16) -> StoredKeyshare {
        StoredKeyshare {
            threshold,
            peers,
            public_key: String::new(),
            share: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_ready_needs_threshold_plus_one_including_self() {
        let peers = vec![peer(1), peer(2), peer(3), peer(4)];
        let p = SigningProcess::new("1-1", peer(1), [0; 32], keyshare(peers, 2));
        assert!(!p.ready(&[peer(1), peer(2)]));
        assert!(!p.ready(&[peer(2), peer(3), peer(4)]));
        assert!(p.ready(&[peer(1), peer(3), peer(4)]));
    }

    #[test]
    fn test_start_params_are_ranked_subset_in_keygen_order() {
        let peers = vec![peer(1), peer(2), peer(3), peer(4)];
        let p = SigningProcess::new("1-9", peer(1), [0; 32], keyshare(peers.clone(), 1));
        let params = p.start_params(&peers).unwrap();
        let subset = decode_parties(&params).unwrap();

        let mut expected: Vec<PeerId> = sort_by_rank(&peers, "1-9").into_iter().take(2).collect();
        expected.sort_by_key(|x| peers.iter().position(|y| y == x));
        assert_eq!(subset, expected);

        // Every node derives the same params from the same ready set.
        let q = SigningProcess::new("1-9", peer(3), [0; 32], keyshare(peers.clone(), 1));
        assert_eq!(q.start_params(&peers).unwrap(), params);
    }

    #[tokio::test]
    async fn test_non_signer_exits_with_not_in_subset() {
        let peers = vec![peer(1), peer(2), peer(3)];
        let p = SigningProcess::new("1-1", peer(3), [0; 32], keyshare(peers, 1));
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let err = p
            .start(StartContext {
                cancel: CancellationToken::new(),
                is_coordinator: false,
                params: encode_parties(&[peer(1), peer(2)]).unwrap(),
                outbound: tx,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::NotInSubset));
    }

    #[test]
    fn test_finalize_signature_normalizes_and_recovers() {
        let key = SigningKey::random(&mut OsRng);
        let digest = [7u8; 32];
        let (sig, _) = key.sign_prehash_recoverable(&digest).unwrap();
        let (r, s) = sig.split_bytes();

        // High-s variant of the same signature must normalize back.
        let high = Signature::from_scalars(sig.r(), (-*sig.s()).to_bytes()).unwrap();
        let (_, hs) = high.split_bytes();

        for s_bytes in [s.to_vec(), hs.to_vec()] {
            let out = finalize_signature(&r, &s_bytes, &digest, key.verifying_key()).unwrap();
            assert_eq!(out.len(), 65);
            assert!(out[64] == 27 || out[64] == 28);
            let recid = RecoveryId::from_byte(out[64] - 27).unwrap();
            let sig = Signature::from_slice(&out[..64]).unwrap();
            assert!(sig.normalize_s().is_none());
            let recovered = VerifyingKey::recover_from_prehash(&digest, &sig, recid).unwrap();
            assert_eq!(&recovered, key.verifying_key());
        }
    }

    #[test]
    fn test_finalize_signature_rejects_foreign_key() {
        let key = SigningKey::random(&mut OsRng);
        let other = SigningKey::random(&mut OsRng);
        let digest = [1u8; 32];
        let (sig, _) = key.sign_prehash_recoverable(&digest).unwrap();
        let (r, s) = sig.split_bytes();
        assert!(finalize_signature(&r, &s, &digest, other.verifying_key()).is_err());
    }
}

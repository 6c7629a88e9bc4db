//! Mutual authentication for peer streams.
//!
//! ```text
//! dialer                                   listener
//!   | -- Hello { protocol, id_d, n_d } ------> |  gate: id_d in topology
//!   | <-- Challenge { protocol, id_l, n_l,     |
//!   |       sig_l(n_d || id_d) } ------------- |
//!   |  gate: id_l == expected, verify sig_l    |
//!   | -- Auth { sig_d(n_l || id_l) } --------> |  verify sig_d
//! ```
//!
//! Both signatures are domain-separated and bound to the protocol id so a
//! transcript cannot be replayed on another protocol.

use common::{NodeKey, SharedTopology};
use ed25519_dalek::Signature;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use threshold_types::PeerId;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::NetworkError;
use crate::frame::read_prefixed;

pub const PROTOCOL_ID: &str = "/sprinter/tss/1.0.0";

const DOMAIN: &[u8] = b"tss-handshake";

#[derive(Debug, Serialize, Deserialize)]
enum HandshakeMessage {
    Hello {
        protocol: String,
        peer_id: PeerId,
        nonce: [u8; 32],
    },
    Challenge {
        protocol: String,
        peer_id: PeerId,
        nonce: [u8; 32],
        signature: Vec<u8>,
    },
    Auth {
        signature: Vec<u8>,
    },
}

fn transcript(nonce: &[u8; 32], peer: &PeerId) -> Vec<u8> {
    let mut msg = Vec::with_capacity(DOMAIN.len() + PROTOCOL_ID.len() + 64);
    msg.extend_from_slice(DOMAIN);
    msg.extend_from_slice(PROTOCOL_ID.as_bytes());
    msg.extend_from_slice(nonce);
    msg.extend_from_slice(peer.as_bytes());
    msg
}

fn new_nonce() -> [u8; 32] {
    let mut nonce = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

fn fail(peer: impl ToString, reason: impl Into<String>) -> NetworkError {
    NetworkError::Handshake {
        peer: peer.to_string(),
        reason: reason.into(),
    }
}

fn verify(peer: &PeerId, msg: &[u8], sig: &[u8]) -> bool {
    match Signature::from_slice(sig) {
        Ok(sig) => NodeKey::verify(peer, msg, &sig),
        Err(_) => false,
    }
}

async fn write_msg<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &HandshakeMessage,
) -> Result<(), NetworkError> {
    let body = bincode::serialize(msg).map_err(|e| NetworkError::CodecError(e.to_string()))?;
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_msg<R: AsyncRead + Unpin>(reader: &mut R) -> Result<HandshakeMessage, NetworkError> {
    let body = read_prefixed(reader).await?;
    bincode::deserialize(&body).map_err(|e| NetworkError::CodecError(e.to_string()))
}

/// Dialer side. Succeeds only if the remote proves it holds `expected`'s key.
pub async fn dial<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    key: &NodeKey,
    expected: &PeerId,
) -> Result<(), NetworkError> {
    let nonce = new_nonce();
    write_msg(
        stream,
        &HandshakeMessage::Hello {
            protocol: PROTOCOL_ID.to_string(),
            peer_id: key.peer_id(),
            nonce,
        },
    )
    .await?;

    let (protocol, peer_id, remote_nonce, signature) = match read_msg(stream).await? {
        HandshakeMessage::Challenge {
            protocol,
            peer_id,
            nonce,
            signature,
        } => (protocol, peer_id, nonce, signature),
        _ => return Err(fail(expected, "expected challenge")),
    };

    if protocol != PROTOCOL_ID {
        return Err(fail(expected, format!("unsupported protocol {}", protocol)));
    }
    if &peer_id != expected {
        return Err(fail(expected, format!("remote identified as {}", peer_id)));
    }
    if !verify(&peer_id, &transcript(&nonce, &key.peer_id()), &signature) {
        return Err(fail(expected, "bad challenge signature"));
    }

    let sig = key.sign(&transcript(&remote_nonce, &peer_id));
    write_msg(
        stream,
        &HandshakeMessage::Auth {
            signature: sig.to_bytes().to_vec(),
        },
    )
    .await?;

    debug!(peer = %peer_id.short(), "Outbound handshake complete");
    Ok(())
}

/// Listener side. Returns the authenticated remote identity.
pub async fn accept<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    key: &NodeKey,
    topology: &SharedTopology,
) -> Result<PeerId, NetworkError> {
    let (protocol, peer_id, remote_nonce) = match read_msg(stream).await? {
        HandshakeMessage::Hello {
            protocol,
            peer_id,
            nonce,
        } => (protocol, peer_id, nonce),
        _ => return Err(fail("unknown", "expected hello")),
    };

    if protocol != PROTOCOL_ID {
        return Err(fail(peer_id, format!("unsupported protocol {}", protocol)));
    }
    if !topology.borrow().contains(&peer_id) {
        return Err(NetworkError::NotInTopology { peer: peer_id });
    }

    let nonce = new_nonce();
    let sig = key.sign(&transcript(&remote_nonce, &peer_id));
    write_msg(
        stream,
        &HandshakeMessage::Challenge {
            protocol: PROTOCOL_ID.to_string(),
            peer_id: key.peer_id(),
            nonce,
            signature: sig.to_bytes().to_vec(),
        },
    )
    .await?;

    let signature = match read_msg(stream).await? {
        HandshakeMessage::Auth { signature } => signature,
        _ => return Err(fail(peer_id, "expected auth")),
    };
    if !verify(&peer_id, &transcript(&nonce, &key.peer_id()), &signature) {
        return Err(fail(peer_id, "bad auth signature"));
    }

    debug!(peer = %peer_id.short(), "Inbound handshake complete");
    Ok(peer_id)
}

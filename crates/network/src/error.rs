//! Network error types for the peer transport.

use std::io;
use thiserror::Error;
use threshold_types::PeerId;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("failed to connect to peer {peer}: {source}")]
    ConnectionFailed {
        peer: PeerId,
        #[source]
        source: io::Error,
    },

    #[error("failed to send message to peer {peer}: {source}")]
    SendFailed {
        peer: PeerId,
        #[source]
        source: io::Error,
    },

    #[error("failed to receive message: {0}")]
    ReceiveFailed(#[from] io::Error),

    #[error("message codec error: {0}")]
    CodecError(String),

    /// The connection gate refused a peer outside the topology.
    #[error("peer {peer} is not in the topology")]
    NotInTopology { peer: PeerId },

    /// Handshake failed (wrong protocol, identity mismatch, bad signature).
    #[error("handshake with {peer} failed: {reason}")]
    Handshake { peer: String, reason: String },

    #[error("failed to bind listener on {address}: {source}")]
    BindFailed {
        address: String,
        #[source]
        source: io::Error,
    },

    /// Peer outbox is closed (bus shut down or peer removed).
    #[error("peer {peer} unavailable")]
    PeerUnavailable { peer: PeerId },

    #[error("operation timed out: {0}")]
    Timeout(String),
}

impl From<NetworkError> for threshold_types::Error {
    fn from(err: NetworkError) -> Self {
        match err {
            NetworkError::PeerUnavailable { .. } | NetworkError::Timeout(_) => {
                threshold_types::Error::Coordination(err.to_string())
            }
            _ => threshold_types::Error::Internal(err.to_string()),
        }
    }
}

use thiserror::Error;
use threshold_storage::StorageError;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("not in signing subset")]
    NotInSubset,

    #[error("session aborted by {peer}: {reason}")]
    Aborted { peer: String, reason: String },

    #[error("session timed out")]
    Timeout,

    #[error("session cancelled")]
    Cancelled,

    #[error("election failed: {0}")]
    Election(#[from] threshold_consensus::ElectionError),

    #[error("invalid start params: {0}")]
    InvalidParams(String),

    #[error("MPC protocol failed: {0}")]
    Mpc(String),

    #[error("invalid key share: {0}")]
    InvalidKeyShare(String),

    #[error("signature verification failed")]
    InvalidSignature,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<ProtocolError> for threshold_types::Error {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Storage(e) => e.into(),
            ProtocolError::InvalidKeyShare(_) | ProtocolError::Serialization(_) => {
                threshold_types::Error::Internal(err.to_string())
            }
            other => threshold_types::Error::Coordination(other.to_string()),
        }
    }
}

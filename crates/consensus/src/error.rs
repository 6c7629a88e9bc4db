use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ElectionError {
    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("peer {0} is not part of the session")]
    NotAllowed(String),

    #[error("election cancelled")]
    Cancelled,
}

impl From<ElectionError> for threshold_types::Error {
    fn from(err: ElectionError) -> Self {
        threshold_types::Error::Coordination(err.to_string())
    }
}

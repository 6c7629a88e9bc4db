use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("rpc request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("{0} not found")]
    NotFound(String),

    #[error("failed to decode {what}: {reason}")]
    Decode { what: &'static str, reason: String },

    #[error("unexpected http status {0}")]
    Status(u16),

    #[error("no price for {0}")]
    PriceUnavailable(String),
}

impl ChainError {
    pub fn decode(what: &'static str, reason: impl ToString) -> Self {
        ChainError::Decode {
            what,
            reason: reason.to_string(),
        }
    }
}

impl From<ChainError> for threshold_types::Error {
    fn from(err: ChainError) -> Self {
        match err {
            ChainError::NotFound(_) => threshold_types::Error::NotFound(err.to_string()),
            other => threshold_types::Error::IntentUnavailable(other.to_string()),
        }
    }
}

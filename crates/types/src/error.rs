//! Service-level error kinds.
//!
//! Lower layers keep their own error enums; at the handler boundary they are
//! folded into one of these kinds so the HTTP surface can pick a status code
//! and the caller gets a stable `reason` string.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// Malformed request: missing fields, unknown protocol or chain,
    /// malformed big integer.
    #[error("{0}")]
    InvalidInput(String),

    /// The intent could not be found (fetch timeout, missing log).
    #[error("{0}")]
    NotFound(String),

    /// The intent exists but its evidence does not check out: receipt
    /// missing, hash mismatch, signature mismatch, bucket overflow.
    #[error("{0}")]
    IntentUnavailable(String),

    /// The intent is well-formed but breaks a signing rule.
    #[error("{0}")]
    PolicyViolation(String),

    /// Election deadline, party not in subset, TSS timeout, peer unavailable.
    #[error("{0}")]
    Coordination(String),

    /// Caller-facing deadline elapsed.
    #[error("timeout")]
    Timeout,

    #[error("{0}")]
    Internal(String),
}

impl Error {
    /// Short machine-readable tag for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidInput(_) => "invalid_input",
            Error::NotFound(_) => "not_found",
            Error::IntentUnavailable(_) => "intent_unavailable",
            Error::PolicyViolation(_) => "policy_violation",
            Error::Coordination(_) => "coordination",
            Error::Timeout => "timeout",
            Error::Internal(_) => "internal",
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    pub fn policy(msg: impl Into<String>) -> Self {
        Error::PolicyViolation(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Error::IntentUnavailable(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    pub fn chain_not_supported(chain_id: u64) -> Self {
        Error::InvalidInput(format!("chain '{}' not supported", chain_id))
    }
}

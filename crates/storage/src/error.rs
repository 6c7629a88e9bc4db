use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    /// No keyshare on disk yet; keygen has not completed.
    #[error("keyshare not initialized")]
    NotInitialized,

    #[error("storage io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to (de)serialize keyshare: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("lock poisoned")]
    LockPoisoned,
}

impl From<StorageError> for threshold_types::Error {
    fn from(err: StorageError) -> Self {
        threshold_types::Error::Internal(err.to_string())
    }
}

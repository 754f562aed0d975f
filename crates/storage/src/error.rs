use crate::StoreHealth;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Another owner held the store lock for the whole open timeout
    #[error("timed out after {waited:?} waiting for the store lock")]
    Timeout { waited: Duration },

    /// The store was corrupted and could not be rebuilt; the data is unavailable
    #[error("unable to recreate store at {}: {source}", path.display())]
    RecreateFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("store is unavailable while {0:?}")]
    Unavailable(StoreHealth),

    #[error("migration from model {from} failed: {reason}")]
    MigrationFailed { from: String, reason: String },

    /// The context's executor is gone, or the submitted work panicked
    #[error("persistence context is closed")]
    ContextClosed,
}

impl StoreError {
    /// Whether the caller may retry the same operation unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Timeout { .. })
    }

    /// Whether the store is lost for this process
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::RecreateFailed { .. })
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

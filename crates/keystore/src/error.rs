//! Error types for the keystore crate

use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum Error {
    /// No record stored under the key
    #[error("not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    /// Divergent replicas were found and no resolver is registered for the bucket
    #[error("{count} divergent siblings for {bucket}/{key} and no conflict resolver")]
    SiblingConflict {
        bucket: String,
        key: String,
        count: usize,
    },

    /// A conflict resolver could not merge the siblings
    #[error("failed to resolve siblings for {bucket}/{key}: {message}")]
    Resolution {
        bucket: String,
        key: String,
        message: String,
    },

    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record body could not be encoded or decoded
    #[error("invalid record body: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A thread panicked while holding the store
    #[error("store lock poisoned")]
    Poisoned,
}

impl Error {
    pub(crate) fn not_found(bucket: &str, key: &str) -> Self {
        Self::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        }
    }

    /// Whether the error means the key is absent
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether retrying the same operation may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SiblingConflict { .. })
    }
}

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, Error>;

//! Error types for the resource graph.
//!
//! Contract violations (unknown inputs, writes to connected inputs, dirty
//! index reads) propagate straight to the caller. Lock and sibling conflicts
//! are transient and classified as retryable so the lock loop can back off
//! and try again.

use crate::computable::EvaluationError;
use thiserror::Error;

/// Errors that can occur while manipulating the resource graph.
#[derive(Debug, Error)]
pub enum Error {
    /// Input name is not declared in the resource schema
    #[error("{resource}: unknown input '{input}'")]
    UnknownInput { resource: String, input: String },

    /// Input name is already declared
    #[error("{resource}: input '{input}' already exists")]
    InputAlreadyExists { resource: String, input: String },

    /// Direct assignment to an input driven by a connection
    #[error("{resource}: input '{input}' is connected, disconnect it before assigning a value")]
    InputConnected { resource: String, input: String },

    /// Index scan while the scanned index has unsaved changes
    #[error("{bucket}/{key}: index '{index}' has unsaved changes")]
    DirtyState {
        bucket: String,
        key: String,
        index: String,
    },

    /// Object does not exist
    #[error("{bucket}/{key}: not found")]
    NotFound { bucket: String, key: String },

    /// Object already exists
    #[error("{bucket}/{key}: already exists")]
    AlreadyExists { bucket: String, key: String },

    /// Lock is held by another identity
    #[error("lock '{lock}' is held by {}", owner.as_deref().unwrap_or("another identity"))]
    LockConflict { lock: String, owner: Option<String> },

    /// Divergent replicas without a resolver
    #[error("{bucket}/{key}: {count} siblings and no resolver")]
    SiblingConflict {
        bucket: String,
        key: String,
        count: usize,
    },

    /// A cycle in the input graph or the execution graph
    #[error("cycle detected: {path}")]
    CycleDetected { path: String },

    /// Computed input evaluator failed
    #[error("{resource}: cannot evaluate '{input}': {source}")]
    Evaluation {
        resource: String,
        input: String,
        #[source]
        source: EvaluationError,
    },

    /// Referenced log item does not exist
    #[error("cannot find log item with uid {uid}")]
    CannotFindId { uid: String },

    /// Name contains a reserved delimiter or is empty
    #[error("invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    /// Index term that does not decode as an edge
    #[error("corrupt index term '{term}'")]
    CorruptIndex { term: String },

    /// Diff cannot be applied to a value
    #[error("cannot apply diff: {message}")]
    Patch { message: String },

    /// Revert of an item that is not in history
    #[error("log item {uid} is not in history, discard it instead")]
    NotInHistory { uid: String },

    /// Commit or discard of an item that is not staged
    #[error("log item {uid} is not staged")]
    NotStaged { uid: String },

    /// Release by an identity that does not own the lock
    #[error("lock '{lock}' is not owned by {identity}")]
    LockNotOwned { lock: String, identity: String },

    /// Storage adapter error
    #[error("store error: {0}")]
    Store(#[source] keystore::Error),

    /// JSON encoding error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn not_found(bucket: &str, key: &str) -> Self {
        Self::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        }
    }

    pub(crate) fn unknown_input(resource: &str, input: &str) -> Self {
        Self::UnknownInput {
            resource: resource.to_string(),
            input: input.to_string(),
        }
    }

    pub(crate) fn patch(message: impl Into<String>) -> Self {
        Self::Patch {
            message: message.into(),
        }
    }

    /// Whether the error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockConflict { .. } | Self::SiblingConflict { .. })
    }

    /// Whether the error reports a missing object.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<keystore::Error> for Error {
    fn from(err: keystore::Error) -> Self {
        match err {
            keystore::Error::NotFound { bucket, key } => Self::NotFound { bucket, key },
            keystore::Error::SiblingConflict { bucket, key, count } => {
                Self::SiblingConflict { bucket, key, count }
            }
            other => Self::Store(other),
        }
    }
}

/// Result type for graph operations.
pub type Result<T> = std::result::Result<T, Error>;

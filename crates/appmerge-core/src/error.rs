//! Error types for merge orchestration

use appmerge_http::HttpError;
use thiserror::Error;

/// Errors raised by the orchestration core
#[derive(Debug, Error)]
pub enum MergeError {
    /// A required id or option was missing or malformed; raised before any I/O
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The remote call failed
    #[error("Remote request failed: {0}")]
    Remote(#[from] HttpError),

    /// The remote call failed during a one-shot fetch
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: HttpError,
    },

    /// The server answered 2xx but the reply is unusable
    #[error("Malformed server reply: {0}")]
    MalformedReply(String),

    /// One or more workflow-gating checks failed; messages are joined
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("No active configuration")]
    NoActiveConfiguration,

    #[error("Already at the first configuration step")]
    AtFirstStep,

    #[error("Unknown configuration step: {0}")]
    UnknownStep(String),

    /// Path is empty or walks through a non-object value
    #[error("Invalid state path: {0}")]
    InvalidPath(String),

    /// Value does not fit the state schema at this path
    #[error("Invalid value for {path}: {reason}")]
    InvalidValue { path: String, reason: String },

    #[error("mergeStatus.status can only change through update_merge_status")]
    StatusGuarded,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Settings error: {0}")]
    Settings(String),
}

impl MergeError {
    /// The underlying transport error, if this failure came from a remote call
    pub fn http(&self) -> Option<&HttpError> {
        match self {
            MergeError::Remote(e) | MergeError::Context { source: e, .. } => Some(e),
            _ => None,
        }
    }
}

/// Result type for orchestration operations
pub type MergeResult<T> = Result<T, MergeError>;

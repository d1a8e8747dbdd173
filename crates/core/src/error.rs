//! Queue error model.

use thiserror::Error;

use crate::id::JobId;

/// Result type used across the job queue.
pub type QueueResult<T> = Result<T, QueueError>;

/// Job queue error.
///
/// `NotFound` covers both a missing job and a job whose current status makes
/// the requested transition inapplicable. Store failures are always surfaced
/// because the effect of the operation is unknown.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The job does not exist, or its status does not allow the transition.
    #[error("job not found or not in an applicable state: {0}")]
    NotFound(JobId),

    /// Caller input failed validation (e.g. empty queue name).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// The record store reported an error (connectivity, timeout, ...).
    #[error("store error: {0}")]
    Store(String),

    /// A record could not be converted to or from its stored form.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl QueueError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

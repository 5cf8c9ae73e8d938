use cluster::ClusterError;

use crate::reclaim::ReclaimStage;

/// Errors surfaced to callers of the identity operations.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Server error: {0}")]
    Server(String),

    /// The request deadline passed before the stage could start.
    #[error("Deadline exceeded before {0}")]
    DeadlineExceeded(ReclaimStage),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl From<ClusterError> for IdentityError {
    fn from(err: ClusterError) -> Self {
        if err.is_not_found() {
            IdentityError::NotFound(err.to_string())
        } else {
            IdentityError::Server(err.to_string())
        }
    }
}

impl From<serde_json::Error> for IdentityError {
    fn from(err: serde_json::Error) -> Self {
        IdentityError::Server(format!("Malformed record: {err}"))
    }
}

/// Result type for identity operations
pub type IdentityResult<T> = Result<T, IdentityError>;

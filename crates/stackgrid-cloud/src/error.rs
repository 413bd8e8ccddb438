//! Errors returned by capability interfaces.

use stackgrid_core::ResourceKind;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CloudError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("{kind} {name} not ready after {waited_ms}ms")]
    NotReady {
        kind: ResourceKind,
        name: String,
        waited_ms: u64,
    },

    #[error("{operation} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last: Box<CloudError>,
    },
}

impl CloudError {
    /// Whether a single-resource retry may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CloudError::Transient(_) | CloudError::RateLimited { .. })
    }
}

pub type CloudResult<T> = Result<T, CloudError>;

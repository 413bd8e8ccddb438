//! Snapshot store errors.
//!
//! redb failures are flattened to strings at the call site, tagged by the
//! stage that failed, so callers do not depend on redb's error types.

use thiserror::Error;

pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("cannot open snapshot store: {0}")]
    Open(String),

    #[error("snapshot transaction failed: {0}")]
    Transaction(String),

    #[error("cannot open snapshot table: {0}")]
    Table(String),

    #[error("snapshot read failed: {0}")]
    Read(String),

    #[error("snapshot write failed: {0}")]
    Write(String),

    #[error("cannot encode record: {0}")]
    Serialize(String),

    #[error("stored record is corrupt: {0}")]
    Deserialize(String),

    /// A retirement named a generation the history table never saw.
    #[error("no superseded generation {0}")]
    UnknownGeneration(String),
}

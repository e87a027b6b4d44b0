//! Errors raised by the fleetpool state store.

use thiserror::Error;

pub type StateResult<T> = Result<T, StateError>;

/// Storage failures, plus the two logical outcomes callers branch on:
/// a missing record and a uniqueness violation.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("cannot open state store: {0}")]
    Open(String),

    #[error("state store transaction failed: {0}")]
    Transaction(String),

    #[error("state store table unavailable: {0}")]
    Table(String),

    #[error("state store read failed: {0}")]
    Read(String),

    #[error("state store write failed: {0}")]
    Write(String),

    #[error("cannot encode record: {0}")]
    Serialize(String),

    #[error("corrupt record: {0}")]
    Deserialize(String),

    #[error("record not found: {0}")]
    NotFound(String),

    /// An index claim (engine slot, port, numbered database) is taken.
    #[error("uniqueness violation: {0}")]
    Conflict(String),
}

impl StateError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StateError::Conflict(_))
    }
}

//! Lifecycle store errors.

use thiserror::Error;

pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("cannot open lifecycle store: {0}")]
    Open(String),

    /// A redb transaction, table, read, or write step failed.
    #[error("store {op} failed: {reason}")]
    Storage { op: &'static str, reason: String },

    /// A record could not be converted to or from JSON.
    #[error("record codec failed: {0}")]
    Codec(String),

    /// An atomic operation addressed a record that does not exist.
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
}

impl StateError {
    pub(crate) fn storage<E: std::fmt::Display>(op: &'static str) -> impl FnOnce(E) -> Self {
        move |e| Self::Storage {
            op,
            reason: e.to_string(),
        }
    }

    pub(crate) fn not_found(kind: &'static str, id: &str) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

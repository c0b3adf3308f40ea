//! Failures of the instance store and the discovery registry.
//!
//! redb errors are flattened to strings at the boundary so callers never
//! depend on the storage engine's error types.

use std::path::PathBuf;

use thiserror::Error;

pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Error)]
pub enum StateError {
    /// The state file exists but redb refused it even after recreation.
    #[error("cannot open state database: {0}")]
    Open(String),

    /// Another ubench process held the file for the whole retry window.
    #[error("state database {} is held by another ubench process", path.display())]
    Locked { path: PathBuf },

    #[error("state transaction aborted: {0}")]
    Transaction(String),

    #[error("state table unavailable: {0}")]
    Table(String),

    #[error("cannot read stored record: {0}")]
    Read(String),

    #[error("cannot store record: {0}")]
    Write(String),

    /// A record could not be encoded to (or decoded from) JSON.
    #[error("stored record is not valid JSON: {0}")]
    Serialize(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StateError {
    pub(crate) fn locked(path: &std::path::Path) -> Self {
        Self::Locked {
            path: path.to_path_buf(),
        }
    }
}

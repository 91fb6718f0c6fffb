//! Repository errors

use thiserror::Error;

/// Result type alias for repository operations
pub type Result<T> = std::result::Result<T, RepoError>;

#[derive(Error, Debug)]
pub enum RepoError {
    #[error("Email already exists")]
    EmailExists,

    #[error(transparent)]
    Store(#[from] tuplekv_common::Error),
}

impl RepoError {
    /// Whether the error is a uniqueness violation rather than a storage failure
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, RepoError::EmailExists)
    }
}

//! Error types for TupleKV
//!
//! Provides a unified error type hierarchy for the store and everything
//! layered on top of it.

use thiserror::Error;

/// Result type alias using TupleKV's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for TupleKV
#[derive(Error, Debug)]
pub enum Error {
    // Selector Errors
    #[error("Invalid selector: {0}")]
    InvalidSelector(String),

    // Key Errors
    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    // Value Errors
    #[error("Failed to encode value for key {key}: {source}")]
    ValueEncoding {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to decode value for key {key}: {source}")]
    ValueDecoding {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    // Transaction Errors
    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),

    // Backend Errors
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    // Configuration Errors
    #[error("Configuration error: {0}")]
    Config(String),

    // IO Errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Selector that names neither a prefix nor a complete range
    #[must_use]
    pub fn incomplete_selector() -> Self {
        Error::InvalidSelector(
            "selector must specify either 'prefix' or both 'start' and 'end'".to_string(),
        )
    }

    /// Whether the error originated in the underlying engine
    #[must_use]
    pub fn is_backend(&self) -> bool {
        matches!(self, Error::Backend(_))
    }
}

/// Key encoding errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("key segment cannot contain the separator: {segment:?}")]
    ContainsSeparator { segment: String },

    #[error("key must have at least one segment")]
    Empty,

    #[error("a single empty segment collides with the root key")]
    RootCollision,
}

/// Transaction-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("Cannot close database within a transaction")]
    CloseInTransaction,

    #[error("Transaction handle used after its transaction finished")]
    Finished,

    #[error("Store handle used inside its own transaction; use the transaction handle")]
    StoreHandleInTransaction,
}

/// Errors surfaced by the underlying relational engine
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("{0}")]
    Engine(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Connection closed")]
    Closed,
}

impl BackendError {
    /// Wrap a driver error without altering it
    pub fn engine<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        BackendError::Engine(Box::new(err))
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(format!("Failed to parse TOML config: {e}"))
    }
}

//! Configuration management for TupleKV

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Path that opens a private in-memory database
pub const MEMORY_PATH: &str = ":memory:";

/// Main configuration structure for TupleKV
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML/JSON file
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = tokio::fs::read_to_string(path.as_ref())
            .await
            .map_err(|e| Error::Config(format!("Failed to read config file: {e}")))?;

        let config: Config = if path.as_ref().extension().map_or(false, |ext| ext == "toml") {
            toml::from_str(&content)?
        } else {
            serde_json::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse JSON config: {e}")))?
        };

        config.validate()?;
        debug!(
            path = %path.as_ref().display(),
            backend = ?config.storage.backend,
            storage = %config.storage.path,
            "Configuration loaded"
        );
        if config.storage.transaction_mode == TransactionMode::BestEffort {
            warn!("transaction_mode = best_effort: rejected BEGIN/SAVEPOINT will not abort");
        }
        Ok(config)
    }

    /// Check values that would otherwise fail deep inside the store
    pub fn validate(&self) -> Result<()> {
        self.storage.validate()
    }
}

/// Which engine driver backs the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Embedded SQLite driven synchronously (rusqlite)
    #[default]
    Sqlite,
    /// SQLite through the asynchronous sqlx driver
    Sqlx,
}

impl std::str::FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sqlite" | "rusqlite" => Ok(BackendKind::Sqlite),
            "sqlx" => Ok(BackendKind::Sqlx),
            other => Err(Error::Config(format!("Unknown backend: {other}"))),
        }
    }
}

/// How a rejected BEGIN or SAVEPOINT is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionMode {
    /// Propagate the engine error
    #[default]
    Strict,
    /// Log a warning and run the body without transactional guarantees
    BestEffort,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Engine driver
    pub backend: BackendKind,
    /// Database file path, or `:memory:`
    pub path: String,
    /// Name of the key-value table
    pub table: String,
    /// Accept the empty key as a single root entry
    pub allow_root_key: bool,
    /// Handling of engines that reject transactional statements
    pub transaction_mode: TransactionMode,
    /// Busy timeout in milliseconds
    pub busy_timeout_ms: u64,
    /// Enable write-ahead logging for file databases
    pub wal: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Sqlite,
            path: MEMORY_PATH.to_string(),
            table: "kv".to_string(),
            allow_root_key: false,
            transaction_mode: TransactionMode::Strict,
            busy_timeout_ms: 5_000,
            wal: true,
        }
    }
}

impl StorageConfig {
    /// In-memory configuration with defaults
    #[must_use]
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// File-backed configuration with defaults
    #[must_use]
    pub fn with_path(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_memory(&self) -> bool {
        self.path == MEMORY_PATH
    }

    /// The table name is spliced into SQL text, so only plain identifiers pass
    pub fn validate(&self) -> Result<()> {
        if !is_identifier(&self.table) {
            return Err(Error::Config(format!(
                "Invalid table name: {:?}",
                self.table
            )));
        }
        if self.path.is_empty() {
            return Err(Error::Config("Storage path must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Plain SQL identifier: `[A-Za-z_][A-Za-z0-9_]*`
#[must_use]
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when RUST_LOG is unset
    pub level: String,
    /// Emit JSON formatted log lines
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

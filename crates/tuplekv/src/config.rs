//! Configuration loading

use std::path::Path;

use anyhow::Result;
use tuplekv_common::config::{BackendKind, Config};

/// Load configuration from file, falling back to defaults when absent
pub async fn load(path: Option<&str>) -> Result<Config> {
    match path.map(Path::new) {
        Some(path) if path.exists() => Config::load(path).await.map_err(|e| anyhow::anyhow!(e)),
        Some(path) => {
            anyhow::bail!("config file not found: {}", path.display())
        }
        None => Ok(Config::default()),
    }
}

/// Command-line flags take precedence over the file
pub fn apply_overrides(
    mut config: Config,
    db: Option<String>,
    backend: Option<BackendKind>,
) -> Result<Config> {
    if let Some(db) = db {
        config.storage.path = db;
    }
    if let Some(backend) = backend {
        config.storage.backend = backend;
    }
    config.validate()?;
    Ok(config)
}

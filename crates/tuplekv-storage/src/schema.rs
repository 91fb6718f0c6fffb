//! Schema initialization

use tracing::info;

use tuplekv_common::config::is_identifier;
use tuplekv_common::{Error, Result};

use crate::backend::Backend;

/// Default key-value table
pub const DEFAULT_TABLE: &str = "kv";

/// Create the key-value table if it does not exist. Safe to call on every
/// open.
pub async fn ensure_schema(backend: &dyn Backend, table: &str) -> Result<()> {
    if !is_identifier(table) {
        return Err(Error::Config(format!("Invalid table name: {table:?}")));
    }

    backend
        .execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {table} (key TEXT PRIMARY KEY, value TEXT NOT NULL)"
            ),
            &[],
        )
        .await?;

    info!(table, backend = backend.name(), "Schema ready");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SqliteBackend;

    #[tokio::test]
    async fn test_ensure_schema_is_idempotent() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        ensure_schema(&backend, DEFAULT_TABLE).await.unwrap();
        backend
            .execute(
                "INSERT INTO kv (key, value) VALUES (?, ?)",
                &["k".into(), "1".into()],
            )
            .await
            .unwrap();
        ensure_schema(&backend, DEFAULT_TABLE).await.unwrap();

        let stmt = backend.prepare("SELECT COUNT(*) AS n FROM kv").await.unwrap();
        let row = stmt.get_one(&[]).await.unwrap().unwrap();
        assert_eq!(row.get("n").and_then(|v| v.as_i64()), Some(1));
    }

    #[tokio::test]
    async fn test_ensure_schema_rejects_bad_table() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let err = ensure_schema(&backend, "kv; DROP TABLE x").await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}

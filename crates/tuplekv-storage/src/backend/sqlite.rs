//! Embedded SQLite backend (rusqlite)
//!
//! The connection is synchronous; each call takes the connection lock, runs
//! to completion and releases it without awaiting.

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::{ToSql, ToSqlOutput, Value as SqliteValue, ValueRef};
use rusqlite::{params_from_iter, Connection};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use tuplekv_common::config::StorageConfig;
use tuplekv_common::error::{BackendError, Error};
use tuplekv_common::Result;

use super::{Backend, Row, SqlValue, Statement};

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5_000);

fn engine(err: rusqlite::Error) -> Error {
    BackendError::engine(err).into()
}

struct Inner {
    conn: Mutex<Option<Connection>>,
}

impl Inner {
    fn with_conn<R>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<R>) -> Result<R> {
        let guard = self.conn.lock();
        let conn = guard.as_ref().ok_or(BackendError::Closed)?;
        f(conn).map_err(engine)
    }
}

/// Single-connection rusqlite backend
#[derive(Clone)]
pub struct SqliteBackend {
    inner: Arc<Inner>,
}

impl SqliteBackend {
    /// Open (or create) a database file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).map_err(engine)?;
        apply_pragmas(&conn, DEFAULT_BUSY_TIMEOUT, true)?;
        info!(path = %path.as_ref().display(), "Opened SQLite database");
        Ok(Self::from_connection(conn))
    }

    /// Private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(engine)?;
        apply_pragmas(&conn, DEFAULT_BUSY_TIMEOUT, false)?;
        debug!("Opened in-memory SQLite database");
        Ok(Self::from_connection(conn))
    }

    /// Open according to the storage configuration
    pub fn open_with(config: &StorageConfig) -> Result<Self> {
        let conn = if config.is_memory() {
            Connection::open_in_memory()
        } else {
            Connection::open(&config.path)
        }
        .map_err(engine)?;

        apply_pragmas(
            &conn,
            Duration::from_millis(config.busy_timeout_ms),
            config.wal && !config.is_memory(),
        )?;
        info!(path = %config.path, wal = config.wal, "Opened SQLite database");
        Ok(Self::from_connection(conn))
    }

    /// Wrap an already configured connection
    #[must_use]
    pub fn from_connection(conn: Connection) -> Self {
        Self {
            inner: Arc::new(Inner {
                conn: Mutex::new(Some(conn)),
            }),
        }
    }
}

fn apply_pragmas(conn: &Connection, busy_timeout: Duration, wal: bool) -> Result<()> {
    conn.busy_timeout(busy_timeout).map_err(engine)?;
    if wal {
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")
            .map_err(engine)?;
    }
    Ok(())
}

#[async_trait]
impl Backend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<()> {
        debug!(sql, "execute");
        self.inner.with_conn(|conn| {
            if params.is_empty() {
                conn.execute_batch(sql)
            } else {
                conn.execute(sql, params_from_iter(params.iter())).map(|_| ())
            }
        })
    }

    async fn prepare(&self, sql: &str) -> Result<Box<dyn Statement>> {
        // Compile once up front so syntax errors surface here
        self.inner
            .with_conn(|conn| conn.prepare_cached(sql).map(|_| ()))?;
        Ok(Box::new(SqliteStatement {
            inner: Arc::clone(&self.inner),
            sql: sql.to_string(),
        }))
    }

    async fn close(&self) -> Result<()> {
        let conn = self.inner.conn.lock().take();
        if let Some(conn) = conn {
            conn.close().map_err(|(_, err)| engine(err))?;
            info!("Closed SQLite database");
        }
        Ok(())
    }
}

struct SqliteStatement {
    inner: Arc<Inner>,
    sql: String,
}

impl SqliteStatement {
    fn query(&self, params: &[SqlValue], limit: Option<usize>) -> Result<Vec<Row>> {
        self.inner.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&self.sql)?;
            let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
            let mut rows = stmt.query(params_from_iter(params.iter()))?;

            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let mut converted = Row::with_capacity(names.len());
                for (i, name) in names.iter().enumerate() {
                    converted.push(name.clone(), from_value_ref(row.get_ref(i)?)?);
                }
                out.push(converted);
                if limit.is_some_and(|n| out.len() >= n) {
                    break;
                }
            }
            Ok(out)
        })
    }
}

#[async_trait]
impl Statement for SqliteStatement {
    fn sql(&self) -> &str {
        &self.sql
    }

    async fn get_one(&self, params: &[SqlValue]) -> Result<Option<Row>> {
        Ok(self.query(params, Some(1))?.into_iter().next())
    }

    async fn get_all(&self, params: &[SqlValue]) -> Result<Vec<Row>> {
        self.query(params, None)
    }

    async fn mutate(&self, params: &[SqlValue]) -> Result<u64> {
        let changed = self.inner.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&self.sql)?;
            stmt.execute(params_from_iter(params.iter()))
        })?;
        Ok(changed as u64)
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(SqliteValue::Null),
            SqlValue::Integer(n) => ToSqlOutput::Owned(SqliteValue::Integer(*n)),
            SqlValue::Real(f) => ToSqlOutput::Owned(SqliteValue::Real(*f)),
            SqlValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            SqlValue::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

fn from_value_ref(value: ValueRef<'_>) -> rusqlite::Result<SqlValue> {
    Ok(match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(n) => SqlValue::Integer(n),
        ValueRef::Real(f) => SqlValue::Real(f),
        ValueRef::Text(t) => SqlValue::Text(
            std::str::from_utf8(t)
                .map_err(rusqlite::Error::Utf8Error)?
                .to_string(),
        ),
        ValueRef::Blob(b) => SqlValue::Blob(b.to_vec()),
    })
}

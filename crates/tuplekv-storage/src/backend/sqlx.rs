//! Asynchronous SQLite backend (sqlx)

use async_trait::async_trait;
use sqlx::query::Query;
use sqlx::sqlite::{
    Sqlite, SqliteArguments, SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{Column as _, Connection as _, Executor as _, Row as _, TypeInfo as _, ValueRef as _};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

use tuplekv_common::config::StorageConfig;
use tuplekv_common::error::{BackendError, Error};
use tuplekv_common::Result;

use super::{Backend, Row, SqlValue, Statement};

fn engine(err: sqlx::Error) -> Error {
    BackendError::engine(err).into()
}

struct Inner {
    conn: Mutex<Option<SqliteConnection>>,
}

/// Single-connection sqlx backend
#[derive(Clone)]
pub struct SqlxBackend {
    inner: Arc<Inner>,
}

impl SqlxBackend {
    /// Connect with a `sqlite:` URL, e.g. `sqlite://data/kv.db?mode=rwc`
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url).map_err(engine)?;
        Self::connect_options(options).await
    }

    /// Connect according to the storage configuration
    pub async fn connect_with(config: &StorageConfig) -> Result<Self> {
        let options = if config.is_memory() {
            SqliteConnectOptions::from_str("sqlite::memory:").map_err(engine)?
        } else {
            let mut options = SqliteConnectOptions::new()
                .filename(&config.path)
                .create_if_missing(true);
            if config.wal {
                options = options
                    .journal_mode(SqliteJournalMode::Wal)
                    .synchronous(SqliteSynchronous::Normal);
            }
            options
        }
        .busy_timeout(Duration::from_millis(config.busy_timeout_ms));

        let backend = Self::connect_options(options).await?;
        info!(path = %config.path, wal = config.wal, "Opened SQLite database via sqlx");
        Ok(backend)
    }

    async fn connect_options(options: SqliteConnectOptions) -> Result<Self> {
        let conn = SqliteConnection::connect_with(&options)
            .await
            .map_err(engine)?;
        Ok(Self {
            inner: Arc::new(Inner {
                conn: Mutex::new(Some(conn)),
            }),
        })
    }
}

fn bind_all<'q>(sql: &'q str, params: &'q [SqlValue]) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    params.iter().fold(sqlx::query(sql), |query, param| match param {
        SqlValue::Null => query.bind(None::<String>),
        SqlValue::Integer(n) => query.bind(*n),
        SqlValue::Real(f) => query.bind(*f),
        SqlValue::Text(s) => query.bind(s.as_str()),
        SqlValue::Blob(b) => query.bind(b.as_slice()),
    })
}

fn convert_row(row: &SqliteRow) -> Result<Row> {
    let mut out = Row::with_capacity(row.columns().len());
    for (i, column) in row.columns().iter().enumerate() {
        let raw = row.try_get_raw(i).map_err(engine)?;
        let value = if raw.is_null() {
            SqlValue::Null
        } else {
            let type_name = raw.type_info().name().to_string();
            match type_name.as_str() {
                "INTEGER" => SqlValue::Integer(row.try_get_unchecked(i).map_err(engine)?),
                "REAL" => SqlValue::Real(row.try_get_unchecked(i).map_err(engine)?),
                "BLOB" => SqlValue::Blob(row.try_get_unchecked(i).map_err(engine)?),
                _ => SqlValue::Text(row.try_get_unchecked(i).map_err(engine)?),
            }
        };
        out.push(column.name(), value);
    }
    Ok(out)
}

#[async_trait]
impl Backend for SqlxBackend {
    fn name(&self) -> &'static str {
        "sqlx"
    }

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<()> {
        debug!(sql, "execute");
        let mut guard = self.inner.conn.lock().await;
        let conn = guard.as_mut().ok_or(BackendError::Closed)?;
        let query = if params.is_empty() {
            sqlx::query(sql).persistent(false)
        } else {
            bind_all(sql, params)
        };
        query.execute(&mut *conn).await.map_err(engine)?;
        Ok(())
    }

    async fn prepare(&self, sql: &str) -> Result<Box<dyn Statement>> {
        {
            let mut guard = self.inner.conn.lock().await;
            let conn = guard.as_mut().ok_or(BackendError::Closed)?;
            conn.prepare(sql).await.map_err(engine)?;
        }
        Ok(Box::new(SqlxStatement {
            inner: Arc::clone(&self.inner),
            sql: sql.to_string(),
        }))
    }

    async fn close(&self) -> Result<()> {
        let conn = self.inner.conn.lock().await.take();
        if let Some(conn) = conn {
            conn.close().await.map_err(engine)?;
            info!("Closed SQLite database via sqlx");
        }
        Ok(())
    }
}

struct SqlxStatement {
    inner: Arc<Inner>,
    sql: String,
}

#[async_trait]
impl Statement for SqlxStatement {
    fn sql(&self) -> &str {
        &self.sql
    }

    async fn get_one(&self, params: &[SqlValue]) -> Result<Option<Row>> {
        let mut guard = self.inner.conn.lock().await;
        let conn = guard.as_mut().ok_or(BackendError::Closed)?;
        let row = bind_all(&self.sql, params)
            .fetch_optional(&mut *conn)
            .await
            .map_err(engine)?;
        row.as_ref().map(convert_row).transpose()
    }

    async fn get_all(&self, params: &[SqlValue]) -> Result<Vec<Row>> {
        let mut guard = self.inner.conn.lock().await;
        let conn = guard.as_mut().ok_or(BackendError::Closed)?;
        let rows = bind_all(&self.sql, params)
            .fetch_all(&mut *conn)
            .await
            .map_err(engine)?;
        rows.iter().map(convert_row).collect()
    }

    async fn mutate(&self, params: &[SqlValue]) -> Result<u64> {
        let mut guard = self.inner.conn.lock().await;
        let conn = guard.as_mut().ok_or(BackendError::Closed)?;
        let done = bind_all(&self.sql, params)
            .execute(&mut *conn)
            .await
            .map_err(engine)?;
        Ok(done.rows_affected())
    }
}

//! Storage backend abstraction
//!
//! The operation layer and transaction manager talk to the relational engine
//! only through [`Backend`] and [`Statement`]. Every call is async so that
//! synchronous and asynchronous drivers present the same surface.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use tuplekv_common::config::{BackendKind, StorageConfig};
use tuplekv_common::error::BackendError;
use tuplekv_common::Result;

pub mod sqlite;
#[cfg(feature = "sqlx")]
pub mod sqlx;

pub use self::sqlite::SqliteBackend;
#[cfg(feature = "sqlx")]
pub use self::sqlx::SqlxBackend;

/// Relational engine connection
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short driver name for logs
    fn name(&self) -> &'static str;

    /// Run a statement that returns no rows
    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<()>;

    /// Prepare a reusable statement
    async fn prepare(&self, sql: &str) -> Result<Box<dyn Statement>>;

    /// Close the connection. Later calls fail with `BackendError::Closed`.
    async fn close(&self) -> Result<()>;
}

/// A prepared statement bound to its backend
#[async_trait]
pub trait Statement: Send + Sync {
    fn sql(&self) -> &str;

    /// First row, if any
    async fn get_one(&self, params: &[SqlValue]) -> Result<Option<Row>>;

    /// All rows in engine order
    async fn get_all(&self, params: &[SqlValue]) -> Result<Vec<Row>>;

    /// Run a data-modifying statement, returning the rows affected
    async fn mutate(&self, params: &[SqlValue]) -> Result<u64>;
}

/// Open the backend named by the configuration
pub async fn open(config: &StorageConfig) -> Result<Arc<dyn Backend>> {
    match config.backend {
        BackendKind::Sqlite => Ok(Arc::new(SqliteBackend::open_with(config)?)),
        #[cfg(feature = "sqlx")]
        BackendKind::Sqlx => Ok(Arc::new(SqlxBackend::connect_with(config).await?)),
        #[cfg(not(feature = "sqlx"))]
        BackendKind::Sqlx => Err(tuplekv_common::Error::Config(
            "sqlx backend not compiled in; enable the `sqlx` feature".to_string(),
        )),
    }
}

/// Parameter and column value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl SqlValue {
    /// Try to get as string
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get as i64
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Integer(n) => Some(*n),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    fn type_name(&self) -> &'static str {
        match self {
            SqlValue::Null => "NULL",
            SqlValue::Integer(_) => "INTEGER",
            SqlValue::Real(_) => "REAL",
            SqlValue::Text(_) => "TEXT",
            SqlValue::Blob(_) => "BLOB",
        }
    }
}

impl From<String> for SqlValue {
    fn from(s: String) -> Self {
        SqlValue::Text(s)
    }
}

impl From<&str> for SqlValue {
    fn from(s: &str) -> Self {
        SqlValue::Text(s.to_string())
    }
}

impl From<i64> for SqlValue {
    fn from(n: i64) -> Self {
        SqlValue::Integer(n)
    }
}

impl From<f64> for SqlValue {
    fn from(n: f64) -> Self {
        SqlValue::Real(n)
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(b: Vec<u8>) -> Self {
        SqlValue::Blob(b)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(SqlValue::Null, Into::into)
    }
}

/// A result row with named columns
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Row {
    /// Columns in select order
    pub columns: Vec<Column>,
}

/// A named column with a value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub value: SqlValue,
}

impl Row {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            columns: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, name: impl Into<String>, value: SqlValue) {
        self.columns.push(Column {
            name: name.into(),
            value,
        });
    }

    /// Get a column value by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .map(|c| &c.value)
    }

    /// Text column by name, failing on a missing column or another type
    pub fn text(&self, name: &str) -> Result<&str> {
        let value = self
            .get(name)
            .ok_or_else(|| BackendError::engine(RowError::MissingColumn(name.to_string())))?;
        value.as_str().ok_or_else(|| {
            BackendError::engine(RowError::TypeMismatch {
                column: name.to_string(),
                expected: "TEXT",
                found: value.type_name(),
            })
            .into()
        })
    }
}

impl FromIterator<(String, SqlValue)> for Row {
    fn from_iter<I: IntoIterator<Item = (String, SqlValue)>>(iter: I) -> Self {
        Self {
            columns: iter
                .into_iter()
                .map(|(name, value)| Column { name, value })
                .collect(),
        }
    }
}

/// Row shape errors, reported as engine errors
#[derive(Debug, thiserror::Error)]
pub enum RowError {
    #[error("column not found: {0}")]
    MissingColumn(String),

    #[error("column {column} has type {found}, expected {expected}")]
    TypeMismatch {
        column: String,
        expected: &'static str,
        found: &'static str,
    },
}

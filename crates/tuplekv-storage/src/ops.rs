//! Operation layer
//!
//! Translates key-value operations into SQL over a [`Backend`]. Key and value
//! encoding happens before any statement is issued, so malformed input never
//! reaches the engine.

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};
use futures::{Future, Stream, StreamExt, TryStreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::debug;

use tuplekv_common::metrics::{self, LatencyTimer};
use tuplekv_common::{Error, Result};

use crate::backend::{Backend, Row, SqlValue};
use crate::codec::{Key, KeyCodec};
use crate::types::{Entry, EntryMaybe, ListOptions, Selector};

/// Bound parameters per `IN (...)` query; the lowest limit SQLite ships with
const MAX_BATCH_PARAMS: usize = 999;

/// Key-value operations against one table
pub struct Ops {
    backend: Arc<dyn Backend>,
    codec: KeyCodec,
    table: String,
    get_sql: String,
    set_sql: String,
    delete_sql: String,
}

/// A list scan with its bounds encoded, ready to run
#[derive(Debug, Clone, PartialEq)]
pub struct ListQuery {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl Ops {
    pub fn new(backend: Arc<dyn Backend>, codec: KeyCodec, table: &str) -> Self {
        Self {
            backend,
            codec,
            table: table.to_string(),
            get_sql: format!("SELECT key, value FROM {table} WHERE key = ?"),
            set_sql: format!(
                "INSERT INTO {table} (key, value) VALUES (?, ?) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value"
            ),
            delete_sql: format!("DELETE FROM {table} WHERE key = ?"),
        }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn codec(&self) -> KeyCodec {
        self.codec
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Exact-match read; absence is not an error
    pub async fn get<T: DeserializeOwned>(&self, key: &Key) -> Result<EntryMaybe<T>> {
        let raw_key = self.codec.serialize(key)?;
        let stmt = self.backend.prepare(&self.get_sql).await?;
        let value = match stmt.get_one(&[SqlValue::Text(raw_key)]).await? {
            Some(row) => decode_optional(key, row.text("value")?)?,
            None => None,
        };
        Ok(EntryMaybe {
            key: key.clone(),
            value,
        })
    }

    /// Batched read, returned in caller order with misses as `None`
    pub async fn get_many<T: DeserializeOwned>(&self, keys: &[Key]) -> Result<Vec<EntryMaybe<T>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let raw_keys = keys
            .iter()
            .map(|k| self.codec.serialize(k))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut unique: Vec<&str> = Vec::with_capacity(raw_keys.len());
        let mut seen = std::collections::HashSet::with_capacity(raw_keys.len());
        for raw in &raw_keys {
            if seen.insert(raw.as_str()) {
                unique.push(raw);
            }
        }

        let mut found: HashMap<String, String> = HashMap::with_capacity(unique.len());
        for chunk in unique.chunks(MAX_BATCH_PARAMS) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT key, value FROM {} WHERE key IN ({placeholders})",
                self.table
            );
            let params: Vec<SqlValue> = chunk.iter().map(|k| SqlValue::from(*k)).collect();
            let rows = self.backend.prepare(&sql).await?.get_all(&params).await?;
            metrics::record_rows_scanned(rows.len() as u64);
            for row in rows {
                found.insert(row.text("key")?.to_string(), row.text("value")?.to_string());
            }
        }
        debug!(requested = keys.len(), found = found.len(), "get_many");

        keys.iter()
            .zip(&raw_keys)
            .map(|(key, raw)| {
                let value = match found.get(raw) {
                    Some(text) => decode_optional(key, text)?,
                    None => None,
                };
                Ok(EntryMaybe {
                    key: key.clone(),
                    value,
                })
            })
            .collect()
    }

    /// Insert or replace
    pub async fn set<T: Serialize + ?Sized>(&self, key: &Key, value: &T) -> Result<()> {
        let raw_key = self.codec.serialize(key)?;
        let text = serde_json::to_string(value).map_err(|source| Error::ValueEncoding {
            key: key.to_string(),
            source,
        })?;
        let stmt = self.backend.prepare(&self.set_sql).await?;
        stmt.mutate(&[SqlValue::Text(raw_key), SqlValue::Text(text)])
            .await?;
        Ok(())
    }

    /// Remove a key; a missing key is a no-op
    pub async fn delete(&self, key: &Key) -> Result<()> {
        let raw_key = self.codec.serialize(key)?;
        let stmt = self.backend.prepare(&self.delete_sql).await?;
        let removed = stmt.mutate(&[SqlValue::Text(raw_key)]).await?;
        debug!(removed, "delete");
        Ok(())
    }

    /// Validate the selector and encode the scan. Performs no I/O.
    pub fn list_query(&self, selector: &Selector, options: ListOptions) -> Result<ListQuery> {
        let order = if options.reverse { "DESC" } else { "ASC" };
        let (mut sql, mut params) = match selector {
            Selector::Prefix(prefix) => {
                if prefix.is_empty() {
                    return Err(Error::InvalidSelector(
                        "prefix must have at least one segment".to_string(),
                    ));
                }
                let pattern = self.codec.prefix_pattern(prefix)?;
                let (lower, upper) = self.codec.prefix_bounds(prefix)?;
                (
                    format!(
                        "SELECT key, value FROM {} WHERE key LIKE ? ESCAPE '\\' \
                         AND key >= ? AND key < ? ORDER BY key {order}",
                        self.table
                    ),
                    vec![
                        SqlValue::from(pattern),
                        SqlValue::from(lower),
                        SqlValue::from(upper),
                    ],
                )
            }
            Selector::Range { start, end } => {
                let (lower, upper) = self.codec.range_bounds(start, end)?;
                (
                    format!(
                        "SELECT key, value FROM {} WHERE key >= ? AND key < ? ORDER BY key {order}",
                        self.table
                    ),
                    vec![SqlValue::from(lower), SqlValue::from(upper)],
                )
            }
        };

        if let Some(limit) = options.limit {
            sql.push_str(" LIMIT ?");
            params.push(SqlValue::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
        }

        Ok(ListQuery { sql, params })
    }

    /// Run an encoded scan
    pub async fn fetch(&self, query: &ListQuery) -> Result<Vec<Row>> {
        let stmt = self.backend.prepare(&query.sql).await?;
        stmt.get_all(&query.params).await
    }
}

fn decode_optional<T: DeserializeOwned>(key: &Key, text: &str) -> Result<Option<T>> {
    serde_json::from_str::<Option<T>>(text).map_err(|source| Error::ValueDecoding {
        key: key.to_string(),
        source,
    })
}

fn decode_entry<T: DeserializeOwned>(codec: KeyCodec, row: &Row) -> Result<Entry<T>> {
    let key = codec.deserialize(row.text("key")?);
    let value = serde_json::from_str(row.text("value")?).map_err(|source| Error::ValueDecoding {
        key: key.to_string(),
        source,
    })?;
    Ok(Entry { key, value })
}

/// Time an operation and count its outcome
pub(crate) async fn observe<T, F>(op: &'static str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let _timer = LatencyTimer::new(op);
    let result = fut.await;
    metrics::record_operation(op, result.is_ok());
    result
}

/// Lazily evaluated scan results.
///
/// The query runs on first poll. A stream is consumed once; call `list`
/// again to rescan.
pub struct ListStream<T> {
    inner: BoxStream<'static, Result<Entry<T>>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ListStream<T>
where
    T: DeserializeOwned + Send + 'static,
{
    pub(crate) fn new(fetch: BoxFuture<'static, Result<Vec<Row>>>, codec: KeyCodec) -> Self {
        let inner = stream::once(observe("list", fetch))
            .map_ok(move |rows| {
                metrics::record_rows_scanned(rows.len() as u64);
                stream::iter(rows.into_iter().map(move |row| decode_entry(codec, &row)))
            })
            .try_flatten()
            .boxed();
        Self {
            inner,
            _marker: PhantomData,
        }
    }

    /// Drain the stream into a vector
    pub async fn collect_entries(self) -> Result<Vec<Entry<T>>> {
        self.try_collect().await
    }
}

impl<T> Stream for ListStream<T> {
    type Item = Result<Entry<T>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl<T> std::fmt::Debug for ListStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListStream").finish_non_exhaustive()
    }
}

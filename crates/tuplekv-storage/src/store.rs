//! Store façade
//!
//! [`KvStore`] owns one backend connection and serializes plain operations
//! against open transactions through a store-level gate.

use futures::Future;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, info, instrument, warn};

use tuplekv_common::config::{StorageConfig, TransactionMode};
use tuplekv_common::error::TransactionError;
use tuplekv_common::metrics;
use tuplekv_common::{Error, Result};

use crate::backend::{self, Backend};
use crate::codec::{Key, KeyCodec};
use crate::ops::{observe, ListStream, Ops};
use crate::schema::ensure_schema;
use crate::txn::{self, Transaction};
use crate::types::{EntryMaybe, ListOptions, Selector};

tokio::task_local! {
    /// Stores with a transaction body running on the current task
    pub(crate) static ACTIVE_STORES: Vec<u64>;
}

static NEXT_STORE_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) struct Shared {
    pub(crate) id: u64,
    pub(crate) ops: Ops,
    pub(crate) gate: Arc<RwLock<()>>,
    pub(crate) open_frames: AtomicUsize,
    pub(crate) pending_rollback: AtomicBool,
    pub(crate) mode: TransactionMode,
}

impl Shared {
    /// Roll back a transaction whose frame was dropped mid-flight.
    /// Callers hold the gate exclusively.
    pub(crate) async fn recover(&self) {
        if self.pending_rollback.swap(false, Ordering::AcqRel) {
            warn!(store = self.id, "Rolling back abandoned transaction");
            if let Err(err) = self.ops.backend().execute("ROLLBACK", &[]).await {
                debug!(error = %err, "Nothing to roll back");
            }
        }
    }
}

/// Handle to an ordered, transactional key-value store.
///
/// Cloning is cheap and every clone shares the same connection.
#[derive(Clone)]
pub struct KvStore {
    shared: Arc<Shared>,
}

impl KvStore {
    /// Open the configured backend and make sure the table exists
    pub async fn open(config: &StorageConfig) -> Result<Self> {
        config.validate()?;
        let backend = backend::open(config).await?;
        Self::with_backend(backend, config).await
    }

    /// Private in-memory store with default settings
    pub async fn in_memory() -> Result<Self> {
        Self::open(&StorageConfig::in_memory()).await
    }

    /// Build a store over an existing backend
    pub async fn with_backend(backend: Arc<dyn Backend>, config: &StorageConfig) -> Result<Self> {
        config.validate()?;
        ensure_schema(backend.as_ref(), &config.table).await?;

        let id = NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed);
        info!(
            store = id,
            backend = backend.name(),
            table = %config.table,
            "Store ready"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                id,
                ops: Ops::new(backend, KeyCodec::new(config.allow_root_key), &config.table),
                gate: Arc::new(RwLock::new(())),
                open_frames: AtomicUsize::new(0),
                pending_rollback: AtomicBool::new(false),
                mode: config.transaction_mode,
            }),
        })
    }

    /// Name of the underlying driver
    #[must_use]
    pub fn backend_name(&self) -> &'static str {
        self.shared.ops.backend().name()
    }

    #[must_use]
    pub fn codec(&self) -> KeyCodec {
        self.shared.ops.codec()
    }

    fn check_not_in_own_txn(&self) -> Result<()> {
        let inside = ACTIVE_STORES
            .try_with(|ids| ids.contains(&self.shared.id))
            .unwrap_or(false);
        if inside {
            return Err(TransactionError::StoreHandleInTransaction.into());
        }
        Ok(())
    }

    async fn acquire_shared(&self) -> Result<OwnedRwLockReadGuard<()>> {
        self.check_not_in_own_txn()?;
        let guard = Arc::clone(&self.shared.gate).read_owned().await;
        if !self.shared.pending_rollback.load(Ordering::Acquire) {
            return Ok(guard);
        }
        drop(guard);

        let exclusive = Arc::clone(&self.shared.gate).write_owned().await;
        self.shared.recover().await;
        Ok(OwnedRwLockWriteGuard::downgrade(exclusive))
    }

    /// Read one key. A missing key yields `value: None`.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn get<T: DeserializeOwned>(&self, key: &Key) -> Result<EntryMaybe<T>> {
        observe("get", async {
            let _gate = self.acquire_shared().await?;
            self.shared.ops.get(key).await
        })
        .await
    }

    /// Read many keys in one query, preserving input order
    #[instrument(skip_all, fields(count = keys.len()))]
    pub async fn get_many<T: DeserializeOwned>(&self, keys: &[Key]) -> Result<Vec<EntryMaybe<T>>> {
        observe("get_many", async {
            let _gate = self.acquire_shared().await?;
            self.shared.ops.get_many(keys).await
        })
        .await
    }

    /// Insert or replace a value
    #[instrument(skip_all, fields(key = %key))]
    pub async fn set<T: Serialize + ?Sized>(&self, key: &Key, value: &T) -> Result<()> {
        observe("set", async {
            let _gate = self.acquire_shared().await?;
            self.shared.ops.set(key, value).await
        })
        .await
    }

    /// Remove a key; removing a missing key succeeds
    #[instrument(skip_all, fields(key = %key))]
    pub async fn delete(&self, key: &Key) -> Result<()> {
        observe("delete", async {
            let _gate = self.acquire_shared().await?;
            self.shared.ops.delete(key).await
        })
        .await
    }

    /// Scan by prefix or range.
    ///
    /// The selector is validated and encoded before this returns; rows are
    /// read when the stream is first polled.
    pub fn list<T>(&self, selector: Selector, options: ListOptions) -> Result<ListStream<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let query = self
            .check_not_in_own_txn()
            .and_then(|()| self.shared.ops.list_query(&selector, options))
            .map_err(|err| {
                metrics::record_operation("list", false);
                err
            })?;
        debug!(sql = %query.sql, "list");

        let store = self.clone();
        let fetch = async move {
            let _gate = store.acquire_shared().await?;
            store.shared.ops.fetch(&query).await
        };
        Ok(ListStream::new(Box::pin(fetch), self.codec()))
    }

    /// Run `f` inside a transaction.
    ///
    /// Commits when `f` returns `Ok`; rolls back and returns the error
    /// unchanged when it returns `Err`. Plain operations on this store wait
    /// until the transaction finishes; inside `f`, use the [`Transaction`]
    /// handle.
    pub async fn transaction<F, Fut, T, E>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(Transaction) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<Error>,
    {
        self.check_not_in_own_txn()?;
        txn::run_top(Arc::clone(&self.shared), f).await
    }

    /// Close the connection. Fails while a transaction is open.
    pub async fn close(&self) -> Result<()> {
        if self.shared.open_frames.load(Ordering::Acquire) > 0 {
            return Err(TransactionError::CloseInTransaction.into());
        }
        let _gate = Arc::clone(&self.shared.gate).write_owned().await;
        self.shared.recover().await;
        self.shared.ops.backend().close().await?;
        info!(store = self.shared.id, "Store closed");
        Ok(())
    }
}

impl std::fmt::Debug for KvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvStore")
            .field("id", &self.shared.id)
            .field("backend", &self.backend_name())
            .field("table", &self.shared.ops.table())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{SqlValue, Statement};
    use crate::key;
    use async_trait::async_trait;
    use futures::{FutureExt, StreamExt};
    use serde_json::{json, Value};
    use tuplekv_common::error::{BackendError, KeyError};

    async fn store() -> KvStore {
        KvStore::in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let store = store().await;
        let value = json!({"name": "Alice", "tags": ["a", "b"], "age": 30});
        store.set(&key!["users", "alice"], &value).await.unwrap();

        let entry: EntryMaybe<Value> = store.get(&key!["users", "alice"]).await.unwrap();
        assert_eq!(entry.key, key!["users", "alice"]);
        assert_eq!(entry.value, Some(value));
    }

    #[tokio::test]
    async fn test_missing_key() {
        let store = store().await;
        let entry: EntryMaybe<Value> = store.get(&key!["no", "such", "key"]).await.unwrap();
        assert!(!entry.is_present());
        store.delete(&key!["no", "such", "key"]).await.unwrap();
    }

    #[tokio::test]
    async fn test_get_many_preserves_order() {
        let store = store().await;
        store.set(&key!["a"], &1).await.unwrap();
        store.set(&key!["b"], &2).await.unwrap();
        store.set(&key!["c"], &3).await.unwrap();

        let entries: Vec<EntryMaybe<i64>> = store
            .get_many(&[key!["c"], key!["a"], key!["b"]])
            .await
            .unwrap();
        let values: Vec<_> = entries.iter().map(|e| e.value).collect();
        assert_eq!(values, vec![Some(3), Some(1), Some(2)]);
        assert_eq!(entries[0].key, key!["c"]);

        let none: Vec<EntryMaybe<i64>> = store.get_many(&[]).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_separator_rejected() {
        let store = store().await;
        let err = store.set(&key!["bad\u{1f}key"], &1).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Key(KeyError::ContainsSeparator { .. })
        ));
    }

    #[tokio::test]
    async fn test_transaction_rollback_on_error() {
        let store = store().await;
        store.set(&key!["counter"], &0).await.unwrap();

        let result: Result<()> = store
            .transaction(|tx| async move {
                tx.set(&key!["counter"], &10).await?;
                Err(Error::Config("boom".to_string()))
            })
            .await;
        assert!(matches!(result, Err(Error::Config(ref m)) if m == "boom"));

        let entry: EntryMaybe<i64> = store.get(&key!["counter"]).await.unwrap();
        assert_eq!(entry.value, Some(0));
    }

    #[tokio::test]
    async fn test_nested_transaction_commit() {
        let store = store().await;
        store.set(&key!["counter"], &0).await.unwrap();

        let seen = store
            .transaction(|tx| async move {
                tx.set(&key!["counter"], &10).await?;
                tx.transaction(|inner| async move {
                    assert_eq!(inner.depth(), 1);
                    inner.set(&key!["counter"], &20).await
                })
                .await?;
                let entry: EntryMaybe<i64> = tx.get(&key!["counter"]).await?;
                Ok::<_, Error>(entry.value)
            })
            .await
            .unwrap();
        assert_eq!(seen, Some(20));

        let entry: EntryMaybe<i64> = store.get(&key!["counter"]).await.unwrap();
        assert_eq!(entry.value, Some(20));
    }

    #[tokio::test]
    async fn test_caught_nested_failure_keeps_outer() {
        let store = store().await;
        store.set(&key!["counter"], &0).await.unwrap();

        store
            .transaction(|tx| async move {
                tx.set(&key!["counter"], &10).await?;
                let inner: Result<()> = tx
                    .transaction(|inner| async move {
                        inner.set(&key!["counter"], &20).await?;
                        Err(Error::Config("inner".to_string()))
                    })
                    .await;
                assert!(inner.is_err());
                Ok::<_, Error>(())
            })
            .await
            .unwrap();

        let entry: EntryMaybe<i64> = store.get(&key!["counter"]).await.unwrap();
        assert_eq!(entry.value, Some(10));
    }

    #[tokio::test]
    async fn test_uncaught_nested_failure_rolls_back_all() {
        let store = store().await;
        store.set(&key!["counter"], &0).await.unwrap();

        let result: Result<()> = store
            .transaction(|tx| async move {
                tx.set(&key!["counter"], &10).await?;
                tx.transaction(|inner| async move {
                    inner.set(&key!["counter"], &20).await?;
                    Err(Error::Config("inner".to_string()))
                })
                .await
            })
            .await;
        assert!(result.is_err());

        let entry: EntryMaybe<i64> = store.get(&key!["counter"]).await.unwrap();
        assert_eq!(entry.value, Some(0));
    }

    #[tokio::test]
    async fn test_close_inside_transaction() {
        let store = store().await;
        let outer = store.clone();
        let result: Result<()> = store
            .transaction(|tx| async move {
                assert!(matches!(
                    tx.close().await,
                    Err(Error::Transaction(TransactionError::CloseInTransaction))
                ));
                outer.close().await
            })
            .await;
        assert!(matches!(
            result,
            Err(Error::Transaction(TransactionError::CloseInTransaction))
        ));

        // Still usable afterwards
        store.set(&key!["k"], &1).await.unwrap();
        store.close().await.unwrap();
        assert!(matches!(
            store.get::<i64>(&key!["k"]).await,
            Err(Error::Backend(BackendError::Closed))
        ));
    }

    #[tokio::test]
    async fn test_store_handle_inside_own_transaction_fails_fast() {
        let store = store().await;
        let outer = store.clone();
        let result: Result<()> = store
            .transaction(|_tx| async move { outer.set(&key!["k"], &1).await })
            .await;
        assert!(matches!(
            result,
            Err(Error::Transaction(TransactionError::StoreHandleInTransaction))
        ));
    }

    #[tokio::test]
    async fn test_finished_handle_is_rejected() {
        let store = store().await;
        let leaked = store
            .transaction(|tx| async move { Ok::<_, Error>(tx) })
            .await
            .unwrap();
        assert!(!leaked.is_active());
        assert!(matches!(
            leaked.set(&key!["k"], &1).await,
            Err(Error::Transaction(TransactionError::Finished))
        ));
    }

    #[tokio::test]
    async fn test_panic_rolls_back() {
        let store = store().await;
        store.set(&key!["counter"], &0).await.unwrap();

        let panicked = std::panic::AssertUnwindSafe(store.transaction(|tx| async move {
            tx.set(&key!["counter"], &99).await?;
            if tx.depth() == 0 {
                panic!("body panicked");
            }
            Ok::<_, Error>(())
        }))
        .catch_unwind()
        .await;
        assert!(panicked.is_err());

        let entry: EntryMaybe<i64> = store.get(&key!["counter"]).await.unwrap();
        assert_eq!(entry.value, Some(0));
    }

    #[tokio::test]
    async fn test_dropped_transaction_is_rolled_back() {
        let store = store().await;
        store.set(&key!["counter"], &0).await.unwrap();

        let (tx_ready, rx_ready) = tokio::sync::oneshot::channel::<()>();
        let stalled = store.transaction(|tx| async move {
            tx.set(&key!["counter"], &5).await?;
            let _ = tx_ready.send(());
            futures::future::pending::<()>().await;
            Ok::<_, Error>(())
        });
        tokio::select! {
            _ = stalled => unreachable!("body never completes"),
            _ = rx_ready => {}
        }

        let entry: EntryMaybe<i64> = store.get(&key!["counter"]).await.unwrap();
        assert_eq!(entry.value, Some(0));

        store
            .transaction(|tx| async move { tx.set(&key!["counter"], &7).await })
            .await
            .unwrap();
        let entry: EntryMaybe<i64> = store.get(&key!["counter"]).await.unwrap();
        assert_eq!(entry.value, Some(7));
    }

    #[tokio::test]
    async fn test_failed_frame_discards_its_dropped_child() {
        let store = store().await;

        store
            .transaction(|tx| async move {
                tx.set(&key!["outer"], &1).await?;
                let failed: Result<()> = tx
                    .transaction(|mid| async move {
                        mid.set(&key!["mid"], &1).await?;
                        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel::<()>();
                        let child = mid.transaction(|c| async move {
                            c.set(&key!["child"], &1).await?;
                            let _ = ready_tx.send(());
                            futures::future::pending::<()>().await;
                            Ok::<_, Error>(())
                        });
                        tokio::select! {
                            _ = child => unreachable!("body never completes"),
                            _ = ready_rx => {}
                        }
                        Err(Error::Config("mid fails".to_string()))
                    })
                    .await;
                assert!(failed.is_err());

                tx.set(&key!["after"], &1).await
            })
            .await
            .unwrap();

        let entries: Vec<EntryMaybe<i64>> = store
            .get_many(&[key!["outer"], key!["mid"], key!["child"], key!["after"]])
            .await
            .unwrap();
        let present: Vec<bool> = entries.iter().map(EntryMaybe::is_present).collect();
        assert_eq!(present, vec![true, false, false, true]);
    }

    #[tokio::test]
    async fn test_unserializable_value_is_rejected() {
        let store = store().await;
        let mut value = std::collections::BTreeMap::new();
        value.insert((1, 2), 3);

        let err = store.set(&key!["bad", "val"], &value).await.unwrap_err();
        match err {
            Error::ValueEncoding { key, .. } => assert_eq!(key, r#"["bad", "val"]"#),
            other => panic!("unexpected error: {other:?}"),
        }

        let entry: EntryMaybe<Value> = store.get(&key!["bad", "val"]).await.unwrap();
        assert!(!entry.is_present());
    }

    #[tokio::test]
    async fn test_list_prefix_and_range() {
        let store = store().await;
        for name in ["alice", "bob", "charlie"] {
            store.set(&key!["users", name], &name).await.unwrap();
        }
        store.set(&key!["usersx", "zed"], &"zed").await.unwrap();
        store.set(&key!["users"], &"self").await.unwrap();

        let names: Vec<String> = store
            .list::<String>(Selector::prefix(key!["users"]), ListOptions::default())
            .unwrap()
            .collect_entries()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.value)
            .collect();
        assert_eq!(names, vec!["alice", "bob", "charlie"]);

        let reversed: Vec<String> = store
            .list::<String>(
                Selector::prefix(key!["users"]),
                ListOptions::default().reverse().limit(2),
            )
            .unwrap()
            .map(|e| e.unwrap().value)
            .collect()
            .await;
        assert_eq!(reversed, vec!["charlie", "bob"]);

        let range = store
            .list::<String>(
                Selector::range(key!["users", "alice"], key!["users", "charlie"]),
                ListOptions::default(),
            )
            .unwrap()
            .collect_entries()
            .await
            .unwrap();
        let keys: Vec<Key> = range.into_iter().map(|e| e.key).collect();
        assert_eq!(keys, vec![key!["users", "alice"], key!["users", "bob"]]);

        let empty = store
            .list::<String>(Selector::prefix(key!["users"]), ListOptions::default().limit(0))
            .unwrap()
            .collect_entries()
            .await
            .unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_list_inside_transaction_sees_writes() {
        let store = store().await;
        let count = store
            .transaction(|tx| async move {
                tx.set(&key!["docs", "u1", "a"], &1).await?;
                tx.set(&key!["docs", "u1", "b"], &2).await?;
                let entries = tx
                    .list::<i64>(Selector::prefix(key!["docs", "u1"]), ListOptions::default())?
                    .collect_entries()
                    .await?;
                Ok::<_, Error>(entries.len())
            })
            .await
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_root_key() {
        let config = StorageConfig {
            allow_root_key: true,
            ..StorageConfig::in_memory()
        };
        let root_store = KvStore::open(&config).await.unwrap();
        root_store.set(&Key::root(), &json!({"version": 1})).await.unwrap();
        let entry: EntryMaybe<Value> = root_store.get(&Key::root()).await.unwrap();
        assert_eq!(entry.value, Some(json!({"version": 1})));
        assert!(root_store.set(&key![""], &1).await.is_err());

        let default = store().await;
        assert!(matches!(
            default.set(&Key::root(), &1).await,
            Err(Error::Key(KeyError::Empty))
        ));
    }

    /// Backend that refuses transactional statements
    struct NoTxnBackend {
        inner: crate::backend::SqliteBackend,
    }

    #[async_trait]
    impl Backend for NoTxnBackend {
        fn name(&self) -> &'static str {
            "no-txn"
        }

        async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<()> {
            if sql.starts_with("BEGIN") || sql.starts_with("SAVEPOINT") {
                let err = std::io::Error::new(std::io::ErrorKind::Unsupported, "no transactions");
                return Err(BackendError::engine(err).into());
            }
            self.inner.execute(sql, params).await
        }

        async fn prepare(&self, sql: &str) -> Result<Box<dyn Statement>> {
            self.inner.prepare(sql).await
        }

        async fn close(&self) -> Result<()> {
            self.inner.close().await
        }
    }

    async fn no_txn_store(mode: TransactionMode) -> KvStore {
        let backend = Arc::new(NoTxnBackend {
            inner: crate::backend::SqliteBackend::open_in_memory().unwrap(),
        });
        let config = StorageConfig {
            transaction_mode: mode,
            ..StorageConfig::in_memory()
        };
        KvStore::with_backend(backend, &config).await.unwrap()
    }

    #[tokio::test]
    async fn test_strict_mode_propagates_begin_failure() {
        let store = no_txn_store(TransactionMode::Strict).await;
        let result: Result<()> = store
            .transaction(|tx| async move { tx.set(&key!["k"], &1).await })
            .await;
        assert!(result.unwrap_err().is_backend());

        let entry: EntryMaybe<i64> = store.get(&key!["k"]).await.unwrap();
        assert!(!entry.is_present());
    }

    #[tokio::test]
    async fn test_best_effort_mode_runs_unprotected() {
        let store = no_txn_store(TransactionMode::BestEffort).await;
        store
            .transaction(|tx| async move {
                assert!(tx.is_degraded());
                tx.set(&key!["k"], &1).await?;
                tx.transaction(|inner| async move { inner.set(&key!["j"], &2).await })
                    .await
            })
            .await
            .unwrap();

        let entries: Vec<EntryMaybe<i64>> =
            store.get_many(&[key!["k"], key!["j"]]).await.unwrap();
        assert!(entries.iter().all(EntryMaybe::is_present));
    }
}

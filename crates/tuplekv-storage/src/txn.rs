//! Transaction manager
//!
//! Top-level frames map to `BEGIN`/`COMMIT`/`ROLLBACK` and hold the store's
//! gate exclusively. Nested frames map to `SAVEPOINT`/`RELEASE`/`ROLLBACK TO`
//! on the already open transaction.
//!
//! A frame whose future is dropped before it finishes cannot issue SQL from
//! `Drop`. It leaves a marker instead: an abandoned top-level frame flags the
//! store so the next user of the connection rolls back first, an abandoned
//! savepoint is rolled back before the enclosing frame issues its next
//! statement.

use futures::{Future, FutureExt};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::panic::{resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::OwnedRwLockWriteGuard;
use tracing::{debug, warn};

use tuplekv_common::config::TransactionMode;
use tuplekv_common::error::TransactionError;
use tuplekv_common::metrics::{record_transaction, TxnOutcome};
use tuplekv_common::{Error, Result};

use crate::backend::Backend;
use crate::codec::Key;
use crate::ops::{observe, ListStream};
use crate::store::{Shared, ACTIVE_STORES};
use crate::types::{EntryMaybe, ListOptions, Selector};

/// Issues process-unique savepoint names
struct SavepointOracle {
    counter: AtomicU64,
}

impl SavepointOracle {
    const fn new() -> Self {
        Self {
            counter: AtomicU64::new(1),
        }
    }

    fn next(&self) -> Savepoint {
        let seq = self.counter.fetch_add(1, Ordering::SeqCst);
        Savepoint {
            seq,
            name: format!("sp_{seq}"),
        }
    }
}

static SAVEPOINTS: SavepointOracle = SavepointOracle::new();

#[derive(Debug, Clone)]
struct Savepoint {
    seq: u64,
    name: String,
}

/// Frame state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnState {
    Active,
    Committed,
    RolledBack,
}

struct Frame {
    state: RwLock<TxnState>,
    depth: usize,
}

impl Frame {
    fn finish(&self, state: TxnState) {
        *self.state.write() = state;
    }
}

/// State shared by every frame of one top-level transaction
pub(crate) struct TxnContext {
    shared: Arc<Shared>,
    /// BEGIN was refused and the body runs unprotected
    degraded: bool,
    /// Savepoints whose frames were dropped mid-flight
    abandoned: Mutex<Vec<Savepoint>>,
}

impl TxnContext {
    fn backend(&self) -> &Arc<dyn Backend> {
        self.shared.ops.backend()
    }

    /// Roll back savepoints abandoned by dropped nested frames.
    ///
    /// Every statement goes through here first, so pending savepoints always
    /// nest inside the oldest one; rolling that one back and releasing it
    /// discards the rest.
    async fn settle(&self) -> Result<()> {
        let oldest = {
            let mut pending = self.abandoned.lock();
            let oldest = pending.iter().min_by_key(|sp| sp.seq).cloned();
            pending.clear();
            oldest
        };
        if let Some(sp) = oldest {
            warn!(savepoint = %sp.name, "Rolling back abandoned savepoint");
            rollback_savepoint(self.backend().as_ref(), &sp.name).await?;
        }
        Ok(())
    }

    /// Roll back `sp` after its frame failed. Abandoned savepoints nested
    /// inside it are destroyed along with it and leave the queue.
    async fn abort_savepoint(&self, sp: &Savepoint) {
        self.abandoned.lock().retain(|pending| pending.seq < sp.seq);
        if let Err(err) = rollback_savepoint(self.backend().as_ref(), &sp.name).await {
            warn!(error = %err, savepoint = %sp.name, "Savepoint rollback failed");
        }
    }
}

/// Handle to an open transaction frame.
///
/// Cloning is cheap; every clone refers to the same frame. Using a handle
/// after its frame has finished fails with [`TransactionError::Finished`].
#[derive(Clone)]
pub struct Transaction {
    ctx: Arc<TxnContext>,
    frame: Arc<Frame>,
}

impl Transaction {
    fn new(ctx: Arc<TxnContext>, depth: usize) -> Self {
        Self {
            ctx,
            frame: Arc::new(Frame {
                state: RwLock::new(TxnState::Active),
                depth,
            }),
        }
    }

    /// Check if the frame is still open
    #[must_use]
    pub fn is_active(&self) -> bool {
        *self.frame.state.read() == TxnState::Active
    }

    /// Nesting depth; 0 for a top-level transaction
    #[must_use]
    pub fn depth(&self) -> usize {
        self.frame.depth
    }

    /// Whether the engine refused to open a real transaction
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.ctx.degraded
    }

    async fn ready(&self) -> Result<()> {
        if !self.is_active() {
            return Err(TransactionError::Finished.into());
        }
        self.ctx.settle().await
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &Key) -> Result<EntryMaybe<T>> {
        observe("get", async {
            self.ready().await?;
            self.ctx.shared.ops.get(key).await
        })
        .await
    }

    pub async fn get_many<T: DeserializeOwned>(&self, keys: &[Key]) -> Result<Vec<EntryMaybe<T>>> {
        observe("get_many", async {
            self.ready().await?;
            self.ctx.shared.ops.get_many(keys).await
        })
        .await
    }

    pub async fn set<T: Serialize + ?Sized>(&self, key: &Key, value: &T) -> Result<()> {
        observe("set", async {
            self.ready().await?;
            self.ctx.shared.ops.set(key, value).await
        })
        .await
    }

    pub async fn delete(&self, key: &Key) -> Result<()> {
        observe("delete", async {
            self.ready().await?;
            self.ctx.shared.ops.delete(key).await
        })
        .await
    }

    /// Scan inside this transaction. The selector is checked immediately;
    /// rows are read when the stream is first polled.
    pub fn list<T>(&self, selector: Selector, options: ListOptions) -> Result<ListStream<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        if !self.is_active() {
            return Err(TransactionError::Finished.into());
        }
        let query = self.ctx.shared.ops.list_query(&selector, options)?;
        let tx = self.clone();
        let fetch = async move {
            tx.ready().await?;
            tx.ctx.shared.ops.fetch(&query).await
        };
        Ok(ListStream::new(Box::pin(fetch), self.ctx.shared.ops.codec()))
    }

    /// Run `f` in a savepoint nested in this frame
    pub async fn transaction<F, Fut, T, E>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(Transaction) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<Error>,
    {
        run_nested(self, f).await
    }

    /// Always fails; the store can only be closed outside a transaction
    pub async fn close(&self) -> Result<()> {
        Err(TransactionError::CloseInTransaction.into())
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("depth", &self.frame.depth)
            .field("state", &*self.frame.state.read())
            .field("degraded", &self.ctx.degraded)
            .finish()
    }
}

/// Holds the gate for a top-level frame; flags the store for recovery if
/// the frame is dropped before it settles. The flag is raised before the
/// gate is released.
struct TopGuard {
    shared: Arc<Shared>,
    armed: bool,
    _gate: OwnedRwLockWriteGuard<()>,
}

impl Drop for TopGuard {
    fn drop(&mut self) {
        self.shared.open_frames.fetch_sub(1, Ordering::AcqRel);
        if self.armed {
            warn!("Transaction dropped before completion; rollback deferred");
            self.shared.pending_rollback.store(true, Ordering::Release);
        }
    }
}

/// Marks a nested frame as open; queues its savepoint for rollback if the
/// frame is dropped before it settles
struct NestedGuard {
    ctx: Arc<TxnContext>,
    savepoint: Option<Savepoint>,
}

impl NestedGuard {
    fn disarm(&mut self) {
        self.savepoint = None;
    }
}

impl Drop for NestedGuard {
    fn drop(&mut self) {
        self.ctx.shared.open_frames.fetch_sub(1, Ordering::AcqRel);
        if let Some(sp) = self.savepoint.take() {
            warn!(savepoint = %sp.name, "Nested transaction dropped before completion");
            self.ctx.abandoned.lock().push(sp);
        }
    }
}

async fn rollback_savepoint(backend: &dyn Backend, name: &str) -> Result<()> {
    backend.execute(&format!("ROLLBACK TO {name}"), &[]).await?;
    backend.execute(&format!("RELEASE {name}"), &[]).await
}

async fn rollback_quietly(backend: &dyn Backend) {
    if let Err(err) = backend.execute("ROLLBACK", &[]).await {
        warn!(error = %err, "ROLLBACK failed");
    }
}

pub(crate) async fn run_top<F, Fut, T, E>(shared: Arc<Shared>, f: F) -> std::result::Result<T, E>
where
    F: FnOnce(Transaction) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: From<Error>,
{
    let gate = Arc::clone(&shared.gate).write_owned().await;
    shared.recover().await;

    shared.open_frames.fetch_add(1, Ordering::AcqRel);
    let mut guard = TopGuard {
        shared: Arc::clone(&shared),
        armed: false,
        _gate: gate,
    };

    let backend = Arc::clone(shared.ops.backend());
    let degraded = match backend.execute("BEGIN", &[]).await {
        Ok(()) => false,
        Err(err) => match shared.mode {
            TransactionMode::Strict => return Err(err.into()),
            TransactionMode::BestEffort => {
                warn!(error = %err, "BEGIN rejected; running without a transaction");
                true
            }
        },
    };
    guard.armed = !degraded;
    debug!(store = shared.id, degraded, "Transaction started");

    let ctx = Arc::new(TxnContext {
        shared: Arc::clone(&shared),
        degraded,
        abandoned: Mutex::new(Vec::new()),
    });
    let tx = Transaction::new(Arc::clone(&ctx), 0);
    let frame = Arc::clone(&tx.frame);

    let mut active = ACTIVE_STORES.try_with(Clone::clone).unwrap_or_default();
    active.push(shared.id);
    let outcome = ACTIVE_STORES
        .scope(active, AssertUnwindSafe(f(tx)).catch_unwind())
        .await;

    if degraded {
        frame.finish(TxnState::Committed);
        record_transaction(TxnOutcome::Degraded, false);
        return match outcome {
            Ok(result) => result,
            Err(panic) => resume_unwind(panic),
        };
    }

    let result = match outcome {
        Ok(Ok(value)) => {
            frame.finish(TxnState::Committed);
            let committed = match ctx.settle().await {
                Ok(()) => backend.execute("COMMIT", &[]).await,
                Err(err) => Err(err),
            };
            match committed {
                Ok(()) => {
                    record_transaction(TxnOutcome::Commit, false);
                    debug!(store = shared.id, "Transaction committed");
                    Ok(value)
                }
                Err(err) => {
                    warn!(error = %err, "COMMIT failed; rolling back");
                    rollback_quietly(backend.as_ref()).await;
                    frame.finish(TxnState::RolledBack);
                    record_transaction(TxnOutcome::Rollback, false);
                    Err(err.into())
                }
            }
        }
        Ok(Err(err)) => {
            frame.finish(TxnState::RolledBack);
            rollback_quietly(backend.as_ref()).await;
            record_transaction(TxnOutcome::Rollback, false);
            debug!(store = shared.id, "Transaction rolled back");
            Err(err)
        }
        Err(panic) => {
            frame.finish(TxnState::RolledBack);
            rollback_quietly(backend.as_ref()).await;
            record_transaction(TxnOutcome::Rollback, false);
            guard.armed = false;
            resume_unwind(panic)
        }
    };
    guard.armed = false;
    result
}

async fn run_nested<F, Fut, T, E>(parent: &Transaction, f: F) -> std::result::Result<T, E>
where
    F: FnOnce(Transaction) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: From<Error>,
{
    parent.ready().await?;
    let ctx = Arc::clone(&parent.ctx);
    let backend = Arc::clone(ctx.backend());
    let depth = parent.frame.depth + 1;

    let savepoint = if ctx.degraded {
        None
    } else {
        let sp = SAVEPOINTS.next();
        match backend.execute(&format!("SAVEPOINT {}", sp.name), &[]).await {
            Ok(()) => Some(sp),
            Err(err) => match ctx.shared.mode {
                TransactionMode::Strict => return Err(err.into()),
                TransactionMode::BestEffort => {
                    warn!(error = %err, "SAVEPOINT rejected; running without a savepoint");
                    None
                }
            },
        }
    };
    debug!(depth, savepoint = ?savepoint.as_ref().map(|sp| &sp.name), "Nested transaction started");

    ctx.shared.open_frames.fetch_add(1, Ordering::AcqRel);
    let mut guard = NestedGuard {
        ctx: Arc::clone(&ctx),
        savepoint: savepoint.clone(),
    };

    let tx = Transaction::new(Arc::clone(&ctx), depth);
    let frame = Arc::clone(&tx.frame);
    let outcome = AssertUnwindSafe(f(tx)).catch_unwind().await;
    guard.disarm();

    let Some(sp) = savepoint else {
        frame.finish(TxnState::Committed);
        record_transaction(TxnOutcome::Degraded, true);
        return match outcome {
            Ok(result) => result,
            Err(panic) => resume_unwind(panic),
        };
    };

    match outcome {
        Ok(Ok(value)) => {
            frame.finish(TxnState::Committed);
            let released = match ctx.settle().await {
                Ok(()) => backend.execute(&format!("RELEASE {}", sp.name), &[]).await,
                Err(err) => Err(err),
            };
            match released {
                Ok(()) => {
                    record_transaction(TxnOutcome::Commit, true);
                    Ok(value)
                }
                Err(err) => {
                    frame.finish(TxnState::RolledBack);
                    ctx.abort_savepoint(&sp).await;
                    record_transaction(TxnOutcome::Rollback, true);
                    Err(err.into())
                }
            }
        }
        Ok(Err(err)) => {
            frame.finish(TxnState::RolledBack);
            ctx.abort_savepoint(&sp).await;
            record_transaction(TxnOutcome::Rollback, true);
            Err(err)
        }
        Err(panic) => {
            frame.finish(TxnState::RolledBack);
            ctx.abort_savepoint(&sp).await;
            record_transaction(TxnOutcome::Rollback, true);
            resume_unwind(panic)
        }
    }
}

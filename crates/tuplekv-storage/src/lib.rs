//! # TupleKV Storage Engine
//!
//! Ordered, transactional key-value storage over a single SQLite table.
//! Keys are tuples of primitive segments, so related entries cluster and can
//! be read back with prefix and range scans.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        KvStore                               │
//! │     get │ get_many │ set │ delete │ list │ transaction       │
//! ├─────────────────────────────────────────────────────────────┤
//! │        Operation Layer        │    Transaction Manager       │
//! │   KeyCodec │ JSON values      │  BEGIN │ SAVEPOINT │ gate    │
//! ├─────────────────────────────────────────────────────────────┤
//! │                     Backend trait                            │
//! │          SqliteBackend (rusqlite) │ SqlxBackend (sqlx)      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use tuplekv_storage::{key, KvStore, ListOptions, Selector};
//! use futures::TryStreamExt;
//!
//! # async fn demo() -> tuplekv_common::Result<()> {
//! let store = KvStore::in_memory().await?;
//! store.set(&key!["users", "alice"], &serde_json::json!({"age": 30})).await?;
//!
//! let users: Vec<_> = store
//!     .list::<serde_json::Value>(Selector::prefix(key!["users"]), ListOptions::default())?
//!     .try_collect()
//!     .await?;
//! assert_eq!(users.len(), 1);
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod backend;
pub mod codec;
pub mod ops;
pub mod schema;
pub mod store;
pub mod txn;
pub mod types;

pub use backend::{Backend, Column, Row, SqlValue, SqliteBackend, Statement};
#[cfg(feature = "sqlx")]
pub use backend::SqlxBackend;
pub use codec::{Key, KeyCodec, KeyPart, SEPARATOR};
pub use ops::{ListQuery, ListStream};
pub use schema::{ensure_schema, DEFAULT_TABLE};
pub use store::KvStore;
pub use txn::Transaction;
pub use types::{Entry, EntryMaybe, ListOptions, Selector, SelectorSpec};

//! TupleKV Repositories
//!
//! Application records stored under hierarchical keys:
//! - `["users", "id", id]` with an email index at `["users", "index", "email", email]`
//! - `["tokens", "id", id]` with hash and per-user indexes
//! - `[namespace, owner_id, key]` for opaque JSON documents

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod document;
pub mod error;
pub mod merge;
pub mod token;
pub mod user;

pub use document::DocumentRepo;
pub use error::{RepoError, Result};
pub use merge::{LastWriteWins, Merge, MergeService, ShallowObjectMerge};
pub use token::{RefreshToken, TokenRepo};
pub use user::{User, UserRepo};

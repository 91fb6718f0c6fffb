//! Read-merge-write over document repositories
//!
//! The merge function itself is pluggable; a CRDT implementation can be
//! supplied by the embedding application.

use serde_json::Value;
use tracing::debug;

use tuplekv_storage::EntryMaybe;

use crate::document::DocumentRepo;
use crate::error::{RepoError, Result};

/// Pure merge of an incoming document into the stored one
pub trait Merge: Send + Sync {
    fn merge(&self, current: &Value, incoming: &Value) -> Value;
}

/// Incoming document replaces the stored one
#[derive(Debug, Clone, Copy, Default)]
pub struct LastWriteWins;

impl Merge for LastWriteWins {
    fn merge(&self, _current: &Value, incoming: &Value) -> Value {
        incoming.clone()
    }
}

/// Top-level fields of two objects are combined, incoming fields win.
/// Anything other than two objects falls back to last-write-wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShallowObjectMerge;

impl Merge for ShallowObjectMerge {
    fn merge(&self, current: &Value, incoming: &Value) -> Value {
        match (current, incoming) {
            (Value::Object(current), Value::Object(incoming)) => {
                let mut merged = current.clone();
                for (k, v) in incoming {
                    merged.insert(k.clone(), v.clone());
                }
                Value::Object(merged)
            }
            _ => incoming.clone(),
        }
    }
}

/// Merges documents atomically: the read, merge and write happen in one
/// transaction
#[derive(Debug, Clone)]
pub struct MergeService<M> {
    docs: DocumentRepo,
    merger: M,
}

impl<M: Merge> MergeService<M> {
    pub fn new(docs: DocumentRepo, merger: M) -> Self {
        Self { docs, merger }
    }

    pub async fn get(&self, owner_id: &str, key: &str) -> Result<Option<Value>> {
        self.docs.get(owner_id, key).await
    }

    /// Merge `incoming` into the stored document, inserting it when absent.
    /// Returns the document as stored.
    pub async fn merge(&self, owner_id: &str, key: &str, incoming: Value) -> Result<Value> {
        let doc_key = self.docs.key(owner_id, key);
        let merger = &self.merger;
        self.docs
            .store()
            .transaction(|tx| async move {
                let current: EntryMaybe<Value> = tx.get(&doc_key).await?;
                let stored = match current.value {
                    Some(current) => merger.merge(&current, &incoming),
                    None => incoming,
                };
                tx.set(&doc_key, &stored).await?;
                debug!(key = %doc_key, "Document merged");
                Ok::<_, RepoError>(stored)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tuplekv_storage::KvStore;

    #[test]
    fn test_shallow_merge() {
        let merged = ShallowObjectMerge.merge(&json!({"a": 1, "b": 1}), &json!({"b": 2, "c": 3}));
        assert_eq!(merged, json!({"a": 1, "b": 2, "c": 3}));
        assert_eq!(ShallowObjectMerge.merge(&json!([1]), &json!({"x": 1})), json!({"x": 1}));
        assert_eq!(LastWriteWins.merge(&json!({"a": 1}), &json!({"b": 2})), json!({"b": 2}));
    }

    #[tokio::test]
    async fn test_merge_inserts_then_merges() {
        let store = KvStore::in_memory().await.unwrap();
        let service = MergeService::new(DocumentRepo::collections(store), ShallowObjectMerge);

        let first = service.merge("u1", "todos", json!({"a": 1})).await.unwrap();
        assert_eq!(first, json!({"a": 1}));

        let second = service.merge("u1", "todos", json!({"b": 2})).await.unwrap();
        assert_eq!(second, json!({"a": 1, "b": 2}));
        assert_eq!(service.get("u1", "todos").await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn test_concurrent_merges_do_not_lose_fields() {
        let store = KvStore::in_memory().await.unwrap();
        let service = MergeService::new(DocumentRepo::documents(store), ShallowObjectMerge);

        let tasks: Vec<_> = (0..10)
            .map(|i| {
                let service = service.clone();
                tokio::spawn(async move {
                    let mut fields = serde_json::Map::new();
                    fields.insert(format!("f{i}"), json!(i));
                    service
                        .merge("u1", "doc", Value::Object(fields))
                        .await
                        .unwrap();
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let doc = service.get("u1", "doc").await.unwrap().unwrap();
        assert_eq!(doc.as_object().unwrap().len(), 10);
    }
}

//! Opaque JSON documents keyed by owner

use serde_json::Value;
use tracing::instrument;

use tuplekv_storage::{key, Entry, EntryMaybe, Key, KeyPart, KvStore, ListOptions, Selector};

use crate::error::Result;

/// Namespace for per-user documents
pub const DOCUMENTS: &str = "documents";
/// Namespace for per-user synced collections
pub const COLLECTIONS: &str = "collection";

/// One JSON document per `(owner_id, key)` under `[namespace, owner_id, key]`
#[derive(Debug, Clone)]
pub struct DocumentRepo {
    store: KvStore,
    namespace: &'static str,
}

impl DocumentRepo {
    pub fn new(store: KvStore, namespace: &'static str) -> Self {
        Self { store, namespace }
    }

    pub fn documents(store: KvStore) -> Self {
        Self::new(store, DOCUMENTS)
    }

    pub fn collections(store: KvStore) -> Self {
        Self::new(store, COLLECTIONS)
    }

    #[must_use]
    pub fn namespace(&self) -> &'static str {
        self.namespace
    }

    pub fn store(&self) -> &KvStore {
        &self.store
    }

    /// Storage key of a document
    #[must_use]
    pub fn key(&self, owner_id: &str, key: &str) -> Key {
        key![self.namespace, owner_id, key]
    }

    pub async fn get(&self, owner_id: &str, key: &str) -> Result<Option<Value>> {
        let entry: EntryMaybe<Value> = self.store.get(&self.key(owner_id, key)).await?;
        Ok(entry.value)
    }

    #[instrument(skip(self, doc), fields(namespace = self.namespace))]
    pub async fn insert(&self, owner_id: &str, key: &str, doc: &Value) -> Result<()> {
        self.store.set(&self.key(owner_id, key), doc).await?;
        Ok(())
    }

    #[instrument(skip(self, doc), fields(namespace = self.namespace))]
    pub async fn update(&self, owner_id: &str, key: &str, doc: &Value) -> Result<()> {
        self.store.set(&self.key(owner_id, key), doc).await?;
        Ok(())
    }

    pub async fn delete(&self, owner_id: &str, key: &str) -> Result<()> {
        self.store.delete(&self.key(owner_id, key)).await?;
        Ok(())
    }

    /// Document keys of one owner in ascending order
    pub async fn list_keys(&self, owner_id: &str) -> Result<Vec<String>> {
        let entries: Vec<Entry<Value>> = self
            .store
            .list(
                Selector::prefix(key![self.namespace, owner_id]),
                ListOptions::default(),
            )?
            .collect_entries()
            .await?;
        Ok(entries
            .into_iter()
            .filter_map(|e| match e.key.last() {
                Some(KeyPart::String(s)) => Some(s.clone()),
                _ => None,
            })
            .collect())
    }
}

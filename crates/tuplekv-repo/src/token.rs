//! Refresh token records
//!
//! Tokens are stored by id with two secondary indexes: hash to id for
//! lookups during refresh, and `(user, id)` for listing a user's tokens.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use tuplekv_storage::{key, Entry, EntryMaybe, Key, KvStore, ListOptions, Selector, Transaction};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshToken {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token_hash: String,
    pub revoked_at: Option<DateTime<Utc>>,
    pub last_used_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RefreshToken {
    #[must_use]
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }
}

fn token_key(id: Uuid) -> Key {
    key!["tokens", "id", id.to_string()]
}

fn hash_index(hash: &str) -> Key {
    key!["tokens", "index", "hash", hash]
}

fn user_index(user_id: Uuid) -> Key {
    key!["tokens", "index", "user", user_id.to_string()]
}

/// Refresh token repository
#[derive(Debug, Clone)]
pub struct TokenRepo {
    store: KvStore,
}

impl TokenRepo {
    pub fn new(store: KvStore) -> Self {
        Self { store }
    }

    /// Store a new token together with both indexes
    #[instrument(skip(self, token_hash))]
    pub async fn create(&self, user_id: Uuid, token_hash: &str) -> Result<RefreshToken> {
        let now = Utc::now();
        let token = RefreshToken {
            id: Uuid::new_v4(),
            user_id,
            token_hash: token_hash.to_string(),
            revoked_at: None,
            last_used_at: now,
            created_at: now,
            updated_at: now,
        };

        let record = &token;
        self.store
            .transaction(|tx| async move {
                tx.set(&token_key(record.id), record).await?;
                tx.set(&hash_index(&record.token_hash), &record.id).await?;
                tx.set(&user_index(record.user_id).child(record.id.to_string()), &record.id)
                    .await
            })
            .await?;

        info!(token_id = %token.id, "Refresh token created");
        Ok(token)
    }

    pub async fn get_by_hash(&self, token_hash: &str) -> Result<Option<RefreshToken>> {
        let index: EntryMaybe<Uuid> = self.store.get(&hash_index(token_hash)).await?;
        let Some(id) = index.value else {
            return Ok(None);
        };
        let entry: EntryMaybe<RefreshToken> = self.store.get(&token_key(id)).await?;
        Ok(entry.value)
    }

    /// Touch `last_used_at`; a missing token is ignored
    pub async fn update_last_used(&self, id: Uuid) -> Result<()> {
        self.store
            .transaction(|tx| async move {
                let entry: EntryMaybe<RefreshToken> = tx.get(&token_key(id)).await?;
                if let Some(mut token) = entry.value {
                    let now = Utc::now();
                    token.last_used_at = now;
                    token.updated_at = now;
                    tx.set(&token_key(id), &token).await?;
                }
                Ok(())
            })
            .await
    }

    /// Mark the token with this hash revoked; an unknown hash is ignored
    #[instrument(skip_all)]
    pub async fn revoke(&self, token_hash: &str) -> Result<()> {
        self.store
            .transaction(|tx| async move {
                let index: EntryMaybe<Uuid> = tx.get(&hash_index(token_hash)).await?;
                if let Some(id) = index.value {
                    revoke_in(&tx, id).await?;
                }
                Ok(())
            })
            .await
    }

    /// All tokens issued to a user, revoked ones included
    pub async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<RefreshToken>> {
        let ids: Vec<Entry<Uuid>> = self
            .store
            .list(Selector::prefix(user_index(user_id)), ListOptions::default())?
            .collect_entries()
            .await?;
        let keys: Vec<Key> = ids.into_iter().map(|e| token_key(e.value)).collect();
        let tokens: Vec<EntryMaybe<RefreshToken>> = self.store.get_many(&keys).await?;
        Ok(tokens.into_iter().filter_map(EntryMaybe::into_value).collect())
    }

    /// Revoke every live token of a user at once. Returns how many changed.
    #[instrument(skip(self))]
    pub async fn revoke_all_for_user(&self, user_id: Uuid) -> Result<usize> {
        let revoked = self
            .store
            .transaction(|tx| async move {
                let ids: Vec<Entry<Uuid>> = tx
                    .list(Selector::prefix(user_index(user_id)), ListOptions::default())?
                    .collect_entries()
                    .await?;
                let mut revoked = 0;
                for entry in ids {
                    if revoke_in(&tx, entry.value).await? {
                        revoked += 1;
                    }
                }
                Ok::<_, crate::RepoError>(revoked)
            })
            .await?;
        debug!(revoked, "Revoked user tokens");
        Ok(revoked)
    }
}

/// Returns whether the token was live before the call
async fn revoke_in(tx: &Transaction, id: Uuid) -> tuplekv_common::Result<bool> {
    let entry: EntryMaybe<RefreshToken> = tx.get(&token_key(id)).await?;
    match entry.value {
        Some(mut token) if !token.is_revoked() => {
            let now = Utc::now();
            token.revoked_at = Some(now);
            token.updated_at = now;
            tx.set(&token_key(id), &token).await?;
            Ok(true)
        }
        _ => Ok(false),
    }
}

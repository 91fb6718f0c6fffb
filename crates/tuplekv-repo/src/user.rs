//! User records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;

use tuplekv_storage::{key, EntryMaybe, Key, KvStore};

use crate::error::{RepoError, Result};

/// Stored user account. Secrets arrive already hashed or encrypted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub hashed_password: String,
    pub encrypted_master_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn user_key(id: Uuid) -> Key {
    key!["users", "id", id.to_string()]
}

fn email_index(email: &str) -> Key {
    key!["users", "index", "email", email]
}

/// User repository
#[derive(Debug, Clone)]
pub struct UserRepo {
    store: KvStore,
}

impl UserRepo {
    pub fn new(store: KvStore) -> Self {
        Self { store }
    }

    /// Look up a user through the email index
    #[instrument(skip(self))]
    pub async fn get_by_email(&self, email: &str) -> Result<Option<User>> {
        let index: EntryMaybe<Uuid> = self.store.get(&email_index(email)).await?;
        match index.value {
            Some(id) => self.get_by_id(id).await,
            None => Ok(None),
        }
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<User>> {
        let entry: EntryMaybe<User> = self.store.get(&user_key(id)).await?;
        Ok(entry.value)
    }

    /// Create a user, claiming the email atomically
    #[instrument(skip(self, hashed_password, encrypted_master_key))]
    pub async fn create(
        &self,
        email: &str,
        hashed_password: &str,
        encrypted_master_key: &str,
    ) -> Result<User> {
        let now = Utc::now();
        let user = User {
            id: Uuid::new_v4(),
            email: email.to_string(),
            hashed_password: hashed_password.to_string(),
            encrypted_master_key: encrypted_master_key.to_string(),
            created_at: now,
            updated_at: now,
        };

        let record = &user;
        self.store
            .transaction(|tx| async move {
                let index = email_index(&record.email);
                let existing: EntryMaybe<Uuid> = tx.get(&index).await?;
                if existing.is_present() {
                    return Err(RepoError::EmailExists);
                }
                tx.set(&index, &record.id).await?;
                tx.set(&user_key(record.id), record).await?;
                Ok(())
            })
            .await?;

        info!(user_id = %user.id, "User created");
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn repo() -> UserRepo {
        UserRepo::new(KvStore::in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn test_create_and_lookup() {
        let repo = repo().await;
        let user = repo.create("a@example.com", "hash", "mk").await.unwrap();

        let by_email = repo.get_by_email("a@example.com").await.unwrap().unwrap();
        assert_eq!(by_email, user);
        let by_id = repo.get_by_id(user.id).await.unwrap().unwrap();
        assert_eq!(by_id.email, "a@example.com");

        assert!(repo.get_by_email("b@example.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_email() {
        let repo = repo().await;
        let first = repo.create("a@example.com", "hash", "mk").await.unwrap();
        let err = repo.create("a@example.com", "other", "mk2").await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(err.to_string(), "Email already exists");

        // The first account is untouched
        let stored = repo.get_by_email("a@example.com").await.unwrap().unwrap();
        assert_eq!(stored.id, first.id);
        assert_eq!(stored.hashed_password, "hash");
    }

    #[tokio::test]
    async fn test_stored_shape() {
        let store = KvStore::in_memory().await.unwrap();
        let repo = UserRepo::new(store.clone());
        let user = repo.create("a@example.com", "hash", "mk").await.unwrap();

        let raw: EntryMaybe<serde_json::Value> = store.get(&user_key(user.id)).await.unwrap();
        let raw = raw.value.unwrap();
        assert_eq!(raw["hashedPassword"], "hash");
        assert_eq!(raw["encryptedMasterKey"], "mk");
        assert!(raw["createdAt"].is_string());
    }
}

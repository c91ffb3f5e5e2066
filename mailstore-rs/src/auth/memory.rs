use super::{AuthStore, LoginState};
use crate::error::{Result, StoreError};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct Credential {
    created_at: DateTime<Utc>,
    /// `None` = unset, `Some(0)` = never logged in
    first_login_at: Option<i64>,
}

/// In-process credential store
#[derive(Clone, Default)]
pub struct MemoryAuthStore {
    credentials: Arc<RwLock<HashMap<String, Credential>>>,
}

impl MemoryAuthStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a record that has never logged in
    pub async fn insert(&self, username: &str, created_at: DateTime<Utc>) {
        self.put(username, created_at, Some(0)).await;
    }

    /// Add a record predating login-state tracking
    pub async fn insert_legacy(&self, username: &str, created_at: DateTime<Utc>) {
        self.put(username, created_at, None).await;
    }

    async fn put(&self, username: &str, created_at: DateTime<Utc>, first_login_at: Option<i64>) {
        let mut credentials = self.credentials.write().await;
        credentials.insert(
            username.to_string(),
            Credential {
                created_at,
                first_login_at,
            },
        );
    }

    pub async fn record_login(&self, username: &str, at: DateTime<Utc>) -> Result<()> {
        let mut credentials = self.credentials.write().await;
        let credential = credentials
            .get_mut(username)
            .ok_or_else(|| StoreError::NotFound(format!("credential {}", username)))?;

        if LoginState::from_stored(credential.first_login_at) == LoginState::Never {
            credential.first_login_at = Some(at.timestamp().max(1));
        }
        Ok(())
    }

    pub async fn contains(&self, username: &str) -> bool {
        self.credentials.read().await.contains_key(username)
    }

    async fn get(&self, username: &str) -> Result<Credential> {
        let credentials = self.credentials.read().await;
        credentials
            .get(username)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("credential {}", username)))
    }
}

#[async_trait::async_trait]
impl AuthStore for MemoryAuthStore {
    async fn list_accounts(&self) -> Result<Vec<String>> {
        let credentials = self.credentials.read().await;
        let mut usernames: Vec<String> = credentials.keys().cloned().collect();
        usernames.sort();
        Ok(usernames)
    }

    async fn get_login_state(&self, username: &str) -> Result<LoginState> {
        Ok(LoginState::from_stored(self.get(username).await?.first_login_at))
    }

    async fn get_created_at(&self, username: &str) -> Result<DateTime<Utc>> {
        Ok(self.get(username).await?.created_at)
    }

    async fn delete(&self, username: &str) -> Result<()> {
        let mut credentials = self.credentials.write().await;
        credentials
            .remove(username)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("credential {}", username)))
    }

    async fn mark_unset_as_logged_in(&self) -> Result<u64> {
        let mut credentials = self.credentials.write().await;
        let mut changed = 0;
        for credential in credentials.values_mut() {
            if credential.first_login_at.is_none() {
                credential.first_login_at = Some(1);
                changed += 1;
            }
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_login_state_transitions() {
        let store = MemoryAuthStore::new();
        store.insert("alice@example.org", Utc::now()).await;

        assert_eq!(
            store.get_login_state("alice@example.org").await.unwrap(),
            LoginState::Never
        );

        store
            .record_login("alice@example.org", Utc::now())
            .await
            .unwrap();
        assert_eq!(
            store.get_login_state("alice@example.org").await.unwrap(),
            LoginState::LoggedIn
        );
    }

    #[tokio::test]
    async fn test_migration_only_touches_unset() {
        let store = MemoryAuthStore::new();
        store.insert("new@example.org", Utc::now()).await;
        store.insert_legacy("old@example.org", Utc::now()).await;

        assert_eq!(store.mark_unset_as_logged_in().await.unwrap(), 1);
        assert_eq!(store.mark_unset_as_logged_in().await.unwrap(), 0);

        assert_eq!(
            store.get_login_state("old@example.org").await.unwrap(),
            LoginState::LoggedIn
        );
        assert_eq!(
            store.get_login_state("new@example.org").await.unwrap(),
            LoginState::Never
        );
    }

    #[tokio::test]
    async fn test_delete_missing() {
        let store = MemoryAuthStore::new();
        assert!(store.delete("ghost@example.org").await.unwrap_err().is_not_found());
        assert!(store
            .get_created_at("ghost@example.org")
            .await
            .unwrap_err()
            .is_not_found());
    }
}

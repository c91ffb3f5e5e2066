//! Credential database reached through sqlx
//!
//! Only the columns the retention engine needs are touched:
//!
//! ```sql
//! credentials (username TEXT PRIMARY KEY, created_at BIGINT, first_login_at BIGINT NULL)
//! ```
//!
//! Timestamps are unix seconds.

use super::{AuthStore, LoginState};
use crate::error::{Result, StoreError};
use chrono::{DateTime, Utc};
use sqlx::any::AnyPoolOptions;
use sqlx::AnyPool;
use tracing::info;

#[derive(Clone)]
pub struct SqlAuthStore {
    pool: AnyPool,
}

impl SqlAuthStore {
    /// Connect to the credential database, creating the table if needed
    pub async fn connect(dsn: &str) -> Result<Self> {
        sqlx::any::install_default_drivers();

        let pool = AnyPoolOptions::new().max_connections(4).connect(dsn).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS credentials (
                username TEXT PRIMARY KEY,
                created_at BIGINT NOT NULL,
                first_login_at BIGINT
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    /// Add a credential record that has never logged in
    pub async fn add_account(&self, username: &str, created_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "INSERT INTO credentials (username, created_at, first_login_at) VALUES ($1, $2, 0)",
        )
        .bind(username)
        .bind(created_at.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Set the login timestamp once; later logins leave it alone
    pub async fn record_login(&self, username: &str, at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE credentials SET first_login_at = $2 \
             WHERE username = $1 AND (first_login_at IS NULL OR first_login_at = 0)",
        )
        .bind(username)
        .bind(at.timestamp().max(1))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Either already logged in or missing
            self.get_created_at(username).await?;
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait::async_trait]
impl AuthStore for SqlAuthStore {
    async fn list_accounts(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT username FROM credentials ORDER BY username")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(username,)| username).collect())
    }

    async fn get_login_state(&self, username: &str) -> Result<LoginState> {
        // NULL reads as 0, both mean "never"
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT COALESCE(first_login_at, 0) FROM credentials WHERE username = $1",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(first_login_at,)| LoginState::from_stored(Some(first_login_at)))
            .ok_or_else(|| StoreError::NotFound(format!("credential {}", username)))
    }

    async fn get_created_at(&self, username: &str) -> Result<DateTime<Utc>> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT created_at FROM credentials WHERE username = $1")
                .bind(username)
                .fetch_optional(&self.pool)
                .await?;

        let (created_at,) =
            row.ok_or_else(|| StoreError::NotFound(format!("credential {}", username)))?;
        DateTime::from_timestamp(created_at, 0).ok_or_else(|| {
            StoreError::Database(format!(
                "credential {} has invalid created_at {}",
                username, created_at
            ))
        })
    }

    async fn delete(&self, username: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM credentials WHERE username = $1")
            .bind(username)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("credential {}", username)));
        }
        Ok(())
    }

    async fn mark_unset_as_logged_in(&self) -> Result<u64> {
        let result =
            sqlx::query("UPDATE credentials SET first_login_at = 1 WHERE first_login_at IS NULL")
                .execute(&self.pool)
                .await?;

        let changed = result.rows_affected();
        if changed > 0 {
            info!(
                "Marked {} legacy credential(s) as logged in before the first unused-account sweep",
                changed
            );
        }
        Ok(changed)
    }
}

/// External authentication-store boundary
///
/// The retention engine reads login state and creation time from the
/// credential database and deletes unused accounts from it. The storage
/// engine never writes login state there.
///
/// Login state is stored as a timestamp column: unset (`NULL`) and `0` both
/// read as [`LoginState::Never`], anything positive as
/// [`LoginState::LoggedIn`]. [`AuthStore::mark_unset_as_logged_in`] is the
/// one-time migration that protects legacy accounts predating the column.

pub mod memory;
pub mod sql;

pub use memory::MemoryAuthStore;
pub use sql::SqlAuthStore;

use crate::error::Result;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginState {
    /// Eligible for the unused-account sweep
    Never,
    /// Protected regardless of account age
    LoggedIn,
}

impl LoginState {
    /// Interpret the stored `first_login_at` value
    pub fn from_stored(value: Option<i64>) -> Self {
        match value {
            Some(ts) if ts > 0 => LoginState::LoggedIn,
            _ => LoginState::Never,
        }
    }
}

#[async_trait::async_trait]
pub trait AuthStore: Send + Sync {
    /// Normalized usernames of every credential record
    async fn list_accounts(&self) -> Result<Vec<String>>;

    async fn get_login_state(&self, username: &str) -> Result<LoginState>;

    async fn get_created_at(&self, username: &str) -> Result<DateTime<Utc>>;

    async fn delete(&self, username: &str) -> Result<()>;

    /// Mark every record with an unset login state as logged in.
    /// Idempotent, returns the number of records changed.
    async fn mark_unset_as_logged_in(&self) -> Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_state_from_stored() {
        assert_eq!(LoginState::from_stored(None), LoginState::Never);
        assert_eq!(LoginState::from_stored(Some(0)), LoginState::Never);
        assert_eq!(LoginState::from_stored(Some(1)), LoginState::LoggedIn);
        assert_eq!(
            LoginState::from_stored(Some(1_700_000_000)),
            LoginState::LoggedIn
        );
    }
}

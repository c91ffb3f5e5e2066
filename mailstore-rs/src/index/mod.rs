//! Relational mailbox index
//!
//! Mailboxes, message metadata, flags, UIDs and modification sequences.
//! Every mutating operation is one transaction; dropping its future before
//! completion rolls the transaction back.
//!
//! UID and modseq counters live in the mailbox row and are only changed by
//! the transaction holding that row's lock, which makes them the single
//! serialization point per mailbox and keeps them correct across restarts
//! and across several engine instances sharing one database.
//!
//! Operations that remove messages return the blob keys that lost their last
//! reference. The caller deletes those blobs after the call returned, never
//! before.

pub mod dialect;
pub mod sql;
pub mod types;

pub use dialect::{Dialect, MySqlDialect, PostgresDialect, SqliteDialect};
pub use sql::SqlIndex;
pub use types::{
    canonical_mailbox_name, flags, Account, Appended, Expunged, FlagDelta, FlagSet, IndexStats,
    Mailbox, MailboxId, MessageMeta, ModSeq, NewMessage, PurgeFilter, SpecialUse, Uid, INBOX,
};

use crate::blob::BlobKey;
use crate::error::Result;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::time::Duration;

#[async_trait::async_trait]
pub trait MailIndex: Send + Sync {
    /// Provision an account together with its `INBOX`
    async fn create_account(&self, username: &str, created_at: DateTime<Utc>) -> Result<Account>;

    async fn get_account(&self, username: &str) -> Result<Account>;

    async fn list_accounts(&self) -> Result<Vec<Account>>;

    /// Set `first_login_at` if it is not set yet; later logins leave it alone
    async fn record_login(&self, username: &str, at: DateTime<Utc>) -> Result<Account>;

    /// Remove an account with all its mailboxes and messages
    async fn delete_account(&self, username: &str) -> Result<Vec<BlobKey>>;

    /// Like [`delete_account`](Self::delete_account), but only if the
    /// account has never logged in, checked under the account lock.
    /// Returns `None` and leaves the account alone otherwise.
    async fn delete_account_if_unused(&self, username: &str) -> Result<Option<Vec<BlobKey>>>;

    async fn create_mailbox(
        &self,
        username: &str,
        name: &str,
        special_use: Option<SpecialUse>,
    ) -> Result<MailboxId>;

    async fn find_mailbox(&self, username: &str, name: &str) -> Result<Mailbox>;

    async fn get_mailbox(&self, id: MailboxId) -> Result<Mailbox>;

    async fn list_mailboxes(&self, username: &str) -> Result<Vec<Mailbox>>;

    /// Every mailbox of every account, for maintenance sweeps
    async fn list_all_mailboxes(&self) -> Result<Vec<Mailbox>>;

    /// Rename a mailbox and its children
    async fn rename_mailbox(&self, id: MailboxId, new_name: &str) -> Result<()>;

    async fn delete_mailbox(&self, id: MailboxId) -> Result<Vec<BlobKey>>;

    async fn set_mailbox_retention(&self, id: MailboxId, max_age: Option<Duration>) -> Result<()>;

    /// Start a new UID epoch, returns the new UIDVALIDITY
    async fn renew_uid_validity(&self, id: MailboxId) -> Result<u32>;

    async fn append(&self, id: MailboxId, message: &NewMessage) -> Result<Appended>;

    /// Apply a flag change. Always allocates a new modseq, even when the
    /// resulting flag set equals the old one.
    async fn set_flags(&self, id: MailboxId, uid: Uid, delta: &FlagDelta) -> Result<ModSeq>;

    /// Remove `\Deleted` messages among `uids` (all of them if empty)
    async fn expunge(&self, id: MailboxId, uids: &[Uid]) -> Result<Expunged>;

    /// Move messages to another mailbox, returning (old uid, new uid) pairs
    async fn move_messages(
        &self,
        from: MailboxId,
        to: MailboxId,
        uids: &[Uid],
    ) -> Result<Vec<(Uid, Uid)>>;

    async fn get_message(&self, id: MailboxId, uid: Uid) -> Result<MessageMeta>;

    /// Messages whose modseq is strictly greater than `since_modseq`
    async fn list_messages(&self, id: MailboxId, since_modseq: ModSeq) -> Result<Vec<MessageMeta>>;

    /// Remove messages received before `cutoff`
    async fn expire_messages(&self, id: MailboxId, cutoff: DateTime<Utc>) -> Result<Expunged>;

    async fn purge_messages(&self, id: MailboxId, filter: PurgeFilter) -> Result<Expunged>;

    /// Every blob key referenced by at least one message
    async fn referenced_blob_keys(&self) -> Result<HashSet<BlobKey>>;

    async fn stats(&self) -> Result<IndexStats>;
}

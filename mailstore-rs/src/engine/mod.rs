//! Engine facade
//!
//! The surface consumed by protocol servers. Resolves addresses through the
//! mapping pipelines, runs metadata operations against the index and moves
//! bodies in and out of the blob store, keeping the cross-store ordering:
//! blob written before the index row that references it, index row removed
//! before the blob.
//!
//! # Usage
//! ```no_run
//! use mailstore_rs::config::Config;
//! use mailstore_rs::engine::Engine;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = Engine::open(&Config::default()).await?;
//!
//! engine.provision("Alice@Example.org").await?;
//! let delivered = engine.deliver("alice@example.org", b"Subject: hi\r\n\r\nhello", false).await?;
//! let message = engine.fetch(delivered.mailbox, delivered.uid).await?;
//! assert_eq!(message.body, b"Subject: hi\r\n\r\nhello");
//! # Ok(())
//! # }
//! ```

pub mod types;

pub use types::{Delivered, EngineOptions, FetchedMessage, Mode, PurgeSummary};

use crate::auth::AuthStore;
use crate::blob::{self, BlobKey, BlobStore};
use crate::config::Config;
use crate::error::{Result, StoreError};
use crate::index::{
    flags, Account, Appended, Expunged, FlagDelta, FlagSet, IndexStats, MailIndex, Mailbox,
    MailboxId, MessageMeta, ModSeq, NewMessage, PurgeFilter, SpecialUse, SqlIndex, Uid, INBOX,
};
use crate::mapping::{Pipeline, Purpose, Resolver};
use crate::retention::{RetentionConfig, RetentionEngine};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub struct Engine {
    index: Arc<dyn MailIndex>,
    blobs: Arc<dyn BlobStore>,
    resolver: Resolver,
    options: EngineOptions,
}

impl Engine {
    pub fn new(
        index: Arc<dyn MailIndex>,
        blobs: Arc<dyn BlobStore>,
        resolver: Resolver,
        options: EngineOptions,
    ) -> Self {
        Engine {
            index,
            blobs,
            resolver,
            options,
        }
    }

    /// Open the index and blob store described by `config`
    pub async fn open(config: &Config) -> Result<Self> {
        config.validate()?;

        let index = SqlIndex::connect(&config.index).await?;
        let blobs = blob::from_config(&config.blobs)?;
        let resolver = Resolver::new(
            Pipeline::from_config(config.delivery.profile, &config.delivery.table)?,
            Pipeline::from_config(config.auth.profile, &config.auth.table)?,
        );
        let options = EngineOptions::from(&config.delivery);

        info!(
            "Engine ready: {} index, {} blob store, {:?} mode",
            index.backend(),
            blobs.kind(),
            options.mode
        );

        Ok(Self::new(Arc::new(index), blobs, resolver, options))
    }

    pub fn index(&self) -> &Arc<dyn MailIndex> {
        &self.index
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn is_lookup_only(&self) -> bool {
        self.options.mode == Mode::LookupOnly
    }

    fn require_mailboxes(&self) -> Result<()> {
        if self.is_lookup_only() {
            return Err(StoreError::LookupOnly);
        }
        Ok(())
    }

    fn check_size(&self, body: &[u8]) -> Result<()> {
        if body.len() > self.options.max_message_size {
            return Err(StoreError::TooLarge {
                size: body.len(),
                limit: self.options.max_message_size,
            });
        }
        Ok(())
    }

    fn incoming_flags(&self, mut set: FlagSet) -> FlagSet {
        if self.options.suppress_recent {
            set.remove(flags::RECENT);
        }
        set
    }

    fn outgoing(&self, mut meta: MessageMeta) -> MessageMeta {
        if self.options.suppress_recent {
            meta.flags.remove(flags::RECENT);
        }
        meta
    }

    /// Whether the recipient address is known.
    ///
    /// In lookup-only mode this is the mapping table's membership answer. In
    /// full mode the resolved account must also exist in the index.
    pub async fn exists(&self, raw_address: &str) -> Result<bool> {
        let pipeline = self.resolver.pipeline(Purpose::Delivery);

        if self.is_lookup_only() {
            return pipeline.exists(raw_address).await;
        }

        let username = match pipeline.resolve(raw_address).await {
            Ok(username) => username,
            Err(StoreError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        match self.index.get_account(&username).await {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// The stored form of an account name, as `provision` keys it
    fn account_name(&self, raw_username: &str) -> Result<String> {
        self.resolver
            .pipeline(Purpose::Auth)
            .profile()
            .normalize(raw_username)
    }

    /// Create an account (and its INBOX) for a raw username
    pub async fn provision(&self, raw_username: &str) -> Result<Account> {
        self.require_mailboxes()?;
        let username = self.account_name(raw_username)?;
        self.index.create_account(&username, Utc::now()).await
    }

    /// Resolve a login name to its account and record the login.
    ///
    /// Credentials are verified by the caller before this is reached.
    pub async fn authenticate(&self, raw_username: &str) -> Result<Account> {
        self.require_mailboxes()?;
        let username = self.resolver.resolve(raw_username, Purpose::Auth).await?;
        let account = self.index.record_login(&username, Utc::now()).await?;
        debug!("Authenticated {} as {}", raw_username, account.username);
        Ok(account)
    }

    /// Deliver a message to the recipient's INBOX, or to the quarantine
    /// mailbox when `quarantine` is set.
    pub async fn deliver(
        &self,
        raw_recipient: &str,
        body: &[u8],
        quarantine: bool,
    ) -> Result<Delivered> {
        self.require_mailboxes()?;
        self.check_size(body)?;

        let username = self
            .resolver
            .resolve(raw_recipient, Purpose::Delivery)
            .await?;

        let mailbox = if quarantine {
            self.quarantine_mailbox(&username).await?
        } else {
            self.index.find_mailbox(&username, INBOX).await?.id
        };

        let mut initial = FlagSet::new();
        if !self.options.suppress_recent {
            initial.insert(flags::RECENT);
        }

        let (blob_key, appended) = self.store(mailbox, body, initial, Utc::now()).await?;

        info!(
            "Delivered {} bytes to {} mailbox {} as uid {}",
            body.len(),
            username,
            mailbox,
            appended.uid
        );

        Ok(Delivered {
            username,
            mailbox,
            uid: appended.uid,
            modseq: appended.modseq,
            blob_key,
        })
    }

    async fn quarantine_mailbox(&self, username: &str) -> Result<MailboxId> {
        let name = self.options.quarantine_mailbox.as_str();

        match self.index.find_mailbox(username, name).await {
            Ok(mailbox) => return Ok(mailbox.id),
            Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        match self
            .index
            .create_mailbox(username, name, Some(SpecialUse::Junk))
            .await
        {
            Ok(id) => Ok(id),
            // Created by a concurrent delivery
            Err(StoreError::AlreadyExists(_)) => {
                Ok(self.index.find_mailbox(username, name).await?.id)
            }
            Err(e) => Err(e),
        }
    }

    /// Append a message to a named mailbox of an account
    pub async fn append(
        &self,
        username: &str,
        mailbox: &str,
        body: &[u8],
        flag_set: FlagSet,
        received_at: Option<DateTime<Utc>>,
    ) -> Result<Appended> {
        self.require_mailboxes()?;
        self.check_size(body)?;

        let username = self.account_name(username)?;
        let mailbox = self.index.find_mailbox(&username, mailbox).await?;
        let (_, appended) = self
            .store(
                mailbox.id,
                body,
                self.incoming_flags(flag_set),
                received_at.unwrap_or_else(Utc::now),
            )
            .await?;
        Ok(appended)
    }

    /// Blob first, then the index row. A failed index write removes the
    /// blob again; if that fails too the reconciliation pass collects it.
    async fn store(
        &self,
        mailbox: MailboxId,
        body: &[u8],
        flag_set: FlagSet,
        received_at: DateTime<Utc>,
    ) -> Result<(BlobKey, Appended)> {
        let blob_key = self.blobs.put(body).await?;

        let message = NewMessage {
            flags: flag_set,
            size: body.len() as u64,
            blob_key: blob_key.clone(),
            received_at,
        };

        match self.index.append(mailbox, &message).await {
            Ok(appended) => Ok((blob_key, appended)),
            Err(e) => {
                if let Err(cleanup) = self.blobs.delete(&blob_key).await {
                    warn!(
                        "Failed to remove blob {} after aborted append: {}",
                        blob_key, cleanup
                    );
                }
                Err(e)
            }
        }
    }

    /// Message metadata and body
    pub async fn fetch(&self, mailbox: MailboxId, uid: Uid) -> Result<FetchedMessage> {
        self.require_mailboxes()?;

        let meta = self.index.get_message(mailbox, uid).await?;
        let body = match self.blobs.get(&meta.blob_key).await {
            Ok(body) => body,
            Err(StoreError::NotFound(_)) => {
                error!(
                    "Message {} in mailbox {} references missing blob {}",
                    uid, mailbox, meta.blob_key
                );
                return Err(StoreError::Inconsistent(format!(
                    "blob {} of message {} in mailbox {} is missing",
                    meta.blob_key, uid, mailbox
                )));
            }
            Err(e) => return Err(e),
        };

        Ok(FetchedMessage {
            meta: self.outgoing(meta),
            body,
        })
    }

    pub async fn list_messages(
        &self,
        mailbox: MailboxId,
        since_modseq: ModSeq,
    ) -> Result<Vec<MessageMeta>> {
        self.require_mailboxes()?;
        let messages = self.index.list_messages(mailbox, since_modseq).await?;
        Ok(messages.into_iter().map(|m| self.outgoing(m)).collect())
    }

    pub async fn set_flags(&self, mailbox: MailboxId, uid: Uid, delta: &FlagDelta) -> Result<ModSeq> {
        self.require_mailboxes()?;
        if self.options.suppress_recent {
            return self
                .index
                .set_flags(mailbox, uid, &delta.without(flags::RECENT))
                .await;
        }
        self.index.set_flags(mailbox, uid, delta).await
    }

    /// Expunge `\Deleted` messages, then delete the blobs they released
    pub async fn expunge(&self, mailbox: MailboxId, uids: &[Uid]) -> Result<Expunged> {
        self.require_mailboxes()?;
        let expunged = self.index.expunge(mailbox, uids).await?;
        blob::reclaim(self.blobs.as_ref(), &expunged.unreferenced).await;
        Ok(expunged)
    }

    pub async fn move_messages(
        &self,
        from: MailboxId,
        to: MailboxId,
        uids: &[Uid],
    ) -> Result<Vec<(Uid, Uid)>> {
        self.require_mailboxes()?;
        self.index.move_messages(from, to, uids).await
    }

    pub async fn create_mailbox(
        &self,
        username: &str,
        name: &str,
        special_use: Option<SpecialUse>,
    ) -> Result<MailboxId> {
        self.require_mailboxes()?;
        let username = self.account_name(username)?;
        self.index.create_mailbox(&username, name, special_use).await
    }

    pub async fn find_mailbox(&self, username: &str, name: &str) -> Result<Mailbox> {
        self.require_mailboxes()?;
        self.index.find_mailbox(&self.account_name(username)?, name).await
    }

    pub async fn list_mailboxes(&self, username: &str) -> Result<Vec<Mailbox>> {
        self.require_mailboxes()?;
        self.index.list_mailboxes(&self.account_name(username)?).await
    }

    pub async fn rename_mailbox(&self, username: &str, name: &str, new_name: &str) -> Result<()> {
        self.require_mailboxes()?;
        let mailbox = self.index.find_mailbox(&self.account_name(username)?, name).await?;
        self.index.rename_mailbox(mailbox.id, new_name).await
    }

    pub async fn delete_mailbox(&self, username: &str, name: &str) -> Result<()> {
        self.require_mailboxes()?;
        let mailbox = self.index.find_mailbox(&self.account_name(username)?, name).await?;
        let unreferenced = self.index.delete_mailbox(mailbox.id).await?;
        blob::reclaim(self.blobs.as_ref(), &unreferenced).await;
        Ok(())
    }

    /// Administrative account removal from the index and blob store
    pub async fn delete_account(&self, username: &str) -> Result<()> {
        self.require_mailboxes()?;
        let username = self.account_name(username)?;
        let unreferenced = self.index.delete_account(&username).await?;
        let reclaimed = blob::reclaim(self.blobs.as_ref(), &unreferenced).await;
        info!("Deleted account {}, {} blob(s) reclaimed", username, reclaimed);
        Ok(())
    }

    /// Delete every `\Seen` message of one account, or of all accounts
    pub async fn purge_read(&self, username: Option<&str>) -> Result<PurgeSummary> {
        self.purge(username, PurgeFilter::Seen).await
    }

    /// Delete every message of one account, or of all accounts
    pub async fn purge_all(&self, username: Option<&str>) -> Result<PurgeSummary> {
        self.purge(username, PurgeFilter::All).await
    }

    async fn purge(&self, username: Option<&str>, filter: PurgeFilter) -> Result<PurgeSummary> {
        self.require_mailboxes()?;

        let mailboxes = match username {
            Some(username) => {
                self.index
                    .list_mailboxes(&self.account_name(username)?)
                    .await?
            }
            None => self.index.list_all_mailboxes().await?,
        };

        let mut summary = PurgeSummary::default();
        for mailbox in mailboxes {
            let expunged = self.index.purge_messages(mailbox.id, filter).await?;
            if expunged.is_empty() {
                continue;
            }
            summary.mailboxes += 1;
            summary.messages += expunged.uids.len();
            summary.blobs_reclaimed +=
                blob::reclaim(self.blobs.as_ref(), &expunged.unreferenced).await;
        }

        info!(
            "Purged {} message(s) from {} mailbox(es) ({:?})",
            summary.messages, summary.mailboxes, filter
        );
        Ok(summary)
    }

    pub async fn stats(&self) -> Result<IndexStats> {
        self.require_mailboxes()?;
        self.index.stats().await
    }

    /// Retention engine sharing this engine's stores
    pub fn retention(
        &self,
        config: RetentionConfig,
        auth: Option<Arc<dyn AuthStore>>,
    ) -> Arc<RetentionEngine> {
        Arc::new(RetentionEngine::new(
            self.index.clone(),
            self.blobs.clone(),
            auth,
            config,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;
    use crate::index::SqliteDialect;
    use crate::mapping::StaticTable;
    use crate::normalize::Profile;
    use std::collections::HashMap;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn engine_with(options: EngineOptions, resolver: Resolver) -> (TempDir, Engine) {
        let dir = TempDir::new().unwrap();
        let dsn = format!("sqlite://{}?mode=rwc", dir.path().join("index.db").display());
        let index =
            SqlIndex::connect_with(Box::new(SqliteDialect), &dsn, 4, Duration::from_secs(5))
                .await
                .unwrap();
        let engine = Engine::new(
            Arc::new(index),
            Arc::new(MemoryBlobStore::new()),
            resolver,
            options,
        );
        (dir, engine)
    }

    #[tokio::test]
    async fn test_provision_normalizes_username() {
        let (_dir, engine) = engine_with(EngineOptions::default(), Resolver::default()).await;

        let account = engine.provision("Alice@EXAMPLE.org").await.unwrap();
        assert_eq!(account.username, "alice@example.org");
        assert!(engine.exists("ALICE@example.org").await.unwrap());
        assert!(!engine.exists("bob@example.org").await.unwrap());
    }

    #[tokio::test]
    async fn test_mailbox_operations_accept_raw_usernames() {
        let (_dir, engine) = engine_with(EngineOptions::default(), Resolver::default()).await;
        engine.provision("Alice@Example.org").await.unwrap();

        let appended = engine
            .append("Alice@Example.org", INBOX, b"hello", FlagSet::new(), None)
            .await
            .unwrap();
        assert_eq!(appended.uid, 1);

        engine
            .create_mailbox("ALICE@example.org", "Archive", None)
            .await
            .unwrap();
        let names: Vec<String> = engine
            .list_mailboxes("Alice@Example.org")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert_eq!(names, vec!["Archive".to_string(), INBOX.to_string()]);

        let inbox = engine.find_mailbox("alice@EXAMPLE.org", INBOX).await.unwrap();
        assert_eq!(inbox.next_uid, 2);

        engine.delete_account("Alice@Example.org").await.unwrap();
        assert!(engine
            .index()
            .get_account("alice@example.org")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_authenticate_records_first_login() {
        let (_dir, engine) = engine_with(EngineOptions::default(), Resolver::default()).await;
        engine.provision("alice@example.org").await.unwrap();

        let first = engine.authenticate("Alice@example.org").await.unwrap();
        let first_login = first.first_login_at.unwrap();
        let again = engine.authenticate("alice@example.org").await.unwrap();
        assert_eq!(again.first_login_at, Some(first_login));

        assert!(engine
            .authenticate("nobody@example.org")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_recent_flag_toggle() {
        let (_dir, engine) = engine_with(EngineOptions::default(), Resolver::default()).await;
        engine.provision("alice@example.org").await.unwrap();

        let delivered = engine
            .deliver("alice@example.org", b"body", false)
            .await
            .unwrap();
        let fetched = engine.fetch(delivered.mailbox, delivered.uid).await.unwrap();
        assert!(!fetched.meta.flags.contains(flags::RECENT));

        let options = EngineOptions {
            suppress_recent: false,
            ..EngineOptions::default()
        };
        let (_dir2, engine) = engine_with(options, Resolver::default()).await;
        engine.provision("alice@example.org").await.unwrap();
        let delivered = engine
            .deliver("alice@example.org", b"body", false)
            .await
            .unwrap();
        let fetched = engine.fetch(delivered.mailbox, delivered.uid).await.unwrap();
        assert!(fetched.meta.flags.contains(flags::RECENT));
    }

    #[tokio::test]
    async fn test_delivery_through_alias_table() {
        let mut entries = HashMap::new();
        entries.insert(
            "postmaster@example.org".to_string(),
            "alice@example.org".to_string(),
        );
        let resolver = Resolver::new(
            Pipeline::new(Profile::CasefoldEmail, Arc::new(StaticTable::new(entries))),
            Pipeline::identity(Profile::CasefoldEmail),
        );
        let (_dir, engine) = engine_with(EngineOptions::default(), resolver).await;
        engine.provision("alice@example.org").await.unwrap();

        let delivered = engine
            .deliver("PostMaster@example.org", b"report", false)
            .await
            .unwrap();
        assert_eq!(delivered.username, "alice@example.org");

        assert!(engine
            .deliver("unknown@example.org", b"x", false)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_purge_read_keeps_unseen() {
        let (_dir, engine) = engine_with(EngineOptions::default(), Resolver::default()).await;
        engine.provision("alice@example.org").await.unwrap();

        engine
            .append("alice@example.org", INBOX, b"read", FlagSet::parse("\\Seen"), None)
            .await
            .unwrap();
        engine
            .append("alice@example.org", INBOX, b"unread", FlagSet::new(), None)
            .await
            .unwrap();

        let summary = engine.purge_read(Some("alice@example.org")).await.unwrap();
        assert_eq!(summary.messages, 1);
        assert_eq!(summary.blobs_reclaimed, 1);

        let stats = engine.stats().await.unwrap();
        assert_eq!(stats.messages, 1);
        assert_eq!(stats.total_size, 6);

        let summary = engine.purge_all(None).await.unwrap();
        assert_eq!(summary.messages, 1);
    }
}

//! SQL implementation of [`MailIndex`] over SQLite, PostgreSQL or MySQL
//!
//! Every write transaction starts by locking the mailbox (or account) row it
//! changes, reads what it is about to touch and only then writes, so the
//! same statements work on backends without `RETURNING`.

use super::dialect::{self, Dialect};
use super::types::*;
use super::MailIndex;
use crate::blob::BlobKey;
use crate::config::IndexConfig;
use crate::error::{Result, StoreError};
use chrono::{DateTime, Utc};
use sqlx::any::AnyPoolOptions;
use sqlx::{AnyConnection, AnyPool};
use std::borrow::Cow;
use std::collections::{BTreeSet, HashSet};
use std::time::Duration;
use tracing::{debug, info};

// NULL columns are read through COALESCE: the Any driver cannot decode a
// SQLite NULL into an Option
const MAILBOX_COLUMNS: &str = "id, account_id, name, uid_validity, next_uid, highest_modseq, \
                               COALESCE(special_use, '') AS special_use, \
                               COALESCE(max_age_secs, -1) AS max_age_secs, created_at";

const MESSAGE_COLUMNS: &str = "mailbox_id, uid, modseq, flags, size, blob_key, received_at";

const ALLOCATE_UID_MODSEQ: &str = "UPDATE mailboxes \
     SET next_uid = next_uid + 1, highest_modseq = highest_modseq + 1 WHERE id = $1";

const READ_UID_MODSEQ: &str = "SELECT next_uid - 1, highest_modseq FROM mailboxes WHERE id = $1";

const ALLOCATE_MODSEQ: &str =
    "UPDATE mailboxes SET highest_modseq = highest_modseq + 1 WHERE id = $1";

const READ_MODSEQ: &str = "SELECT highest_modseq FROM mailboxes WHERE id = $1";

const ALLOCATE_UID_VALIDITY: &str = "UPDATE store_meta \
     SET value = CASE WHEN value < $1 THEN $2 ELSE value + 1 END \
     WHERE name = 'uid_validity'";

const READ_UID_VALIDITY: &str = "SELECT value FROM store_meta WHERE name = 'uid_validity'";

const INSERT_MESSAGE: &str = "INSERT INTO messages \
     (mailbox_id, uid, modseq, flags, is_seen, is_deleted, size, blob_key, received_at) \
     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)";

#[derive(sqlx::FromRow)]
struct AccountRow {
    id: i64,
    username: String,
    created_at: i64,
    first_login_at: i64,
}

#[derive(sqlx::FromRow)]
struct MailboxRow {
    id: i64,
    account_id: i64,
    name: String,
    uid_validity: i64,
    next_uid: i64,
    highest_modseq: i64,
    /// Empty when unset
    special_use: String,
    /// Negative when unset
    max_age_secs: i64,
    created_at: i64,
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    mailbox_id: i64,
    uid: i64,
    modseq: i64,
    flags: String,
    size: i64,
    blob_key: String,
    received_at: i64,
}

fn to_unix(t: DateTime<Utc>) -> i64 {
    t.timestamp()
}

fn from_unix(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

impl From<AccountRow> for Account {
    fn from(row: AccountRow) -> Self {
        Account {
            id: row.id,
            username: row.username,
            created_at: from_unix(row.created_at),
            first_login_at: (row.first_login_at > 0).then(|| from_unix(row.first_login_at)),
        }
    }
}

impl From<MailboxRow> for Mailbox {
    fn from(row: MailboxRow) -> Self {
        Mailbox {
            id: MailboxId(row.id),
            account_id: row.account_id,
            name: row.name,
            uid_validity: u32::try_from(row.uid_validity).unwrap_or(u32::MAX),
            next_uid: Uid::try_from(row.next_uid).unwrap_or(Uid::MAX),
            highest_modseq: row.highest_modseq.max(0) as ModSeq,
            special_use: SpecialUse::parse(&row.special_use),
            max_age: (row.max_age_secs >= 0).then(|| Duration::from_secs(row.max_age_secs as u64)),
            created_at: from_unix(row.created_at),
        }
    }
}

impl From<MessageRow> for MessageMeta {
    fn from(row: MessageRow) -> Self {
        MessageMeta {
            mailbox_id: MailboxId(row.mailbox_id),
            uid: row.uid as Uid,
            modseq: row.modseq as ModSeq,
            flags: FlagSet::parse(&row.flags),
            size: row.size.max(0) as u64,
            blob_key: BlobKey::new(row.blob_key),
            received_at: from_unix(row.received_at),
        }
    }
}

/// Which rows a removal transaction deletes
enum Removal<'a> {
    /// `\Deleted` messages among the UIDs, or all `\Deleted` ones if empty
    Deleted(&'a [Uid]),
    ReceivedBefore(i64),
    Purge(PurgeFilter),
}

impl Removal<'_> {
    /// Condition appended to `mailbox_id = $1`, with the values for `$2..`
    fn condition(&self) -> (String, Vec<i64>) {
        match self {
            Removal::Deleted(uids) if uids.is_empty() => {
                (" AND is_deleted = 1".to_string(), Vec::new())
            }
            Removal::Deleted(uids) => {
                let placeholders: Vec<String> =
                    (0..uids.len()).map(|i| format!("${}", i + 2)).collect();
                (
                    format!(" AND is_deleted = 1 AND uid IN ({})", placeholders.join(", ")),
                    uids.iter().map(|uid| *uid as i64).collect(),
                )
            }
            Removal::ReceivedBefore(cutoff) => (" AND received_at < $2".to_string(), vec![*cutoff]),
            Removal::Purge(PurgeFilter::Seen) => (" AND is_seen = 1".to_string(), Vec::new()),
            Removal::Purge(PurgeFilter::All) => (String::new(), Vec::new()),
        }
    }
}

/// Relational index backed by SQLite, PostgreSQL or MySQL
pub struct SqlIndex {
    pool: AnyPool,
    dialect: Box<dyn Dialect>,
}

impl SqlIndex {
    /// Connect using the `[index]` configuration section and create the
    /// schema if needed.
    pub async fn connect(config: &IndexConfig) -> Result<Self> {
        let dialect = dialect::for_driver(&config.driver)?;
        Self::connect_with(
            dialect,
            &config.dsn,
            config.max_connections,
            config.lock_timeout(),
        )
        .await
    }

    pub async fn connect_with(
        dialect: Box<dyn Dialect>,
        dsn: &str,
        max_connections: u32,
        lock_timeout: Duration,
    ) -> Result<Self> {
        sqlx::any::install_default_drivers();

        let setup = dialect.session_setup(lock_timeout);
        let pool = AnyPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(lock_timeout.max(Duration::from_secs(1)))
            .after_connect(move |conn, _meta| {
                let setup = setup.clone();
                Box::pin(async move {
                    for statement in &setup {
                        sqlx::query(statement.as_str()).execute(&mut *conn).await?;
                    }
                    Ok(())
                })
            })
            .connect(dsn)
            .await?;

        let index = SqlIndex { pool, dialect };
        index.initialize().await?;

        info!("Opened {} mailbox index", index.dialect.name());
        Ok(index)
    }

    async fn initialize(&self) -> Result<()> {
        for statement in self.dialect.schema() {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn backend(&self) -> &'static str {
        self.dialect.name()
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn sql<'a>(&self, text: &'a str) -> Cow<'a, str> {
        self.dialect.sql(text)
    }

    async fn lock_mailbox(&self, conn: &mut AnyConnection, id: MailboxId) -> Result<()> {
        let locked: Option<(i64,)> = sqlx::query_as(&self.sql(self.dialect.lock_mailbox()))
            .bind(id.0)
            .fetch_optional(&mut *conn)
            .await?;
        locked
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("mailbox {}", id)))
    }

    async fn lock_account(&self, conn: &mut AnyConnection, username: &str) -> Result<i64> {
        let locked: Option<(i64,)> = sqlx::query_as(&self.sql(self.dialect.lock_account()))
            .bind(username)
            .fetch_optional(&mut *conn)
            .await?;
        locked
            .map(|(id,)| id)
            .ok_or_else(|| StoreError::NotFound(format!("account {}", username)))
    }

    async fn fetch_mailbox(&self, conn: &mut AnyConnection, id: MailboxId) -> Result<Mailbox> {
        let sql = format!("SELECT {} FROM mailboxes WHERE id = $1", MAILBOX_COLUMNS);
        let row: Option<MailboxRow> = sqlx::query_as(&self.sql(&sql))
            .bind(id.0)
            .fetch_optional(&mut *conn)
            .await?;
        row.map(Mailbox::from)
            .ok_or_else(|| StoreError::NotFound(format!("mailbox {}", id)))
    }

    async fn account_id(&self, username: &str) -> Result<i64> {
        let row: Option<(i64,)> =
            sqlx::query_as(&self.sql("SELECT id FROM accounts WHERE username = $1"))
                .bind(username)
                .fetch_optional(&self.pool)
                .await?;
        row.map(|(id,)| id)
            .ok_or_else(|| StoreError::NotFound(format!("account {}", username)))
    }

    async fn allocate_modseq(&self, conn: &mut AnyConnection, id: MailboxId) -> Result<ModSeq> {
        sqlx::query(&self.sql(ALLOCATE_MODSEQ))
            .bind(id.0)
            .execute(&mut *conn)
            .await?;

        let row: Option<(i64,)> = sqlx::query_as(&self.sql(READ_MODSEQ))
            .bind(id.0)
            .fetch_optional(&mut *conn)
            .await?;
        row.map(|(modseq,)| modseq as ModSeq)
            .ok_or_else(|| StoreError::NotFound(format!("mailbox {}", id)))
    }

    async fn allocate_uid_modseq(&self, conn: &mut AnyConnection, id: MailboxId) -> Result<Appended> {
        sqlx::query(&self.sql(ALLOCATE_UID_MODSEQ))
            .bind(id.0)
            .execute(&mut *conn)
            .await?;

        let row: Option<(i64, i64)> = sqlx::query_as(&self.sql(READ_UID_MODSEQ))
            .bind(id.0)
            .fetch_optional(&mut *conn)
            .await?;
        let (uid, modseq) =
            row.ok_or_else(|| StoreError::NotFound(format!("mailbox {}", id)))?;

        let uid = Uid::try_from(uid).map_err(|_| {
            StoreError::Database(format!("mailbox {} has exhausted its UID space", id))
        })?;

        Ok(Appended {
            uid,
            modseq: modseq as ModSeq,
        })
    }

    async fn allocate_uid_validity(&self, conn: &mut AnyConnection, now: DateTime<Utc>) -> Result<u32> {
        sqlx::query(&self.sql(ALLOCATE_UID_VALIDITY))
            .bind(to_unix(now))
            .bind(to_unix(now))
            .execute(&mut *conn)
            .await?;

        let (value,): (i64,) = sqlx::query_as(READ_UID_VALIDITY)
            .fetch_one(&mut *conn)
            .await?;
        u32::try_from(value)
            .map_err(|_| StoreError::Database(format!("UIDVALIDITY {} out of range", value)))
    }

    async fn insert_mailbox(
        &self,
        conn: &mut AnyConnection,
        account_id: i64,
        name: &str,
        special_use: Option<SpecialUse>,
        now: DateTime<Utc>,
    ) -> Result<MailboxId> {
        let uid_validity = self.allocate_uid_validity(conn, now).await?;

        sqlx::query(&self.sql(
            "INSERT INTO mailboxes \
             (account_id, name, uid_validity, next_uid, highest_modseq, special_use, max_age_secs, created_at) \
             VALUES ($1, $2, $3, 1, 0, $4, NULL, $5)",
        ))
        .bind(account_id)
        .bind(name)
        .bind(uid_validity as i64)
        .bind(special_use.map(|s| s.as_str()))
        .bind(to_unix(now))
        .execute(&mut *conn)
        .await?;

        let (id,): (i64,) = sqlx::query_as(&self.sql(
            "SELECT id FROM mailboxes WHERE account_id = $1 AND name = $2",
        ))
        .bind(account_id)
        .bind(name)
        .fetch_one(&mut *conn)
        .await?;

        Ok(MailboxId(id))
    }

    async fn insert_message(
        &self,
        conn: &mut AnyConnection,
        id: MailboxId,
        slot: Appended,
        flags: &FlagSet,
        size: i64,
        blob_key: &str,
        received_at: i64,
    ) -> Result<()> {
        sqlx::query(&self.sql(INSERT_MESSAGE))
            .bind(id.0)
            .bind(slot.uid as i64)
            .bind(slot.modseq as i64)
            .bind(flags.to_stored())
            .bind(flags.is_seen() as i64)
            .bind(flags.is_deleted() as i64)
            .bind(size)
            .bind(blob_key)
            .bind(received_at)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Keep only the keys no remaining message row points at
    async fn unreferenced(
        &self,
        conn: &mut AnyConnection,
        keys: impl IntoIterator<Item = String>,
    ) -> Result<Vec<BlobKey>> {
        let candidates: BTreeSet<String> = keys.into_iter().collect();
        let mut unreferenced = Vec::new();

        for key in candidates {
            let (count,): (i64,) =
                sqlx::query_as(&self.sql("SELECT COUNT(*) FROM messages WHERE blob_key = $1"))
                    .bind(key.as_str())
                    .fetch_one(&mut *conn)
                    .await?;
            if count == 0 {
                unreferenced.push(BlobKey::new(key));
            }
        }

        Ok(unreferenced)
    }

    async fn remove_messages(&self, id: MailboxId, removal: Removal<'_>) -> Result<Expunged> {
        let mut tx = self.pool.begin().await?;
        let modseq = self.allocate_modseq(&mut tx, id).await?;

        let (condition, values) = removal.condition();
        let select = format!(
            "SELECT uid, blob_key FROM messages WHERE mailbox_id = $1{}",
            condition
        );
        let select = self.sql(&select);
        let mut query = sqlx::query_as::<_, (i64, String)>(&select).bind(id.0);
        for value in &values {
            query = query.bind(*value);
        }
        let removed = query.fetch_all(&mut *tx).await?;

        if removed.is_empty() {
            // Nothing changed, give the modseq back
            tx.rollback().await?;
            return Ok(Expunged::default());
        }

        let delete = format!("DELETE FROM messages WHERE mailbox_id = $1{}", condition);
        let delete = self.sql(&delete);
        let mut query = sqlx::query(&delete).bind(id.0);
        for value in &values {
            query = query.bind(*value);
        }
        query.execute(&mut *tx).await?;

        let mut uids: Vec<Uid> = removed.iter().map(|(uid, _)| *uid as Uid).collect();
        uids.sort_unstable();

        let unreferenced = self
            .unreferenced(&mut tx, removed.into_iter().map(|(_, key)| key))
            .await?;
        tx.commit().await?;

        debug!(
            "Removed {} message(s) from mailbox {} at modseq {}, {} blob(s) unreferenced",
            uids.len(),
            id,
            modseq,
            unreferenced.len()
        );

        Ok(Expunged {
            uids,
            modseq: Some(modseq),
            unreferenced,
        })
    }

    /// Delete everything of a locked account, returning the released keys
    async fn remove_account(
        &self,
        conn: &mut AnyConnection,
        account_id: i64,
    ) -> Result<(usize, Vec<BlobKey>)> {
        // Appends in flight hold mailbox locks, wait for them
        sqlx::query(&self.sql(self.dialect.lock_account_mailboxes()))
            .bind(account_id)
            .execute(&mut *conn)
            .await?;

        let removed: Vec<(String,)> = sqlx::query_as(&self.sql(
            "SELECT blob_key FROM messages WHERE mailbox_id IN \
             (SELECT id FROM mailboxes WHERE account_id = $1)",
        ))
        .bind(account_id)
        .fetch_all(&mut *conn)
        .await?;

        sqlx::query(&self.sql(
            "DELETE FROM messages WHERE mailbox_id IN \
             (SELECT id FROM mailboxes WHERE account_id = $1)",
        ))
        .bind(account_id)
        .execute(&mut *conn)
        .await?;
        sqlx::query(&self.sql("DELETE FROM mailboxes WHERE account_id = $1"))
            .bind(account_id)
            .execute(&mut *conn)
            .await?;
        sqlx::query(&self.sql("DELETE FROM accounts WHERE id = $1"))
            .bind(account_id)
            .execute(&mut *conn)
            .await?;

        let message_count = removed.len();
        let unreferenced = self
            .unreferenced(conn, removed.into_iter().map(|(key,)| key))
            .await?;
        Ok((message_count, unreferenced))
    }
}

#[async_trait::async_trait]
impl MailIndex for SqlIndex {
    async fn create_account(&self, username: &str, created_at: DateTime<Utc>) -> Result<Account> {
        let mut tx = self.pool.begin().await?;

        // The insert comes first so SQLite takes the write lock immediately
        sqlx::query(&self.sql(
            "INSERT INTO accounts (username, created_at, first_login_at) VALUES ($1, $2, 0)",
        ))
        .bind(username)
        .bind(to_unix(created_at))
        .execute(&mut *tx)
        .await
        .map_err(|e| match StoreError::from(e) {
            StoreError::AlreadyExists(_) => {
                StoreError::AlreadyExists(format!("account {}", username))
            }
            other => other,
        })?;

        let (id,): (i64,) =
            sqlx::query_as(&self.sql("SELECT id FROM accounts WHERE username = $1"))
                .bind(username)
                .fetch_one(&mut *tx)
                .await?;

        self.insert_mailbox(&mut tx, id, INBOX, None, created_at)
            .await?;
        tx.commit().await?;

        info!("Created account {}", username);

        Ok(Account {
            id,
            username: username.to_string(),
            created_at: from_unix(to_unix(created_at)),
            first_login_at: None,
        })
    }

    async fn get_account(&self, username: &str) -> Result<Account> {
        let row: Option<AccountRow> = sqlx::query_as(&self.sql(
            "SELECT id, username, created_at, first_login_at FROM accounts WHERE username = $1",
        ))
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Account::from)
            .ok_or_else(|| StoreError::NotFound(format!("account {}", username)))
    }

    async fn list_accounts(&self) -> Result<Vec<Account>> {
        let rows: Vec<AccountRow> = sqlx::query_as(
            "SELECT id, username, created_at, first_login_at FROM accounts ORDER BY username",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Account::from).collect())
    }

    async fn record_login(&self, username: &str, at: DateTime<Utc>) -> Result<Account> {
        sqlx::query(&self.sql(
            "UPDATE accounts SET first_login_at = $1 WHERE username = $2 AND first_login_at = 0",
        ))
        .bind(to_unix(at).max(1))
        .bind(username)
        .execute(&self.pool)
        .await?;

        self.get_account(username).await
    }

    async fn delete_account(&self, username: &str) -> Result<Vec<BlobKey>> {
        let mut tx = self.pool.begin().await?;
        let account_id = self.lock_account(&mut tx, username).await?;

        let (message_count, unreferenced) = self.remove_account(&mut tx, account_id).await?;
        tx.commit().await?;

        info!(
            "Deleted account {} with {} message(s)",
            username, message_count
        );
        Ok(unreferenced)
    }

    async fn delete_account_if_unused(&self, username: &str) -> Result<Option<Vec<BlobKey>>> {
        let mut tx = self.pool.begin().await?;
        let account_id = self.lock_account(&mut tx, username).await?;

        let (first_login_at,): (i64,) =
            sqlx::query_as(&self.sql("SELECT first_login_at FROM accounts WHERE id = $1"))
                .bind(account_id)
                .fetch_one(&mut *tx)
                .await?;
        if first_login_at > 0 {
            tx.rollback().await?;
            debug!("Account {} logged in meanwhile, keeping it", username);
            return Ok(None);
        }

        let (message_count, unreferenced) = self.remove_account(&mut tx, account_id).await?;
        tx.commit().await?;

        info!(
            "Deleted unused account {} with {} message(s)",
            username, message_count
        );
        Ok(Some(unreferenced))
    }

    async fn create_mailbox(
        &self,
        username: &str,
        name: &str,
        special_use: Option<SpecialUse>,
    ) -> Result<MailboxId> {
        let name = canonical_mailbox_name(name)?;

        let mut tx = self.pool.begin().await?;
        let account_id = self.lock_account(&mut tx, username).await?;

        let existing: Option<(i64,)> = sqlx::query_as(&self.sql(
            "SELECT id FROM mailboxes WHERE account_id = $1 AND name = $2",
        ))
        .bind(account_id)
        .bind(name.as_str())
        .fetch_optional(&mut *tx)
        .await?;
        if existing.is_some() {
            return Err(StoreError::AlreadyExists(format!(
                "mailbox {} of {}",
                name, username
            )));
        }

        let id = self
            .insert_mailbox(&mut tx, account_id, &name, special_use, Utc::now())
            .await?;
        tx.commit().await?;

        info!("Created mailbox {} for {}", name, username);
        Ok(id)
    }

    async fn find_mailbox(&self, username: &str, name: &str) -> Result<Mailbox> {
        let name = canonical_mailbox_name(name)?;
        let sql = format!(
            "SELECT {} FROM mailboxes \
             WHERE account_id = (SELECT id FROM accounts WHERE username = $1) AND name = $2",
            MAILBOX_COLUMNS
        );

        let row: Option<MailboxRow> = sqlx::query_as(&self.sql(&sql))
            .bind(username)
            .bind(name.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.map(Mailbox::from)
            .ok_or_else(|| StoreError::NotFound(format!("mailbox {} of {}", name, username)))
    }

    async fn get_mailbox(&self, id: MailboxId) -> Result<Mailbox> {
        let mut conn = self.pool.acquire().await?;
        self.fetch_mailbox(&mut conn, id).await
    }

    async fn list_mailboxes(&self, username: &str) -> Result<Vec<Mailbox>> {
        let account_id = self.account_id(username).await?;
        let sql = format!(
            "SELECT {} FROM mailboxes WHERE account_id = $1 ORDER BY name",
            MAILBOX_COLUMNS
        );

        let rows: Vec<MailboxRow> = sqlx::query_as(&self.sql(&sql))
            .bind(account_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(Mailbox::from).collect())
    }

    async fn list_all_mailboxes(&self) -> Result<Vec<Mailbox>> {
        let sql = format!("SELECT {} FROM mailboxes ORDER BY id", MAILBOX_COLUMNS);
        let rows: Vec<MailboxRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(Mailbox::from).collect())
    }

    async fn rename_mailbox(&self, id: MailboxId, new_name: &str) -> Result<()> {
        let new_name = canonical_mailbox_name(new_name)?;

        let mut tx = self.pool.begin().await?;
        self.lock_mailbox(&mut tx, id).await?;
        let mailbox = self.fetch_mailbox(&mut tx, id).await?;

        if mailbox.is_inbox() {
            return Err(StoreError::InvalidName("INBOX cannot be renamed".to_string()));
        }
        if mailbox.name == new_name {
            return Ok(());
        }

        let old_prefix = format!("{}{}", mailbox.name, HIERARCHY_SEPARATOR);
        if new_name.starts_with(&old_prefix) {
            return Err(StoreError::InvalidName(format!(
                "cannot move {} below itself",
                mailbox.name
            )));
        }

        let taken: Option<(i64,)> = sqlx::query_as(&self.sql(
            "SELECT id FROM mailboxes WHERE account_id = $1 AND name = $2",
        ))
        .bind(mailbox.account_id)
        .bind(new_name.as_str())
        .fetch_optional(&mut *tx)
        .await?;
        if taken.is_some() {
            return Err(StoreError::AlreadyExists(format!("mailbox {}", new_name)));
        }

        let siblings: Vec<(i64, String)> =
            sqlx::query_as(&self.sql("SELECT id, name FROM mailboxes WHERE account_id = $1"))
                .bind(mailbox.account_id)
                .fetch_all(&mut *tx)
                .await?;

        let mut renames = vec![(id.0, new_name.clone())];
        for (child_id, child_name) in siblings {
            if let Some(rest) = child_name.strip_prefix(&old_prefix) {
                renames.push((
                    child_id,
                    format!("{}{}{}", new_name, HIERARCHY_SEPARATOR, rest),
                ));
            }
        }

        for (mailbox_id, name) in &renames {
            sqlx::query(&self.sql("UPDATE mailboxes SET name = $1 WHERE id = $2"))
                .bind(name.as_str())
                .bind(*mailbox_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        info!(
            "Renamed mailbox {} to {} ({} child mailbox(es))",
            mailbox.name,
            new_name,
            renames.len() - 1
        );
        Ok(())
    }

    async fn delete_mailbox(&self, id: MailboxId) -> Result<Vec<BlobKey>> {
        let mut tx = self.pool.begin().await?;
        self.lock_mailbox(&mut tx, id).await?;
        let mailbox = self.fetch_mailbox(&mut tx, id).await?;

        if mailbox.is_inbox() {
            return Err(StoreError::InvalidName("INBOX cannot be deleted".to_string()));
        }

        let removed: Vec<(String,)> =
            sqlx::query_as(&self.sql("SELECT blob_key FROM messages WHERE mailbox_id = $1"))
                .bind(id.0)
                .fetch_all(&mut *tx)
                .await?;
        sqlx::query(&self.sql("DELETE FROM messages WHERE mailbox_id = $1"))
            .bind(id.0)
            .execute(&mut *tx)
            .await?;
        sqlx::query(&self.sql("DELETE FROM mailboxes WHERE id = $1"))
            .bind(id.0)
            .execute(&mut *tx)
            .await?;

        let unreferenced = self
            .unreferenced(&mut tx, removed.into_iter().map(|(key,)| key))
            .await?;
        tx.commit().await?;

        info!("Deleted mailbox {} ({})", mailbox.name, id);
        Ok(unreferenced)
    }

    async fn set_mailbox_retention(&self, id: MailboxId, max_age: Option<Duration>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        self.lock_mailbox(&mut tx, id).await?;

        sqlx::query(&self.sql("UPDATE mailboxes SET max_age_secs = $1 WHERE id = $2"))
            .bind(max_age.map(|d| d.as_secs().min(i64::MAX as u64) as i64))
            .bind(id.0)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn renew_uid_validity(&self, id: MailboxId) -> Result<u32> {
        let mut tx = self.pool.begin().await?;
        self.lock_mailbox(&mut tx, id).await?;

        let uid_validity = self.allocate_uid_validity(&mut tx, Utc::now()).await?;
        sqlx::query(&self.sql("UPDATE mailboxes SET uid_validity = $1 WHERE id = $2"))
            .bind(uid_validity as i64)
            .bind(id.0)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!("Mailbox {} entered UIDVALIDITY epoch {}", id, uid_validity);
        Ok(uid_validity)
    }

    async fn append(&self, id: MailboxId, message: &NewMessage) -> Result<Appended> {
        let mut tx = self.pool.begin().await?;

        let slot = self.allocate_uid_modseq(&mut tx, id).await?;
        self.insert_message(
            &mut tx,
            id,
            slot,
            &message.flags,
            message.size as i64,
            message.blob_key.as_str(),
            to_unix(message.received_at),
        )
        .await?;
        tx.commit().await?;

        debug!(
            "Appended uid {} modseq {} to mailbox {}",
            slot.uid, slot.modseq, id
        );
        Ok(slot)
    }

    async fn set_flags(&self, id: MailboxId, uid: Uid, delta: &FlagDelta) -> Result<ModSeq> {
        let mut tx = self.pool.begin().await?;
        let modseq = self.allocate_modseq(&mut tx, id).await?;

        let current: Option<(String,)> = sqlx::query_as(&self.sql(
            "SELECT flags FROM messages WHERE mailbox_id = $1 AND uid = $2",
        ))
        .bind(id.0)
        .bind(uid as i64)
        .fetch_optional(&mut *tx)
        .await?;
        // Dropping the transaction here rolls the modseq allocation back
        let (current,) = current
            .ok_or_else(|| StoreError::NotFound(format!("message {} in mailbox {}", uid, id)))?;

        let next = delta.apply(&FlagSet::parse(&current));
        sqlx::query(&self.sql(
            "UPDATE messages SET flags = $1, is_seen = $2, is_deleted = $3, modseq = $4 \
             WHERE mailbox_id = $5 AND uid = $6",
        ))
        .bind(next.to_stored())
        .bind(next.is_seen() as i64)
        .bind(next.is_deleted() as i64)
        .bind(modseq as i64)
        .bind(id.0)
        .bind(uid as i64)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        debug!("Set flags of uid {} in mailbox {} at modseq {}", uid, id, modseq);
        Ok(modseq)
    }

    async fn expunge(&self, id: MailboxId, uids: &[Uid]) -> Result<Expunged> {
        self.remove_messages(id, Removal::Deleted(uids)).await
    }

    async fn move_messages(
        &self,
        from: MailboxId,
        to: MailboxId,
        uids: &[Uid],
    ) -> Result<Vec<(Uid, Uid)>> {
        let mut tx = self.pool.begin().await?;

        // Fixed lock order so two opposite moves cannot deadlock
        let mut lock_order = vec![from, to];
        lock_order.sort();
        lock_order.dedup();
        for id in lock_order {
            self.lock_mailbox(&mut tx, id).await?;
        }

        let source = self.fetch_mailbox(&mut tx, from).await?;
        let target = self.fetch_mailbox(&mut tx, to).await?;
        if source.account_id != target.account_id {
            return Err(StoreError::NotFound(format!(
                "mailbox {} in the account of mailbox {}",
                to, from
            )));
        }

        let select = format!(
            "SELECT {} FROM messages WHERE mailbox_id = $1 AND uid = $2",
            MESSAGE_COLUMNS
        );
        let select = self.sql(&select);
        let delete = self.sql("DELETE FROM messages WHERE mailbox_id = $1 AND uid = $2");

        let mut moved = Vec::new();
        for &uid in uids {
            let row: Option<MessageRow> = sqlx::query_as(&select)
                .bind(from.0)
                .bind(uid as i64)
                .fetch_optional(&mut *tx)
                .await?;
            let Some(row) = row else {
                continue;
            };

            sqlx::query(&delete)
                .bind(from.0)
                .bind(uid as i64)
                .execute(&mut *tx)
                .await?;

            let slot = self.allocate_uid_modseq(&mut tx, to).await?;
            self.insert_message(
                &mut tx,
                to,
                slot,
                &FlagSet::parse(&row.flags),
                row.size,
                &row.blob_key,
                row.received_at,
            )
            .await?;
            moved.push((uid, slot.uid));
        }

        if moved.is_empty() {
            tx.rollback().await?;
            return Ok(moved);
        }

        if from != to {
            self.allocate_modseq(&mut tx, from).await?;
        }
        tx.commit().await?;

        debug!(
            "Moved {} message(s) from mailbox {} to {}",
            moved.len(),
            from,
            to
        );
        Ok(moved)
    }

    async fn get_message(&self, id: MailboxId, uid: Uid) -> Result<MessageMeta> {
        let sql = format!(
            "SELECT {} FROM messages WHERE mailbox_id = $1 AND uid = $2",
            MESSAGE_COLUMNS
        );
        let row: Option<MessageRow> = sqlx::query_as(&self.sql(&sql))
            .bind(id.0)
            .bind(uid as i64)
            .fetch_optional(&self.pool)
            .await?;

        row.map(MessageMeta::from)
            .ok_or_else(|| StoreError::NotFound(format!("message {} in mailbox {}", uid, id)))
    }

    async fn list_messages(&self, id: MailboxId, since_modseq: ModSeq) -> Result<Vec<MessageMeta>> {
        let mut tx = self.pool.begin().await?;

        let exists: Option<(i64,)> =
            sqlx::query_as(&self.sql("SELECT id FROM mailboxes WHERE id = $1"))
                .bind(id.0)
                .fetch_optional(&mut *tx)
                .await?;
        if exists.is_none() {
            return Err(StoreError::NotFound(format!("mailbox {}", id)));
        }

        let sql = format!(
            "SELECT {} FROM messages WHERE mailbox_id = $1 AND modseq > $2 ORDER BY uid",
            MESSAGE_COLUMNS
        );
        let rows: Vec<MessageRow> = sqlx::query_as(&self.sql(&sql))
            .bind(id.0)
            .bind(i64::try_from(since_modseq).unwrap_or(i64::MAX))
            .fetch_all(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(rows.into_iter().map(MessageMeta::from).collect())
    }

    async fn expire_messages(&self, id: MailboxId, cutoff: DateTime<Utc>) -> Result<Expunged> {
        self.remove_messages(id, Removal::ReceivedBefore(to_unix(cutoff)))
            .await
    }

    async fn purge_messages(&self, id: MailboxId, filter: PurgeFilter) -> Result<Expunged> {
        self.remove_messages(id, Removal::Purge(filter)).await
    }

    async fn referenced_blob_keys(&self) -> Result<HashSet<BlobKey>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT DISTINCT blob_key FROM messages")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(key,)| BlobKey::new(key)).collect())
    }

    async fn stats(&self) -> Result<IndexStats> {
        let sql = format!(
            "SELECT \
                (SELECT COUNT(*) FROM accounts), \
                (SELECT COUNT(*) FROM mailboxes), \
                (SELECT COUNT(*) FROM messages), \
                (SELECT CAST(COALESCE(SUM(size), 0) AS {}) FROM messages)",
            self.dialect.integer_cast()
        );
        let (accounts, mailboxes, messages, total_size): (i64, i64, i64, i64) =
            sqlx::query_as(&sql).fetch_one(&self.pool).await?;

        Ok(IndexStats {
            accounts: accounts as u64,
            mailboxes: mailboxes as u64,
            messages: messages as u64,
            total_size: total_size as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::dialect::SqliteDialect;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn dsn(dir: &TempDir) -> String {
        format!("sqlite://{}?mode=rwc", dir.path().join("index.db").display())
    }

    async fn open(dir: &TempDir) -> SqlIndex {
        SqlIndex::connect_with(Box::new(SqliteDialect), &dsn(dir), 4, Duration::from_secs(5))
            .await
            .unwrap()
    }

    async fn setup() -> (TempDir, SqlIndex, MailboxId) {
        let dir = TempDir::new().unwrap();
        let index = open(&dir).await;
        index
            .create_account("alice@example.org", Utc::now())
            .await
            .unwrap();
        let inbox = index.find_mailbox("alice@example.org", "INBOX").await.unwrap();
        (dir, index, inbox.id)
    }

    fn message(key: &str) -> NewMessage {
        NewMessage {
            flags: FlagSet::new(),
            size: 10 * 1024,
            blob_key: BlobKey::new(key),
            received_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_append_flag_and_sync_scenario() {
        let (_dir, index, inbox) = setup().await;

        let first = index.append(inbox, &message("aaaa01")).await.unwrap();
        assert_eq!(first, Appended { uid: 1, modseq: 1 });

        let second = index.append(inbox, &message("aaaa02")).await.unwrap();
        assert_eq!(second, Appended { uid: 2, modseq: 2 });

        let modseq = index
            .set_flags(inbox, 1, &FlagDelta::Add(FlagSet::parse("\\Seen")))
            .await
            .unwrap();
        assert_eq!(modseq, 3);

        let changed = index.list_messages(inbox, 2).await.unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].uid, 1);
        assert_eq!(changed[0].modseq, 3);
        assert!(changed[0].flags.is_seen());
    }

    #[tokio::test]
    async fn test_since_modseq_filter_is_exact() {
        let (_dir, index, inbox) = setup().await;

        for i in 0..5 {
            index.append(inbox, &message(&format!("bbbb{:02}", i))).await.unwrap();
        }
        index
            .set_flags(inbox, 2, &FlagDelta::Add(FlagSet::parse("\\Flagged")))
            .await
            .unwrap();
        index
            .set_flags(inbox, 4, &FlagDelta::Add(FlagSet::parse("\\Seen")))
            .await
            .unwrap();

        let all = index.list_messages(inbox, 0).await.unwrap();
        assert_eq!(all.len(), 5);
        let highest = index.get_mailbox(inbox).await.unwrap().highest_modseq;

        for since in 0..=highest {
            let returned: Vec<Uid> = index
                .list_messages(inbox, since)
                .await
                .unwrap()
                .iter()
                .map(|m| {
                    assert!(m.modseq > since);
                    m.uid
                })
                .collect();
            let expected: Vec<Uid> = all
                .iter()
                .filter(|m| m.modseq > since)
                .map(|m| m.uid)
                .collect();
            assert_eq!(returned, expected, "since {}", since);
        }
    }

    #[tokio::test]
    async fn test_set_flags_always_allocates_modseq() {
        let (_dir, index, inbox) = setup().await;
        index.append(inbox, &message("cccc01")).await.unwrap();

        let seen = FlagDelta::Add(FlagSet::parse("\\Seen"));
        let a = index.set_flags(inbox, 1, &seen).await.unwrap();
        let b = index.set_flags(inbox, 1, &seen).await.unwrap();
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_set_flags_on_missing_message_keeps_counter() {
        let (_dir, index, inbox) = setup().await;
        index.append(inbox, &message("cccc02")).await.unwrap();

        let err = index
            .set_flags(inbox, 99, &FlagDelta::Add(FlagSet::parse("\\Seen")))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(index.get_mailbox(inbox).await.unwrap().highest_modseq, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_appends_get_distinct_uids() {
        let (_dir, index, inbox) = setup().await;
        let index = Arc::new(index);

        let mut handles = Vec::new();
        for i in 0..24 {
            let index = Arc::clone(&index);
            handles.push(tokio::spawn(async move {
                index
                    .append(inbox, &message(&format!("dddd{:04}", i)))
                    .await
                    .unwrap()
            }));
        }

        let mut uids = Vec::new();
        let mut modseqs = Vec::new();
        for handle in handles {
            let appended = handle.await.unwrap();
            uids.push(appended.uid);
            modseqs.push(appended.modseq);
        }
        uids.sort_unstable();
        modseqs.sort_unstable();

        assert_eq!(uids, (1..=24).collect::<Vec<Uid>>());
        assert_eq!(modseqs, (1..=24).collect::<Vec<ModSeq>>());
    }

    #[tokio::test]
    async fn test_counters_survive_restart_and_deletion() {
        let dir = TempDir::new().unwrap();
        let inbox = {
            let index = open(&dir).await;
            index.create_account("bob@example.org", Utc::now()).await.unwrap();
            let inbox = index.find_mailbox("bob@example.org", "INBOX").await.unwrap().id;

            for i in 0..3 {
                index.append(inbox, &message(&format!("eeee{:02}", i))).await.unwrap();
            }
            index
                .set_flags(inbox, 3, &FlagDelta::Add(FlagSet::parse("\\Deleted")))
                .await
                .unwrap();
            let expunged = index.expunge(inbox, &[3]).await.unwrap();
            assert_eq!(expunged.uids, vec![3]);
            index.close().await;
            inbox
        };

        let index = open(&dir).await;
        let appended = index.append(inbox, &message("eeee99")).await.unwrap();
        assert_eq!(appended.uid, 4);
        // 3 appends, 1 flag change, 1 expunge
        assert_eq!(appended.modseq, 6);
    }

    #[tokio::test]
    async fn test_expunge_only_removes_deleted_and_reports_unreferenced() {
        let (_dir, index, inbox) = setup().await;

        // Two rows share a blob, one has its own
        index.append(inbox, &message("ffff01")).await.unwrap();
        index.append(inbox, &message("ffff01")).await.unwrap();
        index.append(inbox, &message("ffff02")).await.unwrap();

        let deleted = FlagDelta::Add(FlagSet::parse("\\Deleted"));
        index.set_flags(inbox, 1, &deleted).await.unwrap();
        index.set_flags(inbox, 3, &deleted).await.unwrap();

        // UID 2 is not \Deleted, so asking for it removes nothing
        let expunged = index.expunge(inbox, &[1, 2]).await.unwrap();
        assert_eq!(expunged.uids, vec![1]);
        assert!(expunged.unreferenced.is_empty());

        let expunged = index.expunge(inbox, &[]).await.unwrap();
        assert_eq!(expunged.uids, vec![3]);
        assert_eq!(expunged.unreferenced, vec![BlobKey::new("ffff02")]);

        index.set_flags(inbox, 2, &deleted).await.unwrap();
        let expunged = index.expunge(inbox, &[2]).await.unwrap();
        assert_eq!(expunged.unreferenced, vec![BlobKey::new("ffff01")]);

        let nothing = index.expunge(inbox, &[]).await.unwrap();
        assert!(nothing.is_empty());
        assert_eq!(nothing.modseq, None);
    }

    #[tokio::test]
    async fn test_create_mailbox_conflicts() {
        let (_dir, index, _inbox) = setup().await;

        index
            .create_mailbox("alice@example.org", "Archive", None)
            .await
            .unwrap();
        assert!(matches!(
            index.create_mailbox("alice@example.org", "Archive", None).await,
            Err(StoreError::AlreadyExists(_))
        ));
        assert!(matches!(
            index.create_mailbox("alice@example.org", "inbox", None).await,
            Err(StoreError::AlreadyExists(_))
        ));
        // Names other than INBOX are case-sensitive
        index
            .create_mailbox("alice@example.org", "archive", None)
            .await
            .unwrap();

        assert!(index
            .create_mailbox("nobody@example.org", "Archive", None)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_uid_validity_is_unique_per_mailbox() {
        let (_dir, index, inbox) = setup().await;
        let junk = index
            .create_mailbox("alice@example.org", "Junk", Some(SpecialUse::Junk))
            .await
            .unwrap();

        let inbox_mb = index.get_mailbox(inbox).await.unwrap();
        let junk_mb = index.get_mailbox(junk).await.unwrap();
        assert!(junk_mb.uid_validity > inbox_mb.uid_validity);
        assert_eq!(junk_mb.special_use, Some(SpecialUse::Junk));

        let renewed = index.renew_uid_validity(inbox).await.unwrap();
        assert!(renewed > junk_mb.uid_validity);
        assert_eq!(index.get_mailbox(inbox).await.unwrap().uid_validity, renewed);
    }

    #[tokio::test]
    async fn test_delete_account_cascades() {
        let (_dir, index, inbox) = setup().await;
        let archive = index
            .create_mailbox("alice@example.org", "Archive", None)
            .await
            .unwrap();
        index.append(inbox, &message("abab01")).await.unwrap();
        index.append(archive, &message("abab02")).await.unwrap();

        index.create_account("carol@example.org", Utc::now()).await.unwrap();

        let mut keys = index.delete_account("alice@example.org").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec![BlobKey::new("abab01"), BlobKey::new("abab02")]);

        assert!(index.get_account("alice@example.org").await.unwrap_err().is_not_found());
        assert!(index.get_mailbox(archive).await.unwrap_err().is_not_found());
        assert!(index
            .delete_account("alice@example.org")
            .await
            .unwrap_err()
            .is_not_found());

        let stats = index.stats().await.unwrap();
        assert_eq!(stats.accounts, 1);
        assert_eq!(stats.mailboxes, 1);
        assert_eq!(stats.messages, 0);
    }

    #[tokio::test]
    async fn test_create_account_twice() {
        let (_dir, index, _inbox) = setup().await;
        assert!(matches!(
            index.create_account("alice@example.org", Utc::now()).await,
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_record_login_sets_once() {
        let (_dir, index, _inbox) = setup().await;
        let account = index.get_account("alice@example.org").await.unwrap();
        assert!(account.first_login_at.is_none());

        let first = Utc::now() - chrono::Duration::days(2);
        let account = index.record_login("alice@example.org", first).await.unwrap();
        assert_eq!(account.first_login_at.unwrap().timestamp(), first.timestamp());

        let account = index
            .record_login("alice@example.org", Utc::now())
            .await
            .unwrap();
        assert_eq!(account.first_login_at.unwrap().timestamp(), first.timestamp());
    }

    #[tokio::test]
    async fn test_move_messages() {
        let (_dir, index, inbox) = setup().await;
        let archive = index
            .create_mailbox("alice@example.org", "Archive", None)
            .await
            .unwrap();
        index.append(archive, &message("mmmm00")).await.unwrap();
        index.append(inbox, &message("mmmm01")).await.unwrap();
        index.append(inbox, &message("mmmm02")).await.unwrap();

        let moved = index.move_messages(inbox, archive, &[2, 7]).await.unwrap();
        assert_eq!(moved, vec![(2, 2)]);

        let moved_meta = index.get_message(archive, 2).await.unwrap();
        assert_eq!(moved_meta.blob_key, BlobKey::new("mmmm02"));
        assert!(index.get_message(inbox, 2).await.unwrap_err().is_not_found());

        // Source records the removal with a new modseq
        assert_eq!(index.get_mailbox(inbox).await.unwrap().highest_modseq, 3);
    }

    #[tokio::test]
    async fn test_rename_and_delete_mailbox() {
        let (_dir, index, inbox) = setup().await;
        let work = index
            .create_mailbox("alice@example.org", "Work", None)
            .await
            .unwrap();
        index
            .create_mailbox("alice@example.org", "Work/2024", None)
            .await
            .unwrap();
        index.append(work, &message("rrrr01")).await.unwrap();

        index.rename_mailbox(work, "Projects").await.unwrap();
        let names: Vec<String> = index
            .list_mailboxes("alice@example.org")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert_eq!(names, vec!["INBOX", "Projects", "Projects/2024"]);

        assert!(matches!(
            index.rename_mailbox(inbox, "Other").await,
            Err(StoreError::InvalidName(_))
        ));
        assert!(matches!(
            index.delete_mailbox(inbox).await,
            Err(StoreError::InvalidName(_))
        ));

        let keys = index.delete_mailbox(work).await.unwrap();
        assert_eq!(keys, vec![BlobKey::new("rrrr01")]);
        assert!(index
            .find_mailbox("alice@example.org", "Projects")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_expire_and_purge() {
        let (_dir, index, inbox) = setup().await;
        let now = Utc::now();

        let mut old = message("oooo01");
        old.received_at = now - chrono::Duration::hours(2);
        index.append(inbox, &old).await.unwrap();

        let mut fresh = message("oooo02");
        fresh.flags = FlagSet::parse("\\Seen");
        index.append(inbox, &fresh).await.unwrap();
        index.append(inbox, &message("oooo03")).await.unwrap();

        let expired = index
            .expire_messages(inbox, now - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(expired.uids, vec![1]);
        assert_eq!(expired.unreferenced, vec![BlobKey::new("oooo01")]);

        let purged = index.purge_messages(inbox, PurgeFilter::Seen).await.unwrap();
        assert_eq!(purged.uids, vec![2]);

        let purged = index.purge_messages(inbox, PurgeFilter::All).await.unwrap();
        assert_eq!(purged.uids, vec![3]);
        assert!(index.referenced_blob_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mailbox_retention_override() {
        let (_dir, index, inbox) = setup().await;
        index
            .set_mailbox_retention(inbox, Some(Duration::from_secs(600)))
            .await
            .unwrap();
        assert_eq!(
            index.get_mailbox(inbox).await.unwrap().max_age,
            Some(Duration::from_secs(600))
        );

        assert!(index
            .set_mailbox_retention(MailboxId(9999), None)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_stats_sum_sizes() {
        let (_dir, index, inbox) = setup().await;
        index.append(inbox, &message("ssss01")).await.unwrap();
        index.append(inbox, &message("ssss02")).await.unwrap();

        let stats = index.stats().await.unwrap();
        assert_eq!(stats.accounts, 1);
        assert_eq!(stats.mailboxes, 1);
        assert_eq!(stats.messages, 2);
        assert_eq!(stats.total_size, 20 * 1024);
    }

    #[tokio::test]
    async fn test_plain_mailbox_reads_back() {
        let (_dir, index, inbox) = setup().await;

        let mailbox = index.get_mailbox(inbox).await.unwrap();
        assert_eq!(mailbox.name, INBOX);
        assert_eq!(mailbox.special_use, None);
        assert_eq!(mailbox.max_age, None);
        assert_eq!(index.list_mailboxes("alice@example.org").await.unwrap().len(), 1);
        assert_eq!(index.list_all_mailboxes().await.unwrap().len(), 1);

        index
            .set_mailbox_retention(inbox, Some(Duration::from_secs(60)))
            .await
            .unwrap();
        index.set_mailbox_retention(inbox, None).await.unwrap();
        assert_eq!(index.get_mailbox(inbox).await.unwrap().max_age, None);
    }

    #[tokio::test]
    async fn test_lock_wait_timeout_is_busy() {
        use sqlx::Connection;

        let dir = TempDir::new().unwrap();
        let index = SqlIndex::connect_with(
            Box::new(SqliteDialect),
            &dsn(&dir),
            2,
            Duration::from_millis(200),
        )
        .await
        .unwrap();
        index.create_account("alice@example.org", Utc::now()).await.unwrap();
        let inbox = index.find_mailbox("alice@example.org", INBOX).await.unwrap().id;

        let mut holder = sqlx::SqliteConnection::connect(&dsn(&dir)).await.unwrap();
        sqlx::query("BEGIN IMMEDIATE").execute(&mut holder).await.unwrap();

        let err = index.append(inbox, &message("busy01")).await.unwrap_err();
        assert!(matches!(err, StoreError::Busy(_)), "unexpected error: {:?}", err);
        assert!(err.is_retryable());

        sqlx::query("ROLLBACK").execute(&mut holder).await.unwrap();
        let appended = index.append(inbox, &message("busy02")).await.unwrap();
        assert_eq!(appended, Appended { uid: 1, modseq: 1 });
    }

    #[tokio::test]
    async fn test_move_between_accounts_is_refused() {
        let (_dir, index, inbox) = setup().await;
        index.create_account("mallory@example.org", Utc::now()).await.unwrap();
        let foreign = index
            .find_mailbox("mallory@example.org", INBOX)
            .await
            .unwrap()
            .id;
        index.append(inbox, &message("xacc01")).await.unwrap();

        assert!(index
            .move_messages(inbox, foreign, &[1])
            .await
            .unwrap_err()
            .is_not_found());
        assert!(index.get_message(inbox, 1).await.is_ok());
        assert!(index.list_messages(foreign, 0).await.unwrap().is_empty());
        assert_eq!(index.get_mailbox(foreign).await.unwrap().highest_modseq, 0);
    }

    #[tokio::test]
    async fn test_delete_if_unused_rechecks_login() {
        let (_dir, index, inbox) = setup().await;
        index.append(inbox, &message("unus01")).await.unwrap();
        index.create_account("bob@example.org", Utc::now()).await.unwrap();
        index.record_login("bob@example.org", Utc::now()).await.unwrap();

        assert_eq!(
            index.delete_account_if_unused("bob@example.org").await.unwrap(),
            None
        );
        assert!(index.get_account("bob@example.org").await.is_ok());

        assert_eq!(
            index.delete_account_if_unused("alice@example.org").await.unwrap(),
            Some(vec![BlobKey::new("unus01")])
        );
        assert!(index
            .delete_account_if_unused("alice@example.org")
            .await
            .unwrap_err()
            .is_not_found());
    }
}

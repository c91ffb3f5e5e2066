//! Per-backend SQL dialects
//!
//! Query text is written once with `$N` placeholders, numbered in bind
//! order and each used once. SQLite and PostgreSQL take it verbatim, MySQL
//! gets positional `?` markers. Beyond that a dialect owns the schema DDL,
//! the per-connection session setup and how a transaction takes the lock on
//! a mailbox or account row.

use crate::error::{Result, StoreError};
use std::borrow::Cow;
use std::time::Duration;

pub trait Dialect: Send + Sync {
    fn name(&self) -> &'static str;

    /// Idempotent DDL statements creating the schema
    fn schema(&self) -> &'static [&'static str];

    /// Statements run on every new connection
    fn session_setup(&self, lock_timeout: Duration) -> Vec<String>;

    /// First statement of a mailbox write transaction. Takes the lock that
    /// serializes UID/modseq allocation and returns the mailbox id, or no
    /// row if the mailbox does not exist. Binds: `$1` mailbox id.
    fn lock_mailbox(&self) -> &'static str;

    /// Same for an account row. Binds: `$1` username. Returns the account id.
    fn lock_account(&self) -> &'static str;

    /// Lock every mailbox row of an account, in id order.
    /// Binds: `$1` account id.
    fn lock_account_mailboxes(&self) -> &'static str;

    /// Integer type accepted by `CAST(.. AS ..)`
    fn integer_cast(&self) -> &'static str {
        "BIGINT"
    }

    /// Rewrite query text into this backend's placeholder syntax
    fn sql<'a>(&self, text: &'a str) -> Cow<'a, str> {
        Cow::Borrowed(text)
    }
}

/// Select the dialect for a configured driver name
pub fn for_driver(driver: &str) -> Result<Box<dyn Dialect>> {
    match driver {
        "sqlite" | "sqlite3" => Ok(Box::new(SqliteDialect)),
        "postgres" | "postgresql" => Ok(Box::new(PostgresDialect)),
        "mysql" | "mariadb" => Ok(Box::new(MySqlDialect)),
        other => Err(StoreError::Config(format!(
            "unsupported database driver: {}",
            other
        ))),
    }
}

/// Replace each `$N` with `?`
fn positional(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek().is_some_and(|d| d.is_ascii_digit()) {
            while chars.peek().is_some_and(|d| d.is_ascii_digit()) {
                chars.next();
            }
            out.push('?');
        } else {
            out.push(c);
        }
    }

    out
}

/// SQLite: a deferred transaction whose first statement is a write takes the
/// database write lock up front, so later reads inside it can never hit a
/// stale WAL snapshot. Waiting writers are bounded by `busy_timeout`.
pub struct SqliteDialect;

const SQLITE_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS store_meta (
        name TEXT PRIMARY KEY,
        value INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS accounts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        username TEXT NOT NULL UNIQUE,
        created_at INTEGER NOT NULL,
        first_login_at INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS mailboxes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        account_id INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
        name TEXT NOT NULL,
        uid_validity INTEGER NOT NULL,
        next_uid INTEGER NOT NULL DEFAULT 1,
        highest_modseq INTEGER NOT NULL DEFAULT 0,
        special_use TEXT,
        max_age_secs INTEGER,
        created_at INTEGER NOT NULL,
        UNIQUE (account_id, name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS messages (
        mailbox_id INTEGER NOT NULL REFERENCES mailboxes(id) ON DELETE CASCADE,
        uid INTEGER NOT NULL,
        modseq INTEGER NOT NULL,
        flags TEXT NOT NULL DEFAULT '',
        is_seen INTEGER NOT NULL DEFAULT 0,
        is_deleted INTEGER NOT NULL DEFAULT 0,
        size INTEGER NOT NULL,
        blob_key TEXT NOT NULL,
        received_at INTEGER NOT NULL,
        PRIMARY KEY (mailbox_id, uid)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_messages_modseq ON messages(mailbox_id, modseq)",
    "CREATE INDEX IF NOT EXISTS idx_messages_received ON messages(mailbox_id, received_at)",
    "CREATE INDEX IF NOT EXISTS idx_messages_blob ON messages(blob_key)",
    "INSERT INTO store_meta (name, value) VALUES ('uid_validity', 0) ON CONFLICT (name) DO NOTHING",
];

impl Dialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn schema(&self) -> &'static [&'static str] {
        SQLITE_SCHEMA
    }

    fn session_setup(&self, lock_timeout: Duration) -> Vec<String> {
        vec![
            format!("PRAGMA busy_timeout = {}", lock_timeout.as_millis()),
            "PRAGMA journal_mode = WAL".to_string(),
            "PRAGMA foreign_keys = ON".to_string(),
        ]
    }

    fn lock_mailbox(&self) -> &'static str {
        "UPDATE mailboxes SET next_uid = next_uid WHERE id = $1 RETURNING id"
    }

    fn lock_account(&self) -> &'static str {
        "UPDATE accounts SET first_login_at = first_login_at WHERE username = $1 RETURNING id"
    }

    // The account lock already holds the database write lock
    fn lock_account_mailboxes(&self) -> &'static str {
        "UPDATE mailboxes SET next_uid = next_uid WHERE account_id = $1"
    }
}

/// PostgreSQL: explicit row locks; other mailboxes proceed in parallel.
/// Waiting is bounded by `lock_timeout`, which surfaces as SQLSTATE 55P03.
pub struct PostgresDialect;

const POSTGRES_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS store_meta (
        name TEXT PRIMARY KEY,
        value BIGINT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS accounts (
        id BIGSERIAL PRIMARY KEY,
        username TEXT NOT NULL UNIQUE,
        created_at BIGINT NOT NULL,
        first_login_at BIGINT NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS mailboxes (
        id BIGSERIAL PRIMARY KEY,
        account_id BIGINT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
        name TEXT NOT NULL,
        uid_validity BIGINT NOT NULL,
        next_uid BIGINT NOT NULL DEFAULT 1,
        highest_modseq BIGINT NOT NULL DEFAULT 0,
        special_use TEXT,
        max_age_secs BIGINT,
        created_at BIGINT NOT NULL,
        UNIQUE (account_id, name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS messages (
        mailbox_id BIGINT NOT NULL REFERENCES mailboxes(id) ON DELETE CASCADE,
        uid BIGINT NOT NULL,
        modseq BIGINT NOT NULL,
        flags TEXT NOT NULL DEFAULT '',
        is_seen BIGINT NOT NULL DEFAULT 0,
        is_deleted BIGINT NOT NULL DEFAULT 0,
        size BIGINT NOT NULL,
        blob_key TEXT NOT NULL,
        received_at BIGINT NOT NULL,
        PRIMARY KEY (mailbox_id, uid)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_messages_modseq ON messages(mailbox_id, modseq)",
    "CREATE INDEX IF NOT EXISTS idx_messages_received ON messages(mailbox_id, received_at)",
    "CREATE INDEX IF NOT EXISTS idx_messages_blob ON messages(blob_key)",
    "INSERT INTO store_meta (name, value) VALUES ('uid_validity', 0) ON CONFLICT (name) DO NOTHING",
];

impl Dialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn schema(&self) -> &'static [&'static str] {
        POSTGRES_SCHEMA
    }

    fn session_setup(&self, lock_timeout: Duration) -> Vec<String> {
        vec![format!("SET lock_timeout = '{}ms'", lock_timeout.as_millis())]
    }

    fn lock_mailbox(&self) -> &'static str {
        "SELECT id FROM mailboxes WHERE id = $1 FOR UPDATE"
    }

    fn lock_account(&self) -> &'static str {
        "SELECT id FROM accounts WHERE username = $1 FOR UPDATE"
    }

    fn lock_account_mailboxes(&self) -> &'static str {
        "SELECT id FROM mailboxes WHERE account_id = $1 ORDER BY id FOR UPDATE"
    }
}

/// MySQL / MariaDB on InnoDB: row locks like PostgreSQL, waits bounded by
/// `innodb_lock_wait_timeout` (whole seconds, error 1205). Sessions run at
/// READ COMMITTED so reads after a lock see every earlier commit.
pub struct MySqlDialect;

const MYSQL_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS store_meta (
        name VARCHAR(64) NOT NULL PRIMARY KEY,
        value BIGINT NOT NULL
    ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_bin
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS accounts (
        id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
        username VARCHAR(255) NOT NULL,
        created_at BIGINT NOT NULL,
        first_login_at BIGINT NOT NULL DEFAULT 0,
        UNIQUE KEY uq_accounts_username (username)
    ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_bin
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS mailboxes (
        id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
        account_id BIGINT NOT NULL,
        name VARCHAR(255) NOT NULL,
        uid_validity BIGINT NOT NULL,
        next_uid BIGINT NOT NULL DEFAULT 1,
        highest_modseq BIGINT NOT NULL DEFAULT 0,
        special_use VARCHAR(32) NULL,
        max_age_secs BIGINT NULL,
        created_at BIGINT NOT NULL,
        UNIQUE KEY uq_mailboxes_account_name (account_id, name),
        CONSTRAINT fk_mailboxes_account FOREIGN KEY (account_id)
            REFERENCES accounts(id) ON DELETE CASCADE
    ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_bin
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS messages (
        mailbox_id BIGINT NOT NULL,
        uid BIGINT NOT NULL,
        modseq BIGINT NOT NULL,
        flags TEXT NOT NULL,
        is_seen BIGINT NOT NULL DEFAULT 0,
        is_deleted BIGINT NOT NULL DEFAULT 0,
        size BIGINT NOT NULL,
        blob_key VARCHAR(64) NOT NULL,
        received_at BIGINT NOT NULL,
        PRIMARY KEY (mailbox_id, uid),
        KEY idx_messages_modseq (mailbox_id, modseq),
        KEY idx_messages_received (mailbox_id, received_at),
        KEY idx_messages_blob (blob_key),
        CONSTRAINT fk_messages_mailbox FOREIGN KEY (mailbox_id)
            REFERENCES mailboxes(id) ON DELETE CASCADE
    ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_bin
    "#,
    "INSERT IGNORE INTO store_meta (name, value) VALUES ('uid_validity', 0)",
];

impl Dialect for MySqlDialect {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn schema(&self) -> &'static [&'static str] {
        MYSQL_SCHEMA
    }

    fn session_setup(&self, lock_timeout: Duration) -> Vec<String> {
        vec![
            format!(
                "SET SESSION innodb_lock_wait_timeout = {}",
                lock_timeout.as_secs().max(1)
            ),
            "SET SESSION TRANSACTION ISOLATION LEVEL READ COMMITTED".to_string(),
        ]
    }

    fn lock_mailbox(&self) -> &'static str {
        "SELECT id FROM mailboxes WHERE id = $1 FOR UPDATE"
    }

    fn lock_account(&self) -> &'static str {
        "SELECT id FROM accounts WHERE username = $1 FOR UPDATE"
    }

    fn lock_account_mailboxes(&self) -> &'static str {
        "SELECT id FROM mailboxes WHERE account_id = $1 ORDER BY id FOR UPDATE"
    }

    fn integer_cast(&self) -> &'static str {
        "SIGNED"
    }

    fn sql<'a>(&self, text: &'a str) -> Cow<'a, str> {
        Cow::Owned(positional(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_selection() {
        assert_eq!(for_driver("sqlite3").unwrap().name(), "sqlite");
        assert_eq!(for_driver("postgresql").unwrap().name(), "postgres");
        assert_eq!(for_driver("mariadb").unwrap().name(), "mysql");
        assert!(for_driver("oracle").is_err());
    }

    #[test]
    fn test_session_setup_carries_lock_timeout() {
        let sqlite = SqliteDialect.session_setup(Duration::from_secs(3));
        assert!(sqlite.iter().any(|s| s == "PRAGMA busy_timeout = 3000"));

        let pg = PostgresDialect.session_setup(Duration::from_millis(1500));
        assert_eq!(pg, vec!["SET lock_timeout = '1500ms'".to_string()]);

        // InnoDB only takes whole seconds
        let mysql = MySqlDialect.session_setup(Duration::from_millis(300));
        assert_eq!(mysql[0], "SET SESSION innodb_lock_wait_timeout = 1");
    }

    #[test]
    fn test_placeholders() {
        let text = "UPDATE messages SET flags = $1 WHERE mailbox_id = $2 AND uid IN ($3, $12)";
        assert_eq!(SqliteDialect.sql(text), text);
        assert_eq!(PostgresDialect.sql(text), text);
        assert_eq!(
            MySqlDialect.sql(text),
            "UPDATE messages SET flags = ? WHERE mailbox_id = ? AND uid IN (?, ?)"
        );
        assert_eq!(MySqlDialect.sql("SELECT '$' FROM t"), "SELECT '$' FROM t");
    }

    #[test]
    fn test_schemas_cover_same_tables() {
        for table in ["store_meta", "accounts", "mailboxes", "messages"] {
            let needle = format!("CREATE TABLE IF NOT EXISTS {}", table);
            assert!(SqliteDialect.schema().iter().any(|s| s.contains(&needle)));
            assert!(PostgresDialect.schema().iter().any(|s| s.contains(&needle)));
            assert!(MySqlDialect.schema().iter().any(|s| s.contains(&needle)));
        }
    }
}

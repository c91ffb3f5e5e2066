use thiserror::Error;

/// SQLite primary result codes that mean "try again later"
/// (SQLITE_BUSY, SQLITE_LOCKED and their extended variants).
const SQLITE_BUSY_CODES: &[&str] = &["5", "6", "261", "262", "517", "773"];

/// PostgreSQL SQLSTATEs for lock-wait timeouts, serialization failures,
/// deadlocks and statement cancellation by timeout.
const POSTGRES_BUSY_CODES: &[&str] = &["55P03", "40001", "40P01", "57014"];

/// MySQL error numbers for lock-wait timeouts and deadlocks. Their SQLSTATE
/// (`HY000` for 1205) is too generic to match on.
const MYSQL_BUSY_ERRORS: &[u16] = &[1205, 1213];

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid username: {0}")]
    InvalidUsername(String),

    #[error("Invalid mailbox name: {0}")]
    InvalidName(String),

    #[error("Backend busy: {0}")]
    Busy(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Inconsistent store state: {0}")]
    Inconsistent(String),

    #[error("Message too large: {size} bytes exceeds limit of {limit}")]
    TooLarge { size: usize, limit: usize },

    #[error("Operation requires mailbox context, engine is lookup-only")]
    LookupOnly,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(std::io::Error),

    #[error("Database error: {0}")]
    Database(String),
}

impl StoreError {
    /// Whether the caller should retry the operation with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Busy(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => StoreError::NotFound(err.to_string()),
            _ => StoreError::Io(err),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound("row not found".to_string()),
            sqlx::Error::PoolTimedOut => {
                StoreError::Busy("timed out waiting for a database connection".to_string())
            }
            sqlx::Error::Database(db_err) => {
                if db_err.is_unique_violation() {
                    return StoreError::AlreadyExists(db_err.message().to_string());
                }
                let mysql_busy = db_err
                    .try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>()
                    .is_some_and(|e| MYSQL_BUSY_ERRORS.contains(&e.number()));
                let code = db_err.code().map(|c| c.into_owned()).unwrap_or_default();
                if mysql_busy
                    || SQLITE_BUSY_CODES.contains(&code.as_str())
                    || POSTGRES_BUSY_CODES.contains(&code.as_str())
                {
                    StoreError::Busy(db_err.message().to_string())
                } else {
                    StoreError::Database(db_err.to_string())
                }
            }
            sqlx::Error::Io(e) => StoreError::StoreUnavailable(e.to_string()),
            sqlx::Error::Tls(e) => StoreError::StoreUnavailable(e.to_string()),
            sqlx::Error::PoolClosed => {
                StoreError::StoreUnavailable("connection pool closed".to_string())
            }
            sqlx::Error::Protocol(msg) => StoreError::StoreUnavailable(msg),
            sqlx::Error::Configuration(e) => StoreError::Config(e.to_string()),
            other => StoreError::Database(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

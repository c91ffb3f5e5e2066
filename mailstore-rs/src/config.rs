use crate::blob::{Compression, CompressionAlgorithm};
use crate::error::{Result, StoreError};
use crate::normalize::Profile;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub index: IndexConfig,
    pub blobs: BlobConfig,
    pub delivery: DeliveryConfig,
    pub auth: AuthConfig,
    pub retention: RetentionSettings,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IndexConfig {
    /// sqlite, sqlite3, postgres, postgresql, mysql or mariadb
    pub driver: String,
    pub dsn: String,
    pub max_connections: u32,
    /// Lock-wait timeout before an operation fails with `Busy`
    pub lock_timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BlobBackend {
    Fs,
    Memory,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BlobConfig {
    pub backend: BlobBackend,
    pub path: Option<String>,
    pub compression: CompressionAlgorithm,
    pub compression_level: u32,
}

/// Mapping table selection, tagged by `kind`
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TableConfig {
    Identity,
    Static {
        #[serde(default)]
        entries: HashMap<String, String>,
    },
    File {
        path: String,
    },
    Regex {
        pattern: String,
        replacement: String,
    },
}

impl Default for TableConfig {
    fn default() -> Self {
        TableConfig::Identity
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub profile: Profile,
    pub table: TableConfig,
    pub max_message_size: usize,
    pub quarantine_mailbox: String,
    /// Never report or store the \Recent flag
    pub suppress_recent: bool,
    /// Answer membership checks only, without mailbox operations
    pub lookup_only: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    pub profile: Profile,
    pub table: TableConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetentionSettings {
    pub interval_secs: u64,
    pub message_retention_secs: Option<u64>,
    pub unused_account_retention_secs: Option<u64>,
    /// DSN of the external credential database
    pub auth_store: Option<String>,
    pub orphan_grace_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for IndexConfig {
    fn default() -> Self {
        IndexConfig {
            driver: "sqlite".to_string(),
            dsn: "sqlite://mailstore.db?mode=rwc".to_string(),
            max_connections: 10,
            lock_timeout_secs: 5,
        }
    }
}

impl IndexConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}

impl Default for BlobConfig {
    fn default() -> Self {
        BlobConfig {
            backend: BlobBackend::Fs,
            path: Some("/tmp/mailstore/blobs".to_string()),
            compression: CompressionAlgorithm::None,
            compression_level: 6,
        }
    }
}

impl BlobConfig {
    pub fn compression(&self) -> Compression {
        Compression {
            algorithm: self.compression,
            level: self.compression_level,
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        DeliveryConfig {
            profile: Profile::CasefoldEmail,
            table: TableConfig::Identity,
            max_message_size: 32 * 1024 * 1024, // 32MB
            quarantine_mailbox: "Junk".to_string(),
            suppress_recent: true,
            lookup_only: false,
        }
    }
}

impl Default for RetentionSettings {
    fn default() -> Self {
        RetentionSettings {
            interval_secs: 3600,
            message_retention_secs: None,
            unused_account_retention_secs: None,
            auth_store: None,
            orphan_grace_secs: 3600,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| StoreError::Config(e.to_string()))?;

        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| StoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        crate::index::dialect::for_driver(&self.index.driver)?;

        if self.index.dsn.trim().is_empty() {
            return Err(StoreError::Config("index.dsn must not be empty".to_string()));
        }
        if self.index.max_connections == 0 {
            return Err(StoreError::Config(
                "index.max_connections must be at least 1".to_string(),
            ));
        }
        if self.blobs.compression_level > 9 {
            return Err(StoreError::Config(format!(
                "blobs.compression_level must be 0-9, got {}",
                self.blobs.compression_level
            )));
        }
        if self.blobs.backend == BlobBackend::Fs && self.blobs.path.is_none() {
            return Err(StoreError::Config(
                "blobs.path is required for the fs backend".to_string(),
            ));
        }
        if self.retention.interval_secs == 0 {
            return Err(StoreError::Config(
                "retention.interval_secs must be positive".to_string(),
            ));
        }
        if self.retention.unused_account_retention_secs.is_some()
            && self.retention.auth_store.is_none()
        {
            return Err(StoreError::Config(
                "retention.unused_account_retention_secs requires retention.auth_store"
                    .to_string(),
            ));
        }

        Ok(())
    }
}

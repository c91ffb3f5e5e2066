//! Message body storage
//!
//! Provides blob storage backends:
//! - [`fs`]: one file per blob under a fan-out directory tree
//! - [`memory`]: process-local map, for tests and ephemeral deployments
//!
//! Blob stores hold no reference counts. The index decides when a key has
//! become unreferenced and callers delete it only after that index
//! transaction committed.

pub mod codec;
pub mod fs;
pub mod memory;

pub use codec::{Compression, CompressionAlgorithm};
pub use fs::FsBlobStore;
pub use memory::MemoryBlobStore;

use crate::config::{BlobBackend, BlobConfig};
use crate::error::{Result, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Store-assigned blob identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobKey(String);

impl BlobKey {
    /// Allocate a fresh random key
    pub fn generate() -> Self {
        BlobKey(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Wrap a key read back from the index
    pub fn new(key: impl Into<String>) -> Self {
        BlobKey(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Keys double as file names, so only lowercase hex is accepted
    pub fn is_well_formed(&self) -> bool {
        self.0.len() >= 4 && self.0.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A stored blob as seen by listing, used for orphan reconciliation
#[derive(Debug, Clone)]
pub struct BlobInfo {
    pub key: BlobKey,
    pub stored_at: DateTime<Utc>,
}

/// Content storage backend
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `data` and return its new key
    async fn put(&self, data: &[u8]) -> Result<BlobKey>;

    /// Read a blob back, decoded
    async fn get(&self, key: &BlobKey) -> Result<Vec<u8>>;

    /// Remove a blob. Returns `NotFound` if it is already gone.
    async fn delete(&self, key: &BlobKey) -> Result<()>;

    /// Enumerate stored blobs
    async fn list(&self) -> Result<Vec<BlobInfo>>;

    /// Remove leftovers of `put`s interrupted before completion that are
    /// older than `older_than`. Returns how many were removed. Backends that
    /// write atomically have nothing to sweep.
    async fn sweep_incomplete(&self, _older_than: DateTime<Utc>) -> Result<usize> {
        Ok(0)
    }

    /// Backend name for logging
    fn kind(&self) -> &'static str;
}

/// Open the blob store described by `config`
pub fn from_config(config: &BlobConfig) -> Result<Arc<dyn BlobStore>> {
    let compression = config.compression();

    match config.backend {
        BlobBackend::Fs => {
            let path = config.path.as_ref().ok_or_else(|| {
                StoreError::Config("blobs.path is required for the fs backend".to_string())
            })?;
            Ok(Arc::new(FsBlobStore::new(path, compression)))
        }
        BlobBackend::Memory => Ok(Arc::new(MemoryBlobStore::with_compression(compression))),
    }
}

/// Delete blobs whose last referencing row is gone.
///
/// Must only be called after the index transaction that unreferenced the
/// keys has committed. Failures leave orphaned blobs behind, which the
/// reconciliation pass collects later, so they are logged and not returned.
pub async fn reclaim(store: &dyn BlobStore, keys: &[BlobKey]) -> usize {
    let mut deleted = 0;

    for key in keys {
        match store.delete(key).await {
            Ok(()) => deleted += 1,
            Err(StoreError::NotFound(_)) => {
                debug!("Blob {} already removed", key);
            }
            Err(e) => {
                warn!("Failed to delete unreferenced blob {}: {}", key, e);
            }
        }
    }

    deleted
}

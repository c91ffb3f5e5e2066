use super::codec::{self, Compression};
use super::{BlobInfo, BlobKey, BlobStore};
use crate::error::{Result, StoreError};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-memory blob store
///
/// Blobs are encoded exactly like the filesystem store so compression
/// behaves the same in tests.
pub struct MemoryBlobStore {
    blobs: Arc<RwLock<HashMap<BlobKey, (Vec<u8>, DateTime<Utc>)>>>,
    compression: Compression,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::with_compression(Compression::none())
    }

    pub fn with_compression(compression: Compression) -> Self {
        MemoryBlobStore {
            blobs: Arc::new(RwLock::new(HashMap::new())),
            compression,
        }
    }

    /// Number of stored blobs
    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }

    /// Insert a blob with an explicit timestamp (reconciliation tests)
    pub async fn put_at(&self, data: &[u8], stored_at: DateTime<Utc>) -> Result<BlobKey> {
        let key = BlobKey::generate();
        let encoded = codec::encode(data, self.compression)?;
        self.blobs
            .write()
            .await
            .insert(key.clone(), (encoded, stored_at));
        Ok(key)
    }
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, data: &[u8]) -> Result<BlobKey> {
        self.put_at(data, Utc::now()).await
    }

    async fn get(&self, key: &BlobKey) -> Result<Vec<u8>> {
        let blobs = self.blobs.read().await;
        let (stored, _) = blobs
            .get(key)
            .ok_or_else(|| StoreError::NotFound(format!("blob {}", key)))?;
        codec::decode(stored)
    }

    async fn delete(&self, key: &BlobKey) -> Result<()> {
        self.blobs
            .write()
            .await
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("blob {}", key)))
    }

    async fn list(&self) -> Result<Vec<BlobInfo>> {
        let blobs = self.blobs.read().await;
        Ok(blobs
            .iter()
            .map(|(key, (_, stored_at))| BlobInfo {
                key: key.clone(),
                stored_at: *stored_at,
            })
            .collect())
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryBlobStore::with_compression(Compression::zlib(6));
        let key = store.put(b"hello world").await.unwrap();

        assert_eq!(store.get(&key).await.unwrap(), b"hello world");
        assert_eq!(store.len().await, 1);

        store.delete(&key).await.unwrap();
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_second_delete_is_not_found() {
        let store = MemoryBlobStore::new();
        let key = store.put(b"x").await.unwrap();

        store.delete(&key).await.unwrap();
        let err = store.delete(&key).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_list_reports_timestamps() {
        let store = MemoryBlobStore::new();
        let old = Utc::now() - chrono::Duration::hours(3);
        let key = store.put_at(b"old", old).await.unwrap();

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, key);
        assert_eq!(listed[0].stored_at, old);
    }
}

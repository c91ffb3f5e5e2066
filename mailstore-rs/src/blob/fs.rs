use super::codec::{self, Compression};
use super::{BlobInfo, BlobKey, BlobStore};
use crate::error::{Result, StoreError};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// Filesystem blob store
///
/// Layout: `<root>/<first two key chars>/<key>`. Blobs are written to
/// `<root>/tmp` first and renamed into place, so a reader never sees a
/// partially written blob.
pub struct FsBlobStore {
    base_path: PathBuf,
    compression: Compression,
}

impl FsBlobStore {
    pub fn new(base_path: impl Into<PathBuf>, compression: Compression) -> Self {
        Self {
            base_path: base_path.into(),
            compression,
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn blob_path(&self, key: &BlobKey) -> Result<PathBuf> {
        if !key.is_well_formed() {
            return Err(StoreError::NotFound(format!("malformed blob key {:?}", key.as_str())));
        }
        Ok(self.base_path.join(&key.as_str()[..2]).join(key.as_str()))
    }

    async fn ensure_dir(&self, dir: &Path) -> Result<()> {
        if !dir.exists() {
            fs::create_dir_all(dir).await.map_err(|e| {
                StoreError::StoreUnavailable(format!("Failed to create directory {:?}: {}", dir, e))
            })?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, data: &[u8]) -> Result<BlobKey> {
        let key = BlobKey::generate();
        let final_path = self.blob_path(&key)?;
        let tmp_dir = self.base_path.join("tmp");

        self.ensure_dir(&tmp_dir).await?;
        if let Some(parent) = final_path.parent() {
            self.ensure_dir(parent).await?;
        }

        let encoded = codec::encode(data, self.compression)?;

        // Write to tmp first, then rename into place (atomic on one filesystem)
        let tmp_path = tmp_dir.join(key.as_str());
        fs::write(&tmp_path, &encoded).await?;
        if let Err(e) = fs::rename(&tmp_path, &final_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }

        debug!(
            "Stored blob {} ({} bytes, {} on disk)",
            key,
            data.len(),
            encoded.len()
        );

        Ok(key)
    }

    async fn get(&self, key: &BlobKey) -> Result<Vec<u8>> {
        let path = self.blob_path(key)?;
        let stored = fs::read(&path).await?;
        codec::decode(&stored)
    }

    async fn delete(&self, key: &BlobKey) -> Result<()> {
        let path = self.blob_path(key)?;
        fs::remove_file(&path).await?;
        debug!("Deleted blob {}", key);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<BlobInfo>> {
        let mut blobs = Vec::new();

        let mut shards = match fs::read_dir(&self.base_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(blobs),
            Err(e) => return Err(e.into()),
        };

        while let Some(shard) = shards.next_entry().await? {
            let name = shard.file_name();
            let name = name.to_string_lossy();
            if name.len() != 2 || !shard.file_type().await?.is_dir() {
                continue;
            }

            let mut entries = fs::read_dir(shard.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                let key = BlobKey::new(entry.file_name().to_string_lossy().to_string());
                if !key.is_well_formed() {
                    continue;
                }

                // Raced with a concurrent delete
                let metadata = match entry.metadata().await {
                    Ok(m) => m,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(e.into()),
                };
                let stored_at: DateTime<Utc> = metadata.modified()?.into();

                blobs.push(BlobInfo { key, stored_at });
            }
        }

        Ok(blobs)
    }

    async fn sweep_incomplete(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let tmp_dir = self.base_path.join("tmp");
        let mut entries = match fs::read_dir(&tmp_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let metadata = match entry.metadata().await {
                Ok(m) => m,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            if !metadata.is_file() {
                continue;
            }

            let written_at: DateTime<Utc> = metadata.modified()?.into();
            if written_at >= older_than {
                // May still be in flight
                continue;
            }

            match fs::remove_file(entry.path()).await {
                Ok(()) => {
                    debug!("Removed incomplete blob {:?}", entry.file_name());
                    removed += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(removed)
    }

    fn kind(&self) -> &'static str {
        "fs"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn setup(compression: Compression) -> (TempDir, FsBlobStore) {
        let temp_dir = TempDir::new().unwrap();
        let store = FsBlobStore::new(temp_dir.path().join("blobs"), compression);
        (temp_dir, store)
    }

    #[tokio::test]
    async fn test_round_trip_under_every_compression() {
        let body = "Subject: test\r\n\r\n".repeat(500).into_bytes();

        for compression in [Compression::none(), Compression::zlib(6), Compression::gzip(1)] {
            let (_tmp, store) = setup(compression);
            let key = store.put(&body).await.unwrap();
            assert_eq!(store.get(&key).await.unwrap(), body);
        }
    }

    #[tokio::test]
    async fn test_blob_lands_in_shard_directory() {
        let (_tmp, store) = setup(Compression::none());
        let key = store.put(b"data").await.unwrap();

        let expected = store.base_path().join(&key.as_str()[..2]).join(key.as_str());
        assert!(expected.exists());
        // Nothing left behind in tmp
        let tmp_entries = std::fs::read_dir(store.base_path().join("tmp")).unwrap().count();
        assert_eq!(tmp_entries, 0);
    }

    #[tokio::test]
    async fn test_delete_twice_returns_not_found() {
        let (_tmp, store) = setup(Compression::none());
        let key = store.put(b"data").await.unwrap();

        store.delete(&key).await.unwrap();
        assert!(store.delete(&key).await.unwrap_err().is_not_found());
        assert!(store.get(&key).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_concurrent_deletes_of_same_key() {
        let (_tmp, store) = setup(Compression::none());
        let store = Arc::new(store);
        let key = store.put(b"data").await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = Arc::clone(&store);
            let key = key.clone();
            handles.push(tokio::spawn(async move { store.delete(&key).await }));
        }

        let mut ok = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => ok += 1,
                Err(e) => assert!(e.is_not_found(), "unexpected error: {}", e),
            }
        }
        assert_eq!(ok, 1);
    }

    #[tokio::test]
    async fn test_concurrent_puts_get_distinct_keys() {
        let (_tmp, store) = setup(Compression::zlib(3));
        let store = Arc::new(store);

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let body = format!("message {}", i).into_bytes();
                let key = store.put(&body).await.unwrap();
                (key, body)
            }));
        }

        let mut keys = std::collections::HashSet::new();
        for handle in handles {
            let (key, body) = handle.await.unwrap();
            assert_eq!(store.get(&key).await.unwrap(), body);
            keys.insert(key);
        }
        assert_eq!(keys.len(), 16);
        assert_eq!(store.list().await.unwrap().len(), 16);
    }

    #[tokio::test]
    async fn test_list_on_missing_root_is_empty() {
        let (_tmp, store) = setup(Compression::none());
        assert!(store.list().await.unwrap().is_empty());
        assert_eq!(store.sweep_incomplete(Utc::now()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sweep_incomplete_writes() {
        let (_tmp, store) = setup(Compression::none());
        let kept = store.put(b"complete").await.unwrap();

        // Left behind by a crash between write and rename
        let stray = store.base_path().join("tmp").join(BlobKey::generate().as_str());
        std::fs::write(&stray, b"partial").unwrap();

        // Too recent, could be a put in progress
        let past = Utc::now() - chrono::Duration::hours(1);
        assert_eq!(store.sweep_incomplete(past).await.unwrap(), 0);
        assert!(stray.exists());

        let future = Utc::now() + chrono::Duration::hours(1);
        assert_eq!(store.sweep_incomplete(future).await.unwrap(), 1);
        assert!(!stray.exists());
        assert_eq!(store.get(&kept).await.unwrap(), b"complete");
    }

    #[tokio::test]
    async fn test_malformed_key_is_not_found() {
        let (_tmp, store) = setup(Compression::none());
        let err = store.get(&BlobKey::new("../../secret")).await.unwrap_err();
        assert!(err.is_not_found());
    }
}

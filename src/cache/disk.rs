use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::fs;

use super::Cache;

/// A cache that stores blobs as files under a directory, named by the
/// SHA-256 hex digest of the cache key.
pub struct DiskCache {
    dir: PathBuf,
}

impl DiskCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        DiskCache { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        self.dir.join(hex::encode(hasher.finalize()))
    }
}

#[async_trait]
impl Cache for DiskCache {
    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let path = self.path_for(key);
        match fs::read(&path).await {
            Ok(bytes) => Some(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "cache read error");
                None
            }
        }
    }

    async fn set(&self, key: &str, value: &[u8]) {
        if let Err(err) = write_entry(&self.dir, &self.path_for(key), value).await {
            tracing::warn!(error = %err, "cache write error");
        }
    }

    async fn delete(&self, key: &str) {
        let path = self.path_for(key);
        if let Err(err) = fs::remove_file(&path).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %err, "cache delete error");
            }
        }
    }
}

async fn write_entry(dir: &Path, path: &Path, value: &[u8]) -> std::io::Result<()> {
    if fs::metadata(dir).await.is_err() {
        fs::create_dir_all(dir).await?;
    }
    fs::write(path, value).await
}

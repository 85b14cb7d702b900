//! Content-addressed on-disk thumbnail cache.
//!
//! Images are stored as `<root>/<hh>/<sha256>.png`, where `hh` is the first
//! byte of the digest in hex. Identical images share one file, so a file is
//! only removed once no thumbnail record points at it.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct ThumbnailCache {
    root: PathBuf,
}

impl ThumbnailCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where `bytes` live in the cache.
    pub fn path_for(&self, bytes: &[u8]) -> PathBuf {
        let digest = hex::encode(Sha256::digest(bytes));
        self.root.join(&digest[..2]).join(format!("{}.png", digest))
    }

    /// Store `bytes` and return their path. Existing content is not rewritten.
    ///
    /// The file is written under a temporary name and renamed into place, so
    /// readers never see a partial image.
    pub async fn write(&self, bytes: &[u8]) -> Result<PathBuf> {
        let path = self.path_for(bytes);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(path);
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| cache_err(parent, source))?;
        }

        let tmp = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|source| cache_err(&tmp, source))?;
        if let Err(source) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(cache_err(&path, source));
        }

        debug!(path = %path.display(), bytes = bytes.len(), "cached thumbnail");
        Ok(path)
    }

    /// Delete a cached file. A file that is already gone is not an error.
    pub async fn remove(&self, path: &Path) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                debug!(path = %path.display(), "removed cached thumbnail");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(cache_err(path, source)),
        }
    }
}

fn cache_err(path: &Path, source: std::io::Error) -> Error {
    Error::Cache {
        path: path.to_path_buf(),
        source,
    }
}

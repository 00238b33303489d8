//! Filesystem bucket: one directory, one file per key.
//!
//! Writes go to a temporary sibling first and are renamed into place, so a
//! reader never observes a half-written payload.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::{BlobError, BlobResult, BlobStore, validate_key};

#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Open (creating if needed) a bucket rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> BlobResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|source| BlobError::Io {
            key: root.display().to_string(),
            source,
        })?;
        debug!(root = ?root, "filesystem bucket opened");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> BlobResult<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, bytes: Bytes) -> BlobResult<()> {
        let path = self.path_for(key)?;
        let tmp = self.root.join(format!(".{key}.partial"));
        let io_err = |source| BlobError::Io {
            key: key.to_string(),
            source,
        };
        tokio::fs::write(&tmp, &bytes).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &path).await.map_err(io_err)?;
        debug!(%key, size = bytes.len(), "blob stored");
        Ok(())
    }

    async fn get(&self, key: &str) -> BlobResult<Bytes> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BlobError::NotFound(key.to_string()))
            }
            Err(source) => Err(BlobError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }
}

//! In-memory bucket for single-process setups and tests.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use crate::{BlobError, BlobResult, BlobStore, validate_key};

#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<DashMap<String, Bytes>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, bytes: Bytes) -> BlobResult<()> {
        validate_key(key)?;
        self.blobs.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> BlobResult<Bytes> {
        validate_key(key)?;
        self.blobs
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| BlobError::NotFound(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_and_overwrite() {
        let store = MemoryBlobStore::new();
        store.put("cat.jpg", Bytes::from_static(b"one")).await.unwrap();
        store.put("cat.jpg", Bytes::from_static(b"two")).await.unwrap();
        assert_eq!(store.get("cat.jpg").await.unwrap(), Bytes::from_static(b"two"));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn missing_key_is_not_found() {
        let store = MemoryBlobStore::new();
        assert!(matches!(store.get("dog.jpg").await, Err(BlobError::NotFound(_))));
    }
}

//! classgrid-blob: durable blob storage for payloads and result artifacts.
//!
//! A [`BlobStore`] is one bucket. The gateway writes submitted payloads to
//! the input bucket under the submission filename; workers read them back by
//! task id and write a small CSV artifact to the output bucket (see
//! [`artifact`]). Writing an existing key overwrites it.

pub mod artifact;
pub mod error;
pub mod fs;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

pub use error::{BlobError, BlobResult};
pub use fs::FsBlobStore;
pub use memory::MemoryBlobStore;

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Bytes) -> BlobResult<()>;

    async fn get(&self, key: &str) -> BlobResult<Bytes>;
}

/// Shared handle to a bucket.
pub type SharedBlobStore = Arc<dyn BlobStore>;

/// Keys are flat filenames: no separators, no traversal, no control bytes.
pub fn validate_key(key: &str) -> BlobResult<()> {
    let reason = if key.is_empty() {
        Some("empty key")
    } else if key.len() > 255 {
        Some("key longer than 255 bytes")
    } else if key == "." || key == ".." {
        Some("relative path component")
    } else if key.contains(['/', '\\']) {
        Some("path separator in key")
    } else if key.chars().any(char::is_control) {
        Some("control character in key")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(BlobError::InvalidKey {
            key: key.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

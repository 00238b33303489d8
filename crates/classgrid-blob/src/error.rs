//! Blob store error types.

use thiserror::Error;

pub type BlobResult<T> = Result<T, BlobError>;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("invalid blob key {key:?}: {reason}")]
    InvalidKey { key: String, reason: &'static str },

    #[error("blob io error on {key}: {source}")]
    Io {
        key: String,
        source: std::io::Error,
    },
}

impl BlobError {
    /// Whether retrying the same call could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, BlobError::Io { .. })
    }
}

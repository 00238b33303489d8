//! Worker error types.

use std::path::PathBuf;

use thiserror::Error;

use classgrid_blob::BlobError;
use classgrid_queue::QueueError;

/// The classifier could not label a payload. Reported to the client as a
/// `capability_failed` result rather than retried.
#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("payload {0} is empty")]
    EmptyPayload(String),

    #[error("no label known for {0}")]
    Unrecognized(String),

    #[error("failed to read labels from {path}: {source}")]
    LabelsRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse labels in {path}: {source}")]
    LabelsParse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// An iteration failed without producing a result. The task stays
/// unacknowledged and the broker redelivers it.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Blob(#[from] BlobError),
}

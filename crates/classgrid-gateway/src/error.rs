//! Gateway error types.

use std::time::Duration;

use thiserror::Error;

use classgrid_blob::BlobError;
use classgrid_core::{ErrorTag, TaskId};
use classgrid_queue::QueueError;

/// Why a submission produced no label.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid upload: {0}")]
    InvalidUpload(String),

    #[error("a request for {0} is already in flight")]
    Duplicate(TaskId),

    #[error("classification of {id} failed ({tag}): {detail}")]
    Classification {
        id: TaskId,
        tag: ErrorTag,
        detail: String,
    },

    #[error("storing payload failed: {0}")]
    Upload(#[source] BlobError),

    #[error("publishing task failed: {0}")]
    Enqueue(#[source] QueueError),

    #[error("no result for {id} within {waited:?}")]
    Timeout { id: TaskId, waited: Duration },

    #[error("wait for {0} was cancelled")]
    Cancelled(TaskId),
}

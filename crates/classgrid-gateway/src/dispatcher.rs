//! Dispatcher: turns one upload into a task and waits for its result.
//!
//! ```text
//! submit(payload, file_name)
//!   ├── begin_wait(file_name)          → Duplicate if already in flight
//!   ├── input.put(file_name, payload)  → Upload on failure
//!   ├── send(task_queue, file_name)    → Enqueue on failure (after retries)
//!   ├── await_result(max_wait)         → Timeout
//!   └── output.get(<stem>.txt)         → artifact body for the client
//! ```
//!
//! Registering the wait before storing the payload means a duplicate
//! submission is refused before it can overwrite the first one's payload.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use classgrid_blob::artifact::{artifact_key, render_artifact};
use classgrid_blob::{SharedBlobStore, validate_key};
use classgrid_core::{ClassgridConfig, Outcome, Task, TaskId};
use classgrid_correlator::{Correlator, CorrelatorError};
use classgrid_metrics::GatewayMetrics;
use classgrid_queue::{RetryPolicy, SharedQueue, with_backoff};

use crate::error::GatewayError;

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub task_queue: String,
    pub max_wait: Duration,
    pub retry: RetryPolicy,
}

impl DispatcherSettings {
    pub fn from_config(config: &ClassgridConfig) -> Self {
        Self {
            task_queue: config.queues.task_queue.clone(),
            max_wait: config.gateway.max_wait,
            retry: RetryPolicy::new(
                config.worker.retry_attempts,
                config.worker.retry_base,
                config.worker.retry_max,
            ),
        }
    }
}

/// A labelled submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified {
    pub id: TaskId,
    pub label: String,
    /// The result artifact as stored in the output bucket.
    pub artifact: Bytes,
}

#[derive(Clone)]
pub struct Dispatcher {
    queue: SharedQueue,
    input: SharedBlobStore,
    output: SharedBlobStore,
    correlator: Correlator,
    metrics: Arc<GatewayMetrics>,
    settings: DispatcherSettings,
}

impl Dispatcher {
    pub fn new(
        queue: SharedQueue,
        input: SharedBlobStore,
        output: SharedBlobStore,
        correlator: Correlator,
        metrics: Arc<GatewayMetrics>,
        settings: DispatcherSettings,
    ) -> Self {
        Self {
            queue,
            input,
            output,
            correlator,
            metrics,
            settings,
        }
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    pub fn metrics(&self) -> &GatewayMetrics {
        &self.metrics
    }

    /// Dispatch one upload and wait for its label.
    pub async fn submit(&self, payload: Bytes, file_name: &str) -> Result<Classified, GatewayError> {
        if let Err(e) = validate_key(file_name) {
            self.metrics.record_rejected();
            return Err(GatewayError::InvalidUpload(e.to_string()));
        }

        let handle = match self.correlator.begin_wait(file_name) {
            Ok(handle) => handle,
            Err(_) => {
                self.metrics.record_duplicate();
                return Err(GatewayError::Duplicate(file_name.to_string()));
            }
        };
        self.metrics.record_submitted();
        let started = Instant::now();

        let size = payload.len();
        if let Err(e) = self.input.put(file_name, payload).await {
            self.metrics.record_internal_error();
            return Err(GatewayError::Upload(e));
        }

        let task = Task::new(file_name);
        let sent = with_backoff(&self.settings.retry, "send task", || {
            self.queue
                .send(&self.settings.task_queue, &task.id, &task.attributes)
        })
        .await;
        if let Err(e) = sent {
            self.metrics.record_internal_error();
            return Err(GatewayError::Enqueue(e));
        }
        debug!(task_id = %task.id, bytes = size, "task dispatched");

        let result = match handle.await_result(self.settings.max_wait).await {
            Ok(result) => result,
            Err(CorrelatorError::Timeout { id, waited }) => {
                self.metrics.record_timeout();
                warn!(task_id = %id, ?waited, "no result before deadline");
                return Err(GatewayError::Timeout { id, waited });
            }
            Err(CorrelatorError::Cancelled(id)) | Err(CorrelatorError::DuplicateKey(id)) => {
                self.metrics.record_internal_error();
                return Err(GatewayError::Cancelled(id));
            }
        };

        match result.outcome {
            Outcome::Label { label } => {
                let artifact = match self.output.get(&artifact_key(file_name)).await {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(task_id = %result.id, error = %e, "artifact unreadable, rendering from result");
                        Bytes::from(render_artifact(file_name, &label))
                    }
                };
                self.metrics.record_completed(started.elapsed());
                info!(
                    task_id = %result.id,
                    %label,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "classified"
                );
                Ok(Classified {
                    id: result.id,
                    label,
                    artifact,
                })
            }
            Outcome::Failed { tag, detail } => {
                self.metrics.record_failed(tag);
                Err(GatewayError::Classification {
                    id: result.id,
                    tag,
                    detail,
                })
            }
        }
    }
}

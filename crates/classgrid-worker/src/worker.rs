//! The worker processing loop.
//!
//! Per iteration: claim at most one task, fetch its payload, classify,
//! write the artifact, publish the result, acknowledge. The acknowledgement
//! always comes last, so a crash anywhere before it leaves the task to be
//! redelivered after the visibility timeout. Redelivery is harmless: the
//! artifact is overwritten with the same content and the gateway drops a
//! second result for an id it already answered.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use classgrid_blob::artifact::{artifact_key, render_artifact};
use classgrid_blob::{BlobError, SharedBlobStore};
use classgrid_core::{ClassgridConfig, ErrorTag, Task, TaskResult};
use classgrid_queue::{Message, RetryPolicy, SharedQueue, with_backoff};

use crate::classifier::SharedClassifier;
use crate::error::WorkerError;

/// Queue names and delivery policy for a worker.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub task_queue: String,
    pub result_queue: String,
    pub dead_letter_queue: Option<String>,
    pub receive_wait: Duration,
    /// Deliveries after which a task is treated as poison.
    pub max_receive_count: u32,
    pub retry: RetryPolicy,
}

impl WorkerSettings {
    pub fn from_config(config: &ClassgridConfig) -> Self {
        Self {
            task_queue: config.queues.task_queue.clone(),
            result_queue: config.queues.result_queue.clone(),
            dead_letter_queue: config.queues.dead_letter_queue.clone(),
            receive_wait: config.queues.receive_wait,
            max_receive_count: config.worker.max_receive_count,
            retry: RetryPolicy::new(
                config.worker.retry_attempts,
                config.worker.retry_base,
                config.worker.retry_max,
            ),
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from_config(&ClassgridConfig::default())
    }
}

/// One worker. Cheap to clone; all collaborators are shared handles.
#[derive(Clone)]
pub struct WorkerLoop {
    id: String,
    queue: SharedQueue,
    input: SharedBlobStore,
    output: SharedBlobStore,
    classifier: SharedClassifier,
    settings: WorkerSettings,
}

impl WorkerLoop {
    pub fn new(
        id: impl Into<String>,
        queue: SharedQueue,
        input: SharedBlobStore,
        output: SharedBlobStore,
        classifier: SharedClassifier,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            id: id.into(),
            queue,
            input,
            output,
            classifier,
            settings,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The same worker under another identity.
    pub fn with_id(&self, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..self.clone()
        }
    }

    /// Claim and process at most one task.
    ///
    /// Returns the published result, or `None` if the wait elapsed with no
    /// task or the claimed message could not be decoded.
    pub async fn run_once(&self) -> Result<Option<TaskResult>, WorkerError> {
        let mut batch = self
            .queue
            .receive(&self.settings.task_queue, 1, self.settings.receive_wait)
            .await?;
        match batch.pop() {
            Some(message) => self.process(message).await,
            None => Ok(None),
        }
    }

    /// Process one claimed message through to acknowledgement.
    pub async fn process(&self, message: Message) -> Result<Option<TaskResult>, WorkerError> {
        let task = match Task::from_parts(&message.body, message.attributes.clone()) {
            Ok(task) => task,
            Err(e) => {
                warn!(worker = %self.id, message_id = %message.id, error = %e, "discarding undecodable task");
                self.ack(&message).await?;
                return Ok(None);
            }
        };

        let result = if message.receive_count > self.settings.max_receive_count {
            self.give_up(&task, &message).await?
        } else {
            self.classify(&task).await?
        };

        let retry = self.settings.retry;
        with_backoff(&retry, "publish result", || {
            self.queue
                .send(&self.settings.result_queue, &result.id, &result.attributes)
        })
        .await?;

        self.ack(&message).await?;
        debug!(
            worker = %self.id,
            task_id = %task.id,
            label = result.label().unwrap_or_default(),
            error_tag = result.error_tag().map(|t| t.as_str()).unwrap_or_default(),
            "task done"
        );
        Ok(Some(result))
    }

    async fn classify(&self, task: &Task) -> Result<TaskResult, WorkerError> {
        let payload: Bytes = match self.input.get(&task.id).await {
            Ok(bytes) => bytes,
            Err(e @ (BlobError::NotFound(_) | BlobError::InvalidKey { .. })) => {
                warn!(worker = %self.id, task_id = %task.id, error = %e, "payload missing");
                return Ok(TaskResult::failure(task, ErrorTag::PayloadMissing, e.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        match self.classifier.classify(&task.id, &payload).await {
            Ok(label) => {
                let file_name = task.file_name();
                self.output
                    .put(
                        &artifact_key(file_name),
                        Bytes::from(render_artifact(file_name, &label)),
                    )
                    .await?;
                Ok(TaskResult::success(task, label))
            }
            Err(e) => {
                warn!(worker = %self.id, task_id = %task.id, error = %e, "classification failed");
                Ok(TaskResult::failure(task, ErrorTag::CapabilityFailed, e.to_string()))
            }
        }
    }

    /// Poison handling: park a copy on the dead-letter queue and answer the
    /// waiting request with an error.
    async fn give_up(&self, task: &Task, message: &Message) -> Result<TaskResult, WorkerError> {
        warn!(
            worker = %self.id,
            task_id = %task.id,
            receive_count = message.receive_count,
            "task exceeded delivery limit"
        );
        if let Some(dlq) = &self.settings.dead_letter_queue {
            let retry = self.settings.retry;
            with_backoff(&retry, "dead-letter task", || {
                self.queue.send(dlq, &message.body, &message.attributes)
            })
            .await?;
        }
        Ok(TaskResult::failure(
            task,
            ErrorTag::PoisonMessage,
            format!("gave up after {} deliveries", message.receive_count),
        ))
    }

    async fn ack(&self, message: &Message) -> Result<(), WorkerError> {
        let retry = self.settings.retry;
        with_backoff(&retry, "ack task", || {
            self.queue.ack(&self.settings.task_queue, &message.handle)
        })
        .await?;
        Ok(())
    }

    /// Process tasks until `shutdown` fires. A task already claimed when the
    /// signal arrives is finished first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(worker = %self.id, queue = %self.settings.task_queue, "worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            let claimed = tokio::select! {
                _ = shutdown.changed() => break,
                claimed = self.queue.receive(&self.settings.task_queue, 1, self.settings.receive_wait) => claimed,
            };

            match claimed {
                Ok(messages) => {
                    for message in messages {
                        let message_id = message.id.clone();
                        if let Err(e) = self.process(message).await {
                            warn!(
                                worker = %self.id,
                                %message_id,
                                error = %e,
                                "task left for redelivery"
                            );
                        }
                    }
                }
                Err(e) => {
                    warn!(worker = %self.id, error = %e, "receive failed");
                    tokio::time::sleep(self.settings.retry.base).await;
                }
            }
        }

        info!(worker = %self.id, "worker stopped");
    }
}

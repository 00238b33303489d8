//! Result relay: drains the result queue into the correlator.
//!
//! Every received message is resolved and then acknowledged, including
//! results nobody is waiting for and results that cannot be decoded.
//! Acknowledgements are independent: one failed ack never holds back the
//! rest of the batch.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use classgrid_core::{ClassgridConfig, TaskResult};
use classgrid_correlator::{Correlator, Resolution};
use classgrid_queue::{QueueResult, SharedQueue};

/// Pause after a failed receive before polling again.
const RECEIVE_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub result_queue: String,
    pub batch: usize,
    pub wait: Duration,
}

impl RelaySettings {
    pub fn from_config(config: &ClassgridConfig) -> Self {
        Self {
            result_queue: config.queues.result_queue.clone(),
            batch: config.queues.result_batch,
            wait: config.queues.result_wait,
        }
    }
}

/// What one drain pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainStats {
    pub received: usize,
    pub delivered: usize,
    pub dropped: usize,
    pub malformed: usize,
    pub ack_failures: usize,
}

#[derive(Clone)]
pub struct ResultRelay {
    queue: SharedQueue,
    correlator: Correlator,
    settings: RelaySettings,
}

impl ResultRelay {
    pub fn new(queue: SharedQueue, correlator: Correlator, settings: RelaySettings) -> Self {
        Self {
            queue,
            correlator,
            settings,
        }
    }

    /// Receive one batch, resolve each result, acknowledge each message.
    pub async fn drain_once(&self) -> QueueResult<DrainStats> {
        let messages = self
            .queue
            .receive(&self.settings.result_queue, self.settings.batch, self.settings.wait)
            .await?;

        let mut stats = DrainStats {
            received: messages.len(),
            ..DrainStats::default()
        };

        for message in messages {
            match TaskResult::from_parts(&message.body, message.attributes) {
                Ok(result) => match self.correlator.resolve(result) {
                    Resolution::Delivered => stats.delivered += 1,
                    Resolution::Dropped => stats.dropped += 1,
                },
                Err(e) => {
                    warn!(message_id = %message.id, error = %e, "discarding malformed result");
                    stats.malformed += 1;
                }
            }

            if let Err(e) = self
                .queue
                .ack(&self.settings.result_queue, &message.handle)
                .await
            {
                warn!(message_id = %message.id, error = %e, "result ack failed");
                stats.ack_failures += 1;
            }
        }

        if stats.received > 0 {
            debug!(
                received = stats.received,
                delivered = stats.delivered,
                dropped = stats.dropped,
                malformed = stats.malformed,
                "result batch relayed"
            );
        }
        Ok(stats)
    }

    /// Drain until `shutdown` fires.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(queue = %self.settings.result_queue, batch = self.settings.batch, "result relay started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                drained = self.drain_once() => {
                    if let Err(e) = drained {
                        warn!(error = %e, "result receive failed");
                        tokio::time::sleep(RECEIVE_BACKOFF).await;
                    }
                }
            }
        }

        info!("result relay stopped");
    }
}

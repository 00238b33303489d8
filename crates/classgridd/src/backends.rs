//! Backend construction from configuration.

use std::sync::Arc;

use anyhow::{Context, bail};
use tracing::{info, warn};

use classgrid_blob::{FsBlobStore, MemoryBlobStore, SharedBlobStore};
use classgrid_core::{ClassgridConfig, QueueBackend, StorageBackend};
use classgrid_queue::{MemoryBroker, RedisBroker, SharedQueue};
use classgrid_worker::{LookupClassifier, SharedClassifier};

/// Open the configured broker.
pub async fn open_queue(config: &ClassgridConfig) -> anyhow::Result<SharedQueue> {
    let queues = &config.queues;
    match queues.backend {
        QueueBackend::Memory => Ok(Arc::new(MemoryBroker::new(queues.visibility_timeout))),
        QueueBackend::Redis => {
            let broker = RedisBroker::connect(
                &queues.redis_url,
                &queues.key_prefix,
                queues.visibility_timeout,
                queues.poll_interval,
            )
            .await
            .with_context(|| format!("connecting to {}", queues.redis_url))?;
            info!(url = %queues.redis_url, prefix = %queues.key_prefix, "redis broker connected");
            Ok(Arc::new(broker))
        }
    }
}

/// Open the payload and artifact buckets.
pub fn open_buckets(config: &ClassgridConfig) -> anyhow::Result<(SharedBlobStore, SharedBlobStore)> {
    let storage = &config.storage;
    match storage.backend {
        StorageBackend::Memory => Ok((
            Arc::new(MemoryBlobStore::new()),
            Arc::new(MemoryBlobStore::new()),
        )),
        StorageBackend::Fs => {
            let input = FsBlobStore::open(storage.root.join(&storage.input_bucket))
                .context("opening input bucket")?;
            let output = FsBlobStore::open(storage.root.join(&storage.output_bucket))
                .context("opening output bucket")?;
            Ok((Arc::new(input), Arc::new(output)))
        }
    }
}

/// Load the label table, or an empty one that rejects every subject.
pub fn load_classifier(config: &ClassgridConfig) -> anyhow::Result<SharedClassifier> {
    match &config.worker.labels {
        Some(path) => Ok(Arc::new(LookupClassifier::from_file(path)?)),
        None => {
            warn!("worker.labels not set; every task will fail classification");
            Ok(Arc::new(LookupClassifier::default()))
        }
    }
}

/// Components in separate processes can only meet through Redis and the
/// filesystem.
pub fn require_shared_backends(config: &ClassgridConfig, mode: &str) -> anyhow::Result<()> {
    if config.queues.backend != QueueBackend::Redis {
        bail!("{mode} mode needs queues.backend = \"redis\"; use `standalone` for a single process");
    }
    if config.storage.backend != StorageBackend::Fs {
        bail!("{mode} mode needs storage.backend = \"fs\"; use `standalone` for a single process");
    }
    Ok(())
}

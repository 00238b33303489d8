//! In-process worker fleet.
//!
//! Each instance is a tokio task running a clone of a template
//! [`WorkerLoop`]. Used by `classgridd standalone`, where the gateway,
//! relay, autoscaler and workers share one process and one broker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use classgrid_autoscale::{Provisioner, ProvisioningError};
use classgrid_core::InstanceId;

use crate::worker::WorkerLoop;

struct LocalInstance {
    shutdown: watch::Sender<bool>,
    started: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

pub struct LocalFleet {
    template: WorkerLoop,
    next_id: AtomicU64,
    instances: Mutex<HashMap<InstanceId, LocalInstance>>,
}

impl LocalFleet {
    pub fn new(template: WorkerLoop) -> Self {
        Self {
            template,
            next_id: AtomicU64::new(1),
            instances: Mutex::new(HashMap::new()),
        }
    }

    fn instances(&self) -> std::sync::MutexGuard<'_, HashMap<InstanceId, LocalInstance>> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.instances.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Instances whose task has not exited yet.
    pub fn len(&self) -> usize {
        self.instances().values().filter(|i| !i.handle.is_finished()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Signal every instance and wait for all of them to exit.
    pub async fn shutdown(&self) {
        let drained: Vec<(InstanceId, LocalInstance)> = self.instances().drain().collect();
        for (_, instance) in &drained {
            let _ = instance.shutdown.send(true);
        }
        for (id, instance) in drained {
            if let Err(e) = instance.handle.await {
                debug!(instance = %id, error = %e, "worker task ended abnormally");
            }
        }
    }
}

#[async_trait]
impl Provisioner for LocalFleet {
    async fn launch(&self, count: usize) -> Result<Vec<InstanceId>, ProvisioningError> {
        let mut ids = Vec::with_capacity(count);
        let mut instances = self.instances();
        for _ in 0..count {
            let id = format!("local-{:04}", self.next_id.fetch_add(1, Ordering::Relaxed));
            let worker = self.template.with_id(id.clone());
            let (shutdown, rx) = watch::channel(false);
            let started = Arc::new(AtomicBool::new(false));
            let flag = started.clone();
            let handle = tokio::spawn(async move {
                flag.store(true, Ordering::Release);
                worker.run(rx).await;
            });
            instances.insert(
                id.clone(),
                LocalInstance {
                    shutdown,
                    started,
                    handle,
                },
            );
            ids.push(id);
        }
        info!(count, "local workers launched");
        Ok(ids)
    }

    async fn terminate(&self, ids: &[InstanceId]) -> Result<(), ProvisioningError> {
        let instances = self.instances();
        let mut missing = Vec::new();
        for id in ids {
            match instances.get(id) {
                Some(instance) => {
                    let _ = instance.shutdown.send(true);
                }
                None => missing.push(id.clone()),
            }
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ProvisioningError::Terminate {
                ids: missing,
                reason: "no such local worker".into(),
            })
        }
    }

    async fn list_running(&self) -> Result<Vec<InstanceId>, ProvisioningError> {
        let mut instances = self.instances();
        instances.retain(|id, instance| {
            let alive = !instance.handle.is_finished();
            if !alive {
                debug!(instance = %id, "local worker exited");
            }
            alive
        });
        let mut running: Vec<InstanceId> = instances
            .iter()
            .filter(|(_, i)| i.started.load(Ordering::Acquire))
            .map(|(id, _)| id.clone())
            .collect();
        running.sort();
        Ok(running)
    }
}

//! Child-process worker fleet.
//!
//! Each instance is a separate OS process, normally `classgridd worker
//! --config <path>`, sharing the Redis broker and filesystem buckets with
//! the gateway. Instance ids are derived from the child pid.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use classgrid_autoscale::{Provisioner, ProvisioningError};
use classgrid_core::InstanceId;

pub struct ProcessFleet {
    program: PathBuf,
    args: Vec<OsString>,
    children: Mutex<HashMap<InstanceId, Child>>,
}

impl ProcessFleet {
    pub fn new(program: impl Into<PathBuf>, args: impl IntoIterator<Item = impl Into<OsString>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            children: Mutex::new(HashMap::new()),
        }
    }

    fn children(&self) -> std::sync::MutexGuard<'_, HashMap<InstanceId, Child>> {
        self.children.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn spawn_one(&self) -> std::io::Result<(InstanceId, Child)> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        let pid = child.id().unwrap_or_default();
        Ok((format!("pid-{pid}"), child))
    }
}

#[async_trait]
impl Provisioner for ProcessFleet {
    async fn launch(&self, count: usize) -> Result<Vec<InstanceId>, ProvisioningError> {
        let mut ids = Vec::with_capacity(count);
        let mut children = self.children();
        for _ in 0..count {
            match self.spawn_one() {
                Ok((id, child)) => {
                    debug!(instance = %id, program = %self.program.display(), "worker process spawned");
                    children.insert(id.clone(), child);
                    ids.push(id);
                }
                // Keep what already started; the rest is retried next tick.
                Err(e) if !ids.is_empty() => {
                    warn!(launched = ids.len(), requested = count, error = %e, "partial launch");
                    break;
                }
                Err(e) => {
                    return Err(ProvisioningError::Launch {
                        count,
                        reason: format!("{}: {e}", self.program.display()),
                    });
                }
            }
        }
        info!(count = ids.len(), "worker processes launched");
        Ok(ids)
    }

    async fn terminate(&self, ids: &[InstanceId]) -> Result<(), ProvisioningError> {
        let mut children = self.children();
        let mut failed = Vec::new();
        let mut reason = String::new();
        for id in ids {
            match children.get_mut(id) {
                Some(child) => {
                    if let Err(e) = child.start_kill() {
                        failed.push(id.clone());
                        reason = e.to_string();
                    }
                }
                None => {
                    failed.push(id.clone());
                    reason = "no such worker process".into();
                }
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(ProvisioningError::Terminate { ids: failed, reason })
        }
    }

    async fn list_running(&self) -> Result<Vec<InstanceId>, ProvisioningError> {
        let mut children = self.children();
        children.retain(|id, child| match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!(instance = %id, %status, "worker process exited");
                false
            }
            Err(e) => {
                warn!(instance = %id, error = %e, "lost track of worker process");
                false
            }
        });
        let mut running: Vec<InstanceId> = children.keys().cloned().collect();
        running.sort();
        Ok(running)
    }
}

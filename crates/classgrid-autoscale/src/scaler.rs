//! Autoscaler: backlog-driven fleet sizing.
//!
//! Each tick samples the task queue depth, reconciles the fleet state
//! against the provisioner's listing, derives a `ScalingDecision` and
//! carries it out. Provisioning failures are logged and the next tick tries
//! again from freshly reconciled state.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use classgrid_core::{AutoscaleConfig, InstanceId};
use classgrid_queue::SharedQueue;

use crate::fleet::{FleetSnapshot, FleetState};
use crate::provisioner::{ProvisioningError, SharedProvisioner};

/// What one tick decided to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "action", content = "count", rename_all = "snake_case")]
pub enum ScalingDecision {
    /// Launch this many instances.
    ScaleOut(u32),
    /// Terminate this many instances.
    ScaleIn(u32),
    /// No change needed.
    Hold,
}

impl ScalingDecision {
    pub fn action(&self) -> &'static str {
        match self {
            ScalingDecision::ScaleOut(_) => "scale_out",
            ScalingDecision::ScaleIn(_) => "scale_in",
            ScalingDecision::Hold => "hold",
        }
    }

    pub fn count(&self) -> u32 {
        match self {
            ScalingDecision::ScaleOut(n) | ScalingDecision::ScaleIn(n) => *n,
            ScalingDecision::Hold => 0,
        }
    }
}

/// Sizing bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalingPolicy {
    pub scale_factor: u32,
    pub min_instances: u32,
    pub max_instances: u32,
}

impl ScalingPolicy {
    /// `clamp(ceil(backlog / scale_factor), min, max)`.
    pub fn desired(&self, backlog: usize) -> u32 {
        let factor = self.scale_factor.max(1) as usize;
        let wanted = backlog.div_ceil(factor).min(u32::MAX as usize) as u32;
        wanted.max(self.min_instances).min(self.max_instances)
    }
}

impl From<&AutoscaleConfig> for ScalingPolicy {
    fn from(config: &AutoscaleConfig) -> Self {
        Self {
            scale_factor: config.scale_factor,
            min_instances: config.min_instances,
            max_instances: config.max_instances,
        }
    }
}

/// Decide how to move from `total` instances toward the backlog's desired
/// size.
pub fn decide(backlog: usize, total: u32, policy: &ScalingPolicy) -> ScalingDecision {
    let desired = policy.desired(backlog);
    if desired > total {
        let headroom = policy.max_instances.saturating_sub(total);
        ScalingDecision::ScaleOut((desired - total).min(headroom))
    } else if desired < total {
        ScalingDecision::ScaleIn(total - desired)
    } else if backlog == 0 && total > policy.min_instances {
        // Idle drain. `desired` already sits at `min` when the backlog is
        // empty, so this only fires if the clamp above ever changes.
        ScalingDecision::ScaleIn(total - policy.min_instances)
    } else {
        ScalingDecision::Hold
    }
}

/// The fleet-sizing control loop.
pub struct Autoscaler {
    queue: SharedQueue,
    task_queue: String,
    provisioner: SharedProvisioner,
    policy: ScalingPolicy,
    protected: HashSet<InstanceId>,
    launch_timeout: Duration,
    terminate_timeout: Duration,
    fleet: FleetState,
    ticks: u64,
    snapshot_tx: watch::Sender<FleetSnapshot>,
}

impl Autoscaler {
    pub fn new(
        queue: SharedQueue,
        task_queue: impl Into<String>,
        provisioner: SharedProvisioner,
        config: &AutoscaleConfig,
    ) -> Self {
        let (snapshot_tx, _) = watch::channel(FleetSnapshot::default());
        Self {
            queue,
            task_queue: task_queue.into(),
            provisioner,
            policy: ScalingPolicy::from(config),
            protected: config.protected_instances.iter().cloned().collect(),
            launch_timeout: config.launch_timeout,
            terminate_timeout: config.terminate_timeout,
            fleet: FleetState::new(),
            ticks: 0,
            snapshot_tx,
        }
    }

    /// Receive the snapshot published after every tick.
    pub fn subscribe(&self) -> watch::Receiver<FleetSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn fleet(&self) -> &FleetState {
        &self.fleet
    }

    /// Run one sample/reconcile/decide/act cycle.
    pub async fn tick(&mut self) -> anyhow::Result<ScalingDecision> {
        let backlog = self
            .queue
            .approximate_depth(&self.task_queue)
            .await
            .context("sampling task queue depth")?;

        let listed: HashSet<InstanceId> = self
            .provisioner
            .list_running()
            .await?
            .into_iter()
            .filter(|id| !self.protected.contains(id))
            .collect();

        let report = self.fleet.reconcile(
            &listed,
            Instant::now(),
            self.launch_timeout,
            self.terminate_timeout,
        );
        if report != Default::default() {
            debug!(
                promoted = report.promoted.len(),
                adopted = report.adopted.len(),
                vanished = report.vanished.len(),
                launch_expired = report.launch_expired.len(),
                terminate_expired = report.terminate_expired.len(),
                "fleet reconciled"
            );
        }

        let total = self.fleet.total() as u32;
        let desired = self.policy.desired(backlog);
        let decision = decide(backlog, total, &self.policy);
        debug!(backlog, total, desired, decision = decision.action(), "scaling evaluated");

        match decision {
            ScalingDecision::ScaleOut(count) => self.scale_out(count).await,
            ScalingDecision::ScaleIn(count) => self.scale_in(count).await,
            ScalingDecision::Hold => {}
        }

        self.ticks += 1;
        self.snapshot_tx.send_replace(FleetSnapshot {
            backlog,
            running: self.fleet.running_count(),
            launching: self.fleet.launching_count(),
            terminating: self.fleet.terminating_count(),
            desired,
            last_decision: decision,
            ticks: self.ticks,
        });

        Ok(decision)
    }

    async fn scale_out(&mut self, count: u32) {
        match self.provisioner.launch(count as usize).await {
            Ok(ids) => {
                info!(requested = count, launched = ids.len(), "scaling out");
                self.fleet.mark_launching(ids, Instant::now());
            }
            Err(e) => warn!(count, error = %e, "scale-out failed, will retry next tick"),
        }
    }

    async fn scale_in(&mut self, count: u32) {
        let victims = self.fleet.select_for_termination(count as usize);
        if victims.is_empty() {
            return;
        }
        match self.provisioner.terminate(&victims).await {
            Ok(()) => {
                info!(count = victims.len(), instances = ?victims, "scaling in");
                self.fleet.mark_terminating(&victims, Instant::now());
            }
            Err(ProvisioningError::Terminate { ids: failed, reason }) => {
                let signalled: Vec<InstanceId> = victims
                    .into_iter()
                    .filter(|id| !failed.contains(id))
                    .collect();
                warn!(
                    count,
                    failed = ?failed,
                    signalled = signalled.len(),
                    %reason,
                    "scale-in partly failed, will retry next tick"
                );
                self.fleet.mark_terminating(&signalled, Instant::now());
            }
            Err(e) => warn!(count, error = %e, "scale-in failed, will retry next tick"),
        }
    }

    /// Run the autoscaler loop.
    pub async fn run(&mut self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = interval.as_secs(),
            min = self.policy.min_instances,
            max = self.policy.max_instances,
            scale_factor = self.policy.scale_factor,
            "autoscaler started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.tick().await {
                        warn!(error = %e, "autoscaler tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("autoscaler shutting down");
                    break;
                }
            }
        }
    }
}

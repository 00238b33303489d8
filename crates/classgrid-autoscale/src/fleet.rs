//! The autoscaler's view of the worker fleet.
//!
//! Every instance id lives in at most one of `running`, `launching` or
//! `terminating`. The provisioner is the source of truth; `reconcile`
//! folds its latest listing into this view once per tick.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use classgrid_core::InstanceId;

use crate::scaler::ScalingDecision;

#[derive(Debug, Clone, Copy)]
struct Terminating {
    /// When the instance first became running. Kept so an instance that
    /// refuses to stop goes back to its place in the oldest-first order.
    since: Instant,
    requested_at: Instant,
}

/// What changed during one reconciliation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Launching ids now reported running.
    pub promoted: Vec<InstanceId>,
    /// Reported ids the state did not know about.
    pub adopted: Vec<InstanceId>,
    /// Running or terminating ids no longer reported.
    pub vanished: Vec<InstanceId>,
    /// Launching ids that never appeared before the launch timeout.
    pub launch_expired: Vec<InstanceId>,
    /// Terminating ids still reported after the terminate timeout.
    pub terminate_expired: Vec<InstanceId>,
}

#[derive(Debug, Default)]
pub struct FleetState {
    running: HashMap<InstanceId, Instant>,
    launching: HashMap<InstanceId, Instant>,
    terminating: HashMap<InstanceId, Terminating>,
}

impl FleetState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold the provisioner's current listing into the state.
    pub fn reconcile(
        &mut self,
        listed: &HashSet<InstanceId>,
        now: Instant,
        launch_timeout: Duration,
        terminate_timeout: Duration,
    ) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        let launching: Vec<(InstanceId, Instant)> = self.launching.drain().collect();
        for (id, started) in launching {
            if listed.contains(&id) {
                self.running.insert(id.clone(), now);
                report.promoted.push(id);
            } else if now.saturating_duration_since(started) >= launch_timeout {
                warn!(instance = %id, "instance never reported running, forgetting it");
                report.launch_expired.push(id);
            } else {
                self.launching.insert(id, started);
            }
        }

        self.running.retain(|id, _| {
            let keep = listed.contains(id);
            if !keep {
                report.vanished.push(id.clone());
            }
            keep
        });

        let terminating: Vec<(InstanceId, Terminating)> = self.terminating.drain().collect();
        for (id, term) in terminating {
            if !listed.contains(&id) {
                report.vanished.push(id);
            } else if now.saturating_duration_since(term.requested_at) >= terminate_timeout {
                warn!(instance = %id, "instance still running after terminate, re-admitting");
                self.running.insert(id.clone(), term.since);
                report.terminate_expired.push(id);
            } else {
                self.terminating.insert(id, term);
            }
        }

        let mut unknown: Vec<&InstanceId> = listed
            .iter()
            .filter(|id| !self.contains(id))
            .collect();
        unknown.sort();
        for id in unknown {
            debug!(instance = %id, "adopting running instance");
            self.running.insert(id.clone(), now);
            report.adopted.push(id.clone());
        }

        report.promoted.sort();
        report.vanished.sort();
        report.launch_expired.sort();
        report.terminate_expired.sort();
        report
    }

    /// Record ids the provisioner just started.
    pub fn mark_launching(&mut self, ids: impl IntoIterator<Item = InstanceId>, now: Instant) {
        for id in ids {
            if !self.contains(&id) {
                self.launching.insert(id, now);
            }
        }
    }

    /// Pick up to `count` running ids, oldest first.
    pub fn select_for_termination(&self, count: usize) -> Vec<InstanceId> {
        let mut candidates: Vec<(&InstanceId, &Instant)> = self.running.iter().collect();
        candidates.sort_by(|a, b| a.1.cmp(b.1).then_with(|| a.0.cmp(b.0)));
        candidates
            .into_iter()
            .take(count)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Move running ids into `terminating`. Ids that are not running are
    /// ignored.
    pub fn mark_terminating(&mut self, ids: &[InstanceId], now: Instant) {
        for id in ids {
            if let Some(since) = self.running.remove(id) {
                self.terminating.insert(
                    id.clone(),
                    Terminating {
                        since,
                        requested_at: now,
                    },
                );
            }
        }
    }

    /// Instances that count toward fleet size.
    pub fn total(&self) -> usize {
        self.running.len() + self.launching.len()
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn launching_count(&self) -> usize {
        self.launching.len()
    }

    pub fn terminating_count(&self) -> usize {
        self.terminating.len()
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.running.contains_key(id)
    }

    pub fn is_launching(&self, id: &str) -> bool {
        self.launching.contains_key(id)
    }

    pub fn is_terminating(&self, id: &str) -> bool {
        self.terminating.contains_key(id)
    }

    fn contains(&self, id: &str) -> bool {
        self.is_running(id) || self.is_launching(id) || self.is_terminating(id)
    }
}

/// Point-in-time view published after every tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FleetSnapshot {
    pub backlog: usize,
    pub running: usize,
    pub launching: usize,
    pub terminating: usize,
    pub desired: u32,
    pub last_decision: ScalingDecision,
    pub ticks: u64,
}

impl Default for FleetSnapshot {
    fn default() -> Self {
        Self {
            backlog: 0,
            running: 0,
            launching: 0,
            terminating: 0,
            desired: 0,
            last_decision: ScalingDecision::Hold,
            ticks: 0,
        }
    }
}

//! classgrid-autoscale: backlog-driven worker fleet sizing.
//!
//! Samples the task queue depth, reconciles the fleet it believes it has
//! against what the provisioner reports, and launches or terminates worker
//! instances to track the backlog.
//!
//! # Scaling Algorithm
//!
//! ```text
//! total   = |running| + |launching|
//! desired = clamp(ceil(backlog / scale_factor), min, max)
//! delta   = desired - total
//!
//! delta > 0                                → ScaleOut(min(delta, max - total))
//! delta < 0                                → ScaleIn(|delta|)
//! delta == 0 && backlog == 0 && total > min → ScaleIn(total - min)
//! otherwise                                → Hold
//! ```
//!
//! Instances that were asked to start count toward `total` until the
//! provisioner reports them, so a slow launch is never launched twice.
//! Instances that were asked to stop no longer count, and are never picked
//! for termination again while the stop is pending.

pub mod fleet;
pub mod provisioner;
pub mod scaler;

pub use fleet::{FleetSnapshot, FleetState, ReconcileReport};
pub use provisioner::{Provisioner, ProvisioningError, SharedProvisioner};
pub use scaler::{Autoscaler, ScalingDecision, ScalingPolicy, decide};

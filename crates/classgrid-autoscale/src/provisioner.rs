//! Compute-fleet provisioning interface.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use classgrid_core::InstanceId;

#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("launch of {count} instance(s) failed: {reason}")]
    Launch { count: usize, reason: String },

    /// `ids` names only the instances that could not be signalled; the
    /// rest of the request went through.
    #[error("terminate of {ids:?} failed: {reason}")]
    Terminate { ids: Vec<InstanceId>, reason: String },

    #[error("listing running instances failed: {0}")]
    List(String),
}

/// Starts, stops, and enumerates worker instances.
///
/// Launches are asynchronous: an id returned by `launch` may take a while to
/// appear in `list_running`, and a terminated id may keep appearing for a
/// while after `terminate` returns.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn launch(&self, count: usize) -> Result<Vec<InstanceId>, ProvisioningError>;

    async fn terminate(&self, ids: &[InstanceId]) -> Result<(), ProvisioningError>;

    async fn list_running(&self) -> Result<Vec<InstanceId>, ProvisioningError>;
}

pub type SharedProvisioner = Arc<dyn Provisioner>;

//! classgrid-core: types shared by every classgrid crate.
//!
//! Holds the task/result data model exchanged over the queues, the wire
//! attribute names, and the `classgrid.toml` configuration.

pub mod config;
pub mod types;

pub use config::{
    AutoscaleConfig, ClassgridConfig, ConfigError, GatewayConfig, QueueBackend, QueueConfig,
    StorageBackend, StorageConfig, WorkerConfig, parse_duration,
};
pub use types::*;

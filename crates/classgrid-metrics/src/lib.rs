//! classgrid-metrics: observability for the gateway and the fleet.
//!
//! # Architecture
//!
//! ```text
//! GatewayMetrics
//!   ├── record_*() ← called by the dispatcher per submission
//!   └── snapshot() → GatewaySnapshot (counters + latency percentiles)
//!
//! Prometheus exposition
//!   └── render_prometheus(gateway, pending, fleet) → text/plain for /metrics
//! ```

pub mod collector;
pub mod prometheus;

pub use collector::{GatewayMetrics, GatewaySnapshot};
pub use prometheus::render_prometheus;

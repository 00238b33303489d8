//! classgrid-gateway: synchronous front door over the task queues.
//!
//! The [`Dispatcher`] turns an upload into a queued task and waits on the
//! correlator for its result. The [`ResultRelay`] runs in the background,
//! draining the result queue into the correlator.
//!
//! # HTTP Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/upload` | Multipart upload; answers with the result artifact |
//! | GET | `/healthz` | Liveness |
//! | GET | `/metrics` | Prometheus exposition |
//!
//! Upload status codes: 200 labelled, 400 malformed upload, 409 same
//! filename already in flight, 422 classification failed, 500 storage or
//! queue failure, 504 no result in time.

pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod relay;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use tokio::sync::watch;

use classgrid_autoscale::FleetSnapshot;

pub use dispatcher::{Classified, Dispatcher, DispatcherSettings};
pub use error::GatewayError;
pub use relay::{DrainStats, RelaySettings, ResultRelay};

/// Largest accepted upload body.
pub const MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct GatewayState {
    pub dispatcher: Dispatcher,
    /// Multipart field carrying the file.
    pub upload_field: String,
    /// Latest autoscaler snapshot, when the autoscaler runs in-process.
    pub fleet: Option<watch::Receiver<FleetSnapshot>>,
}

/// Build the gateway router.
pub fn build_router(state: GatewayState) -> Router {
    Router::new()
        .route(
            "/upload",
            post(handlers::upload).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/healthz", get(handlers::healthz))
        .route("/metrics", get(handlers::prometheus_metrics))
        .with_state(state)
}

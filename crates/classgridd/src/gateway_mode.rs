//! Gateway mode: HTTP front door and result relay.
//!
//! Workers and the autoscaler run elsewhere and meet the gateway through
//! the Redis broker and the filesystem buckets.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use classgrid_core::ClassgridConfig;
use classgrid_correlator::Correlator;
use classgrid_gateway::{
    Dispatcher, DispatcherSettings, GatewayState, RelaySettings, ResultRelay, build_router,
};
use classgrid_metrics::GatewayMetrics;

use crate::backends;

pub async fn run_gateway(config: ClassgridConfig, listen: Option<SocketAddr>) -> anyhow::Result<()> {
    info!("classgrid daemon starting in gateway mode");
    backends::require_shared_backends(&config, "gateway")?;

    let queue = backends::open_queue(&config).await?;
    let (input, output) = backends::open_buckets(&config)?;

    let correlator = Correlator::new();
    let dispatcher = Dispatcher::new(
        queue.clone(),
        input,
        output,
        correlator.clone(),
        Arc::new(GatewayMetrics::new()),
        DispatcherSettings::from_config(&config),
    );
    let relay = ResultRelay::new(queue, correlator, RelaySettings::from_config(&config));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let relay_handle = tokio::spawn(async move {
        relay.run(shutdown_rx).await;
    });

    let router = build_router(GatewayState {
        dispatcher,
        upload_field: config.gateway.upload_field.clone(),
        fleet: None,
    });
    let addr = listen.unwrap_or(config.gateway.listen);
    info!(%addr, "gateway listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(crate::shutdown_signal(shutdown_tx))
        .await?;

    let _ = relay_handle.await;
    info!("classgrid gateway stopped");
    Ok(())
}

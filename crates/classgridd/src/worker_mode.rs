//! Worker and autoscaler modes.
//!
//! The autoscaler launches workers by re-running a binary (this one unless
//! `autoscale.launch_template` names another) with the `worker` subcommand.

use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::info;

use classgrid_autoscale::Autoscaler;
use classgrid_core::ClassgridConfig;
use classgrid_worker::{ProcessFleet, WorkerLoop, WorkerSettings};

use crate::backends;

pub async fn run_worker(config: ClassgridConfig, id: String) -> anyhow::Result<()> {
    info!(worker = %id, "classgrid daemon starting in worker mode");
    backends::require_shared_backends(&config, "worker")?;

    let queue = backends::open_queue(&config).await?;
    let (input, output) = backends::open_buckets(&config)?;
    let classifier = backends::load_classifier(&config)?;

    let worker = WorkerLoop::new(
        id,
        queue,
        input,
        output,
        classifier,
        WorkerSettings::from_config(&config),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        worker.run(shutdown_rx).await;
    });

    crate::shutdown_signal(shutdown_tx).await;
    let _ = handle.await;
    info!("classgrid worker stopped");
    Ok(())
}

pub async fn run_autoscaler(config: ClassgridConfig, config_path: Option<PathBuf>) -> anyhow::Result<()> {
    info!("classgrid daemon starting in autoscaler mode");
    backends::require_shared_backends(&config, "autoscaler")?;

    let program = match &config.autoscale.launch_template {
        Some(path) => path.clone(),
        None => std::env::current_exe().context("locating the classgridd binary")?,
    };
    let args = worker_args(config_path.as_deref());
    info!(program = %program.display(), "worker launch command resolved");
    let fleet = Arc::new(ProcessFleet::new(program, args));

    let queue = backends::open_queue(&config).await?;
    let mut autoscaler = Autoscaler::new(
        queue,
        config.queues.task_queue.clone(),
        fleet,
        &config.autoscale,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let interval = config.autoscale.interval;
    let handle = tokio::spawn(async move {
        autoscaler.run(interval, shutdown_rx).await;
    });

    crate::shutdown_signal(shutdown_tx).await;
    // Dropping the autoscaler drops the fleet, which kills its children.
    let _ = handle.await;
    info!("classgrid autoscaler stopped");
    Ok(())
}

/// Arguments handed to every launched worker.
fn worker_args(config_path: Option<&std::path::Path>) -> Vec<OsString> {
    let mut args = Vec::new();
    if let Some(path) = config_path {
        args.push(OsString::from("--config"));
        args.push(path.as_os_str().to_owned());
    }
    args.push(OsString::from("worker"));
    args
}

//! classgridd: the classgrid daemon.
//!
//! Single binary that assembles the classgrid subsystems:
//! - Queues (in-memory or Redis)
//! - Payload and artifact buckets (in-memory or filesystem)
//! - Gateway HTTP server + result relay
//! - Worker loops
//! - Autoscaler
//!
//! # Usage
//!
//! ```text
//! classgridd standalone                               # everything in one process
//! classgridd --config classgrid.toml gateway          # HTTP front door + relay
//! classgridd --config classgrid.toml worker           # one worker loop
//! classgridd --config classgrid.toml autoscaler       # spawns `worker` processes
//! classgridd --config classgrid.toml config           # print effective config
//! ```

mod backends;
mod gateway_mode;
mod worker_mode;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::info;

use classgrid_autoscale::Autoscaler;
use classgrid_core::{ClassgridConfig, QueueBackend};
use classgrid_correlator::Correlator;
use classgrid_gateway::{
    Dispatcher, DispatcherSettings, GatewayState, RelaySettings, ResultRelay, build_router,
};
use classgrid_metrics::GatewayMetrics;
use classgrid_queue::MemoryBroker;
use classgrid_worker::{LocalFleet, WorkerLoop, WorkerSettings};

#[derive(Parser)]
#[command(name = "classgridd", about = "classgrid daemon")]
struct Cli {
    /// Path to classgrid.toml. Built-in defaults are used when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run gateway, relay, autoscaler and in-process workers together.
    Standalone {
        /// Address to listen on (overrides gateway.listen).
        #[arg(long)]
        listen: Option<SocketAddr>,
    },

    /// Run the HTTP gateway and result relay.
    Gateway {
        /// Address to listen on (overrides gateway.listen).
        #[arg(long)]
        listen: Option<SocketAddr>,
    },

    /// Run one worker loop.
    Worker {
        /// Instance id used in logs. Defaults to `pid-<pid>`.
        #[arg(long)]
        id: Option<String>,
    },

    /// Run the autoscaler, launching workers as child processes.
    Autoscaler,

    /// Print the effective configuration as TOML.
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = match &cli.config {
        Some(path) => {
            let config = ClassgridConfig::from_file(path)?;
            info!(path = %path.display(), "configuration loaded");
            config
        }
        None => ClassgridConfig::default(),
    };

    match cli.command {
        Command::Standalone { listen } => run_standalone(config, listen).await,
        Command::Gateway { listen } => gateway_mode::run_gateway(config, listen).await,
        Command::Worker { id } => {
            let id = id.unwrap_or_else(|| format!("pid-{}", std::process::id()));
            worker_mode::run_worker(config, id).await
        }
        Command::Autoscaler => worker_mode::run_autoscaler(config, cli.config).await,
        Command::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,classgridd=debug,classgrid=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Resolve on ctrl-c, then broadcast shutdown to every background loop.
pub(crate) async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install CTRL+C handler");
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
}

async fn run_standalone(config: ClassgridConfig, listen: Option<SocketAddr>) -> anyhow::Result<()> {
    info!("classgrid daemon starting in standalone mode");

    if config.queues.backend == QueueBackend::Redis {
        info!("standalone mode keeps queues in memory; queues.backend = \"redis\" is ignored");
    }

    // ── Initialize subsystems ──────────────────────────────────

    let broker = Arc::new(MemoryBroker::new(config.queues.visibility_timeout));
    let (input, output) = backends::open_buckets(&config)?;
    let classifier = backends::load_classifier(&config)?;
    info!(
        input = %config.storage.input_bucket,
        output = %config.storage.output_bucket,
        "buckets opened"
    );

    let correlator = Correlator::new();
    let dispatcher = Dispatcher::new(
        broker.clone(),
        input.clone(),
        output.clone(),
        correlator.clone(),
        Arc::new(GatewayMetrics::new()),
        DispatcherSettings::from_config(&config),
    );
    let relay = ResultRelay::new(broker.clone(), correlator, RelaySettings::from_config(&config));

    let template = WorkerLoop::new(
        "template",
        broker.clone(),
        input,
        output,
        classifier,
        WorkerSettings::from_config(&config),
    );
    let fleet = Arc::new(LocalFleet::new(template));
    let mut autoscaler = Autoscaler::new(
        broker,
        config.queues.task_queue.clone(),
        fleet.clone(),
        &config.autoscale,
    );
    let fleet_snapshots = autoscaler.subscribe();
    info!(
        min = config.autoscale.min_instances,
        max = config.autoscale.max_instances,
        "autoscaler initialized"
    );

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let relay_shutdown = shutdown_rx.clone();
    let autoscale_shutdown = shutdown_rx.clone();

    // ── Start background tasks ─────────────────────────────────

    let relay_handle = tokio::spawn(async move {
        relay.run(relay_shutdown).await;
    });

    // The first tick runs one interval after start; bring the fleet up to
    // its floor now so the first uploads have a worker.
    if let Err(e) = autoscaler.tick().await {
        tracing::warn!(error = %e, "initial autoscaler tick failed");
    }
    let interval = config.autoscale.interval;
    let autoscale_handle = tokio::spawn(async move {
        autoscaler.run(interval, autoscale_shutdown).await;
    });

    // ── Start API server ───────────────────────────────────────

    let router = build_router(GatewayState {
        dispatcher,
        upload_field: config.gateway.upload_field.clone(),
        fleet: Some(fleet_snapshots),
    });
    let addr = listen.unwrap_or(config.gateway.listen);
    info!(%addr, "gateway listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await?;

    // Wait for background tasks, then drain the workers.
    let _ = relay_handle.await;
    let _ = autoscale_handle.await;
    fleet.shutdown().await;

    info!("classgrid daemon stopped");
    Ok(())
}

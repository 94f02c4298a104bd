use std::process::ExitCode;

use clap::Parser;
use eyre::Result;
use tokio::select;
use tracing::{Level, error, info};
use tracing_error::ErrorLayer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, filter::Directive};
use uuid::Uuid;

use k8s_shredder::{
    ClusterGateway, Config, Metrics, ScheduleGate, Shutdown, start_eviction_loop,
};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let config = Config::parse();

    init_tracing_subscriber()?;
    install_color_eyre()?;

    info!("k8s-shredder {}", env!("CARGO_PKG_VERSION"));

    let shutdown = Shutdown::new();
    if let Err(err) = try_main(config, &shutdown).await {
        error!(?err, "Failed to start");
        shutdown.trigger_shutdown();
    }

    shutdown.wait_shutdown_triggered().await;

    select! {
        _ = shutdown.wait_shutdown_complete() => {},
        _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => {
            info!("Waiting for graceful shutdown");
            shutdown.wait_shutdown_complete().await;
        }
    }

    info!("Bye!");
    Ok(ExitCode::from(1))
}

async fn try_main(config: Config, shutdown: &Shutdown) -> Result<()> {
    let instance_id = Uuid::new_v4();
    info!(%instance_id, dry_run = config.dry_run, "Starting");

    let gate = ScheduleGate::try_new(
        config.eviction_loop_schedule.as_deref(),
        config.eviction_loop_duration.as_deref(),
    )?;
    let metrics = Metrics::new()?;
    let gateway = ClusterGateway::try_new(
        kube::Config::infer().await?,
        &config.argo_rollouts_api_version,
        config.dry_run,
    )?;

    start_eviction_loop(gateway, config, gate, metrics, shutdown)?;
    info!("Eviction loop started");

    Ok(())
}

fn init_tracing_subscriber() -> Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(Directive::from(Level::INFO))
        .from_env()?;

    let fmt = tracing_subscriber::fmt::layer().with_filter(filter);

    tracing_subscriber::registry()
        .with(fmt)
        .with(ErrorLayer::default())
        .try_init()?;

    Ok(())
}

fn install_color_eyre() -> Result<()> {
    color_eyre::config::HookBuilder::new()
        .capture_span_trace_by_default(true)
        .install()?;
    Ok(())
}

use chrono::Utc;
use eyre::Result;
use tokio::select;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, Level, debug, error, info, span};

use crate::config::Config;
use crate::consts::{REASON_KARPENTER_DISRUPTED, REASON_KARPENTER_DRIFTED, REASON_NODE_LABEL};
use crate::gateway::ClusterGateway;
use crate::metrics::Metrics;
use crate::park::park_nodes;
use crate::planner::{parked_nodes, process_parked_nodes};
use crate::rollout::RolloutCoordinator;
use crate::schedule::ScheduleGate;
use crate::shutdown::Shutdown;
use crate::sources;
use crate::spawn_service::spawn_service;

/// Starts the periodic eviction loop. Ticks are serialized: the next tick is
/// not polled until the previous one has fully finished, so a slow API server
/// stretches the period instead of overlapping work.
pub fn start_eviction_loop(
    gateway: ClusterGateway,
    config: Config,
    gate: ScheduleGate,
    metrics: Metrics,
    shutdown: &Shutdown,
) -> Result<()> {
    spawn_service(shutdown, "eviction-loop", {
        let shutdown = shutdown.clone();
        async move {
            let mut interval = tokio::time::interval(config.eviction_loop_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                select! {
                    _ = shutdown.wait_shutdown_triggered() => break,
                    _ = interval.tick() => {}
                }

                select! {
                    _ = shutdown.wait_shutdown_triggered() => break,
                    _ = run_tick(&gateway, &config, &gate, &metrics) => {}
                }
            }
        }
    })?;

    Ok(())
}

/// One pass: schedule gate, parking sources, then the eviction campaign over
/// every parked node.
pub async fn run_tick(
    gateway: &ClusterGateway,
    config: &Config,
    gate: &ScheduleGate,
    metrics: &Metrics,
) {
    let span = span!(Level::ERROR, "eviction-loop");
    async move {
        metrics.loops_total.inc();

        if !gate.is_active(Utc::now()) {
            debug!("Outside the scheduled eviction window, skipping");
            return;
        }

        metrics.reset_tick_gauges();
        let timer = metrics.loops_duration_seconds.start_timer();
        if gateway.is_dry_run() {
            info!("Dry run: mutations are annotated server-side only");
        }

        let coordinator =
            RolloutCoordinator::start(gateway.clone(), config.clone(), metrics.clone());

        run_parking_sources(gateway, config, metrics).await;

        match parked_nodes(gateway, config).await {
            Ok(nodes) => {
                debug!(count = nodes.len(), "Processing parked nodes");
                process_parked_nodes(gateway, config, metrics, coordinator, &nodes).await;
            }
            Err(err) => {
                error!(?err, "Failed to list parked nodes");
                metrics.errors_total.inc();
                coordinator.drain().await;
            }
        }

        timer.observe_duration();
    }
    .instrument(span)
    .await
}

/// Runs the enabled parking sources in a fixed order. A failing source is
/// logged and counted; it never blocks the others or the eviction phase.
async fn run_parking_sources(gateway: &ClusterGateway, config: &Config, metrics: &Metrics) {
    if config.enable_karpenter_drift_detection {
        let candidates = sources::drifted_nodes(gateway, config).await;
        park_candidates(gateway, config, metrics, REASON_KARPENTER_DRIFTED, candidates).await;
    }

    if config.enable_karpenter_disruption_detection {
        let candidates = sources::disrupted_nodes(gateway, config).await;
        park_candidates(
            gateway,
            config,
            metrics,
            REASON_KARPENTER_DISRUPTED,
            candidates,
        )
        .await;
    }

    if config.enable_node_label_detection {
        let candidates = sources::labeled_nodes(gateway, config).await;
        park_candidates(gateway, config, metrics, REASON_NODE_LABEL, candidates).await;
    }
}

async fn park_candidates(
    gateway: &ClusterGateway,
    config: &Config,
    metrics: &Metrics,
    reason: &str,
    candidates: Result<Vec<String>>,
) {
    let candidates = match candidates {
        Ok(candidates) => candidates,
        Err(err) => {
            error!(reason, ?err, "Parking source failed");
            metrics.errors_total.inc();
            metrics.source_counters(reason).errors_total.inc();
            return;
        }
    };

    if candidates.is_empty() {
        return;
    }

    info!(reason, count = candidates.len(), "Discovered parking candidates");
    if let Err(err) = park_nodes(gateway, config, metrics, &candidates, reason).await {
        error!(reason, ?err, "Parking engine failed");
        metrics.errors_total.inc();
        metrics.source_counters(reason).errors_total.inc();
    }
}

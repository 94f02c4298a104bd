use std::collections::HashSet;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{Instrument, Level, debug, error, info, span, warn};

use crate::config::Config;
use crate::failures::FailureKind;
use crate::gateway::ClusterGateway;
use crate::metrics::Metrics;
use crate::workload::{
    ControllerKind, ControllerRef, deployment_rollout_in_progress, restart_rollout_patch,
    restart_template_patch, rollout_is_paused, stateful_set_rollout_in_progress,
};

const RESTART_QUEUE_DEPTH: usize = 64;

#[derive(Debug, Error)]
enum RestartError {
    #[error("kube error: {0}")]
    Kube(#[from] kube::Error),
    #[error("controller kind {0} cannot be rollout-restarted")]
    Unsupported(&'static str),
}

/// Serializes rollout-restart patches behind a single worker so that each
/// controller object is patched at most once per loop, no matter how many of
/// its pods the planners see.
pub struct RolloutCoordinator {
    tx: mpsc::Sender<ControllerRef>,
    worker: JoinHandle<()>,
}

impl RolloutCoordinator {
    pub fn start(gateway: ClusterGateway, config: Config, metrics: Metrics) -> RolloutCoordinator {
        let (tx, rx) = mpsc::channel(RESTART_QUEUE_DEPTH);
        let worker = tokio::spawn(
            run_worker(gateway, config, metrics, rx)
                .instrument(span!(Level::ERROR, "rollout-coordinator")),
        );

        RolloutCoordinator { tx, worker }
    }

    /// Planners submit restart requests through clones of this sender.
    pub fn sender(&self) -> mpsc::Sender<ControllerRef> {
        self.tx.clone()
    }

    /// Closes the queue and waits until every accepted request has been
    /// handled, so no patch is outstanding when the tick ends.
    pub async fn drain(self) {
        drop(self.tx);
        if let Err(err) = self.worker.await {
            error!(?err, "Rollout coordinator worker panicked");
        }
    }
}

async fn run_worker(
    gateway: ClusterGateway,
    config: Config,
    metrics: Metrics,
    mut rx: mpsc::Receiver<ControllerRef>,
) {
    // Fingerprints acted on this loop; the worker is the only writer.
    let mut completed: HashSet<String> = HashSet::new();

    while let Some(controller) = rx.recv().await {
        let fingerprint = controller.fingerprint();
        if !completed.insert(fingerprint.clone()) {
            debug!(%fingerprint, "Rollout restart already handled this loop");
            continue;
        }

        match restart_controller(&gateway, &config, &controller).await {
            Ok(()) => {}
            Err(RestartError::Kube(err)) if FailureKind::of(&err) == FailureKind::Gone => {
                debug!(%fingerprint, "Controller object is gone, nothing to restart");
            }
            Err(err) => {
                warn!(%fingerprint, ?err, "Failed to restart controller object");
                metrics.errors_total.inc();
            }
        }
    }
}

async fn restart_controller(
    gateway: &ClusterGateway,
    config: &Config,
    controller: &ControllerRef,
) -> Result<(), RestartError> {
    let now = Utc::now();
    let namespace = &controller.namespace;
    let name = &controller.name;

    match controller.kind {
        ControllerKind::Deployment => {
            // State may have moved since the planner enqueued this.
            let deployment = gateway.get_deployment(namespace, name).await?;
            if deployment_rollout_in_progress(&deployment) {
                debug!(%namespace, %name, "Deployment rollout already in progress");
                return Ok(());
            }

            let patch = restart_template_patch(&config.restarted_at_annotation, now);
            gateway
                .patch_deployment_strategic(namespace, name, &patch)
                .await?;
            info!(%namespace, %name, "Restarted deployment");
        }
        ControllerKind::StatefulSet => {
            let stateful_set = gateway.get_stateful_set(namespace, name).await?;
            if stateful_set_rollout_in_progress(&stateful_set) {
                debug!(%namespace, %name, "StatefulSet rollout already in progress");
                return Ok(());
            }

            let patch = restart_template_patch(&config.restarted_at_annotation, now);
            gateway
                .patch_stateful_set_strategic(namespace, name, &patch)
                .await?;
            info!(%namespace, %name, "Restarted statefulset");
        }
        ControllerKind::Rollout => {
            let rollout = gateway.get_rollout(namespace, name).await?;
            if rollout_is_paused(&rollout) {
                warn!(%namespace, %name, "Rollout is paused, not restarting");
                return Ok(());
            }

            gateway
                .patch_rollout_merge(namespace, name, &restart_rollout_patch(now))
                .await?;
            info!(%namespace, %name, "Restarted rollout");
        }
        other => return Err(RestartError::Unsupported(other.as_str())),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::test_config;

    fn offline_gateway() -> ClusterGateway {
        let kube_config = kube::Config::new("http://localhost:8080".parse().unwrap());
        ClusterGateway::try_new(kube_config, "v1alpha1", true).unwrap()
    }

    #[tokio::test]
    async fn duplicate_fingerprints_are_dropped() {
        let config = test_config();
        let metrics = Metrics::new().unwrap();
        let coordinator =
            RolloutCoordinator::start(offline_gateway(), config, metrics.clone());

        // DaemonSets are rejected without touching the cluster, so each
        // accepted request shows up as exactly one error.
        let controller = ControllerRef {
            kind: ControllerKind::DaemonSet,
            namespace: String::from("default"),
            name: String::from("logging"),
        };

        let sender = coordinator.sender();
        sender.send(controller.clone()).await.unwrap();
        sender.send(controller.clone()).await.unwrap();
        sender.send(controller).await.unwrap();
        drop(sender);

        coordinator.drain().await;

        assert_eq!(metrics.errors_total.get(), 1);
    }

    #[tokio::test]
    async fn distinct_controllers_are_each_handled() {
        let config = test_config();
        let metrics = Metrics::new().unwrap();
        let coordinator =
            RolloutCoordinator::start(offline_gateway(), config, metrics.clone());

        let sender = coordinator.sender();
        for name in ["one", "two"] {
            sender
                .send(ControllerRef {
                    kind: ControllerKind::StaticPod,
                    namespace: String::from("kube-system"),
                    name: String::from(name),
                })
                .await
                .unwrap();
        }
        drop(sender);

        coordinator.drain().await;

        assert_eq!(metrics.errors_total.get(), 2);
    }
}

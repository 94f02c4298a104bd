use chrono::{DateTime, Duration, Utc};
use eyre::{Result, WrapErr};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::ResourceExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::consts::UPGRADE_STATUS_PARKED;
use crate::failures::FailureKind;
use crate::gateway::ClusterGateway;
use crate::labels::{
    get_expires_on, is_eviction_opted_out, is_node_parked, is_pod_evictable, node_has_taint_key,
    pod_carries_parking_record,
};
use crate::metrics::Metrics;
use crate::rollout::RolloutCoordinator;
use crate::unpark::unpark_node;
use crate::workload::{
    ControllerKind, ControllerRef, deployment_rollout_in_progress, resolve_pod_controller,
    rollout_is_paused, stateful_set_rollout_in_progress,
};

/// What the planner decides to do with one pod before the node expires.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PodAction {
    /// Tenant opted out until expiry.
    Skip,
    /// PDB-respecting soft eviction.
    Evict,
    /// Hand the pod's controller to the rollout coordinator.
    ConsiderRestart,
}

/// Processes one parked node: walks its evictable pods sequentially and
/// issues at most one action per pod. Past the node's expiry the planner
/// switches to force deletion, gated by the safety predicate.
pub async fn process_node(
    gateway: &ClusterGateway,
    config: &Config,
    metrics: &Metrics,
    restart_tx: &mpsc::Sender<ControllerRef>,
    node: &Node,
) -> Result<()> {
    let name = node.name_any();

    if node_has_taint_key(node, &config.to_be_deleted_taint) {
        debug!(node = %name, "Node is owned by the autoscaler, skipping");
        return Ok(());
    }

    let expires_on = match get_expires_on(node, config) {
        Ok(Some(expires_on)) => expires_on,
        Ok(None) => {
            error!(node = %name, "Parked node is missing its expiry label, skipping");
            metrics.errors_total.inc();
            return Ok(());
        }
        Err(raw) => {
            error!(node = %name, value = %raw, "Parked node has an unparsable expiry label, skipping");
            metrics.errors_total.inc();
            return Ok(());
        }
    };

    metrics
        .node_force_to_evict_time
        .with_label_values(&[&name])
        .set(expires_on.timestamp() as f64);

    let pods = gateway
        .list_pods_on_node(&name)
        .await
        .wrap_err("listing pods on node")?;
    let evictable: Vec<&Pod> = pods.iter().filter(|pod| is_pod_evictable(pod)).collect();

    for pod in &evictable {
        metrics
            .pod_force_to_evict_time
            .with_label_values(&[&pod.name_any(), &pod.namespace().unwrap_or_default()])
            .set(expires_on.timestamp() as f64);
    }

    let now = Utc::now();
    if now > expires_on {
        force_delete_pods(gateway, config, metrics, &name, &evictable).await;
        metrics.processed_nodes_total.inc();
        return Ok(());
    }

    let ttl = Duration::from_std(config.parked_node_ttl).wrap_err("parked node TTL out of range")?;
    for pod in evictable {
        let pod_name = pod.name_any();
        let namespace = pod.namespace().unwrap_or_default();

        let action = plan_pod_action(pod, config, now, expires_on, ttl);
        match action {
            PodAction::Skip => {
                debug!(pod = %pod_name, %namespace, "Pod opted out of eviction until expiry");
            }
            PodAction::Evict => {
                evict_pod(gateway, metrics, pod).await;
            }
            PodAction::ConsiderRestart => {
                consider_restart(gateway, config, metrics, restart_tx, pod).await;
            }
        }
    }

    metrics.processed_nodes_total.inc();
    Ok(())
}

/// Lists parked nodes and runs the planner, skipping nodes the autoscaler
/// already owns. Used by the loop driver.
pub async fn parked_nodes(gateway: &ClusterGateway, config: &Config) -> Result<Vec<Node>> {
    let selector = format!("{}={}", config.upgrade_status_label, UPGRADE_STATUS_PARKED);
    let nodes = gateway
        .list_nodes_labeled(&selector)
        .await
        .wrap_err("listing parked nodes")?;

    Ok(nodes
        .into_iter()
        .filter(|node| is_node_parked(node, config))
        .filter(|node| !node_has_taint_key(node, &config.to_be_deleted_taint))
        .collect())
}

fn plan_pod_action(
    pod: &Pod,
    config: &Config,
    now: DateTime<Utc>,
    expires_on: DateTime<Utc>,
    ttl: Duration,
) -> PodAction {
    if is_eviction_opted_out(pod, config) {
        return PodAction::Skip;
    }

    let prefix = &config.namespace_prefix_skip_initial_eviction;
    let skips_initial_eviction = !prefix.is_empty()
        && pod
            .namespace()
            .is_some_and(|namespace| namespace.starts_with(prefix));

    if !skips_initial_eviction && now < rollout_phase_start(expires_on, ttl, config.rolling_restart_threshold)
    {
        return PodAction::Evict;
    }

    PodAction::ConsiderRestart
}

/// The instant the planner stops preferring soft eviction: the configured
/// fraction of the TTL must pass before rollout restarts begin.
fn rollout_phase_start(expires_on: DateTime<Utc>, ttl: Duration, threshold: f64) -> DateTime<Utc> {
    let before_expiry = (1.0 - threshold) * ttl.num_milliseconds() as f64;
    expires_on - Duration::milliseconds(before_expiry as i64)
}

async fn evict_pod(gateway: &ClusterGateway, metrics: &Metrics, pod: &Pod) {
    let pod_name = pod.name_any();
    let namespace = pod.namespace().unwrap_or_default();

    match gateway.evict_pod(pod).await {
        Ok(()) => {
            info!(pod = %pod_name, %namespace, "Evicted pod");
            metrics.processed_pods_total.inc();
        }
        Err(err) => match FailureKind::of(&err) {
            FailureKind::Gone => {
                debug!(pod = %pod_name, %namespace, "Pod is gone anyway");
            }
            kind => {
                // A denied eviction (blocked by a PDB) lands here too; the
                // next tick retries.
                warn!(pod = %pod_name, %namespace, ?err, "Failed to evict pod");
                metrics.errors_total.inc();
                metrics.record_pod_error(
                    &pod_name,
                    &namespace,
                    kind.reason_label("eviction failed"),
                    "evict",
                );
            }
        },
    }
}

async fn consider_restart(
    gateway: &ClusterGateway,
    config: &Config,
    metrics: &Metrics,
    restart_tx: &mpsc::Sender<ControllerRef>,
    pod: &Pod,
) {
    let pod_name = pod.name_any();
    let namespace = pod.namespace().unwrap_or_default();

    let controller = match resolve_pod_controller(gateway, config, pod).await {
        Ok(controller) => controller,
        Err(err) => {
            warn!(pod = %pod_name, %namespace, ?err, "Failed to resolve pod controller, skipping");
            metrics.errors_total.inc();
            metrics.record_pod_error(&pod_name, &namespace, "controller resolution failed", "restart");
            return;
        }
    };

    if !controller.kind.is_restartable() {
        // Bare replicasets and unknown owners cannot be rolled; evict instead.
        evict_pod(gateway, metrics, pod).await;
        return;
    }

    let in_progress = match restart_in_progress(gateway, &controller).await {
        Ok(InProgress::Paused) => {
            warn!(
                pod = %pod_name,
                %namespace,
                controller = %controller.fingerprint(),
                "Rollout is paused, leaving pod alone"
            );
            return;
        }
        Ok(InProgress::Yes) => true,
        Ok(InProgress::No) => false,
        Err(err) => {
            warn!(pod = %pod_name, %namespace, ?err, "Failed to inspect controller, skipping");
            metrics.errors_total.inc();
            metrics.record_pod_error(&pod_name, &namespace, "controller inspection failed", "restart");
            return;
        }
    };

    if in_progress {
        // A rollout is already replacing this controller's pods; nudge ours
        // out with a plain eviction instead of piling on another restart.
        evict_pod(gateway, metrics, pod).await;
        return;
    }

    if restart_tx.send(controller.clone()).await.is_err() {
        warn!(
            controller = %controller.fingerprint(),
            "Rollout coordinator is gone, dropping restart request"
        );
        return;
    }

    debug!(
        pod = %pod_name,
        %namespace,
        controller = %controller.fingerprint(),
        "Requested rollout restart"
    );
    metrics.processed_pods_total.inc();
}

enum InProgress {
    Yes,
    No,
    Paused,
}

async fn restart_in_progress(
    gateway: &ClusterGateway,
    controller: &ControllerRef,
) -> kube::Result<InProgress> {
    match controller.kind {
        ControllerKind::Deployment => {
            let deployment = gateway
                .get_deployment(&controller.namespace, &controller.name)
                .await?;
            Ok(if deployment_rollout_in_progress(&deployment) {
                InProgress::Yes
            } else {
                InProgress::No
            })
        }
        ControllerKind::StatefulSet => {
            let stateful_set = gateway
                .get_stateful_set(&controller.namespace, &controller.name)
                .await?;
            Ok(if stateful_set_rollout_in_progress(&stateful_set) {
                InProgress::Yes
            } else {
                InProgress::No
            })
        }
        ControllerKind::Rollout => {
            let rollout = gateway
                .get_rollout(&controller.namespace, &controller.name)
                .await?;
            Ok(if rollout_is_paused(&rollout) {
                InProgress::Paused
            } else {
                // The rollout controller's own state machine is respected.
                InProgress::No
            })
        }
        _ => Ok(InProgress::No),
    }
}

/// Past expiry: delete everything left, unless the safety predicate shows
/// pods the parking pass never labeled, in which case the whole node is
/// unparked instead.
async fn force_delete_pods(
    gateway: &ClusterGateway,
    config: &Config,
    metrics: &Metrics,
    node_name: &str,
    evictable: &[&Pod],
) {
    if config.eviction_safety_check && !safety_predicate_holds(evictable, config) {
        warn!(
            node = %node_name,
            "Unlabeled pods found on an expired node, unparking instead of force deleting"
        );
        if let Err(err) = unpark_node(gateway, config, node_name).await {
            error!(node = %node_name, ?err, "Failed to unpark node");
            metrics.errors_total.inc();
        }
        return;
    }

    for pod in evictable {
        let pod_name = pod.name_any();
        let namespace = pod.namespace().unwrap_or_default();

        match gateway.force_delete_pod(pod).await {
            Ok(()) => {
                info!(pod = %pod_name, %namespace, node = %node_name, "Force deleted pod");
                metrics.processed_pods_total.inc();
            }
            Err(err) => match FailureKind::of(&err) {
                FailureKind::Gone => {
                    debug!(pod = %pod_name, %namespace, "Pod is gone anyway");
                }
                kind => {
                    warn!(pod = %pod_name, %namespace, ?err, "Failed to force delete pod");
                    metrics.errors_total.inc();
                    metrics.record_pod_error(
                        &pod_name,
                        &namespace,
                        kind.reason_label("deletion failed"),
                        "force-delete",
                    );
                }
            },
        }
    }
}

/// Every evictable pod on the node must carry the parking record before
/// disruption budgets may be bypassed.
fn safety_predicate_holds(evictable: &[&Pod], config: &Config) -> bool {
    evictable
        .iter()
        .all(|pod| pod_carries_parking_record(pod, config))
}

/// Spawns one planner per parked node and waits for all of them; the rollout
/// coordinator runs concurrently and is drained afterwards.
pub async fn process_parked_nodes(
    gateway: &ClusterGateway,
    config: &Config,
    metrics: &Metrics,
    coordinator: RolloutCoordinator,
    nodes: &[Node],
) {
    use futures::StreamExt;

    let restart_tx = coordinator.sender();
    futures::stream::iter(nodes)
        .for_each_concurrent(None, |node| {
            let restart_tx = restart_tx.clone();
            async move {
                let name = node.name_any();
                let timer = metrics.processing_duration_seconds.start_timer();
                if let Err(err) =
                    process_node(gateway, config, metrics, &restart_tx, node).await
                {
                    error!(node = %name, ?err, "Failed to process parked node");
                    metrics.errors_total.inc();
                }
                timer.observe_duration();
            }
        })
        .await;

    drop(restart_tx);
    coordinator.drain().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::test_config;

    macro_rules! from_json {
        ($($json:tt)+) => {
            ::serde_json::from_value(::serde_json::json!($($json)+)).expect("Invalid json")
        };
    }

    fn at(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn plain_pod(namespace: &str) -> Pod {
        from_json!({
            "metadata": {
                "name": "p1",
                "namespace": namespace,
                "ownerReferences": [
                    { "apiVersion": "apps/v1", "kind": "ReplicaSet", "name": "web-5d4f", "uid": "1" }
                ]
            }
        })
    }

    #[test]
    fn pods_are_evicted_before_the_rollout_phase() {
        let config = test_config();
        let expires_on = at("2025-03-12T01:00:00Z");
        let ttl = Duration::minutes(60);

        // threshold 0.5: rollout phase starts half way, at 00:30
        let action = plan_pod_action(
            &plain_pod("default"),
            &config,
            at("2025-03-12T00:10:00Z"),
            expires_on,
            ttl,
        );
        assert_eq!(action, PodAction::Evict);

        let action = plan_pod_action(
            &plain_pod("default"),
            &config,
            at("2025-03-12T00:40:00Z"),
            expires_on,
            ttl,
        );
        assert_eq!(action, PodAction::ConsiderRestart);
    }

    #[test]
    fn threshold_zero_means_rollout_from_the_start() {
        let mut config = test_config();
        config.rolling_restart_threshold = 0.0;

        let expires_on = at("2025-03-12T01:00:00Z");
        let action = plan_pod_action(
            &plain_pod("default"),
            &config,
            at("2025-03-12T00:00:01Z"),
            expires_on,
            Duration::minutes(60),
        );
        assert_eq!(action, PodAction::ConsiderRestart);
    }

    #[test]
    fn threshold_one_means_eviction_until_expiry() {
        let mut config = test_config();
        config.rolling_restart_threshold = 1.0;

        let expires_on = at("2025-03-12T01:00:00Z");
        let action = plan_pod_action(
            &plain_pod("default"),
            &config,
            at("2025-03-12T00:59:59Z"),
            expires_on,
            Duration::minutes(60),
        );
        assert_eq!(action, PodAction::Evict);
    }

    #[test]
    fn short_ttl_boundary() {
        // TTL 30s, threshold 0.1: eviction window is the first 3 seconds
        let mut config = test_config();
        config.rolling_restart_threshold = 0.1;
        let expires_on = at("2025-03-12T00:00:30Z");
        let ttl = Duration::seconds(30);

        let action = plan_pod_action(
            &plain_pod("default"),
            &config,
            at("2025-03-12T00:00:02Z"),
            expires_on,
            ttl,
        );
        assert_eq!(action, PodAction::Evict);

        let action = plan_pod_action(
            &plain_pod("default"),
            &config,
            at("2025-03-12T00:00:04Z"),
            expires_on,
            ttl,
        );
        assert_eq!(action, PodAction::ConsiderRestart);
    }

    #[test]
    fn opt_out_label_wins() {
        let config = test_config();
        let pod: Pod = from_json!({
            "metadata": {
                "name": "q",
                "namespace": "default",
                "labels": {
                    "shredder.ethos.adobe.net/allow-eviction": "false"
                }
            }
        });

        let action = plan_pod_action(
            &pod,
            &config,
            at("2025-03-12T00:10:00Z"),
            at("2025-03-12T01:00:00Z"),
            Duration::minutes(60),
        );
        assert_eq!(action, PodAction::Skip);
    }

    #[test]
    fn namespace_prefix_skips_the_eviction_phase() {
        let mut config = test_config();
        config.namespace_prefix_skip_initial_eviction = String::from("tenant-");

        let action = plan_pod_action(
            &plain_pod("tenant-blue"),
            &config,
            at("2025-03-12T00:01:00Z"),
            at("2025-03-12T01:00:00Z"),
            Duration::minutes(60),
        );
        assert_eq!(action, PodAction::ConsiderRestart);

        let action = plan_pod_action(
            &plain_pod("default"),
            &config,
            at("2025-03-12T00:01:00Z"),
            at("2025-03-12T01:00:00Z"),
            Duration::minutes(60),
        );
        assert_eq!(action, PodAction::Evict);
    }

    #[test]
    fn empty_namespace_prefix_skips_nothing() {
        let config = test_config();
        assert!(config.namespace_prefix_skip_initial_eviction.is_empty());

        let action = plan_pod_action(
            &plain_pod("default"),
            &config,
            at("2025-03-12T00:01:00Z"),
            at("2025-03-12T01:00:00Z"),
            Duration::minutes(60),
        );
        assert_eq!(action, PodAction::Evict);
    }

    #[test]
    fn safety_predicate_fails_on_unlabeled_pods() {
        let config = test_config();

        let labeled: Pod = from_json!({
            "metadata": {
                "name": "p1",
                "namespace": "default",
                "labels": {
                    "shredder.ethos.adobe.net/upgrade-status": "parked",
                    "shredder.ethos.adobe.net/parked-node-expires-on": "1700000000"
                }
            }
        });
        let unlabeled: Pod = from_json!({
            "metadata": { "name": "x", "namespace": "default" }
        });

        assert!(safety_predicate_holds(&[&labeled], &config));
        assert!(!safety_predicate_holds(&[&labeled, &unlabeled], &config));
        assert!(safety_predicate_holds(&[], &config));
    }

    #[test]
    fn opted_out_pods_still_satisfy_the_safety_predicate() {
        let config = test_config();

        // parked at parking time, even though it opted out of soft eviction
        let opted_out: Pod = from_json!({
            "metadata": {
                "name": "q",
                "namespace": "default",
                "labels": {
                    "shredder.ethos.adobe.net/allow-eviction": "false",
                    "shredder.ethos.adobe.net/upgrade-status": "parked",
                    "shredder.ethos.adobe.net/parked-node-expires-on": "1700000000"
                }
            }
        });
        assert!(safety_predicate_holds(&[&opted_out], &config));
    }

    #[test]
    fn rollout_phase_start_math() {
        let expires_on = at("2025-03-12T01:00:00Z");
        let ttl = Duration::minutes(60);

        assert_eq!(
            rollout_phase_start(expires_on, ttl, 0.5),
            at("2025-03-12T00:30:00Z")
        );
        assert_eq!(
            rollout_phase_start(expires_on, ttl, 0.0),
            at("2025-03-12T00:00:00Z")
        );
        assert_eq!(rollout_phase_start(expires_on, ttl, 1.0), expires_on);
    }
}

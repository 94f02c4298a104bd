use chrono::{DateTime, Duration, Utc};
use eyre::{Result, WrapErr};
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::gateway::ClusterGateway;
use crate::labels::{
    is_node_parked, is_pod_evictable, labels_merge_patch, parking_labels,
    taints_with_parking_taint,
};
use crate::metrics::Metrics;

/// Parks candidate nodes: labels, cordon, taint, and the same labels on every
/// evictable pod. Enforces the simultaneous-parked-node ceiling with a
/// deterministic (creation time, name) ordering.
///
/// Individual node failures are logged and counted; the only hard error is
/// failing to list nodes, without which the ceiling is uncomputable.
pub async fn park_nodes(
    gateway: &ClusterGateway,
    config: &Config,
    metrics: &Metrics,
    candidates: &[String],
    reason: &str,
) -> Result<()> {
    if candidates.is_empty() {
        return Ok(());
    }

    let nodes = gateway
        .list_nodes()
        .await
        .wrap_err("listing nodes to compute the parking quota")?;

    let mut eligible: Vec<&Node> = Vec::new();
    for name in candidates {
        match nodes.iter().find(|node| &node.name_any() == name) {
            Some(node) if is_node_parked(node, config) => {
                debug!(node = %name, "Node is already parked, skipping");
            }
            Some(node) => eligible.push(node),
            None => warn!(node = %name, "Candidate node not found, skipping"),
        }
    }
    order_candidates(&mut eligible);

    let already_parked = nodes
        .iter()
        .filter(|node| is_node_parked(node, config))
        .count();
    let limit = parse_max_parked_nodes(&config.max_parked_nodes, nodes.len());

    if let Some(limit) = limit {
        let slots = limit.saturating_sub(already_parked);
        if slots == 0 {
            info!(
                limit,
                already_parked,
                candidates = eligible.len(),
                "Parked node ceiling reached, not parking"
            );
            return Ok(());
        }
        eligible.truncate(slots);
    }

    let ttl = Duration::from_std(config.parked_node_ttl).wrap_err("parked node TTL out of range")?;
    let expires_on = Utc::now() + ttl;

    for node in eligible {
        let name = node.name_any();
        match park_node(gateway, config, node, reason, expires_on).await {
            Ok(()) => {
                info!(node = %name, reason, %expires_on, "Parked node");
                metrics.nodes_parked_total.inc();
                metrics.source_counters(reason).nodes_parked_total.inc();
            }
            Err(err) => {
                warn!(node = %name, reason, ?err, "Failed to park node");
                metrics.nodes_parking_failed_total.inc();
                metrics
                    .source_counters(reason)
                    .nodes_parking_failed_total
                    .inc();
            }
        }
    }

    Ok(())
}

async fn park_node(
    gateway: &ClusterGateway,
    config: &Config,
    node: &Node,
    reason: &str,
    expires_on: DateTime<Utc>,
) -> Result<()> {
    let name = node.name_any();
    let labels = parking_labels(config, reason, expires_on);

    let node_patch = json!({
        "metadata": { "labels": labels },
        "spec": {
            "unschedulable": true,
            "taints": taints_with_parking_taint(node, config),
        }
    });
    gateway
        .patch_node(&name, &node_patch)
        .await
        .wrap_err("labeling and cordoning node")?;

    let pods = gateway
        .list_pods_on_node(&name)
        .await
        .wrap_err("listing pods on node")?;
    let pod_patch = labels_merge_patch(parking_labels(config, reason, expires_on));
    for pod in pods.iter().filter(|pod| is_pod_evictable(pod)) {
        if let Err(err) = gateway.patch_pod(pod, &pod_patch).await {
            warn!(
                pod = %pod.name_any(),
                namespace = %pod.namespace().unwrap_or_default(),
                ?err,
                "Failed to label pod, continuing"
            );
        }
    }

    Ok(())
}

/// Oldest nodes first; names break ties so identical candidate sets park in
/// the same order on every loop.
fn order_candidates(nodes: &mut [&Node]) {
    nodes.sort_by_key(|node| {
        (
            node.metadata.creation_timestamp.as_ref().map(|time| time.0),
            node.name_any(),
        )
    });
}

/// The parked-node ceiling: an integer, a percentage of the cluster, or
/// `None` for no limit. Values that make no sense disable the limit with a
/// warning rather than blocking the loop.
fn parse_max_parked_nodes(input: &str, total_nodes: usize) -> Option<usize> {
    if let Some(percentage) = input.strip_suffix('%') {
        match percentage.trim().parse::<i64>() {
            Ok(value) if value > 0 => {
                return Some((value as f64 / 100.0 * total_nodes as f64).floor() as usize);
            }
            Ok(_) | Err(_) => {
                warn!(max_parked_nodes = %input, "Unusable parked node ceiling, no limit applied");
                return None;
            }
        }
    }

    match input.trim().parse::<i64>() {
        Ok(0) => None,
        Ok(value) if value > 0 => Some(value as usize),
        Ok(_) => {
            warn!(max_parked_nodes = %input, "Negative parked node ceiling, no limit applied");
            None
        }
        Err(_) => {
            warn!(max_parked_nodes = %input, "Unparsable parked node ceiling, no limit applied");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    macro_rules! from_json {
        ($($json:tt)+) => {
            ::serde_json::from_value(::serde_json::json!($($json)+)).expect("Invalid json")
        };
    }

    #[test]
    fn ceiling_parses_integers_percentages_and_zero() {
        assert_eq!(parse_max_parked_nodes("0", 10), None);
        assert_eq!(parse_max_parked_nodes("5", 10), Some(5));
        assert_eq!(parse_max_parked_nodes("20%", 10), Some(2));
        assert_eq!(parse_max_parked_nodes("20%", 11), Some(2));
        assert_eq!(parse_max_parked_nodes("50%", 3), Some(1));
    }

    #[test]
    fn unusable_ceiling_means_no_limit() {
        assert_eq!(parse_max_parked_nodes("-1", 10), None);
        assert_eq!(parse_max_parked_nodes("many", 10), None);
        assert_eq!(parse_max_parked_nodes("-20%", 10), None);
        assert_eq!(parse_max_parked_nodes("x%", 10), None);
    }

    #[test]
    fn candidates_order_by_age_then_name() {
        let old: Node = from_json!({
            "metadata": { "name": "w2", "creationTimestamp": "2025-01-01T00:00:00Z" }
        });
        let young: Node = from_json!({
            "metadata": { "name": "w1", "creationTimestamp": "2025-03-01T00:00:00Z" }
        });
        let old_sibling: Node = from_json!({
            "metadata": { "name": "w0", "creationTimestamp": "2025-01-01T00:00:00Z" }
        });

        let mut candidates = vec![&young, &old, &old_sibling];
        order_candidates(&mut candidates);

        let names: Vec<_> = candidates.iter().map(|node| node.name_any()).collect();
        assert_eq!(names, ["w0", "w2", "w1"]);
    }

    #[test]
    fn ordering_is_stable_across_permutations() {
        let a: Node = from_json!({
            "metadata": { "name": "a", "creationTimestamp": "2025-02-01T00:00:00Z" }
        });
        let b: Node = from_json!({
            "metadata": { "name": "b", "creationTimestamp": "2025-02-01T00:00:00Z" }
        });
        let c: Node = from_json!({
            "metadata": { "name": "c", "creationTimestamp": "2025-01-01T00:00:00Z" }
        });

        let mut first = vec![&a, &b, &c];
        let mut second = vec![&c, &b, &a];
        order_candidates(&mut first);
        order_candidates(&mut second);

        let first: Vec<_> = first.iter().map(|node| node.name_any()).collect();
        let second: Vec<_> = second.iter().map(|node| node.name_any()).collect();
        assert_eq!(first, second);
        assert_eq!(first, ["c", "a", "b"]);
    }
}

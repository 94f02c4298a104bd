use eyre::{Result, WrapErr};
use kube::ResourceExt;
use serde_json::json;
use tracing::{info, warn};

use crate::config::Config;
use crate::gateway::ClusterGateway;
use crate::labels::{
    is_node_parked, is_pod_evictable, labels_merge_patch, taints_without_parking_taint,
    unparking_labels,
};

/// Reverses a parking decision: flips the node and its evictable pods to
/// "unparked", drops the expiry and extra labels, removes the parking taint,
/// and uncordons. A no-op on nodes that are not parked.
pub async fn unpark_node(gateway: &ClusterGateway, config: &Config, name: &str) -> Result<()> {
    let node = gateway.get_node(name).await.wrap_err("fetching node")?;
    if !is_node_parked(&node, config) {
        return Ok(());
    }

    let node_patch = json!({
        "metadata": { "labels": unparking_labels(config) },
        "spec": {
            "unschedulable": false,
            "taints": taints_without_parking_taint(&node, config),
        }
    });
    gateway
        .patch_node(name, &node_patch)
        .await
        .wrap_err("unlabeling and uncordoning node")?;

    let pods = gateway
        .list_pods_on_node(name)
        .await
        .wrap_err("listing pods on node")?;
    let pod_patch = labels_merge_patch(unparking_labels(config));
    for pod in pods.iter().filter(|pod| is_pod_evictable(pod)) {
        if let Err(err) = gateway.patch_pod(pod, &pod_patch).await {
            warn!(
                pod = %pod.name_any(),
                namespace = %pod.namespace().unwrap_or_default(),
                ?err,
                "Failed to unlabel pod, continuing"
            );
        }
    }

    info!(node = %name, "Unparked node");
    Ok(())
}

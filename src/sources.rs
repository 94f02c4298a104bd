use std::collections::BTreeMap;
use std::collections::HashSet;

use eyre::{Result, WrapErr};
use kube::ResourceExt;
use kube::api::DynamicObject;

use crate::config::Config;
use crate::consts::UPGRADE_STATUS_PARKED;
use crate::gateway::ClusterGateway;

/// NodeClaim condition marking drifted capacity.
const DRIFT_CONDITION: &str = "Drifted";

/// NodeClaim conditions marking capacity Karpenter wants gone.
const DISRUPTION_CONDITIONS: &[&str] = &["Disrupting", "Terminating", "Empty", "Underutilized"];

/// Nodes whose NodeClaim reports drift. Already-parked nodes are excluded.
pub async fn drifted_nodes(gateway: &ClusterGateway, config: &Config) -> Result<Vec<String>> {
    nodes_from_claims(gateway, config, &[DRIFT_CONDITION]).await
}

/// Nodes whose NodeClaim reports an ongoing disruption.
pub async fn disrupted_nodes(gateway: &ClusterGateway, config: &Config) -> Result<Vec<String>> {
    nodes_from_claims(gateway, config, DISRUPTION_CONDITIONS).await
}

async fn nodes_from_claims(
    gateway: &ClusterGateway,
    config: &Config,
    condition_types: &[&str],
) -> Result<Vec<String>> {
    let claims = gateway
        .list_node_claims()
        .await
        .wrap_err("listing node claims")?;
    let parked = parked_node_names(gateway, config).await?;

    let nodes = claims
        .iter()
        .filter_map(|claim| node_claim_target(claim, condition_types))
        .filter(|node| !parked.contains(node))
        .collect();
    Ok(nodes)
}

/// Nodes matching any of the configured label selectors.
pub async fn labeled_nodes(gateway: &ClusterGateway, config: &Config) -> Result<Vec<String>> {
    let nodes = gateway.list_nodes().await.wrap_err("listing nodes")?;

    let candidates = nodes
        .iter()
        .filter(|node| {
            node.labels()
                .get(&config.upgrade_status_label)
                .map(String::as_str)
                != Some(UPGRADE_STATUS_PARKED)
        })
        .filter(|node| matches_any_selector(node.labels(), &config.node_labels_to_detect))
        .map(|node| node.name_any())
        .collect();
    Ok(candidates)
}

async fn parked_node_names(
    gateway: &ClusterGateway,
    config: &Config,
) -> Result<HashSet<String>> {
    let selector = format!("{}={}", config.upgrade_status_label, UPGRADE_STATUS_PARKED);
    let parked = gateway
        .list_nodes_labeled(&selector)
        .await
        .wrap_err("listing parked nodes")?;
    Ok(parked.iter().map(|node| node.name_any()).collect())
}

/// The node a claim points at, if any of the given condition types is "True"
/// and the claim has been bound to a node.
fn node_claim_target(claim: &DynamicObject, condition_types: &[&str]) -> Option<String> {
    let status = claim.data.get("status")?;

    let triggered = status
        .get("conditions")?
        .as_array()?
        .iter()
        .any(|condition| {
            let type_matches = condition
                .get("type")
                .and_then(|value| value.as_str())
                .is_some_and(|type_| condition_types.contains(&type_));
            let is_true = condition
                .get("status")
                .and_then(|value| value.as_str())
                .is_some_and(|status| status == "True");
            type_matches && is_true
        });
    if !triggered {
        return None;
    }

    let node_name = status.get("nodeName")?.as_str()?;
    if node_name.is_empty() {
        return None;
    }

    Some(String::from(node_name))
}

/// A node matches when any one of its labels satisfies any one selector.
/// Selectors are "key" (presence) or "key=value" (exact match).
fn matches_any_selector(labels: &BTreeMap<String, String>, selectors: &[String]) -> bool {
    selectors.iter().any(|selector| {
        match selector.split_once('=') {
            Some((key, value)) => labels.get(key).map(String::as_str) == Some(value),
            None => labels.contains_key(selector),
        }
    })
}

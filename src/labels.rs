use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Node, Pod, Taint};
use kube::ResourceExt;
use serde_json::{Map, Value, json};

use crate::config::Config;
use crate::consts::{UPGRADE_STATUS_PARKED, UPGRADE_STATUS_UNPARKED};

pub fn is_node_parked(node: &Node, config: &Config) -> bool {
    node.labels()
        .get(&config.upgrade_status_label)
        .is_some_and(|status| status == UPGRADE_STATUS_PARKED)
}

/// The parking deadline, read back from the node label. The value is written
/// as integer Unix seconds but accepted as a float since other tooling
/// produces fractional timestamps.
pub fn get_expires_on(node: &Node, config: &Config) -> Result<Option<DateTime<Utc>>, String> {
    let Some(raw) = node.labels().get(&config.expires_on_label) else {
        return Ok(None);
    };

    let Ok(seconds) = raw.parse::<f64>() else {
        return Err(raw.to_owned());
    };
    let Some(timestamp) = DateTime::from_timestamp(seconds.trunc() as i64, 0) else {
        return Err(raw.to_owned());
    };

    Ok(Some(timestamp))
}

pub fn expires_on_value(expires_on: DateTime<Utc>) -> String {
    expires_on.timestamp().to_string()
}

/// Labels written to a node and its evictable pods at parking time,
/// as a json merge-patch fragment.
pub fn parking_labels(config: &Config, reason: &str, expires_on: DateTime<Utc>) -> Value {
    let mut labels = Map::new();
    labels.insert(
        config.upgrade_status_label.clone(),
        Value::from(UPGRADE_STATUS_PARKED),
    );
    labels.insert(
        config.expires_on_label.clone(),
        Value::from(expires_on_value(expires_on)),
    );
    labels.insert(
        config.parked_by_label.clone(),
        Value::from(config.parked_by_value.clone()),
    );
    labels.insert(config.parking_reason_label.clone(), Value::from(reason));
    for (key, value) in config.extra_parking_labels_map() {
        labels.insert(key, Value::from(value));
    }

    Value::Object(labels)
}

/// The reversal of [`parking_labels`]: flip the status to "unparked", drop the
/// expiry and every extra parking label, keep the parked-by marker.
pub fn unparking_labels(config: &Config) -> Value {
    let mut labels = Map::new();
    labels.insert(
        config.upgrade_status_label.clone(),
        Value::from(UPGRADE_STATUS_UNPARKED),
    );
    labels.insert(config.expires_on_label.clone(), Value::Null);
    labels.insert(
        config.parked_by_label.clone(),
        Value::from(config.parked_by_value.clone()),
    );
    for key in config.extra_parking_labels_map().into_keys() {
        labels.insert(key, Value::Null);
    }

    Value::Object(labels)
}

pub fn labels_merge_patch(labels: Value) -> Value {
    json!({ "metadata": { "labels": labels } })
}

/// A pod takes part in the eviction campaign unless it belongs to a DaemonSet
/// (its controller ignores cordons), is a static-pod mirror (owned by the
/// Node), or is already terminating.
pub fn is_pod_evictable(pod: &Pod) -> bool {
    if pod.metadata.deletion_timestamp.is_some() {
        return false;
    }

    let owner_kind = pod
        .metadata
        .owner_references
        .as_deref()
        .and_then(|owners| owners.first())
        .map(|owner| owner.kind.as_str());
    !matches!(owner_kind, Some("DaemonSet") | Some("Node"))
}

pub fn is_eviction_opted_out(pod: &Pod, config: &Config) -> bool {
    pod.labels()
        .get(&config.allow_eviction_label)
        .is_some_and(|allow| allow == "false")
}

/// Per-pod half of the force-deletion safety predicate.
pub fn pod_carries_parking_record(pod: &Pod, config: &Config) -> bool {
    let labels = pod.labels();
    let parked = labels
        .get(&config.upgrade_status_label)
        .is_some_and(|status| status == UPGRADE_STATUS_PARKED);
    let has_expiry = labels
        .get(&config.expires_on_label)
        .is_some_and(|expiry| !expiry.is_empty());

    parked && has_expiry
}

fn node_taints(node: &Node) -> Option<&[Taint]> {
    node.spec.as_ref()?.taints.as_deref()
}

pub fn node_has_taint_key(node: &Node, key: &str) -> bool {
    node_taints(node).is_some_and(|taints| taints.iter().any(|taint| taint.key == key))
}

pub fn parking_taint(config: &Config) -> Taint {
    Taint {
        key: config.parked_node_taint.key.clone(),
        value: Some(config.parked_node_taint.value.clone()),
        effect: String::from(config.parked_node_taint.effect.as_str()),
        time_added: None,
    }
}

/// The node's taints with the parking taint added, if its key is not
/// already present.
pub fn taints_with_parking_taint(node: &Node, config: &Config) -> Vec<Taint> {
    let mut taints = node_taints(node).map(<[Taint]>::to_vec).unwrap_or_default();
    if !taints
        .iter()
        .any(|taint| taint.key == config.parked_node_taint.key)
    {
        taints.push(parking_taint(config));
    }

    taints
}

/// The node's taints with every taint matching the parking taint key removed.
pub fn taints_without_parking_taint(node: &Node, config: &Config) -> Vec<Taint> {
    let mut taints = node_taints(node).map(<[Taint]>::to_vec).unwrap_or_default();
    taints.retain(|taint| taint.key != config.parked_node_taint.key);
    taints
}

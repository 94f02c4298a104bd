use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;
use kube::api::DynamicObject;
use serde_json::{Value, json};

use crate::config::Config;
use crate::consts::{ARGO_GROUP, ROLLOUT_KIND};
use crate::gateway::ClusterGateway;

fn first_owner(owners: Option<&[OwnerReference]>) -> Option<&OwnerReference> {
    owners.and_then(|owners| owners.first())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControllerKind {
    Deployment,
    StatefulSet,
    Rollout,
    ReplicaSet,
    DaemonSet,
    StaticPod,
    Unknown,
}

impl ControllerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ControllerKind::Deployment => "Deployment",
            ControllerKind::StatefulSet => "StatefulSet",
            ControllerKind::Rollout => "Rollout",
            ControllerKind::ReplicaSet => "ReplicaSet",
            ControllerKind::DaemonSet => "DaemonSet",
            ControllerKind::StaticPod => "StaticPod",
            ControllerKind::Unknown => "Unknown",
        }
    }

    /// Kinds the rollout coordinator knows how to restart.
    pub fn is_restartable(self) -> bool {
        matches!(
            self,
            ControllerKind::Deployment | ControllerKind::StatefulSet | ControllerKind::Rollout
        )
    }
}

/// Identity of the object controlling a pod. The fingerprint deduplicates
/// restart work within a single loop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerRef {
    pub kind: ControllerKind,
    pub namespace: String,
    pub name: String,
}

impl ControllerRef {
    pub fn fingerprint(&self) -> String {
        format!("{}/{}/{}", self.kind.as_str(), self.namespace, self.name)
    }
}

/// Resolves a pod to its controller object, following a ReplicaSet one step
/// up to the Deployment or Argo Rollout that owns it.
pub async fn resolve_pod_controller(
    gateway: &ClusterGateway,
    config: &Config,
    pod: &Pod,
) -> kube::Result<ControllerRef> {
    let namespace = pod.namespace().unwrap_or_default();
    let owner = first_owner(pod.metadata.owner_references.as_deref());

    let Some(owner) = owner else {
        return Ok(ControllerRef {
            kind: ControllerKind::Unknown,
            namespace,
            name: pod.name_any(),
        });
    };

    match owner.kind.as_str() {
        "ReplicaSet" => {
            let replica_set = gateway.get_replica_set(&namespace, &owner.name).await?;
            Ok(classify_replica_set_parent(
                first_owner(replica_set.metadata.owner_references.as_deref()),
                &namespace,
                &owner.name,
                &config.argo_rollouts_api_version,
            ))
        }
        "StatefulSet" => Ok(ControllerRef {
            kind: ControllerKind::StatefulSet,
            namespace,
            name: owner.name.clone(),
        }),
        "DaemonSet" => Ok(ControllerRef {
            kind: ControllerKind::DaemonSet,
            namespace,
            name: owner.name.clone(),
        }),
        "Node" => Ok(ControllerRef {
            kind: ControllerKind::StaticPod,
            namespace,
            name: owner.name.clone(),
        }),
        _ => Ok(ControllerRef {
            kind: ControllerKind::Unknown,
            namespace,
            name: owner.name.clone(),
        }),
    }
}

fn classify_replica_set_parent(
    parent: Option<&OwnerReference>,
    namespace: &str,
    replica_set_name: &str,
    argo_rollouts_api_version: &str,
) -> ControllerRef {
    let namespace = String::from(namespace);
    let Some(parent) = parent else {
        // bare ReplicaSet, nothing further up the chain
        return ControllerRef {
            kind: ControllerKind::ReplicaSet,
            namespace,
            name: String::from(replica_set_name),
        };
    };

    if parent.kind == "Deployment" {
        return ControllerRef {
            kind: ControllerKind::Deployment,
            namespace,
            name: parent.name.clone(),
        };
    }

    let argo_api_version = format!("{ARGO_GROUP}/{argo_rollouts_api_version}");
    if parent.kind == ROLLOUT_KIND && parent.api_version == argo_api_version {
        return ControllerRef {
            kind: ControllerKind::Rollout,
            namespace,
            name: parent.name.clone(),
        };
    }

    ControllerRef {
        kind: ControllerKind::Unknown,
        namespace,
        name: parent.name.clone(),
    }
}

/// Whether a deployment is mid-rollout: its Progressing condition has not
/// timed out, and replica accounting shows unfinished movement.
pub fn deployment_rollout_in_progress(deployment: &Deployment) -> bool {
    let status = deployment.status.as_ref();

    let progressing_timed_out = status
        .and_then(|status| status.conditions.as_deref())
        .is_some_and(|conditions| {
            conditions.iter().any(|condition| {
                condition.type_ == "Progressing"
                    && condition.reason.as_deref() == Some("ProgressDeadlineExceeded")
            })
        });
    if progressing_timed_out {
        return false;
    }

    let observed_generation = status.and_then(|status| status.observed_generation);
    if observed_generation < deployment.metadata.generation {
        return true;
    }

    let desired = deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.replicas)
        .unwrap_or(1);
    let updated = status.and_then(|status| status.updated_replicas).unwrap_or(0);
    let total = status.and_then(|status| status.replicas).unwrap_or(0);
    let available = status
        .and_then(|status| status.available_replicas)
        .unwrap_or(0);

    updated < desired || total > updated || available < updated
}

/// Whether a statefulset is mid-rollout. Only meaningful for the
/// RollingUpdate strategy; OnDelete never reports an ongoing rollout.
pub fn stateful_set_rollout_in_progress(stateful_set: &StatefulSet) -> bool {
    let spec = stateful_set.spec.as_ref();
    let status = stateful_set.status.as_ref();
    let update_strategy = spec.and_then(|spec| spec.update_strategy.as_ref());

    let strategy_type = update_strategy.and_then(|strategy| strategy.type_.as_deref());
    if strategy_type == Some("OnDelete") {
        return false;
    }

    let desired = spec.and_then(|spec| spec.replicas).unwrap_or(1);
    let ready = status.and_then(|status| status.ready_replicas).unwrap_or(0);
    if ready < desired {
        return true;
    }

    let partition = update_strategy
        .and_then(|strategy| strategy.rolling_update.as_ref())
        .and_then(|rolling_update| rolling_update.partition)
        .unwrap_or(0);
    if partition > 0 {
        let updated = status.and_then(|status| status.updated_replicas).unwrap_or(0);
        if updated < desired - partition {
            return true;
        }
    }

    let current_revision = status.and_then(|status| status.current_revision.as_deref());
    let update_revision = status.and_then(|status| status.update_revision.as_deref());
    update_revision != current_revision
}

pub fn rollout_is_paused(rollout: &DynamicObject) -> bool {
    rollout.data["spec"]["paused"].as_bool().unwrap_or(false)
}

/// Strategic-merge patch body restarting a Deployment or StatefulSet the way
/// `kubectl rollout restart` does, with our own annotation key.
pub fn restart_template_patch(annotation_key: &str, now: DateTime<Utc>) -> Value {
    json!({
        "spec": {
            "template": {
                "metadata": {
                    "annotations": {
                        annotation_key: now.to_rfc3339_opts(SecondsFormat::Secs, true),
                    }
                }
            }
        }
    })
}

/// Json-merge patch body restarting an Argo Rollout.
pub fn restart_rollout_patch(now: DateTime<Utc>) -> Value {
    json!({
        "spec": {
            "restartAt": now.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    })
}

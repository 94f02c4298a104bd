use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{
    ApiResource, DeleteParams, DynamicObject, EvictParams, GroupVersionKind, ListParams, Patch,
    PatchParams, PostParams, PropagationPolicy,
};
use kube::{Api, Client, ResourceExt};
use serde_json::Value;

use crate::consts::{
    ARGO_GROUP, CONTROLLER_NAME, KARPENTER_GROUP, KARPENTER_VERSION, NODE_CLAIM_KIND,
    NODE_CLAIM_PLURAL, ROLLOUT_KIND, ROLLOUT_PLURAL,
};

/// Capability-typed access to the cluster. Mutating calls carry the dry-run
/// flag; retry policy belongs to the callers (the next tick, in practice).
#[derive(Clone)]
pub struct ClusterGateway {
    client: Client,
    dry_run: bool,
    rollouts: ApiResource,
}

impl ClusterGateway {
    pub fn try_new(
        kube_config: kube::Config,
        argo_rollouts_api_version: &str,
        dry_run: bool,
    ) -> kube::Result<Self> {
        let client = Client::try_from(kube_config)?;
        let rollouts = ApiResource::from_gvk_with_plural(
            &GroupVersionKind::gvk(ARGO_GROUP, argo_rollouts_api_version, ROLLOUT_KIND),
            ROLLOUT_PLURAL,
        );

        Ok(Self {
            client,
            dry_run,
            rollouts,
        })
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    fn pods(&self) -> Api<Pod> {
        Api::all(self.client.clone())
    }

    fn pods_in(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn post_params(&self) -> PostParams {
        PostParams {
            dry_run: self.dry_run,
            field_manager: Some(String::from(CONTROLLER_NAME)),
        }
    }

    fn patch_params(&self) -> PatchParams {
        PatchParams {
            dry_run: self.dry_run,
            field_manager: Some(String::from(CONTROLLER_NAME)),
            ..PatchParams::default()
        }
    }

    pub async fn list_nodes(&self) -> kube::Result<Vec<Node>> {
        let nodes = self.nodes().list(&ListParams::default()).await?;
        Ok(nodes.items)
    }

    pub async fn list_nodes_labeled(&self, selector: &str) -> kube::Result<Vec<Node>> {
        let nodes = self
            .nodes()
            .list(&ListParams::default().labels(selector))
            .await?;
        Ok(nodes.items)
    }

    pub async fn get_node(&self, name: &str) -> kube::Result<Node> {
        self.nodes().get(name).await
    }

    /// Json merge-patch against a node (labels, taints, cordon flag).
    pub async fn patch_node(&self, name: &str, patch: &Value) -> kube::Result<Node> {
        self.nodes()
            .patch(name, &self.patch_params(), &Patch::Merge(patch))
            .await
    }

    pub async fn list_pods_on_node(&self, node_name: &str) -> kube::Result<Vec<Pod>> {
        let field_selector = format!("spec.nodeName={node_name}");
        let pods = self
            .pods()
            .list(&ListParams::default().fields(&field_selector))
            .await?;
        Ok(pods.items)
    }

    /// Json merge-patch against a pod's metadata (parking labels).
    pub async fn patch_pod(&self, pod: &Pod, patch: &Value) -> kube::Result<Pod> {
        let namespace = pod.namespace().unwrap_or_default();
        self.pods_in(&namespace)
            .patch(&pod.name_any(), &self.patch_params(), &Patch::Merge(patch))
            .await
    }

    /// PDB-respecting eviction through the eviction subresource.
    pub async fn evict_pod(&self, pod: &Pod) -> kube::Result<()> {
        let namespace = pod.namespace().unwrap_or_default();
        let evict_params = EvictParams {
            delete_options: Some(DeleteParams {
                dry_run: self.dry_run,
                ..DeleteParams::default()
            }),
            post_options: self.post_params(),
        };
        self.pods_in(&namespace)
            .evict(&pod.name_any(), &evict_params)
            .await?;
        Ok(())
    }

    /// Immediate deletion, bypassing disruption budgets.
    pub async fn force_delete_pod(&self, pod: &Pod) -> kube::Result<()> {
        let namespace = pod.namespace().unwrap_or_default();
        let delete_params = DeleteParams {
            dry_run: self.dry_run,
            grace_period_seconds: Some(0),
            propagation_policy: Some(PropagationPolicy::Background),
            ..DeleteParams::default()
        };
        self.pods_in(&namespace)
            .delete(&pod.name_any(), &delete_params)
            .await?;
        Ok(())
    }

    pub async fn get_deployment(&self, namespace: &str, name: &str) -> kube::Result<Deployment> {
        Api::namespaced(self.client.clone(), namespace).get(name).await
    }

    pub async fn get_stateful_set(&self, namespace: &str, name: &str) -> kube::Result<StatefulSet> {
        Api::namespaced(self.client.clone(), namespace).get(name).await
    }

    pub async fn get_replica_set(&self, namespace: &str, name: &str) -> kube::Result<ReplicaSet> {
        Api::namespaced(self.client.clone(), namespace).get(name).await
    }

    pub async fn patch_deployment_strategic(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> kube::Result<Deployment> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        api.patch(name, &self.patch_params(), &Patch::Strategic(patch))
            .await
    }

    pub async fn patch_stateful_set_strategic(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> kube::Result<StatefulSet> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        api.patch(name, &self.patch_params(), &Patch::Strategic(patch))
            .await
    }

    fn rollouts_in(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &self.rollouts)
    }

    /// Argo Rollout is a CRD the typed client does not know; it is reached
    /// through the dynamic api.
    pub async fn get_rollout(&self, namespace: &str, name: &str) -> kube::Result<DynamicObject> {
        self.rollouts_in(namespace).get(name).await
    }

    pub async fn patch_rollout_merge(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> kube::Result<DynamicObject> {
        self.rollouts_in(namespace)
            .patch(name, &self.patch_params(), &Patch::Merge(patch))
            .await
    }

    pub async fn list_node_claims(&self) -> kube::Result<Vec<DynamicObject>> {
        let resource = ApiResource::from_gvk_with_plural(
            &GroupVersionKind::gvk(KARPENTER_GROUP, KARPENTER_VERSION, NODE_CLAIM_KIND),
            NODE_CLAIM_PLURAL,
        );
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &resource);
        let claims = api.list(&ListParams::default()).await?;
        Ok(claims.items)
    }
}

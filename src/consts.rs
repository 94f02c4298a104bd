pub const CONTROLLER_NAME: &str = "k8s-shredder";

pub const UPGRADE_STATUS_LABEL_KEY: &str = "shredder.ethos.adobe.net/upgrade-status";
pub const EXPIRES_ON_LABEL_KEY: &str = "shredder.ethos.adobe.net/parked-node-expires-on";
pub const PARKED_BY_LABEL_KEY: &str = "shredder.ethos.adobe.net/parked-by";
pub const PARKING_REASON_LABEL_KEY: &str = "shredder.ethos.adobe.net/parked-reason";
pub const ALLOW_EVICTION_LABEL_KEY: &str = "shredder.ethos.adobe.net/allow-eviction";
pub const RESTARTED_AT_ANNOTATION_KEY: &str = "shredder.ethos.adobe.net/restartedAt";

pub const UPGRADE_STATUS_PARKED: &str = "parked";
pub const UPGRADE_STATUS_UNPARKED: &str = "unparked";

pub const PARKED_BY_VALUE: &str = "k8s-shredder";

pub const REASON_KARPENTER_DRIFTED: &str = "karpenter-drifted";
pub const REASON_KARPENTER_DISRUPTED: &str = "karpenter-disrupted";
pub const REASON_NODE_LABEL: &str = "node-label";

/// Taint the cluster autoscaler puts on nodes it is already terminating.
pub const TO_BE_DELETED_TAINT_KEY: &str = "ToBeDeletedByClusterAutoscaler";

pub const KARPENTER_GROUP: &str = "karpenter.sh";
pub const KARPENTER_VERSION: &str = "v1";
pub const NODE_CLAIM_KIND: &str = "NodeClaim";
pub const NODE_CLAIM_PLURAL: &str = "nodeclaims";

pub const ARGO_GROUP: &str = "argoproj.io";
pub const ROLLOUT_KIND: &str = "Rollout";
pub const ROLLOUT_PLURAL: &str = "rollouts";

// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

/// API groups and versions of the hub-managed resources
pub mod api {
    pub const MCM_GROUP: &str = "mcm.ibm.com";
    pub const CLUSTER_REGISTRY_GROUP: &str = "clusterregistry.k8s.io";
    /// Group whose `managedclusteractions` resource grants the admin role
    pub const ACTION_GROUP: &str = "action.open-cluster-management.io";
    /// Group whose `managedclusterviews` resource grants the view role
    pub const VIEW_GROUP: &str = "view.open-cluster-management.io";
}

/// Label keys written or read by the control plane
pub mod labels {
    /// Label on Works created by the WorkSet dispatcher: `<ns>.<name>`
    pub const WORKSET: &str = "workset";
    /// Label on Works created by the ResourceView dispatcher: `<ns>.<name>`
    pub const VIEW: &str = "view";
    /// Marks discovery replicas created by the service registry
    pub const AUTO_DISCOVERY: &str = "mcm.ibm.com/auto-discovery";
    /// Name of the cluster a registered endpoint originates from
    pub const CLUSTER: &str = "mcm.ibm.com/cluster";
    /// ClusterRoles surfaced to users as assignable roles
    pub const DISCOVERABLE_CLUSTER_ROLE: &str = "clusterview.open-cluster-management.io/discoverable";
    /// Helm v3 release secrets
    pub const HELM_OWNER: &str = "owner";
    pub const HELM_NAME: &str = "name";
}

/// Annotation keys written or read by the control plane
pub mod annotations {
    /// Base64 of the username that created the object
    pub const USER_IDENTITY: &str = "mcm.ibm.com/user-identity";
    /// Base64 of the comma-joined groups of that user
    pub const USER_GROUP: &str = "mcm.ibm.com/user-group";
    /// `<resource>.<ns>.<name>` list of owners on dispatched Works, `<ns>/<name>` on replicas
    pub const OWNERS: &str = "mcm.ibm.com/owners";
    /// JSON `{"dns-prefix", "target-clusters"}` on registered endpoints
    pub const SERVICE_DISCOVERY: &str = "mcm.ibm.com/service-discovery";
    /// Set to "true" on join requests that rotate an existing certificate
    pub const RENEWAL: &str = "mcm.ibm.com/renewal";
}

/// Well-known role names
pub mod roles {
    pub const ADMIN: &str = "managedcluster:admin";
    pub const VIEW: &str = "managedcluster:view";
}

/// The operator name used for server-side apply
pub const OPERATOR_NAME: &str = "mcm-foundation";

/// Certificate subject for managed clusters
pub mod subject {
    pub const ORGANIZATION: &str = "hcm:clusters";
    pub const USER_PREFIX: &str = "hcm:clusters";
}

/// Key under which client configs are stored in the bootstrap and klusterlet secrets
pub const KUBECONFIG_KEY: &str = "kubeconfig";

/// Reason written when a cluster misses its heartbeat
pub const HEARTBEAT_MISSED_REASON: &str = "klusterlet failed to update cluster status on time";

/// Value of a configured cluster label that asks for auto detection
pub const AUTO_DETECT: &str = "auto-detect";

/// Join and certificate timing
pub mod timing {
    /// Upper bound on waiting for a join request to be approved
    pub const JOIN_WAIT_SECS: u64 = 3600;
    /// Poll interval of the renewal loop once a rotation is due
    pub const RENEWAL_POLL_SECS: u64 = 30;
    /// Bootstrap backoff grows linearly by this step
    pub const BOOTSTRAP_BACKOFF_STEP_SECS: u64 = 5;
    pub const BOOTSTRAP_BACKOFF_MAX_SECS: u64 = 120;
    /// Klusterlet status publishing cadence
    pub const STATUS_UPDATE_SECS: u64 = 30;
    /// Hard limit on objects returned by a resource query
    pub const QUERY_LIMIT: u32 = 1000;
}

/// CRD polling configuration
pub mod crd {
    /// Initial polling interval in seconds when waiting for CRD
    pub const POLL_INTERVAL_SECS: u64 = 10;
    /// Maximum polling interval in seconds (exponential backoff cap)
    pub const POLL_MAX_INTERVAL_SECS: u64 = 60;
}

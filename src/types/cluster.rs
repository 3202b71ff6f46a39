// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{CustomResource, ResourceExt};
use serde::{Deserialize, Serialize};

/// Condition type of a cluster whose klusterlet reports in time
pub const CLUSTER_READY: &str = "Ready";

/// Registry entry of a managed cluster
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[kube(group = "clusterregistry.k8s.io", version = "v1alpha1", kind = "Cluster")]
#[kube(namespaced)]
#[kube(status = "ClusterRegistryStatus")]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    #[serde(default, rename = "kubernetesApiEndpoints")]
    pub kubernetes_api_endpoints: KubernetesApiEndpoints,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesApiEndpoints {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub server_endpoints: Vec<ServerAddressByClientCidr>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
pub struct ServerAddressByClientCidr {
    #[serde(rename = "clientCIDR", default)]
    pub client_cidr: String,
    #[serde(rename = "serverAddress", default)]
    pub server_address: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRegistryStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ClusterCondition>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCondition {
    /// `Ready`, or empty once the heartbeat went stale
    #[serde(rename = "type", default)]
    pub condition_type: String,
    #[serde(default)]
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_time: Option<Time>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Cluster {
    /// The most recently written condition
    pub fn latest_condition(&self) -> Option<&ClusterCondition> {
        self.status.as_ref().and_then(|s| s.conditions.last())
    }

    /// A cluster without any condition has not reported yet
    pub fn is_pending(&self) -> bool {
        self.latest_condition().is_none()
    }

    /// Check if this cluster is ready based on its newest condition
    pub fn is_ready(&self) -> bool {
        self.latest_condition()
            .is_some_and(|c| c.condition_type == CLUSTER_READY)
    }

    pub fn last_heartbeat(&self) -> Option<DateTime<Utc>> {
        self.latest_condition()
            .and_then(|c| c.last_heartbeat_time.as_ref())
            .map(|t| t.0)
    }

    /// `<namespace>/<name>`, the key Works are indexed by
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace().unwrap_or_default(), self.name_any())
    }
}

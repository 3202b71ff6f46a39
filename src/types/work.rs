// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! A single unit of action or query targeted at one cluster.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, Time};
use k8s_openapi::ByteString;
use kube::{CustomResource, ResourceExt};
use serde::{Deserialize, Serialize};

/// Resource type that selects Helm releases instead of API objects
pub const RELEASES_RESOURCE: &str = "releases";

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[kube(group = "mcm.ibm.com", version = "v1beta1", kind = "Work")]
#[kube(namespaced)]
#[kube(status = "WorkStatus")]
#[serde(rename_all = "camelCase")]
pub struct WorkSpec {
    #[serde(default)]
    pub cluster: ClusterReference,
    #[serde(rename = "type", default)]
    pub work_type: WorkType,
    #[serde(default)]
    pub scope: ResourceFilter,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_type: Option<ActionType>,
    #[serde(rename = "helm", skip_serializing_if = "Option::is_none")]
    pub helm_work: Option<HelmWorkSpec>,
    #[serde(rename = "kube", skip_serializing_if = "Option::is_none")]
    pub kube_work: Option<KubeWorkSpec>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, schemars::JsonSchema)]
pub struct ClusterReference {
    #[serde(default)]
    pub name: String,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, schemars::JsonSchema)]
pub enum WorkType {
    #[default]
    Action,
    Resource,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, schemars::JsonSchema)]
pub enum ActionType {
    Create,
    Update,
    Delete,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, schemars::JsonSchema)]
pub enum ResourceFilterMode {
    #[default]
    OneShot,
    Periodic,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<LabelSelector>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub field_selector: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_group: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    /// Ask the server for its printable table representation
    #[serde(default)]
    pub server_print: bool,
    #[serde(default)]
    pub mode: ResourceFilterMode,
    #[serde(default)]
    pub update_interval_seconds: i32,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KubeWorkSpec {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(rename = "template", skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "super::preserve_unknown_fields")]
    pub object_template: Option<serde_json::Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HelmWorkSpec {
    #[serde(default)]
    pub release_name: String,
    #[serde(default)]
    pub in_secure_skip_verify: bool,
    #[serde(default)]
    pub chart_name: String,
    #[serde(default)]
    pub version: String,
    #[serde(rename = "chartURL", default)]
    pub chart_url: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "super::byte_string")]
    pub values: Option<ByteString>,
    #[serde(rename = "valuesURL", default)]
    pub values_url: String,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, schemars::JsonSchema)]
pub enum WorkStatusType {
    Processing,
    Completed,
    Failed,
}

impl std::fmt::Display for WorkStatusType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkStatusType::Processing => "Processing",
            WorkStatusType::Completed => "Completed",
            WorkStatusType::Failed => "Failed",
        };
        f.write_str(s)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkStatus {
    /// Empty until the klusterlet has picked the Work up
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub status_type: Option<WorkStatusType>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "super::preserve_unknown_fields")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<Time>,
    /// Spec generation the status was produced for
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Body POSTed to `works/<name>/result`
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResourceViewResult {
    pub api_version: String,
    pub kind: String,
    pub metadata: kube::api::ObjectMeta,
    /// Gzip compressed JSON of the query result
    pub data: ByteString,
}

impl ResourceFilter {
    pub fn is_periodic(&self) -> bool {
        self.mode == ResourceFilterMode::Periodic
    }
}

impl WorkSpec {
    /// Field-by-field comparison that ignores the target cluster
    pub fn same_payload(&self, other: &WorkSpec) -> bool {
        self.work_type == other.work_type
            && self.action_type == other.action_type
            && self.scope == other.scope
            && self.kube_work == other.kube_work
            && self.helm_work == other.helm_work
    }
}

impl Work {
    pub fn status_type(&self) -> Option<WorkStatusType> {
        self.status.as_ref().and_then(|s| s.status_type)
    }

    pub fn is_finished(&self) -> bool {
        self.status_type().is_some()
    }

    pub fn cluster_name(&self) -> &str {
        &self.spec.cluster.name
    }

    /// `<namespace>/<cluster>` index key used by the dispatchers
    pub fn cluster_key(&self) -> String {
        format!("{}/{}", self.namespace().unwrap_or_default(), self.spec.cluster.name)
    }

    /// The status was written for an older spec and no longer applies
    pub fn status_is_stale(&self) -> bool {
        match (self.metadata.generation, self.status.as_ref().and_then(|s| s.observed_generation)) {
            (Some(generation), Some(observed)) => observed < generation,
            _ => false,
        }
    }
}

/// Split an owner label value `<ns>.<name>`; malformed values yield None.
///
/// Namespaces cannot contain dots, so everything after the first dot is the name.
pub fn parse_owner_label(value: &str) -> Option<(&str, &str)> {
    let (namespace, name) = value.split_once('.')?;
    if namespace.is_empty() || name.is_empty() {
        return None;
    }
    Some((namespace, name))
}

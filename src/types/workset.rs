// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use super::legacy::WorkSpecV1Alpha1;
use super::work::WorkStatusType;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use serde::{Deserialize, Serialize};

/// Template fanned out into one Work per selected cluster
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[kube(group = "mcm.ibm.com", version = "v1alpha1", kind = "WorkSet")]
#[kube(namespaced)]
#[kube(status = "WorkSetStatus")]
#[serde(rename_all = "camelCase")]
pub struct WorkSetSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_selector: Option<LabelSelector>,
    /// Selects the child Works; informational, children are found by label
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,
    #[serde(default)]
    pub template: WorkTemplateSpec,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkTemplateSpec {
    #[serde(default)]
    pub spec: WorkSpecV1Alpha1,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkSetStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<WorkStatusType>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

impl WorkSet {
    pub fn is_completed(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.status == Some(WorkStatusType::Completed))
    }
}

// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! The `v1alpha1` Work shape still carried by WorkSet templates.
//!
//! Its discriminators are free strings; lifting into the `v1beta1` shape
//! parses them into typed variants and rejects values nothing can act on.

use super::work::{
    ActionType, ClusterReference, HelmWorkSpec, KubeWorkSpec, ResourceFilter, ResourceFilterMode,
    WorkSpec, WorkType,
};
use crate::error::McmError;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkSpecV1Alpha1 {
    #[serde(default)]
    pub cluster: ClusterReference,
    #[serde(rename = "type", default)]
    pub work_type: String,
    #[serde(default)]
    pub scope: ResourceFilterV1Alpha1,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub action_type: String,
    #[serde(rename = "helm", skip_serializing_if = "Option::is_none")]
    pub helm_work: Option<HelmWorkSpec>,
    #[serde(rename = "kube", skip_serializing_if = "Option::is_none")]
    pub kube_work: Option<KubeWorkSpec>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceFilterV1Alpha1 {
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
    #[serde(default)]
    pub server_print: bool,
    /// "Periodic", or empty for a one-shot query
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mode: String,
    #[serde(default)]
    pub update_interval_seconds: i32,
}

impl TryFrom<ResourceFilterV1Alpha1> for ResourceFilter {
    type Error = McmError;

    fn try_from(f: ResourceFilterV1Alpha1) -> Result<Self, Self::Error> {
        let mode = match f.mode.as_str() {
            "" | "OneShot" => ResourceFilterMode::OneShot,
            "Periodic" => ResourceFilterMode::Periodic,
            other => return Err(McmError::Validation(format!("unknown scope mode '{other}'"))),
        };
        if mode == ResourceFilterMode::Periodic && f.update_interval_seconds <= 0 {
            return Err(McmError::Validation(
                "periodic scope requires a positive updateIntervalSeconds".to_string(),
            ));
        }
        Ok(ResourceFilter {
            label_selector: f.label_selector,
            field_selector: f.field_selector,
            api_group: f.api_group,
            resource_type: f.resource_type,
            name: f.name,
            namespace: f.namespace,
            version: f.version,
            server_print: f.server_print,
            mode,
            update_interval_seconds: f.update_interval_seconds,
        })
    }
}

impl TryFrom<WorkSpecV1Alpha1> for WorkSpec {
    type Error = McmError;

    fn try_from(spec: WorkSpecV1Alpha1) -> Result<Self, Self::Error> {
        let work_type = match spec.work_type.as_str() {
            "" | "Action" => WorkType::Action,
            "Resource" => WorkType::Resource,
            other => return Err(McmError::Validation(format!("unknown work type '{other}'"))),
        };
        let action_type = match spec.action_type.as_str() {
            "" => None,
            "Create" => Some(ActionType::Create),
            "Update" => Some(ActionType::Update),
            "Delete" => Some(ActionType::Delete),
            other => return Err(McmError::Validation(format!("unknown action type '{other}'"))),
        };
        if work_type == WorkType::Action && action_type.is_none() {
            return Err(McmError::Validation("action work without actionType".to_string()));
        }
        Ok(WorkSpec {
            cluster: spec.cluster,
            work_type,
            scope: spec.scope.try_into()?,
            action_type,
            helm_work: spec.helm_work,
            kube_work: spec.kube_work,
        })
    }
}

// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Read-only query fanned out across clusters.

use super::work::{ResourceFilter, ResourceFilterMode, WorkStatusType};
use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, Time};
use kube::CustomResource;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[kube(group = "mcm.ibm.com", version = "v1beta1", kind = "ResourceView")]
#[kube(namespaced)]
#[kube(status = "ResourceViewStatus")]
#[serde(rename_all = "camelCase")]
pub struct ResourceViewSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_selector: Option<LabelSelector>,
    #[serde(default)]
    pub scope: ViewFilter,
    #[serde(default)]
    pub summary_only: bool,
    #[serde(default)]
    pub mode: ResourceFilterMode,
    #[serde(default)]
    pub update_interval_seconds: i32,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ViewFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<LabelSelector>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub field_selector: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_group: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceViewStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ViewCondition>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    #[schemars(schema_with = "super::preserve_unknown_fields")]
    pub results: BTreeMap<String, serde_json::Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ViewCondition {
    #[serde(rename = "type")]
    pub condition_type: WorkStatusType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<Time>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

impl ResourceViewSpec {
    /// The scope every child Work carries
    pub fn work_scope(&self) -> ResourceFilter {
        ResourceFilter {
            label_selector: self.scope.label_selector.clone(),
            field_selector: self.scope.field_selector.clone(),
            api_group: self.scope.api_group.clone(),
            resource_type: self.scope.resource.clone(),
            name: self.scope.resource_name.clone(),
            namespace: self.scope.namespace.clone(),
            version: String::new(),
            server_print: self.summary_only,
            mode: self.mode,
            update_interval_seconds: self.update_interval_seconds,
        }
    }

    pub fn is_periodic(&self) -> bool {
        self.mode == ResourceFilterMode::Periodic
    }
}

impl ResourceView {
    pub fn last_condition(&self) -> Option<&ViewCondition> {
        self.status.as_ref().and_then(|s| s.conditions.last())
    }

    pub fn has_results(&self) -> bool {
        self.status.as_ref().is_some_and(|s| !s.results.is_empty())
    }

    pub fn is_completed(&self) -> bool {
        self.last_condition()
            .is_some_and(|c| c.condition_type == WorkStatusType::Completed)
    }

    /// Periodic views are not re-dispatched within half an interval of the
    /// last aggregate update.
    pub fn within_damping_window(&self, now: DateTime<Utc>) -> bool {
        if !self.is_periodic_with_results() {
            return false;
        }
        let Some(last) = self.last_condition().and_then(|c| c.last_update_time.as_ref()) else {
            return false;
        };
        let half = chrono::Duration::milliseconds(i64::from(self.spec.update_interval_seconds) * 500);
        now <= last.0 + half
    }

    fn is_periodic_with_results(&self) -> bool {
        self.spec.is_periodic() && self.has_results()
    }
}

/// Replace the last condition when it has the same type, append otherwise.
pub fn push_condition(conditions: &mut Vec<ViewCondition>, condition: ViewCondition) {
    match conditions.last_mut() {
        Some(last) if last.condition_type == condition.condition_type => *last = condition,
        _ => conditions.push(condition),
    }
}

// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use k8s_openapi::api::rbac::v1::{PolicyRule, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use serde::{Deserialize, Serialize};

/// RBAC granted on one managed cluster; lives in that cluster's namespace on the hub.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[kube(
    group = "rbac.open-cluster-management.io",
    version = "v1alpha1",
    kind = "ClusterPermission"
)]
#[kube(namespaced)]
#[serde(rename_all = "camelCase")]
pub struct ClusterPermissionSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validate: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_role: Option<ClusterRoleRules>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_role_binding: Option<PermissionClusterRoleBinding>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_role_bindings: Option<Vec<PermissionClusterRoleBinding>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<PermissionRole>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role_bindings: Option<Vec<PermissionRoleBinding>>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
pub struct ClusterRoleRules {
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PermissionClusterRoleBinding {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<Subject>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subjects: Vec<Subject>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role_ref: Option<RoleRef>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRole {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<LabelSelector>,
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRoleBinding {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<Subject>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subjects: Vec<Subject>,
    pub role_ref: RoleRef,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<LabelSelector>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
}

/// `subjects` wins over the single `subject`; None when neither is set.
fn effective_subjects(subjects: &[Subject], subject: Option<&Subject>) -> Option<Vec<Subject>> {
    if !subjects.is_empty() {
        return Some(subjects.to_vec());
    }
    subject.map(|s| vec![s.clone()])
}

impl PermissionClusterRoleBinding {
    pub fn role_name(&self) -> Option<&str> {
        self.role_ref.as_ref().map(|r| r.name.as_str()).filter(|n| !n.is_empty())
    }

    pub fn effective_subjects(&self) -> Option<Vec<Subject>> {
        effective_subjects(&self.subjects, self.subject.as_ref())
    }
}

impl PermissionRoleBinding {
    pub fn role_name(&self) -> Option<&str> {
        Some(self.role_ref.name.as_str()).filter(|n| !n.is_empty())
    }

    pub fn effective_subjects(&self) -> Option<Vec<Subject>> {
        effective_subjects(&self.subjects, self.subject.as_ref())
    }
}

impl ClusterPermissionSpec {
    /// The singular and plural cluster role bindings, in declaration order
    pub fn all_cluster_role_bindings(&self) -> impl Iterator<Item = &PermissionClusterRoleBinding> {
        self.cluster_role_binding
            .iter()
            .chain(self.cluster_role_bindings.iter().flatten())
    }
}

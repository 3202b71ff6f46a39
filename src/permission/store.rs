// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Per-subject role bindings and the rules for combining them.

use crate::constants::roles::{ADMIN, VIEW};
use k8s_openapi::api::rbac::v1::{ClusterRole, Subject};
use kube::ResourceExt;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// Namespace list of a cluster-scoped binding
pub const ALL_NAMESPACES: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BindingScope {
    Cluster,
    Namespace,
}

/// Access granted on one managed cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterBinding {
    pub cluster: String,
    pub scope: BindingScope,
    pub namespaces: Vec<String>,
}

impl ClusterBinding {
    pub fn cluster_wide(cluster: &str) -> Self {
        Self {
            cluster: cluster.to_string(),
            scope: BindingScope::Cluster,
            namespaces: vec![ALL_NAMESPACES.to_string()],
        }
    }

    pub fn in_namespace(cluster: &str, namespace: &str) -> Self {
        Self {
            cluster: cluster.to_string(),
            scope: BindingScope::Namespace,
            namespaces: vec![namespace.to_string()],
        }
    }
}

/// Role name to the clusters it is bound on
pub type Permissions = BTreeMap<String, Vec<ClusterBinding>>;

/// Fold `binding` into `bindings`.
///
/// A cluster-scoped binding absorbs anything for the same cluster, and
/// namespace-scoped bindings for the same cluster union their namespaces.
pub fn merge_binding(bindings: &mut Vec<ClusterBinding>, binding: ClusterBinding) {
    let Some(existing) = bindings.iter_mut().find(|b| b.cluster == binding.cluster) else {
        bindings.push(binding);
        return;
    };
    match (existing.scope, binding.scope) {
        (BindingScope::Cluster, _) => {}
        (BindingScope::Namespace, BindingScope::Cluster) => *existing = binding,
        (BindingScope::Namespace, BindingScope::Namespace) => {
            let namespaces: BTreeSet<String> = existing.namespaces.drain(..).chain(binding.namespaces).collect();
            existing.namespaces = namespaces.into_iter().collect();
        }
    }
}

/// Drop view bindings on clusters where the admin role is also bound.
pub fn dedup_superset(permissions: &mut Permissions) {
    let admin_clusters: HashSet<String> = permissions
        .get(ADMIN)
        .map(|bindings| bindings.iter().map(|b| b.cluster.clone()).collect())
        .unwrap_or_default();
    if let Some(view) = permissions.get_mut(VIEW) {
        view.retain(|b| !admin_clusters.contains(&b.cluster));
    }
    permissions.retain(|_, bindings| !bindings.is_empty());
}

/// Users and groups named by RBAC subjects. Service accounts become their
/// `system:serviceaccount:<ns>:<name>` users, defaulting to `namespace`.
pub fn users_and_groups(subjects: &[Subject], namespace: &str) -> (Vec<String>, Vec<String>) {
    let mut users = Vec::new();
    let mut groups = Vec::new();
    for subject in subjects {
        match subject.kind.as_str() {
            "User" => users.push(subject.name.clone()),
            "Group" => groups.push(subject.name.clone()),
            "ServiceAccount" => {
                let ns = subject.namespace.as_deref().filter(|ns| !ns.is_empty()).unwrap_or(namespace);
                users.push(format!("system:serviceaccount:{}:{}", ns, subject.name));
            }
            _ => {}
        }
    }
    (users, groups)
}

/// Everything one synchronization pass learned
#[derive(Debug, Default)]
pub struct PermissionStore {
    users: HashMap<String, Permissions>,
    groups: HashMap<String, Permissions>,
    discoverable: Vec<ClusterRole>,
}

impl PermissionStore {
    pub fn add_for_user(&mut self, user: &str, role: &str, binding: ClusterBinding) {
        let record = self.users.entry(user.to_string()).or_default();
        merge_binding(record.entry(role.to_string()).or_default(), binding);
    }

    pub fn add_for_group(&mut self, group: &str, role: &str, binding: ClusterBinding) {
        let record = self.groups.entry(group.to_string()).or_default();
        merge_binding(record.entry(role.to_string()).or_default(), binding);
    }

    pub fn add_for_subjects(&mut self, subjects: &[Subject], namespace: &str, role: &str, binding: &ClusterBinding) {
        let (users, groups) = users_and_groups(subjects, namespace);
        for user in users {
            self.add_for_user(&user, role, binding.clone());
        }
        for group in groups {
            self.add_for_group(&group, role, binding.clone());
        }
    }

    pub fn set_discoverable(&mut self, roles: Vec<ClusterRole>) {
        self.discoverable = roles;
    }

    pub fn discoverable_role(&self, name: &str) -> Option<&ClusterRole> {
        self.discoverable.iter().find(|r| r.name_any() == name)
    }

    pub fn subject_counts(&self) -> (usize, usize) {
        (self.users.len(), self.groups.len())
    }

    /// The user's own bindings merged with those of its groups.
    pub fn permissions(&self, user: &str, groups: &[String]) -> Permissions {
        let mut merged = Permissions::new();
        let records = self
            .users
            .get(user)
            .into_iter()
            .chain(groups.iter().filter_map(|g| self.groups.get(g)));
        for record in records {
            for (role, bindings) in record {
                let target = merged.entry(role.clone()).or_default();
                for binding in bindings {
                    merge_binding(target, binding.clone());
                }
            }
        }
        merged
    }
}

// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Turn RBAC objects into per-subject cluster bindings.

use super::store::{ClusterBinding, PermissionStore};
use crate::constants::api::{ACTION_GROUP, VIEW_GROUP};
use crate::constants::labels::DISCOVERABLE_CLUSTER_ROLE;
use crate::constants::roles::{ADMIN, VIEW};
use crate::types::cluster::Cluster;
use crate::types::cluster_permission::ClusterPermission;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding, RoleRef};
use kube::ResourceExt;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use tracing::debug;

const ACTIONS_RESOURCE: &str = "managedclusteractions";
const VIEWS_RESOURCE: &str = "managedclusterviews";

/// The RBAC state one synchronization pass works from
#[derive(Debug, Clone, Default)]
pub struct RbacSnapshot {
    pub clusters: Vec<Cluster>,
    pub cluster_roles: Vec<ClusterRole>,
    pub cluster_role_bindings: Vec<ClusterRoleBinding>,
    pub roles: Vec<Role>,
    pub role_bindings: Vec<RoleBinding>,
    pub cluster_permissions: Vec<ClusterPermission>,
}

impl RbacSnapshot {
    fn cluster_role(&self, name: &str) -> Option<&ClusterRole> {
        self.cluster_roles.iter().find(|r| r.name_any() == name)
    }

    fn role(&self, namespace: &str, name: &str) -> Option<&Role> {
        self.roles
            .iter()
            .find(|r| r.name_any() == name && r.namespace().as_deref() == Some(namespace))
    }

    /// `(name, namespace)` of every managed cluster
    fn managed_clusters(&self) -> Vec<(String, String)> {
        self.clusters
            .iter()
            .map(|c| (c.name_any(), c.namespace().unwrap_or_else(|| c.name_any())))
            .collect()
    }

    /// Rules a role reference resolves to, from `namespace` for Roles.
    fn rules_of(&self, role_ref: &RoleRef, namespace: &str) -> Option<(&[PolicyRule], String)> {
        match role_ref.kind.as_str() {
            "ClusterRole" => self.cluster_role(&role_ref.name).map(|r| {
                let rules = r.rules.as_deref().unwrap_or_default();
                (rules, format!("clusterrole/{}@{}", r.name_any(), r.resource_version().unwrap_or_default()))
            }),
            "Role" => self.role(namespace, &role_ref.name).map(|r| {
                let rules = r.rules.as_deref().unwrap_or_default();
                (
                    rules,
                    format!("role/{}/{}@{}", namespace, r.name_any(), r.resource_version().unwrap_or_default()),
                )
            }),
            _ => None,
        }
    }
}

fn matches(values: &[String], want: &str) -> bool {
    values.iter().any(|v| v == want || v == "*")
}

fn grants_create(rules: &[PolicyRule], group: &str, resource: &str) -> bool {
    rules.iter().any(|rule| {
        matches(&rule.verbs, "create")
            && matches(rule.api_groups.as_deref().unwrap_or_default(), group)
            && matches(rule.resources.as_deref().unwrap_or_default(), resource)
    })
}

/// Synthetic role granted by `rules`: admin for cluster actions, else view for cluster views.
pub fn granted_role(rules: &[PolicyRule]) -> Option<&'static str> {
    if grants_create(rules, ACTION_GROUP, ACTIONS_RESOURCE) {
        Some(ADMIN)
    } else if grants_create(rules, VIEW_GROUP, VIEWS_RESOURCE) {
        Some(VIEW)
    } else {
        None
    }
}

fn is_discoverable(role: &ClusterRole) -> bool {
    role.labels().get(DISCOVERABLE_CLUSTER_ROLE).map(String::as_str) == Some("true")
}

pub trait PermissionProcessor: Send + Sync {
    fn name(&self) -> &'static str;

    fn process(&self, snapshot: &RbacSnapshot, store: &mut PermissionStore);

    /// Versions of every object this processor read, for change detection.
    fn versions(&self, snapshot: &RbacSnapshot, out: &mut BTreeSet<String>);
}

/// Grants the synthetic admin and view roles from cluster-wide and
/// per-cluster-namespace role bindings.
pub struct AdminViewProcessor;

impl PermissionProcessor for AdminViewProcessor {
    fn name(&self) -> &'static str {
        "admin-view"
    }

    fn process(&self, snapshot: &RbacSnapshot, store: &mut PermissionStore) {
        let clusters = snapshot.managed_clusters();

        for crb in &snapshot.cluster_role_bindings {
            let Some((rules, _)) = snapshot.rules_of(&crb.role_ref, "") else {
                continue;
            };
            let Some(role) = granted_role(rules) else {
                continue;
            };
            let subjects = crb.subjects.as_deref().unwrap_or_default();
            for (cluster, _) in &clusters {
                store.add_for_subjects(subjects, "", role, &ClusterBinding::cluster_wide(cluster));
            }
        }

        for (cluster, namespace) in &clusters {
            for rb in snapshot
                .role_bindings
                .iter()
                .filter(|rb| rb.namespace().as_deref() == Some(namespace.as_str()))
            {
                let Some((rules, _)) = snapshot.rules_of(&rb.role_ref, namespace) else {
                    continue;
                };
                if let Some(role) = granted_role(rules) {
                    let subjects = rb.subjects.as_deref().unwrap_or_default();
                    store.add_for_subjects(subjects, namespace, role, &ClusterBinding::cluster_wide(cluster));
                }
            }
        }
    }

    fn versions(&self, snapshot: &RbacSnapshot, out: &mut BTreeSet<String>) {
        let clusters = snapshot.managed_clusters();
        for (name, namespace) in &clusters {
            out.insert(format!("cluster/{namespace}/{name}"));
        }
        for crb in &snapshot.cluster_role_bindings {
            if let Some((rules, role_version)) = snapshot.rules_of(&crb.role_ref, "") {
                if granted_role(rules).is_some() {
                    out.insert(format!(
                        "clusterrolebinding/{}@{}",
                        crb.name_any(),
                        crb.resource_version().unwrap_or_default()
                    ));
                    out.insert(role_version);
                }
            }
        }
        for rb in &snapshot.role_bindings {
            let namespace = rb.namespace().unwrap_or_default();
            if !clusters.iter().any(|(_, ns)| *ns == namespace) {
                continue;
            }
            if let Some((rules, role_version)) = snapshot.rules_of(&rb.role_ref, &namespace) {
                if granted_role(rules).is_some() {
                    out.insert(format!(
                        "rolebinding/{}/{}@{}",
                        namespace,
                        rb.name_any(),
                        rb.resource_version().unwrap_or_default()
                    ));
                    out.insert(role_version);
                }
            }
        }
    }
}

/// Surfaces ClusterPermission bindings to ClusterRoles labeled discoverable.
pub struct DiscoverableProcessor;

impl PermissionProcessor for DiscoverableProcessor {
    fn name(&self) -> &'static str {
        "discoverable"
    }

    fn process(&self, snapshot: &RbacSnapshot, store: &mut PermissionStore) {
        let discoverable: Vec<ClusterRole> = snapshot
            .cluster_roles
            .iter()
            .filter(|r| is_discoverable(r))
            .cloned()
            .collect();
        let names: BTreeSet<String> = discoverable.iter().map(|r| r.name_any()).collect();
        store.set_discoverable(discoverable);

        for cp in &snapshot.cluster_permissions {
            // The namespace of a ClusterPermission is its cluster's name
            let cluster = cp.namespace().unwrap_or_default();
            for binding in cp.spec.all_cluster_role_bindings() {
                let Some(role) = binding.role_name().filter(|r| names.contains(*r)) else {
                    continue;
                };
                let Some(subjects) = binding.effective_subjects() else {
                    debug!("ClusterPermission {}/{} binds {} to nobody", cluster, cp.name_any(), role);
                    continue;
                };
                store.add_for_subjects(&subjects, &cluster, role, &ClusterBinding::cluster_wide(&cluster));
            }
            for binding in cp.spec.role_bindings.iter().flatten() {
                let Some(role) = binding.role_name().filter(|r| names.contains(*r)) else {
                    continue;
                };
                let Some(subjects) = binding.effective_subjects() else {
                    continue;
                };
                let scoped = ClusterBinding::in_namespace(&cluster, &binding.namespace);
                store.add_for_subjects(&subjects, &binding.namespace, role, &scoped);
            }
        }
    }

    fn versions(&self, snapshot: &RbacSnapshot, out: &mut BTreeSet<String>) {
        for role in snapshot.cluster_roles.iter().filter(|r| is_discoverable(r)) {
            out.insert(format!(
                "clusterrole/{}@{}",
                role.name_any(),
                role.resource_version().unwrap_or_default()
            ));
        }
        for cp in &snapshot.cluster_permissions {
            out.insert(format!(
                "clusterpermission/{}/{}@{}",
                cp.namespace().unwrap_or_default(),
                cp.name_any(),
                cp.resource_version().unwrap_or_default()
            ));
        }
    }
}

pub fn default_processors() -> Vec<Box<dyn PermissionProcessor>> {
    vec![Box::new(AdminViewProcessor), Box::new(DiscoverableProcessor)]
}

/// Hex SHA-256 over the sorted versions every processor depends on.
pub fn version_hash(processors: &[Box<dyn PermissionProcessor>], snapshot: &RbacSnapshot) -> String {
    let mut versions = BTreeSet::new();
    for processor in processors {
        processor.versions(snapshot, &mut versions);
    }
    let mut hasher = Sha256::new();
    for version in versions {
        hasher.update(version.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub fn cluster(name: &str) -> Cluster {
        serde_json::from_value(json!({
            "apiVersion": "clusterregistry.k8s.io/v1alpha1",
            "kind": "Cluster",
            "metadata": {"name": name, "namespace": name},
            "spec": {}
        }))
        .unwrap()
    }

    pub fn cluster_role(name: &str, group: &str, resource: &str, verb: &str) -> ClusterRole {
        serde_json::from_value(json!({
            "apiVersion": "rbac.authorization.k8s.io/v1",
            "kind": "ClusterRole",
            "metadata": {"name": name, "resourceVersion": "1"},
            "rules": [{"apiGroups": [group], "resources": [resource], "verbs": [verb]}]
        }))
        .unwrap()
    }

    pub fn binding(name: &str, role: &str, kind: &str, subject: &str) -> ClusterRoleBinding {
        serde_json::from_value(json!({
            "apiVersion": "rbac.authorization.k8s.io/v1",
            "kind": "ClusterRoleBinding",
            "metadata": {"name": name, "resourceVersion": "1"},
            "roleRef": {"apiGroup": "rbac.authorization.k8s.io", "kind": "ClusterRole", "name": role},
            "subjects": [{"kind": kind, "name": subject}]
        }))
        .unwrap()
    }

    #[test]
    fn test_granted_role() {
        let admin = cluster_role("a", ACTION_GROUP, ACTIONS_RESOURCE, "create");
        let view = cluster_role("v", VIEW_GROUP, VIEWS_RESOURCE, "*");
        let read = cluster_role("r", VIEW_GROUP, VIEWS_RESOURCE, "get");
        let wildcard = cluster_role("w", "*", "*", "*");
        assert_eq!(granted_role(admin.rules.as_deref().unwrap()), Some(ADMIN));
        assert_eq!(granted_role(view.rules.as_deref().unwrap()), Some(VIEW));
        assert_eq!(granted_role(read.rules.as_deref().unwrap()), None);
        assert_eq!(granted_role(wildcard.rules.as_deref().unwrap()), Some(ADMIN));
    }

    #[test]
    fn test_admin_view_from_cluster_role_bindings() {
        let snapshot = RbacSnapshot {
            clusters: vec![cluster("c1"), cluster("c2")],
            cluster_roles: vec![cluster_role("actions", ACTION_GROUP, ACTIONS_RESOURCE, "create")],
            cluster_role_bindings: vec![binding("b1", "actions", "User", "alice")],
            ..Default::default()
        };
        let mut store = PermissionStore::default();
        AdminViewProcessor.process(&snapshot, &mut store);

        let permissions = store.permissions("alice", &[]);
        assert_eq!(
            permissions[ADMIN],
            vec![ClusterBinding::cluster_wide("c1"), ClusterBinding::cluster_wide("c2")]
        );
    }

    #[test]
    fn test_role_binding_only_grants_its_cluster() {
        let rb: RoleBinding = serde_json::from_value(json!({
            "apiVersion": "rbac.authorization.k8s.io/v1",
            "kind": "RoleBinding",
            "metadata": {"name": "rb", "namespace": "c2", "resourceVersion": "3"},
            "roleRef": {"apiGroup": "rbac.authorization.k8s.io", "kind": "Role", "name": "viewer"},
            "subjects": [{"kind": "Group", "name": "devs"}]
        }))
        .unwrap();
        let role: Role = serde_json::from_value(json!({
            "apiVersion": "rbac.authorization.k8s.io/v1",
            "kind": "Role",
            "metadata": {"name": "viewer", "namespace": "c2", "resourceVersion": "2"},
            "rules": [{"apiGroups": [VIEW_GROUP], "resources": [VIEWS_RESOURCE], "verbs": ["create"]}]
        }))
        .unwrap();
        let snapshot = RbacSnapshot {
            clusters: vec![cluster("c1"), cluster("c2")],
            roles: vec![role],
            role_bindings: vec![rb],
            ..Default::default()
        };
        let mut store = PermissionStore::default();
        AdminViewProcessor.process(&snapshot, &mut store);

        let permissions = store.permissions("bob", &["devs".to_string()]);
        assert_eq!(permissions[VIEW], vec![ClusterBinding::cluster_wide("c2")]);
    }

    #[test]
    fn test_discoverable_cluster_permission() {
        let mut editor = cluster_role("editor", "apps", "deployments", "*");
        editor.metadata.labels = Some([(DISCOVERABLE_CLUSTER_ROLE.to_string(), "true".to_string())].into());
        let hidden = cluster_role("hidden", "apps", "deployments", "*");
        let cp: ClusterPermission = serde_json::from_value(json!({
            "apiVersion": "rbac.open-cluster-management.io/v1alpha1",
            "kind": "ClusterPermission",
            "metadata": {"name": "perm", "namespace": "c1"},
            "spec": {
                "clusterRoleBinding": {
                    "subject": {"kind": "User", "name": "alice"},
                    "roleRef": {"kind": "ClusterRole", "name": "hidden"}
                },
                "roleBindings": [{
                    "namespace": "web",
                    "subjects": [{"kind": "User", "name": "alice"}],
                    "roleRef": {"kind": "ClusterRole", "name": "editor"}
                }]
            }
        }))
        .unwrap();
        let snapshot = RbacSnapshot {
            cluster_roles: vec![editor, hidden],
            cluster_permissions: vec![cp],
            ..Default::default()
        };
        let mut store = PermissionStore::default();
        DiscoverableProcessor.process(&snapshot, &mut store);

        let permissions = store.permissions("alice", &[]);
        assert_eq!(permissions.len(), 1);
        assert_eq!(permissions["editor"], vec![ClusterBinding::in_namespace("c1", "web")]);
        assert!(store.discoverable_role("editor").is_some());
    }

    #[test]
    fn test_version_hash_tracks_relevant_changes() {
        let processors = default_processors();
        let mut snapshot = RbacSnapshot {
            clusters: vec![cluster("c1")],
            cluster_roles: vec![cluster_role("actions", ACTION_GROUP, ACTIONS_RESOURCE, "create")],
            cluster_role_bindings: vec![binding("b1", "actions", "User", "alice")],
            ..Default::default()
        };
        let first = version_hash(&processors, &snapshot);
        assert_eq!(first, version_hash(&processors, &snapshot));

        snapshot.cluster_role_bindings.push(binding("b2", "missing", "User", "bob"));
        assert_eq!(first, version_hash(&processors, &snapshot));

        snapshot.cluster_role_bindings[0].metadata.resource_version = Some("2".to_string());
        assert_ne!(first, version_hash(&processors, &snapshot));
    }
}

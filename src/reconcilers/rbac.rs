// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Hub RBAC granted to a cluster's klusterlet once its join is approved.

use crate::constants::api::{CLUSTER_REGISTRY_GROUP, MCM_GROUP};
use crate::constants::subject::USER_PREFIX;
use crate::constants::OPERATOR_NAME;
use crate::error::Result;
use crate::kubernetes::ensure_namespace_exists;
use crate::types::join_request::ClusterJoinRequest;
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{ObjectMeta, Patch, PatchParams};
use kube::{Api, Client, Resource};
use tracing::{info, instrument};

const RBAC_GROUP: &str = "rbac.authorization.k8s.io";

fn rule(groups: &[&str], resources: &[&str], verbs: &[&str]) -> PolicyRule {
    let strings = |v: &[&str]| Some(v.iter().map(ToString::to_string).collect());
    PolicyRule {
        api_groups: strings(groups),
        resources: strings(resources),
        verbs: verbs.iter().map(ToString::to_string).collect(),
        ..Default::default()
    }
}

/// Access a klusterlet needs inside its cluster namespace on the hub
pub fn klusterlet_rules() -> Vec<PolicyRule> {
    vec![
        rule(&[MCM_GROUP], &["works"], &["get", "list", "watch"]),
        rule(&[MCM_GROUP], &["works/result"], &["create"]),
        rule(&[MCM_GROUP], &["works/status"], &["patch", "update"]),
        rule(&[MCM_GROUP], &["clusterstatuses"], &["create", "get", "list", "update"]),
        rule(&[CLUSTER_REGISTRY_GROUP], &["clusters"], &["create", "get", "update"]),
        rule(&[CLUSTER_REGISTRY_GROUP], &["clusters/status"], &["patch", "update"]),
        rule(
            &[""],
            &["endpoints"],
            &["create", "get", "list", "update", "watch", "patch", "delete", "deletecollection"],
        ),
        rule(&[""], &["secrets"], &["create", "get", "list", "watch", "update", "delete"]),
        rule(&[""], &["events"], &["create", "update", "patch"]),
    ]
}

/// User name carried by the cluster's client certificate
pub fn cluster_user(namespace: &str, name: &str) -> String {
    format!("{USER_PREFIX}:{namespace}:{name}")
}

pub fn cluster_role(name: &str, namespace: &str, owner: Option<OwnerReference>) -> Role {
    Role {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            owner_references: owner.map(|o| vec![o]),
            ..Default::default()
        },
        rules: Some(klusterlet_rules()),
    }
}

pub fn cluster_role_binding(name: &str, namespace: &str, owner: Option<OwnerReference>) -> RoleBinding {
    RoleBinding {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            owner_references: owner.map(|o| vec![o]),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: RBAC_GROUP.to_string(),
            kind: "Role".to_string(),
            name: name.to_string(),
        },
        subjects: Some(vec![Subject {
            api_group: Some(RBAC_GROUP.to_string()),
            kind: "User".to_string(),
            name: cluster_user(namespace, name),
            ..Default::default()
        }]),
    }
}

/// Create the cluster namespace and apply the klusterlet's Role and RoleBinding.
#[instrument(skip(client, request), fields(cluster = %request.spec.cluster_name))]
pub async fn grant_cluster_access(client: &Client, request: &ClusterJoinRequest) -> Result<()> {
    let name = &request.spec.cluster_name;
    let namespace = &request.spec.cluster_namespace;
    ensure_namespace_exists(client, namespace).await?;

    let owner = request.controller_owner_ref(&());
    let params = PatchParams::apply(OPERATOR_NAME).force();

    let roles: Api<Role> = Api::namespaced(client.clone(), namespace);
    roles
        .patch(name, &params, &Patch::Apply(&cluster_role(name, namespace, owner.clone())))
        .await?;

    let bindings: Api<RoleBinding> = Api::namespaced(client.clone(), namespace);
    bindings
        .patch(name, &params, &Patch::Apply(&cluster_role_binding(name, namespace, owner)))
        .await?;

    info!("Granted hub access to cluster {}/{}", namespace, name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rules_cover_klusterlet_resources() {
        let rules = klusterlet_rules();
        let allows = |resource: &str, verb: &str| {
            rules.iter().any(|r| {
                r.resources.as_ref().is_some_and(|res| res.iter().any(|x| x == resource))
                    && r.verbs.iter().any(|v| v == verb)
            })
        };
        assert!(allows("works", "watch"));
        assert!(allows("works/result", "create"));
        assert!(allows("works/status", "patch"));
        assert!(allows("clusterstatuses", "update"));
        assert!(allows("clusters/status", "update"));
        assert!(allows("endpoints", "deletecollection"));
        assert!(allows("secrets", "delete"));
        assert!(!allows("works", "delete"));
    }

    #[test]
    fn test_binding_targets_cluster_user() {
        let binding = cluster_role_binding("c1", "ns1", None);
        assert_eq!(binding.role_ref.name, "c1");
        assert_eq!(binding.role_ref.kind, "Role");
        let subjects = binding.subjects.unwrap();
        assert_eq!(subjects[0].name, "hcm:clusters:ns1:c1");
        assert_eq!(subjects[0].kind, "User");
    }
}

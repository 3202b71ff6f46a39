// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! User permission cache.
//!
//! A periodic resync folds the hub's RBAC objects into per-user and
//! per-group role bindings on managed clusters. Queries read an immutable
//! snapshot that each resync swaps in whole.

pub mod processors;
pub mod store;

use crate::constants::roles::{ADMIN, VIEW};
use crate::error::{McmError, Result};
use crate::kubernetes::{spawn_reflector, wait_synced};
use crate::types::cluster::Cluster;
use crate::types::cluster_permission::ClusterPermission;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding};
use kube::runtime::reflector::Store;
use kube::runtime::watcher;
use kube::{Api, Client};
use parking_lot::RwLock;
use processors::{default_processors, version_hash, PermissionProcessor, RbacSnapshot};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use store::{dedup_superset, ClusterBinding, PermissionStore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// One role a user holds, with the clusters it applies to
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPermission {
    pub name: String,
    pub bindings: Vec<ClusterBinding>,
    pub rules: Vec<PolicyRule>,
}

fn wildcard_rule(verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec!["*".to_string()]),
        resources: Some(vec!["*".to_string()]),
        verbs: verbs.iter().map(|v| v.to_string()).collect(),
        ..Default::default()
    }
}

struct Snapshot {
    store: Arc<PermissionStore>,
    hash: Option<String>,
}

pub struct PermissionCache {
    processors: Vec<Box<dyn PermissionProcessor>>,
    current: RwLock<Snapshot>,
}

impl Default for PermissionCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PermissionCache {
    pub fn new() -> Self {
        Self {
            processors: default_processors(),
            current: RwLock::new(Snapshot {
                store: Arc::new(PermissionStore::default()),
                hash: None,
            }),
        }
    }

    /// Rebuild the store from `rbac` unless nothing relevant changed.
    /// Returns whether a new store was swapped in.
    pub fn synchronize(&self, rbac: &RbacSnapshot) -> bool {
        let hash = version_hash(&self.processors, rbac);
        if self.current.read().hash.as_deref() == Some(hash.as_str()) {
            debug!("Permission sources unchanged, skipping rebuild");
            return false;
        }

        let mut store = PermissionStore::default();
        for processor in &self.processors {
            processor.process(rbac, &mut store);
            debug!("Permission processor {} done", processor.name());
        }
        let (users, groups) = store.subject_counts();

        let mut current = self.current.write();
        current.store = Arc::new(store);
        current.hash = Some(hash);
        info!("Permission cache rebuilt for {} users and {} groups", users, groups);
        true
    }

    fn store(&self) -> Arc<PermissionStore> {
        self.current.read().store.clone()
    }

    /// Every role `user` holds directly or through `groups`.
    pub fn list(&self, user: &str, groups: &[String]) -> Vec<UserPermission> {
        let store = self.store();
        let mut permissions = store.permissions(user, groups);
        dedup_superset(&mut permissions);
        permissions
            .into_iter()
            .map(|(name, bindings)| {
                let rules = match name.as_str() {
                    ADMIN => vec![wildcard_rule(&["*"])],
                    VIEW => vec![wildcard_rule(&["get", "list", "watch"])],
                    other => store
                        .discoverable_role(other)
                        .and_then(|r| r.rules.clone())
                        .unwrap_or_default(),
                };
                UserPermission { name, bindings, rules }
            })
            .collect()
    }

    pub fn get(&self, user: &str, groups: &[String], name: &str) -> Result<UserPermission> {
        self.list(user, groups)
            .into_iter()
            .find(|p| p.name == name)
            .ok_or_else(|| McmError::NotFound(format!("permission {name} for user {user}")))
    }
}

/// Keeps a [`PermissionCache`] in step with the hub's RBAC objects.
pub struct PermissionSyncer {
    client: Client,
    cache: Arc<PermissionCache>,
    period: Duration,
}

struct Sources {
    clusters: Store<Cluster>,
    cluster_roles: Store<ClusterRole>,
    cluster_role_bindings: Store<ClusterRoleBinding>,
    roles: Store<Role>,
    role_bindings: Store<RoleBinding>,
    cluster_permissions: Store<ClusterPermission>,
}

fn owned<K: Clone>(store: &Store<K>) -> Vec<K>
where
    K: kube::Resource + 'static,
    K::DynamicType: Eq + std::hash::Hash + Clone,
{
    store.state().iter().map(|o| o.as_ref().clone()).collect()
}

impl Sources {
    fn snapshot(&self) -> RbacSnapshot {
        RbacSnapshot {
            clusters: owned(&self.clusters),
            cluster_roles: owned(&self.cluster_roles),
            cluster_role_bindings: owned(&self.cluster_role_bindings),
            roles: owned(&self.roles),
            role_bindings: owned(&self.role_bindings),
            cluster_permissions: owned(&self.cluster_permissions),
        }
    }
}

impl PermissionSyncer {
    pub fn new(client: Client, cache: Arc<PermissionCache>, period: Duration) -> Self {
        Self { client, cache, period }
    }

    async fn start_sources(&self, cancel: &CancellationToken) -> Result<Sources> {
        let config = watcher::Config::default;
        let sources = Sources {
            clusters: spawn_reflector(Api::all(self.client.clone()), config(), cancel.clone()),
            cluster_roles: spawn_reflector(Api::all(self.client.clone()), config(), cancel.clone()),
            cluster_role_bindings: spawn_reflector(Api::all(self.client.clone()), config(), cancel.clone()),
            roles: spawn_reflector(Api::all(self.client.clone()), config(), cancel.clone()),
            role_bindings: spawn_reflector(Api::all(self.client.clone()), config(), cancel.clone()),
            cluster_permissions: spawn_reflector(Api::all(self.client.clone()), config(), cancel.clone()),
        };
        wait_synced(&sources.clusters).await?;
        wait_synced(&sources.cluster_roles).await?;
        wait_synced(&sources.cluster_role_bindings).await?;
        wait_synced(&sources.roles).await?;
        wait_synced(&sources.role_bindings).await?;
        wait_synced(&sources.cluster_permissions).await?;
        Ok(sources)
    }

    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        let sources = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            sources = self.start_sources(&cancel) => sources?,
        };

        let mut interval = tokio::time::interval(self.period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Permission cache stopped");
                    return Ok(());
                }
                _ = interval.tick() => {
                    let snapshot = sources.snapshot();
                    let cache = self.cache.clone();
                    // Rebuilding walks every binding; keep it off the reactor
                    if let Err(e) = tokio::task::spawn_blocking(move || cache.synchronize(&snapshot)).await {
                        error!("Permission cache rebuild panicked: {}", e);
                    }
                }
            }
        }
    }
}

// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Untyped access to arbitrary resources in the local cluster.
//!
//! Work payloads carry raw object templates and resource names such as
//! `deployments` or `deployments.apps`; this module maps them onto API
//! endpoints through discovery and performs the CRUD calls.

use crate::error::{is_already_exists, is_not_found, McmError, Result};
use http::header::{HeaderValue, ACCEPT};
use kube::api::{DeleteParams, GetParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::{DynamicObject, GroupVersion, GroupVersionKind, Request};
use kube::discovery::{self, ApiCapabilities, ApiResource, Discovery, Scope};
use kube::{Api, Client, Resource};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, instrument};

/// Ask the API server for its printable table representation.
const TABLE_ACCEPT: &str = "application/json;as=Table;v=v1;g=meta.k8s.io,application/json";

/// User and groups to act as when impersonation is enabled
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub user: String,
    pub groups: Vec<String>,
}

/// Arguments of a list or get query
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub resource: String,
    pub api_group: String,
    pub version: String,
    pub namespace: String,
    pub name: String,
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
    pub limit: Option<u32>,
    pub server_print: bool,
}

pub struct KubeControl {
    client: Client,
    /// Base config used to derive impersonating clients; None disables impersonation
    config: Option<kube::Config>,
    discovery: RwLock<Option<Arc<Discovery>>>,
}

impl KubeControl {
    pub fn new(client: Client, config: Option<kube::Config>) -> Self {
        Self {
            client,
            config,
            discovery: RwLock::new(None),
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn client_as(&self, identity: Option<&Identity>) -> Result<Client> {
        match (identity, &self.config) {
            (Some(identity), Some(config)) if !identity.user.is_empty() => {
                let mut config = config.clone();
                config.auth_info.impersonate = Some(identity.user.clone());
                config.auth_info.impersonate_groups =
                    Some(identity.groups.clone()).filter(|g| !g.is_empty());
                Ok(Client::try_from(config)?)
            }
            _ => Ok(self.client.clone()),
        }
    }

    async fn discovery(&self, refresh: bool) -> Result<Arc<Discovery>> {
        if !refresh {
            if let Some(cached) = self.discovery.read().await.as_ref() {
                return Ok(cached.clone());
            }
        }
        let fresh = Arc::new(Discovery::new(self.client.clone()).run().await?);
        *self.discovery.write().await = Some(fresh.clone());
        Ok(fresh)
    }

    /// Resolve a resource name such as `pods`, `deployments.apps` or `Deployment`.
    pub async fn resolve_resource(
        &self,
        resource: &str,
        api_group: &str,
        version: &str,
    ) -> Result<(ApiResource, ApiCapabilities)> {
        for refresh in [false, true] {
            let discovery = self.discovery(refresh).await?;
            if let Some(found) = find_resource(&discovery, resource, api_group, version) {
                return Ok(found);
            }
        }
        Err(McmError::NotFound(format!("resource type {resource}")))
    }

    pub async fn resolve_kind(&self, api_version: &str, kind: &str) -> Result<(ApiResource, ApiCapabilities)> {
        let gv: GroupVersion = api_version
            .parse()
            .map_err(|_| McmError::Validation(format!("invalid apiVersion '{api_version}'")))?;
        let gvk = GroupVersionKind::gvk(&gv.group, &gv.version, kind);
        Ok(discovery::pinned_kind(&self.client, &gvk).await?)
    }

    fn api(
        client: Client,
        ar: &ApiResource,
        caps: &ApiCapabilities,
        namespace: &str,
    ) -> Result<Api<DynamicObject>> {
        match caps.scope {
            Scope::Namespaced if namespace.is_empty() => Err(McmError::Validation(format!(
                "namespace must be set for {}",
                ar.plural
            ))),
            Scope::Namespaced => Ok(Api::namespaced_with(client, namespace, ar)),
            Scope::Cluster => Ok(Api::all_with(client, ar)),
        }
    }

    /// Create the object described by `template`. An existing object counts as created.
    #[instrument(skip(self, template, identity))]
    pub async fn create(&self, namespace: &str, template: &Value, identity: Option<&Identity>) -> Result<()> {
        let mut obj: DynamicObject = serde_json::from_value(template.clone())?;
        let types = obj
            .types
            .clone()
            .ok_or_else(|| McmError::Validation("template has no apiVersion/kind".to_string()))?;
        let (ar, caps) = self.resolve_kind(&types.api_version, &types.kind).await?;

        let namespace = if namespace.is_empty() {
            obj.metadata.namespace.clone().unwrap_or_default()
        } else {
            namespace.to_string()
        };
        if caps.scope == Scope::Namespaced {
            obj.metadata.namespace = Some(namespace.clone());
        }

        let api = Self::api(self.client_as(identity)?, &ar, &caps, &namespace)?;
        match api.create(&PostParams::default(), &obj).await {
            Ok(_) => Ok(()),
            Err(e) if is_already_exists(&e) => {
                debug!("{} already exists", ar.kind);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete an object; a missing object counts as deleted.
    #[instrument(skip(self))]
    pub async fn delete(&self, resource: &str, namespace: &str, name: &str) -> Result<()> {
        let (ar, caps) = self.resolve_resource(resource, "", "").await?;
        let api = Self::api(self.client.clone(), &ar, &caps, namespace)?;
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Bring the live object in line with `template`. Returns false when nothing changed.
    #[instrument(skip(self, template))]
    pub async fn update(&self, namespace: &str, template: &Value) -> Result<bool> {
        let obj: DynamicObject = serde_json::from_value(template.clone())?;
        let types = obj
            .types
            .clone()
            .ok_or_else(|| McmError::Validation("template has no apiVersion/kind".to_string()))?;
        let name = obj
            .metadata
            .name
            .clone()
            .ok_or_else(|| McmError::Validation("template has no name".to_string()))?;
        let namespace = if namespace.is_empty() {
            obj.metadata.namespace.clone().unwrap_or_default()
        } else {
            namespace.to_string()
        };

        let (ar, caps) = self.resolve_kind(&types.api_version, &types.kind).await?;
        let api = Self::api(self.client.clone(), &ar, &caps, &namespace)?;
        let current = serde_json::to_value(api.get(&name).await?)?;

        let patch = merge_diff(&current, template)?;
        if patch.as_object().is_some_and(Map::is_empty) {
            debug!("Nothing to update for {}/{}", namespace, name);
            return Ok(false);
        }

        api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(true)
    }

    /// Run a get (when `name` is set) or list query and return the raw JSON.
    #[instrument(skip(self), fields(resource = %query.resource))]
    pub async fn query(&self, query: &Query) -> Result<Value> {
        let (ar, caps) = self
            .resolve_resource(&query.resource, &query.api_group, &query.version)
            .await?;
        let namespace = match caps.scope {
            Scope::Namespaced if !query.namespace.is_empty() => Some(query.namespace.as_str()),
            _ => None,
        };
        let request = Request::new(DynamicObject::url_path(&ar, namespace));

        let mut http_request = if query.name.is_empty() {
            let mut lp = ListParams::default();
            if let Some(labels) = query.label_selector.as_deref().filter(|s| !s.is_empty()) {
                lp = lp.labels(labels);
            }
            if let Some(fields) = query.field_selector.as_deref().filter(|s| !s.is_empty()) {
                lp = lp.fields(fields);
            }
            if let Some(limit) = query.limit {
                lp = lp.limit(limit);
            }
            request
                .list(&lp)
                .map_err(|e| McmError::Validation(e.to_string()))?
        } else {
            request
                .get(&query.name, &GetParams::default())
                .map_err(|e| McmError::Validation(e.to_string()))?
        };

        if query.server_print {
            http_request
                .headers_mut()
                .insert(ACCEPT, HeaderValue::from_static(TABLE_ACCEPT));
        }

        Ok(self.client.request::<Value>(http_request).await?)
    }
}

fn find_resource(
    discovery: &Discovery,
    resource: &str,
    api_group: &str,
    version: &str,
) -> Option<(ApiResource, ApiCapabilities)> {
    let (name, group) = match resource.split_once('.') {
        Some((name, group)) if api_group.is_empty() => (name, group),
        _ => (resource, api_group),
    };
    let name = name.to_lowercase();
    let matches = |ar: &ApiResource| ar.plural == name || ar.kind.to_lowercase() == name;

    let mut candidates: Vec<_> = discovery
        .groups()
        .filter(|g| group.is_empty() || g.name() == group)
        .collect();
    // Core resources win when no group is named
    candidates.sort_by_key(|g| !g.name().is_empty());

    for g in candidates {
        let found = if version.is_empty() {
            g.recommended_resources().into_iter().find(|(ar, _)| matches(ar))
        } else {
            g.versioned_resources(version)
                .into_iter()
                .find(|(ar, _)| matches(ar))
        };
        if found.is_some() {
            return found;
        }
    }
    None
}

/// JSON merge patch carrying the fields of `desired` that differ from `current`.
///
/// Fields absent from `desired` are left untouched. Changing `apiVersion`,
/// `kind` or `metadata.name` is rejected.
pub fn merge_diff(current: &Value, desired: &Value) -> Result<Value> {
    for key in ["apiVersion", "kind"] {
        if let Some(want) = desired.get(key) {
            if current.get(key).is_some_and(|have| have != want) {
                return Err(McmError::Validation(format!("{key} may not change")));
            }
        }
    }
    let name = |v: &Value| v.pointer("/metadata/name").cloned();
    if let (Some(have), Some(want)) = (name(current), name(desired)) {
        if have != want {
            return Err(McmError::Validation("metadata.name may not change".to_string()));
        }
    }
    Ok(diff_value(current, desired).unwrap_or_else(|| Value::Object(Map::new())))
}

fn diff_value(current: &Value, desired: &Value) -> Option<Value> {
    match (current, desired) {
        (Value::Object(have), Value::Object(want)) => {
            let mut patch = Map::new();
            for (key, want_value) in want {
                match have.get(key) {
                    Some(have_value) => {
                        if let Some(d) = diff_value(have_value, want_value) {
                            patch.insert(key.clone(), d);
                        }
                    }
                    None => {
                        patch.insert(key.clone(), want_value.clone());
                    }
                }
            }
            (!patch.is_empty()).then_some(Value::Object(patch))
        }
        (have, want) if have == want => None,
        (_, want) => Some(want.clone()),
    }
}

/// Decode the user and groups stamped on a hub object, if any.
pub fn identity_from_annotations(
    annotations: &std::collections::BTreeMap<String, String>,
) -> Option<Identity> {
    use crate::constants::annotations::{USER_GROUP, USER_IDENTITY};
    use base64::{engine::general_purpose::STANDARD, Engine};

    let decode = |key: &str| -> Option<String> {
        let raw = annotations.get(key)?;
        let bytes = STANDARD.decode(raw.trim()).ok()?;
        String::from_utf8(bytes).ok()
    };

    let user = decode(USER_IDENTITY).filter(|u| !u.is_empty())?;
    let groups = decode(USER_GROUP)
        .map(|g| {
            g.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();
    Some(Identity { user, groups })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_diff_no_change() {
        let current = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cm", "namespace": "default", "resourceVersion": "42"},
            "data": {"a": "1"}
        });
        let desired = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cm"},
            "data": {"a": "1"}
        });
        assert_eq!(merge_diff(&current, &desired).unwrap(), json!({}));
    }

    #[test]
    fn test_merge_diff_changed_and_added_fields() {
        let current = json!({"metadata": {"name": "cm"}, "data": {"a": "1", "b": "2"}});
        let desired = json!({"metadata": {"name": "cm", "labels": {"x": "y"}}, "data": {"a": "3"}});
        assert_eq!(
            merge_diff(&current, &desired).unwrap(),
            json!({"metadata": {"labels": {"x": "y"}}, "data": {"a": "3"}})
        );
    }

    #[test]
    fn test_merge_diff_replaces_arrays() {
        let current = json!({"spec": {"ports": [{"port": 80}]}});
        let desired = json!({"spec": {"ports": [{"port": 80}, {"port": 443}]}});
        assert_eq!(
            merge_diff(&current, &desired).unwrap(),
            json!({"spec": {"ports": [{"port": 80}, {"port": 443}]}})
        );
    }

    #[test]
    fn test_merge_diff_rejects_identity_change() {
        let current = json!({"kind": "ConfigMap", "metadata": {"name": "a"}});
        assert!(merge_diff(&current, &json!({"kind": "Secret"})).is_err());
        assert!(merge_diff(&current, &json!({"metadata": {"name": "b"}})).is_err());
    }

    #[test]
    fn test_identity_from_annotations() {
        use base64::{engine::general_purpose::STANDARD, Engine};
        let mut annotations = std::collections::BTreeMap::new();
        annotations.insert(
            crate::constants::annotations::USER_IDENTITY.to_string(),
            STANDARD.encode("alice"),
        );
        annotations.insert(
            crate::constants::annotations::USER_GROUP.to_string(),
            STANDARD.encode("devs,ops"),
        );
        let identity = identity_from_annotations(&annotations).unwrap();
        assert_eq!(identity.user, "alice");
        assert_eq!(identity.groups, vec!["devs", "ops"]);

        assert!(identity_from_annotations(&Default::default()).is_none());
    }
}

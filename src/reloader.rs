// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Restarts the aggregated API server when the cluster's client CAs rotate.

use crate::error::Result;
use crate::kubernetes::retry::{retry_with_backoff, RetryConfig};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use kube::api::{DeleteParams, ListParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const AUTH_NAMESPACE: &str = "kube-system";
const AUTH_CONFIGMAP: &str = "extension-apiserver-authentication";
const CA_KEYS: [&str; 2] = ["client-ca-file", "requestheader-client-ca-file"];
const APISERVER_SELECTOR: &str = "app=mcm-apiserver";
const MAX_ATTEMPTS: u32 = 3;

/// Whether either client CA differs between two versions of the configmap
pub fn ca_changed(old: &ConfigMap, new: &ConfigMap) -> bool {
    CA_KEYS.iter().any(|key| {
        let value = |cm: &ConfigMap| cm.data.as_ref().and_then(|d| d.get(*key)).cloned();
        value(old) != value(new)
    })
}

#[derive(Clone)]
pub struct ApiServerReloader {
    client: Client,
    /// Delay between pod deletions and between attempts
    pacing: Duration,
}

impl ApiServerReloader {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            pacing: Duration::from_secs(5),
        }
    }

    pub fn with_pacing(mut self, pacing: Duration) -> Self {
        self.pacing = pacing;
        self
    }

    /// Sleep for the pacing interval; false when cancelled first.
    async fn pause(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.pacing) => true,
        }
    }

    /// Delete the API server pods one at a time. Returns how many went.
    async fn restart_pods(&self, cancel: &CancellationToken) -> Result<usize> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let list = pods.list(&ListParams::default().labels(APISERVER_SELECTOR)).await?;
        let total = list.items.len();

        for (i, pod) in list.items.iter().enumerate() {
            if cancel.is_cancelled() {
                info!("API server reload cancelled");
                return Ok(i);
            }
            let api: Api<Pod> = Api::namespaced(self.client.clone(), &pod.namespace().unwrap_or_default());
            api.delete(&pod.name_any(), &DeleteParams::default()).await?;
            debug!("{}/{} API server pods deleted", i + 1, total);
            if i + 1 < total && !self.pause(cancel).await {
                info!("API server reload cancelled");
                return Ok(i + 1);
            }
        }
        Ok(total)
    }

    /// Restart the API server, retrying a bounded number of times.
    pub async fn reload(&self, cancel: CancellationToken) -> Result<usize> {
        let retry = RetryConfig::fixed(MAX_ATTEMPTS, self.pacing);
        let deleted = retry_with_backoff(&retry, "reload API server", || self.restart_pods(&cancel)).await?;
        info!("API server reloaded, {} pods restarted", deleted);
        Ok(deleted)
    }

    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), AUTH_NAMESPACE);
        let changes = watcher::watch_object(api, AUTH_CONFIGMAP).default_backoff();
        tokio::pin!(changes);
        info!("Watching {}/{} for CA changes", AUTH_NAMESPACE, AUTH_CONFIGMAP);

        let mut current: Option<ConfigMap> = None;
        let mut in_flight: Option<CancellationToken> = None;
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("API server reloader stopped");
                    return Ok(());
                }
                next = changes.next() => next,
            };
            let configmap = match next {
                Some(Ok(Some(configmap))) => configmap,
                Some(Ok(None)) => continue,
                Some(Err(e)) => {
                    warn!("Watch of {} failed: {}", AUTH_CONFIGMAP, e);
                    continue;
                }
                None => anyhow::bail!("watch of {AUTH_CONFIGMAP} ended"),
            };

            let changed = current.as_ref().is_some_and(|old| ca_changed(old, &configmap));
            current = Some(configmap);
            if !changed {
                continue;
            }

            info!("CA change in {} detected, reloading API server", AUTH_CONFIGMAP);
            if let Some(previous) = in_flight.take() {
                previous.cancel();
            }
            let token = shutdown.child_token();
            in_flight = Some(token.clone());
            let reloader = self.clone();
            tokio::spawn(async move {
                if let Err(e) = reloader.reload(token).await {
                    error!("Failed to reload API server: {}", e);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{list_json, status_success_json, MockService};
    use serde_json::json;

    fn configmap(client_ca: &str, header_ca: &str) -> ConfigMap {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": AUTH_CONFIGMAP, "namespace": AUTH_NAMESPACE},
            "data": {"client-ca-file": client_ca, "requestheader-client-ca-file": header_ca}
        }))
        .unwrap()
    }

    fn pod(namespace: &str, name: &str) -> serde_json::Value {
        json!({"apiVersion": "v1", "kind": "Pod", "metadata": {"name": name, "namespace": namespace, "labels": {"app": "mcm-apiserver"}}})
    }

    fn reloader(mock: &MockService) -> ApiServerReloader {
        ApiServerReloader::new(mock.clone().into_client()).with_pacing(Duration::from_millis(1))
    }

    #[test]
    fn test_ca_changed() {
        let base = configmap("a", "b");
        assert!(!ca_changed(&base, &configmap("a", "b")));
        assert!(ca_changed(&base, &configmap("x", "b")));
        assert!(ca_changed(&base, &configmap("a", "y")));

        let mut other = base.clone();
        other.data.as_mut().unwrap().insert("unrelated".to_string(), "z".to_string());
        assert!(!ca_changed(&base, &other));
    }

    #[tokio::test]
    async fn test_reload_deletes_every_pod() {
        let mock = MockService::new()
            .on_get(
                "/api/v1/pods",
                200,
                &list_json("PodList", "v1", vec![pod("mcm", "api-0"), pod("mcm", "api-1")]),
            )
            .on_delete("/api/v1/namespaces/mcm/pods/", 200, &status_success_json());

        let deleted = reloader(&mock).reload(CancellationToken::new()).await.unwrap();
        assert_eq!(deleted, 2);

        let deletes = mock.requests_to("DELETE", "/api/v1/namespaces/mcm/pods/");
        let names: Vec<_> = deletes.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(names, vec!["/api/v1/namespaces/mcm/pods/api-0", "/api/v1/namespaces/mcm/pods/api-1"]);
        let list = &mock.requests_to("GET", "/api/v1/pods")[0];
        assert!(list.query.contains("labelSelector=app%3Dmcm-apiserver"));
    }

    #[tokio::test]
    async fn test_reload_retries_then_fails() {
        let mock = MockService::new().on_get("/api/v1/pods", 500, "{}");
        assert!(reloader(&mock).reload(CancellationToken::new()).await.is_err());
        assert_eq!(mock.requests_to("GET", "/api/v1/pods").len(), MAX_ATTEMPTS as usize);
    }

    #[tokio::test]
    async fn test_cancelled_reload_stops_deleting() {
        let mock = MockService::new()
            .on_get("/api/v1/pods", 200, &list_json("PodList", "v1", vec![pod("mcm", "api-0")]));
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert_eq!(reloader(&mock).reload(cancel).await.unwrap(), 0);
        assert!(mock.requests_to("DELETE", "/").is_empty());
    }
}

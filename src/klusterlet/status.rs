// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Publishes this cluster's registration, heartbeat and ClusterStatus to the hub.

use super::capacity::{self, Platform};
use super::masters::{self, MasterInfo, MasterProbe};
use crate::config::{KlusterletConfig, ObjectKey};
use crate::constants::timing::STATUS_UPDATE_SECS;
use crate::error::{McmError, Result};
use crate::kubernetes::dynamic::merge_diff;
use crate::types::cluster::{Cluster, ClusterCondition, ClusterSpec, CLUSTER_READY};
use crate::types::cluster_status::{ClusterStatus, ClusterStatusSpec};
use chrono::Utc;
use k8s_openapi::api::core::v1::{EndpointAddress, EndpointPort, Node, PersistentVolume, Pod, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{ApiResource, DynamicObject, GroupVersionKind, ListParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::{Api, Client, Resource, ResourceExt};
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

pub const LABEL_CLOUD: &str = "cloud";
pub const LABEL_VENDOR: &str = "vendor";
pub const LABEL_KUBE_VERSION: &str = "kubernetesVersion";

/// Published ClusterStatus, None until the first successful sync
pub type ReadySignal = watch::Receiver<Option<ClusterStatus>>;

pub struct StatusPublisher {
    hub: Client,
    local: Client,
    config: KlusterletConfig,
    probes: Vec<Box<dyn MasterProbe>>,
    ready: watch::Sender<Option<ClusterStatus>>,
}

/// Configured labels fill in missing ones and replace `auto_detect` placeholders.
pub fn merge_labels(
    existing: &BTreeMap<String, String>,
    configured: &BTreeMap<String, String>,
    auto_detect: &str,
) -> BTreeMap<String, String> {
    let mut merged = existing.clone();
    for (key, value) in configured {
        match merged.get(key) {
            Some(current) if current != auto_detect => {}
            _ => {
                merged.insert(key.clone(), value.clone());
            }
        }
    }
    merged
}

/// Replace remaining `auto_detect` values with what was detected locally.
pub fn resolve_detected(
    labels: &mut BTreeMap<String, String>,
    auto_detect: &str,
    platform: &Platform,
    kube_version: &str,
) {
    for (key, value) in labels.iter_mut() {
        if value != auto_detect {
            continue;
        }
        let detected = match key.as_str() {
            LABEL_CLOUD => platform.cloud.as_str(),
            LABEL_VENDOR => platform.vendor.as_str(),
            LABEL_KUBE_VERSION => kube_version,
            _ => continue,
        };
        *value = label_value(detected);
    }
}

/// Coerce into a valid label value: `[A-Za-z0-9._-]`, at most 63 characters.
fn label_value(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .take(63)
        .collect();
    cleaned.trim_matches(|c: char| !c.is_ascii_alphanumeric()).to_string()
}

/// Record the outcome of a sync on the cluster's newest condition.
pub fn record_heartbeat(conditions: &mut Vec<ClusterCondition>, outcome: &Result<ClusterStatus>) {
    if conditions.is_empty() {
        conditions.push(ClusterCondition {
            condition_type: CLUSTER_READY.to_string(),
            status: "True".to_string(),
            ..Default::default()
        });
    }
    let now = Some(Time(Utc::now()));
    if let Some(latest) = conditions.last_mut() {
        match outcome {
            Ok(_) => {
                latest.condition_type = CLUSTER_READY.to_string();
                latest.status = "True".to_string();
                latest.last_heartbeat_time = now;
                latest.reason = None;
            }
            Err(e) => {
                latest.condition_type = String::new();
                latest.last_transition_time = now;
                latest.reason = Some(e.to_string());
            }
        }
    }
}

fn endpoint_address(host: &str) -> EndpointAddress {
    if host.is_empty() {
        EndpointAddress::default()
    } else {
        masters::address(host)
    }
}

fn has_address(endpoint: &EndpointAddress) -> bool {
    !endpoint.ip.is_empty() || endpoint.hostname.as_deref().is_some_and(|h| !h.is_empty())
}

fn parse_key(raw: &str, what: &str) -> Result<ObjectKey> {
    ObjectKey::parse(raw).ok_or_else(|| McmError::Validation(format!("{what} '{raw}' is not namespace/name")))
}

impl StatusPublisher {
    pub fn new(hub: Client, local: Client, config: KlusterletConfig) -> (Self, ReadySignal) {
        let (ready, signal) = watch::channel(None);
        let publisher = Self {
            hub,
            local,
            config,
            probes: masters::default_probes(),
            ready,
        };
        (publisher, signal)
    }

    /// Replace the master address probes.
    pub fn with_probes(mut self, probes: Vec<Box<dyn MasterProbe>>) -> Self {
        self.probes = probes;
        self
    }

    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(Duration::from_secs(STATUS_UPDATE_SECS));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Status publisher stopped");
                    return Ok(());
                }
                _ = interval.tick() => {
                    if let Err(e) = self.sync().await {
                        error!("Failed to sync cluster status: {}", e);
                    }
                }
            }
        }
    }

    fn clusters(&self) -> Api<Cluster> {
        Api::namespaced(self.hub.clone(), &self.config.cluster_namespace)
    }

    /// One publish pass: registration, ClusterStatus, then the heartbeat.
    #[instrument(skip(self), fields(cluster = %self.config.cluster_name))]
    pub async fn sync(&self) -> Result<()> {
        let masters = masters::discover(&self.local, &self.probes, &self.config.master_addresses).await;
        let mut cluster = self.ensure_cluster(&masters).await?;

        let auto_detect = self.config.auto_detect_value.as_str();
        let mut labels = merge_labels(cluster.labels(), &self.config.cluster_labels, auto_detect);
        if labels.values().any(|v| v == auto_detect) {
            match self.detect().await {
                Ok((platform, version)) => resolve_detected(&mut labels, auto_detect, &platform, &version),
                Err(e) => warn!("Platform detection failed: {}", e),
            }
        }
        if &labels != cluster.labels() {
            let patch = json!({"metadata": {"labels": labels}});
            cluster = self
                .clusters()
                .patch(&cluster.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
        }

        let outcome = self.update_cluster_status(&cluster, &labels, &masters).await;
        let mut conditions = cluster.status.as_ref().map(|s| s.conditions.clone()).unwrap_or_default();
        record_heartbeat(&mut conditions, &outcome);

        let patch = json!({
            "metadata": {"resourceVersion": cluster.resource_version()},
            "status": {"conditions": conditions},
        });
        self.clusters()
            .patch_status(&cluster.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        outcome.map(|_| ())
    }

    /// Fetch or register the Cluster, keeping its API endpoints current.
    async fn ensure_cluster(&self, masters: &MasterInfo) -> Result<Cluster> {
        let endpoints = masters::api_endpoints(masters);
        let api = self.clusters();
        match api.get_opt(&self.config.cluster_name).await? {
            Some(cluster) if cluster.spec.kubernetes_api_endpoints == endpoints => Ok(cluster),
            Some(cluster) => {
                let patch = json!({"spec": {"kubernetesApiEndpoints": endpoints}});
                info!("API endpoints of cluster {} changed", cluster.key());
                Ok(api
                    .patch(&cluster.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
                    .await?)
            }
            None => {
                let cluster = Cluster {
                    metadata: ObjectMeta {
                        name: Some(self.config.cluster_name.clone()),
                        namespace: Some(self.config.cluster_namespace.clone()),
                        labels: Some(self.config.cluster_labels.clone()),
                        ..Default::default()
                    },
                    spec: ClusterSpec {
                        kubernetes_api_endpoints: endpoints,
                    },
                    status: None,
                };
                let created = api.create(&PostParams::default(), &cluster).await?;
                info!("Registered cluster {}", created.key());
                Ok(created)
            }
        }
    }

    async fn detect(&self) -> Result<(Platform, String)> {
        let version = self.local.apiserver_version().await?.git_version;
        let nodes: Api<Node> = Api::all(self.local.clone());
        let nodes = nodes.list(&ListParams::default().limit(1)).await?.items;
        Ok((capacity::detect_platform(&version, &nodes), version))
    }

    /// Create or patch the ClusterStatus and signal the HTTPS server.
    async fn update_cluster_status(
        &self,
        cluster: &Cluster,
        labels: &BTreeMap<String, String>,
        masters: &MasterInfo,
    ) -> Result<ClusterStatus> {
        let api: Api<ClusterStatus> = Api::namespaced(self.hub.clone(), &self.config.cluster_namespace);
        let existing = api.get_opt(&self.config.cluster_name).await?;

        let nodes = Api::<Node>::all(self.local.clone()).list(&ListParams::default()).await?.items;
        let pods = Api::<Pod>::all(self.local.clone()).list(&ListParams::default()).await?.items;
        let pvs = Api::<PersistentVolume>::all(self.local.clone())
            .list(&ListParams::default())
            .await?
            .items;

        let previous = existing.as_ref().map(|s| s.spec.clone()).unwrap_or_default();
        let (klusterlet_endpoint, klusterlet_port) = match self.klusterlet_endpoint().await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                error!("Failed to resolve klusterlet endpoint: {}", e);
                (previous.klusterlet_endpoint.clone(), previous.klusterlet_port.clone())
            }
        };
        let desired = ClusterStatusSpec {
            master_addresses: masters.addresses.clone(),
            console_url: masters.console_url.clone(),
            capacity: capacity::capacity(&nodes, &pvs),
            usage: capacity::usage(&pods, &pvs),
            klusterlet_endpoint,
            klusterlet_port,
            klusterlet_version: env!("CARGO_PKG_VERSION").to_string(),
            version: self.config.server_version.clone(),
            // Written by the hub
            klusterlet_ca: previous.klusterlet_ca.clone(),
        };

        let status = match existing {
            None => {
                let status = ClusterStatus {
                    metadata: ObjectMeta {
                        name: Some(self.config.cluster_name.clone()),
                        namespace: Some(self.config.cluster_namespace.clone()),
                        labels: Some(labels.clone()),
                        owner_references: cluster.controller_owner_ref(&()).map(|o| vec![o]),
                        ..Default::default()
                    },
                    spec: desired,
                };
                let created = api.create(&PostParams::default(), &status).await?;
                info!("Created cluster status {}/{}", self.config.cluster_namespace, self.config.cluster_name);
                created
            }
            Some(current) => {
                let diff = merge_diff(&serde_json::to_value(&current.spec)?, &serde_json::to_value(&desired)?)?;
                let spec_changed = diff.as_object().is_some_and(|d| !d.is_empty());
                if spec_changed || current.labels() != labels {
                    let patch = json!({
                        "metadata": {"labels": labels, "resourceVersion": current.resource_version()},
                        "spec": diff,
                    });
                    debug!("Cluster status changed: {}", diff);
                    api.patch(&current.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
                        .await?
                } else {
                    current
                }
            }
        };

        self.ready.send_if_modified(|published| {
            let changed = published
                .as_ref()
                .map_or(true, |p| p.spec.klusterlet_ca != status.spec.klusterlet_ca);
            if changed {
                *published = Some(status.clone());
            }
            changed
        });
        Ok(status)
    }

    /// Address and port the hub reaches this klusterlet on.
    ///
    /// An explicit address wins, then the ingress, a load-balancer service and a route.
    pub async fn klusterlet_endpoint(&self) -> Result<(EndpointAddress, EndpointPort)> {
        let mut endpoint = endpoint_address(&self.config.klusterlet_address);
        let mut port = EndpointPort {
            name: Some("https".to_string()),
            protocol: Some("TCP".to_string()),
            port: self.config.klusterlet_port,
            ..Default::default()
        };

        if let Some(raw) = &self.config.klusterlet_ingress {
            let key = parse_key(raw, "klusterlet ingress")?;
            let ingress = Api::<Ingress>::namespaced(self.local.clone(), &key.namespace)
                .get(&key.name)
                .await?;
            if endpoint.ip.is_empty() {
                if let Some(ip) = ingress
                    .status
                    .as_ref()
                    .and_then(|s| s.load_balancer.as_ref()?.ingress.as_ref()?.first()?.ip.clone())
                {
                    endpoint.ip = ip;
                }
            }
            if endpoint.hostname.is_none() {
                endpoint.hostname = ingress
                    .spec
                    .as_ref()
                    .and_then(|s| s.rules.as_ref()?.first()?.host.clone());
            }
        }

        if let Some(raw) = self.config.klusterlet_service.as_ref().filter(|_| !has_address(&endpoint)) {
            let key = parse_key(raw, "klusterlet service")?;
            let service = Api::<Service>::namespaced(self.local.clone(), &key.namespace)
                .get(&key.name)
                .await?;
            let spec = service.spec.unwrap_or_default();
            if spec.type_.as_deref() != Some("LoadBalancer") {
                return Err(McmError::Validation("klusterlet service must be of type LoadBalancer".to_string()));
            }
            let ingress = service
                .status
                .and_then(|s| s.load_balancer?.ingress?.into_iter().next())
                .ok_or_else(|| McmError::NotFound("load balancer address of klusterlet service".to_string()))?;
            let service_port = spec
                .ports
                .and_then(|p| p.into_iter().next())
                .ok_or_else(|| McmError::NotFound("port of klusterlet service".to_string()))?;
            endpoint.ip = ingress.ip.unwrap_or_default();
            endpoint.hostname = ingress.hostname;
            port.port = service_port.port;
        }

        if let Some(raw) = self.config.klusterlet_route.as_ref().filter(|_| !has_address(&endpoint)) {
            let key = parse_key(raw, "klusterlet route")?;
            let gvk = GroupVersionKind::gvk("route.openshift.io", "v1", "Route");
            let ar = ApiResource::from_gvk_with_plural(&gvk, "routes");
            let route = Api::<DynamicObject>::namespaced_with(self.local.clone(), &key.namespace, &ar)
                .get(&key.name)
                .await?;
            endpoint.hostname = route.data["spec"]["host"].as_str().map(String::from);
        }

        Ok((endpoint, port))
    }
}

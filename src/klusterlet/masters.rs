// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Discovery of the externally reachable API server addresses and console URL.
//!
//! Each platform publishes them differently, so discovery is a chain of
//! probes tried in order. The first probe whose ConfigMap exists wins; when
//! none does, the configured addresses or the `default/kubernetes` endpoints
//! are used.

use crate::error::Result;
use crate::types::cluster::{KubernetesApiEndpoints, ServerAddressByClientCidr};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, EndpointAddress, EndpointPort, Endpoints};
use kube::{Api, Client};
use std::collections::BTreeMap;
use std::net::IpAddr;
use tracing::{debug, warn};

/// Where the cluster's API server and console can be reached
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MasterInfo {
    pub addresses: Vec<EndpointAddress>,
    pub ports: Vec<EndpointPort>,
    pub console_url: String,
}

/// One platform-specific way of finding the master addresses.
#[async_trait]
pub trait MasterProbe: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Ok(None)` when this platform's source does not exist.
    async fn probe(&self, client: &Client) -> Result<Option<MasterInfo>>;
}

async fn config_map_data(client: &Client, namespace: &str, name: &str) -> Result<Option<BTreeMap<String, String>>> {
    let api: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
    Ok(api.get_opt(name).await?.and_then(|cm| cm.data))
}

pub(crate) fn address(host: &str) -> EndpointAddress {
    if host.parse::<IpAddr>().is_ok() {
        EndpointAddress {
            ip: host.to_string(),
            ..Default::default()
        }
    } else {
        EndpointAddress {
            hostname: Some(host.to_string()),
            ..Default::default()
        }
    }
}

fn port(value: &str) -> Option<EndpointPort> {
    value.trim().parse().ok().map(|port| EndpointPort {
        port,
        ..Default::default()
    })
}

/// Split `https://host:port` into its address and port.
fn split_url(url: &str) -> Option<(EndpointAddress, EndpointPort)> {
    let url = url::Url::parse(url.trim()).ok()?;
    let host = url.host_str()?;
    let port = url.port_or_known_default()?;
    Some((address(host), EndpointPort {
        port: i32::from(port),
        ..Default::default()
    }))
}

/// `kube-public/ibmcloud-cluster-info`
pub struct IbmCloudClusterInfo;

#[async_trait]
impl MasterProbe for IbmCloudClusterInfo {
    fn name(&self) -> &'static str {
        "ibmcloud-cluster-info"
    }

    async fn probe(&self, client: &Client) -> Result<Option<MasterInfo>> {
        let Some(data) = config_map_data(client, "kube-public", "ibmcloud-cluster-info").await? else {
            return Ok(None);
        };
        let mut info = MasterInfo::default();
        if let Some(host) = data.get("cluster_kube_apiserver_host") {
            info.addresses.push(address(host));
        }
        if let Some(p) = data.get("cluster_kube_apiserver_port") {
            match port(p) {
                Some(p) => info.ports.push(p),
                None => warn!("Invalid apiserver port '{}'", p),
            }
        }
        if let (Some(addr), Some(p)) = (data.get("cluster_address"), data.get("cluster_router_https_port")) {
            info.console_url = format!("https://{addr}:{p}");
        }
        Ok(Some(info))
    }
}

/// `kube-system/platform-api`
pub struct PlatformApi;

#[async_trait]
impl MasterProbe for PlatformApi {
    fn name(&self) -> &'static str {
        "platform-api"
    }

    async fn probe(&self, client: &Client) -> Result<Option<MasterInfo>> {
        let Some(data) = config_map_data(client, "kube-system", "platform-api").await? else {
            return Ok(None);
        };
        let mut info = MasterInfo::default();
        if let Some((addr, p)) = data.get("KUBERNETES_API_EXTERNAL_URL").and_then(|u| split_url(u)) {
            info.addresses.push(addr);
            info.ports.push(p);
        }
        if let Some(url) = data.get("CLUSTER_EXTERNAL_URL") {
            info.console_url = url.clone();
        }
        Ok(Some(info))
    }
}

/// `openshift-console/console-config`
pub struct OpenShiftConsole;

impl OpenShiftConsole {
    fn find<'a>(value: &'a serde_yaml::Value, key: &str) -> Option<&'a str> {
        match value {
            serde_yaml::Value::Mapping(map) => map.iter().find_map(|(k, v)| {
                if k.as_str() == Some(key) {
                    v.as_str()
                } else {
                    Self::find(v, key)
                }
            }),
            _ => None,
        }
    }
}

#[async_trait]
impl MasterProbe for OpenShiftConsole {
    fn name(&self) -> &'static str {
        "console-config"
    }

    async fn probe(&self, client: &Client) -> Result<Option<MasterInfo>> {
        let Some(data) = config_map_data(client, "openshift-console", "console-config").await? else {
            return Ok(None);
        };
        let mut info = MasterInfo::default();
        let Some(raw) = data.get("console-config.yaml") else {
            return Ok(Some(info));
        };
        let config: serde_yaml::Value = match serde_yaml::from_str(raw) {
            Ok(config) => config,
            Err(e) => {
                warn!("Unreadable console-config.yaml: {}", e);
                return Ok(Some(info));
            }
        };
        if let Some((addr, p)) = Self::find(&config, "masterPublicURL").and_then(split_url) {
            info.addresses.push(addr);
            info.ports.push(p);
        }
        if let Some(url) = Self::find(&config, "consoleBaseAddress") {
            info.console_url = url.to_string();
        }
        Ok(Some(info))
    }
}

/// Probes in their default order
pub fn default_probes() -> Vec<Box<dyn MasterProbe>> {
    vec![Box::new(IbmCloudClusterInfo), Box::new(PlatformApi), Box::new(OpenShiftConsole)]
}

/// Run the probes, falling back to `configured` and then to the kubernetes endpoints.
pub async fn discover(client: &Client, probes: &[Box<dyn MasterProbe>], configured: &[String]) -> MasterInfo {
    for probe in probes {
        match probe.probe(client).await {
            Ok(Some(info)) => {
                debug!("Master addresses from {}", probe.name());
                return info;
            }
            Ok(None) => {}
            Err(e) => warn!("Master probe {} failed: {}", probe.name(), e),
        }
    }

    if !configured.is_empty() {
        return MasterInfo {
            addresses: configured.iter().map(|a| address(a)).collect(),
            ..Default::default()
        };
    }

    let endpoints: Api<Endpoints> = Api::namespaced(client.clone(), "default");
    match endpoints.get_opt("kubernetes").await {
        Ok(Some(ep)) => {
            let subset = ep.subsets.and_then(|s| s.into_iter().next()).unwrap_or_default();
            MasterInfo {
                addresses: subset.addresses.unwrap_or_default(),
                ports: subset.ports.unwrap_or_default(),
                console_url: String::new(),
            }
        }
        Ok(None) => MasterInfo::default(),
        Err(e) => {
            warn!("Failed to read kubernetes endpoints: {}", e);
            MasterInfo::default()
        }
    }
}

/// Every address paired with every port, reachable from anywhere.
pub fn api_endpoints(info: &MasterInfo) -> KubernetesApiEndpoints {
    let mut server_endpoints = Vec::new();
    for addr in &info.addresses {
        let host = addr.hostname.clone().filter(|h| !h.is_empty()).unwrap_or_else(|| addr.ip.clone());
        if info.ports.is_empty() {
            server_endpoints.push(ServerAddressByClientCidr {
                client_cidr: "0.0.0.0/0".to_string(),
                server_address: host.clone(),
            });
        }
        for p in &info.ports {
            server_endpoints.push(ServerAddressByClientCidr {
                client_cidr: "0.0.0.0/0".to_string(),
                server_address: format!("{}:{}", host, p.port),
            });
        }
    }
    KubernetesApiEndpoints { server_endpoints }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockService;
    use serde_json::json;

    fn config_map(namespace: &str, name: &str, data: serde_json::Value) -> String {
        json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": name, "namespace": namespace},
            "data": data
        })
        .to_string()
    }

    #[test]
    fn test_api_endpoints_cross_product() {
        let info = MasterInfo {
            addresses: vec![address("10.0.0.1"), address("api.example.com")],
            ports: vec![port("6443").unwrap(), port("443").unwrap()],
            console_url: String::new(),
        };
        let endpoints: Vec<_> = api_endpoints(&info)
            .server_endpoints
            .into_iter()
            .map(|e| e.server_address)
            .collect();
        assert_eq!(
            endpoints,
            vec!["10.0.0.1:6443", "10.0.0.1:443", "api.example.com:6443", "api.example.com:443"]
        );
    }

    #[test]
    fn test_api_endpoints_without_ports() {
        let info = MasterInfo {
            addresses: vec![address("10.0.0.1")],
            ..Default::default()
        };
        let endpoints = api_endpoints(&info).server_endpoints;
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].server_address, "10.0.0.1");
        assert_eq!(endpoints[0].client_cidr, "0.0.0.0/0");
    }

    #[test]
    fn test_split_url() {
        let (addr, p) = split_url("https://api.example.com:8443").unwrap();
        assert_eq!(addr.hostname.as_deref(), Some("api.example.com"));
        assert_eq!(p.port, 8443);
        let (addr, p) = split_url("https://10.1.2.3").unwrap();
        assert_eq!(addr.ip, "10.1.2.3");
        assert_eq!(p.port, 443);
    }

    #[tokio::test]
    async fn test_first_existing_probe_wins() {
        let mock = MockService::new()
            .on_get(
                "/api/v1/namespaces/kube-system/configmaps/platform-api",
                200,
                &config_map(
                    "kube-system",
                    "platform-api",
                    json!({
                        "KUBERNETES_API_EXTERNAL_URL": "https://9.1.2.3:8001",
                        "CLUSTER_EXTERNAL_URL": "https://console.example.com:8443"
                    }),
                ),
            )
            .on_get(
                "/api/v1/namespaces/openshift-console/configmaps/console-config",
                200,
                &config_map("openshift-console", "console-config", json!({})),
            );
        let info = discover(&mock.clone().into_client(), &default_probes(), &[]).await;
        assert_eq!(info.addresses[0].ip, "9.1.2.3");
        assert_eq!(info.ports[0].port, 8001);
        assert_eq!(info.console_url, "https://console.example.com:8443");
        assert!(mock.requests_to("GET", "/api/v1/namespaces/openshift-console").is_empty());
    }

    #[tokio::test]
    async fn test_openshift_console_config() {
        let yaml = "apiVersion: console.openshift.io/v1\nclusterInfo:\n  consoleBaseAddress: https://console.apps.ocp\n  masterPublicURL: https://api.ocp:6443\n";
        let mock = MockService::new().on_get(
            "/api/v1/namespaces/openshift-console/configmaps/console-config",
            200,
            &config_map("openshift-console", "console-config", json!({"console-config.yaml": yaml})),
        );
        let info = discover(&mock.into_client(), &default_probes(), &[]).await;
        assert_eq!(info.addresses[0].hostname.as_deref(), Some("api.ocp"));
        assert_eq!(info.ports[0].port, 6443);
        assert_eq!(info.console_url, "https://console.apps.ocp");
    }

    #[tokio::test]
    async fn test_falls_back_to_kubernetes_endpoints() {
        let mock = MockService::new().on_get(
            "/api/v1/namespaces/default/endpoints/kubernetes",
            200,
            &json!({
                "apiVersion": "v1",
                "kind": "Endpoints",
                "metadata": {"name": "kubernetes", "namespace": "default"},
                "subsets": [{"addresses": [{"ip": "172.18.0.2"}], "ports": [{"name": "https", "port": 6443}]}]
            })
            .to_string(),
        );
        let info = discover(&mock.into_client(), &default_probes(), &[]).await;
        assert_eq!(info.addresses[0].ip, "172.18.0.2");
        assert_eq!(info.ports[0].port, 6443);

        let configured = discover(&MockService::new().into_client(), &default_probes(), &["10.9.9.9".to_string()]).await;
        assert_eq!(configured.addresses[0].ip, "10.9.9.9");
    }
}

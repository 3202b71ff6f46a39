// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::env;
use std::time::Duration;

/// Which control-plane component this process runs
#[derive(Debug, Clone)]
pub enum Component {
    Hub(HubConfig),
    Klusterlet(KlusterletConfig),
    ServiceRegistry(RegistryConfig),
}

/// Configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub component: Component,
}

/// Hub-side controllers
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Approve join requests without a conflicting Cluster automatically
    pub auto_approve: bool,
    /// Filter WorkSet targets by a SubjectAccessReview for the creating user
    pub enable_rbac_filter: bool,
    pub cluster_health_period: Duration,
    pub permission_resync: Duration,
    pub csr_validation_period: Duration,
    pub gc_period: Duration,
    pub worker_count: u16,
    pub reload_apiserver: bool,
}

/// Managed-cluster agent
#[derive(Debug, Clone)]
pub struct KlusterletConfig {
    pub cluster_name: String,
    pub cluster_namespace: String,
    /// Explicit master addresses, used when no platform probe answers
    pub master_addresses: Vec<String>,
    pub klusterlet_address: String,
    pub klusterlet_port: i32,
    /// `ns/name` references used to resolve the externally reachable endpoint
    pub klusterlet_ingress: Option<String>,
    pub klusterlet_service: Option<String>,
    pub klusterlet_route: Option<String>,
    pub enable_impersonation: bool,
    pub cluster_labels: BTreeMap<String, String>,
    pub bootstrap_secret: ObjectKey,
    pub klusterlet_secret: ObjectKey,
    /// Label selector of the local agent pods restarted on rotation
    pub agent_selector: String,
    pub agent_namespace: String,
    pub tls_cert_file: Option<String>,
    pub tls_key_file: Option<String>,
    pub server_port: u16,
    /// `ns/name:port` of the metrics service behind `/monitoring`
    pub monitoring_service: Option<String>,
    pub server_version: String,
    /// Cluster label value that asks for the value to be detected
    pub auto_detect_value: String,
}

/// Service registry syncer
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub cluster_name: String,
    pub sync_period: Duration,
}

/// A `namespace/name` reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn parse(value: &str) -> Option<Self> {
        let (namespace, name) = value.split_once('/')?;
        if namespace.is_empty() || name.is_empty() || name.contains('/') {
            return None;
        }
        Some(Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: u64) -> Result<Duration> {
    match env::var(key) {
        Ok(v) => Ok(Duration::from_secs(
            v.parse().with_context(|| format!("{key} must be a number of seconds"))?,
        )),
        Err(_) => Ok(Duration::from_secs(default)),
    }
}

fn env_required(key: &str) -> Result<String> {
    env::var(key).with_context(|| format!("{key} environment variable not set"))
}

fn env_key(key: &str, default: &str) -> Result<ObjectKey> {
    let raw = env::var(key).unwrap_or_else(|_| default.to_string());
    ObjectKey::parse(&raw).with_context(|| format!("{key} must be of the form namespace/name"))
}

/// Parse `k=v,k=v` into a label map, skipping empty entries
pub fn parse_labels(raw: &str) -> Result<BTreeMap<String, String>> {
    let mut labels = BTreeMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let Some((k, v)) = pair.split_once('=') else {
            bail!("invalid label '{pair}', expected key=value");
        };
        labels.insert(k.trim().to_string(), v.trim().to_string());
    }
    Ok(labels)
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let component = match env::var("COMPONENT").unwrap_or_else(|_| "hub".to_string()).as_str() {
            "hub" => Component::Hub(HubConfig::from_env()?),
            "klusterlet" => Component::Klusterlet(KlusterletConfig::from_env()?),
            "serviceregistry" => Component::ServiceRegistry(RegistryConfig::from_env()?),
            other => bail!("unknown COMPONENT '{other}'"),
        };
        Ok(Config { component })
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            auto_approve: false,
            enable_rbac_filter: false,
            cluster_health_period: Duration::from_secs(60),
            permission_resync: Duration::from_secs(30),
            csr_validation_period: Duration::from_secs(30),
            gc_period: Duration::from_secs(60),
            worker_count: 2,
            reload_apiserver: false,
        }
    }
}

impl HubConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            auto_approve: env_bool("AUTO_APPROVE", false),
            enable_rbac_filter: env_bool("ENABLE_RBAC_FILTER", false),
            cluster_health_period: env_secs("CLUSTER_HEALTH_PERIOD_SECS", 60)?,
            permission_resync: env_secs("PERMISSION_RESYNC_SECS", 30)?,
            csr_validation_period: env_secs("CSR_VALIDATION_SECS", 30)?,
            gc_period: env_secs("GC_PERIOD_SECS", 60)?,
            worker_count: env::var("WORKER_COUNT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2),
            reload_apiserver: env_bool("RELOAD_APISERVER", false),
        })
    }
}

impl KlusterletConfig {
    pub fn from_env() -> Result<Self> {
        let cluster_name = env_required("CLUSTER_NAME")?;
        let cluster_namespace = env_required("CLUSTER_NAMESPACE")?;
        let master_addresses = env::var("MASTER_ADDRESSES")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        let cluster_labels = parse_labels(&env::var("CLUSTER_LABELS").unwrap_or_default())?;

        Ok(Self {
            cluster_name,
            cluster_namespace,
            master_addresses,
            klusterlet_address: env::var("KLUSTERLET_ADDRESS").unwrap_or_default(),
            klusterlet_port: env::var("KLUSTERLET_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(443),
            klusterlet_ingress: env::var("KLUSTERLET_INGRESS").ok(),
            klusterlet_service: env::var("KLUSTERLET_SERVICE").ok(),
            klusterlet_route: env::var("KLUSTERLET_ROUTE").ok(),
            enable_impersonation: env_bool("ENABLE_IMPERSONATION", false),
            cluster_labels,
            bootstrap_secret: env_key("BOOTSTRAP_SECRET", "multicluster-endpoint/klusterlet-bootstrap")?,
            klusterlet_secret: env_key("KLUSTERLET_SECRET", "multicluster-endpoint/klusterlet-config")?,
            agent_selector: env::var("AGENT_SELECTOR").unwrap_or_else(|_| "app=klusterlet".to_string()),
            agent_namespace: env::var("AGENT_NAMESPACE")
                .unwrap_or_else(|_| "multicluster-endpoint".to_string()),
            tls_cert_file: env::var("TLS_CERT_FILE").ok(),
            tls_key_file: env::var("TLS_KEY_FILE").ok(),
            server_port: env::var("SERVER_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8443),
            monitoring_service: env::var("MONITORING_SERVICE").ok(),
            server_version: env::var("SERVER_VERSION").unwrap_or_default(),
            auto_detect_value: env::var("AUTO_DETECT_VALUE")
                .unwrap_or_else(|_| crate::constants::AUTO_DETECT.to_string()),
        })
    }

    /// The user name the hub knows this cluster's klusterlet by
    pub fn cluster_user(&self) -> String {
        format!(
            "{}:{}:{}",
            crate::constants::subject::USER_PREFIX,
            self.cluster_namespace,
            self.cluster_name
        )
    }
}

impl RegistryConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            cluster_name: env_required("CLUSTER_NAME")?,
            sync_period: env_secs("SYNC_PERIOD_SECS", 1)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_key_parse() {
        let key = ObjectKey::parse("kube-system/klusterlet").unwrap();
        assert_eq!(key.namespace, "kube-system");
        assert_eq!(key.name, "klusterlet");
        assert_eq!(key.to_string(), "kube-system/klusterlet");
    }

    #[test]
    fn test_object_key_rejects_malformed() {
        assert!(ObjectKey::parse("klusterlet").is_none());
        assert!(ObjectKey::parse("/klusterlet").is_none());
        assert!(ObjectKey::parse("a/b/c").is_none());
    }

    #[test]
    fn test_parse_labels() {
        let labels = parse_labels("cloud=auto-detect, env=prod,,").unwrap();
        assert_eq!(labels.len(), 2);
        assert_eq!(labels["cloud"], "auto-detect");
        assert_eq!(labels["env"], "prod");
    }

    #[test]
    fn test_parse_labels_rejects_missing_value() {
        assert!(parse_labels("cloud").is_err());
    }
}

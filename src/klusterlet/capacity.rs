// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Capacity and usage totals plus platform detection from local node, pod
//! and volume listings.

use crate::types::cluster_status::{
    ResourceList, RESOURCE_CPU, RESOURCE_MEMORY, RESOURCE_NODES, RESOURCE_PODS, RESOURCE_STORAGE,
};
use k8s_openapi::api::core::v1::{Node, PersistentVolume, Pod};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::collections::BTreeMap;

const MI: f64 = 1024.0 * 1024.0;
const GI: f64 = MI * 1024.0;

/// Parse a Kubernetes quantity such as `250m`, `4`, `16Gi` or `1e3` into its base unit.
pub fn parse_quantity(q: &str) -> Option<f64> {
    let q = q.trim();
    if q.is_empty() {
        return None;
    }
    const SUFFIXES: [(&str, f64); 15] = [
        ("Ki", 1024.0),
        ("Mi", MI),
        ("Gi", GI),
        ("Ti", GI * 1024.0),
        ("Pi", GI * 1024.0 * 1024.0),
        ("Ei", GI * 1024.0 * 1024.0 * 1024.0),
        ("n", 1e-9),
        ("u", 1e-6),
        ("m", 1e-3),
        ("k", 1e3),
        ("M", 1e6),
        ("G", 1e9),
        ("T", 1e12),
        ("P", 1e15),
        ("E", 1e18),
    ];
    for (suffix, factor) in SUFFIXES {
        if let Some(number) = q.strip_suffix(suffix) {
            return number.parse::<f64>().ok().map(|n| n * factor);
        }
    }
    q.parse::<f64>().ok()
}

fn sum<'a>(quantities: impl Iterator<Item = &'a Quantity>) -> f64 {
    quantities.filter_map(|q| parse_quantity(&q.0)).sum()
}

fn cpu(cores: f64) -> Quantity {
    let millis = (cores * 1000.0).round() as i64;
    if millis % 1000 == 0 {
        Quantity((millis / 1000).to_string())
    } else {
        Quantity(format!("{millis}m"))
    }
}

fn mebibytes(bytes: f64) -> Quantity {
    Quantity(format!("{}Mi", (bytes / MI).floor() as i64))
}

fn gibibytes(bytes: f64) -> Quantity {
    Quantity(format!("{}Gi", (bytes / GI).floor() as i64))
}

fn count(n: usize) -> Quantity {
    Quantity(n.to_string())
}

fn node_capacity<'a>(nodes: &'a [Node], resource: &'a str) -> impl Iterator<Item = &'a Quantity> {
    nodes
        .iter()
        .filter_map(move |n| n.status.as_ref()?.capacity.as_ref()?.get(resource))
}

fn pod_requests<'a>(pods: &'a [Pod], resource: &'a str) -> impl Iterator<Item = &'a Quantity> {
    pods.iter()
        .filter_map(|p| p.spec.as_ref())
        .flat_map(|spec| spec.containers.iter())
        .filter_map(move |c| c.resources.as_ref()?.requests.as_ref()?.get(resource))
}

fn pv_storage(pv: &PersistentVolume) -> Option<&Quantity> {
    pv.spec.as_ref()?.capacity.as_ref()?.get(RESOURCE_STORAGE)
}

/// cpu, memory (Mi), storage (Gi) and node count available in the cluster.
pub fn capacity(nodes: &[Node], pvs: &[PersistentVolume]) -> ResourceList {
    BTreeMap::from([
        (RESOURCE_CPU.to_string(), cpu(sum(node_capacity(nodes, RESOURCE_CPU)))),
        (RESOURCE_MEMORY.to_string(), mebibytes(sum(node_capacity(nodes, RESOURCE_MEMORY)))),
        (RESOURCE_STORAGE.to_string(), gibibytes(sum(pvs.iter().filter_map(pv_storage)))),
        (RESOURCE_NODES.to_string(), count(nodes.len())),
    ])
}

/// Requested cpu and memory, bound storage and pod count.
pub fn usage(pods: &[Pod], pvs: &[PersistentVolume]) -> ResourceList {
    let bound = pvs
        .iter()
        .filter(|pv| pv.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Bound"))
        .filter_map(pv_storage);
    BTreeMap::from([
        (RESOURCE_PODS.to_string(), count(pods.len())),
        (RESOURCE_CPU.to_string(), cpu(sum(pod_requests(pods, RESOURCE_CPU)))),
        (RESOURCE_MEMORY.to_string(), mebibytes(sum(pod_requests(pods, RESOURCE_MEMORY)))),
        (RESOURCE_STORAGE.to_string(), gibibytes(sum(bound))),
    ])
}

/// Values for the `cloud` and `vendor` cluster labels
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub cloud: String,
    pub vendor: String,
}

impl Platform {
    fn new(cloud: &str, vendor: &str) -> Self {
        Self {
            cloud: cloud.to_string(),
            vendor: vendor.to_string(),
        }
    }
}

/// Guess cloud and distribution from the server version and the first node.
pub fn detect_platform(git_version: &str, nodes: &[Node]) -> Platform {
    let version = git_version.to_uppercase();
    for (marker, cloud) in [("IKS", "IBM"), ("ICP", "IBM"), ("EKS", "Amazon"), ("GKE", "Google")] {
        if version.contains(marker) {
            return Platform::new(cloud, marker);
        }
    }

    let node = nodes.first();
    let openshift = node.is_some_and(|n| {
        n.metadata
            .labels
            .as_ref()
            .is_some_and(|l| l.contains_key("node.openshift.io/os_id"))
    });
    let vendor = if openshift { "OpenShift" } else { "Other" };

    let architecture = node
        .and_then(|n| n.status.as_ref()?.node_info.as_ref())
        .map(|i| i.architecture.as_str())
        .unwrap_or_default();
    let provider = node
        .and_then(|n| n.spec.as_ref()?.provider_id.as_deref())
        .unwrap_or_default();

    let cloud = match (architecture, provider) {
        ("s390x", _) => "IBMZPlatform",
        ("ppc64le", _) => "IBMPowerPlatform",
        (_, p) if p.starts_with("ibm") => "IBM",
        (_, p) if p.starts_with("azure") => {
            if !openshift {
                return Platform::new("Azure", "AKS");
            }
            "Azure"
        }
        (_, p) if p.starts_with("aws") => "Amazon",
        (_, p) if p.starts_with("gce") => "Google",
        (_, p) if p.starts_with("vsphere") => "VSphere",
        (_, p) if p.starts_with("openstack") => "OpenStack",
        _ => "Other",
    };
    Platform::new(cloud, vendor)
}

// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Registered sources, their discovery replicas, and the actions that
//! converge one onto the other.

use crate::constants::annotations::{OWNERS, SERVICE_DISCOVERY};
use crate::constants::labels::{AUTO_DISCOVERY, CLUSTER};
use k8s_openapi::api::core::v1::Endpoints;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

/// Payload of the service discovery annotation
#[derive(Debug, Default, Deserialize)]
pub struct ServiceDiscovery {
    #[serde(rename = "dns-prefix", default)]
    pub dns_prefix: String,
    #[serde(rename = "target-clusters", default)]
    pub target_clusters: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EndpointNode {
    /// A source endpoint to replicate to `targets`, or to every ready cluster when empty
    Registered { endpoints: Endpoints, targets: Vec<String> },
    /// A replica created by a previous sync
    Discovery { endpoints: Endpoints },
}

fn key_of(endpoints: &Endpoints) -> String {
    format!("{}/{}", endpoints.namespace().unwrap_or_default(), endpoints.name_any())
}

/// Classify an endpoint. Replicas take precedence over the annotation,
/// since they carry a copy of their source's annotations.
pub fn classify(endpoints: &Endpoints) -> Option<EndpointNode> {
    if endpoints.labels().contains_key(AUTO_DISCOVERY) {
        return Some(EndpointNode::Discovery {
            endpoints: endpoints.clone(),
        });
    }
    let raw = endpoints.annotations().get(SERVICE_DISCOVERY)?;
    match serde_json::from_str::<ServiceDiscovery>(raw) {
        Ok(discovery) => Some(EndpointNode::Registered {
            endpoints: endpoints.clone(),
            targets: discovery.target_clusters,
        }),
        Err(e) => {
            warn!("Endpoint {} has a bad service discovery annotation: {}", key_of(endpoints), e);
            None
        }
    }
}

/// Build the replica of `source` in the namespace of one target cluster.
pub fn replica_for(source: &Endpoints, namespace: &str) -> Endpoints {
    let source_cluster = source.labels().get(CLUSTER).cloned().unwrap_or_default();

    let mut labels: BTreeMap<String, String> = source
        .labels()
        .iter()
        .filter(|(k, _)| k.as_str() != CLUSTER)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    labels.insert(AUTO_DISCOVERY.to_string(), "true".to_string());

    let mut annotations = source.annotations().clone();
    annotations.insert(OWNERS.to_string(), key_of(source));

    Endpoints {
        metadata: ObjectMeta {
            name: Some(format!("{}.{}", source_cluster, source.name_any())),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        },
        subsets: source.subsets.clone(),
    }
}

/// Namespaces a source should be replicated into.
fn target_namespaces<'a>(targets: &[String], ready: &'a BTreeMap<String, String>) -> Vec<&'a String> {
    if targets.is_empty() {
        ready.values().collect()
    } else {
        targets.iter().filter_map(|t| ready.get(t)).collect()
    }
}

/// Actions of one sync tick
#[derive(Debug, Default)]
pub struct SyncPlan {
    pub create: Vec<Endpoints>,
    pub update: Vec<Endpoints>,
    pub delete: Vec<Endpoints>,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.update.is_empty() && self.delete.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct EndpointGraph {
    registered: HashMap<String, EndpointNode>,
    discovery: HashMap<String, EndpointNode>,
}

impl EndpointGraph {
    /// Record the current state of an endpoint. An endpoint that lost its
    /// annotation or label drops out of the graph.
    pub fn upsert(&mut self, endpoints: &Endpoints) {
        let key = key_of(endpoints);
        self.registered.remove(&key);
        self.discovery.remove(&key);
        match classify(endpoints) {
            Some(node @ EndpointNode::Registered { .. }) => {
                self.registered.insert(key, node);
            }
            Some(node @ EndpointNode::Discovery { .. }) => {
                self.discovery.insert(key, node);
            }
            None => {}
        }
    }

    pub fn remove(&mut self, endpoints: &Endpoints) {
        let key = key_of(endpoints);
        self.registered.remove(&key);
        self.discovery.remove(&key);
    }

    pub fn clear(&mut self) {
        self.registered.clear();
        self.discovery.clear();
    }

    pub fn counts(&self) -> (usize, usize) {
        (self.registered.len(), self.discovery.len())
    }

    /// Compute the actions that make replicas match their sources.
    ///
    /// `ready` maps each ready cluster name to its namespace. Replicas are
    /// deleted when their source is gone or no longer targets their
    /// namespace, including when that cluster is not ready.
    pub fn plan(&self, ready: &BTreeMap<String, String>) -> SyncPlan {
        let mut plan = SyncPlan::default();

        for node in self.registered.values() {
            let EndpointNode::Registered { endpoints, targets } = node else {
                continue;
            };
            for namespace in target_namespaces(targets, ready) {
                let replica = replica_for(endpoints, namespace);
                match self.discovery.get(&key_of(&replica)) {
                    Some(EndpointNode::Discovery { endpoints: existing }) => {
                        if existing.subsets != replica.subsets {
                            plan.update.push(replica);
                        }
                    }
                    _ => plan.create.push(replica),
                }
            }
        }

        for node in self.discovery.values() {
            let EndpointNode::Discovery { endpoints } = node else {
                continue;
            };
            let Some(owner) = endpoints.annotations().get(OWNERS) else {
                continue;
            };
            let wanted = match self.registered.get(owner) {
                Some(EndpointNode::Registered { targets, .. }) => {
                    let namespace = endpoints.namespace().unwrap_or_default();
                    target_namespaces(targets, ready).contains(&&namespace)
                }
                _ => false,
            };
            if !wanted {
                plan.delete.push(endpoints.clone());
            }
        }
        plan
    }
}

// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Live capacity/usage snapshot a klusterlet publishes for its cluster.

use k8s_openapi::api::core::v1::{EndpointAddress, EndpointPort};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::ByteString;
use kube::CustomResource;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const RESOURCE_CPU: &str = "cpu";
pub const RESOURCE_MEMORY: &str = "memory";
pub const RESOURCE_STORAGE: &str = "storage";
pub const RESOURCE_NODES: &str = "nodes";
pub const RESOURCE_PODS: &str = "pods";

/// Resource name to quantity, as in core `ResourceList`
pub type ResourceList = BTreeMap<String, Quantity>;

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[kube(group = "mcm.ibm.com", version = "v1beta1", kind = "ClusterStatus")]
#[kube(namespaced)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatusSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub master_addresses: Vec<EndpointAddress>,
    #[serde(rename = "consoleURL", default, skip_serializing_if = "String::is_empty")]
    pub console_url: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub capacity: ResourceList,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub usage: ResourceList,
    #[serde(default)]
    pub klusterlet_endpoint: EndpointAddress,
    #[serde(default)]
    pub klusterlet_port: EndpointPort,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub klusterlet_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    /// CA bundle the klusterlet HTTPS server trusts for client certificates
    #[serde(rename = "klusterletCA", default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "super::byte_string")]
    pub klusterlet_ca: Option<ByteString>,
}

// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Proof-of-identity a managed cluster files to obtain a client certificate.

use crate::constants::annotations;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::ByteString;
use kube::{CustomResource, ResourceExt};
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[kube(group = "mcm.ibm.com", version = "v1beta1", kind = "ClusterJoinRequest")]
#[kube(status = "ClusterJoinRequestStatus")]
#[serde(rename_all = "camelCase")]
pub struct ClusterJoinRequestSpec {
    pub cluster_name: String,
    pub cluster_namespace: String,
    /// PEM encoded PKCS#10 request
    #[schemars(schema_with = "super::byte_string")]
    pub request: ByteString,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, schemars::JsonSchema)]
pub enum JoinPhase {
    #[default]
    Pending,
    Approved,
    Denied,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterJoinRequestStatus {
    #[serde(default)]
    pub phase: JoinPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "super::byte_string")]
    pub certificate: Option<ByteString>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<JoinCondition>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct JoinCondition {
    #[serde(rename = "type")]
    pub condition_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<Time>,
}

impl ClusterJoinRequest {
    pub fn phase(&self) -> JoinPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Signed certificate, once one has been issued
    pub fn certificate(&self) -> Option<&[u8]> {
        self.status
            .as_ref()
            .and_then(|s| s.certificate.as_ref())
            .map(|c| c.0.as_slice())
            .filter(|c| !c.is_empty())
    }

    pub fn is_renewal(&self) -> bool {
        self.annotations()
            .get(annotations::RENEWAL)
            .is_some_and(|v| v == "true")
    }

    /// True when this request was filed by the given cluster
    pub fn is_for(&self, cluster_namespace: &str, cluster_name: &str) -> bool {
        self.spec.cluster_namespace == cluster_namespace && self.spec.cluster_name == cluster_name
    }
}

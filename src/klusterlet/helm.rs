// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Read-only view of Helm v3 releases, as stored in release secrets.

use crate::constants::labels::{HELM_NAME, HELM_OWNER};
use crate::error::{McmError, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use k8s_openapi::api::core::v1::Secret;
use kube::api::ListParams;
use kube::{Api, Client, ResourceExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::io::Read;
use tracing::{debug, instrument, warn};

const RELEASE_KEY: &str = "release";
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// What a release query selects
#[derive(Debug, Clone, Default)]
pub struct ReleaseFilter {
    /// Release name prefix
    pub name: String,
    pub namespace: String,
    /// Extra label selector on the release secrets, e.g. `status in (deployed,failed)`
    pub selector: Option<String>,
}

/// Summary of the newest revision of one release
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HelmRelease {
    pub name: String,
    pub namespace: String,
    pub status: String,
    pub revision: i64,
    pub chart_name: String,
    pub chart_version: String,
    pub first_deployed: Option<DateTime<Utc>>,
    pub last_deployed: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct ReleaseRecord {
    name: String,
    #[serde(default)]
    namespace: String,
    #[serde(default)]
    version: i64,
    #[serde(default)]
    info: ReleaseInfo,
    #[serde(default)]
    chart: ChartRecord,
}

#[derive(Deserialize, Default)]
struct ReleaseInfo {
    #[serde(default)]
    status: String,
    first_deployed: Option<DateTime<Utc>>,
    last_deployed: Option<DateTime<Utc>>,
}

#[derive(Deserialize, Default)]
struct ChartRecord {
    #[serde(default)]
    metadata: ChartMetadata,
}

#[derive(Deserialize, Default)]
struct ChartMetadata {
    #[serde(default)]
    name: String,
    #[serde(default)]
    version: String,
}

/// Decode the `release` payload of a release secret: base64, optionally gzip, then JSON.
pub fn decode_release(raw: &[u8]) -> Result<HelmRelease> {
    let decoded = STANDARD
        .decode(raw)
        .map_err(|e| McmError::Validation(format!("release is not base64: {e}")))?;
    let json = if decoded.starts_with(&GZIP_MAGIC) {
        let mut out = Vec::new();
        GzDecoder::new(decoded.as_slice()).read_to_end(&mut out)?;
        out
    } else {
        decoded
    };
    let record: ReleaseRecord = serde_json::from_slice(&json)?;
    Ok(HelmRelease {
        name: record.name,
        namespace: record.namespace,
        status: record.info.status,
        revision: record.version,
        chart_name: record.chart.metadata.name,
        chart_version: record.chart.metadata.version,
        first_deployed: record.info.first_deployed,
        last_deployed: record.info.last_deployed,
    })
}

/// Keep the highest revision per release, ordered by namespace and name.
fn newest_revisions(releases: Vec<HelmRelease>) -> Vec<HelmRelease> {
    let mut newest: BTreeMap<(String, String), HelmRelease> = BTreeMap::new();
    for release in releases {
        let key = (release.namespace.clone(), release.name.clone());
        match newest.get(&key) {
            Some(existing) if existing.revision >= release.revision => {}
            _ => {
                newest.insert(key, release);
            }
        }
    }
    newest.into_values().collect()
}

pub struct ReleaseLister {
    client: Client,
}

impl ReleaseLister {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    #[instrument(skip(self))]
    pub async fn list(&self, filter: &ReleaseFilter) -> Result<Vec<HelmRelease>> {
        let secrets: Api<Secret> = if filter.namespace.is_empty() {
            Api::all(self.client.clone())
        } else {
            Api::namespaced(self.client.clone(), &filter.namespace)
        };
        let mut selector = format!("{HELM_OWNER}=helm");
        if let Some(extra) = filter.selector.as_deref().filter(|s| !s.is_empty()) {
            selector.push(',');
            selector.push_str(extra);
        }

        let mut releases = Vec::new();
        for secret in secrets.list(&ListParams::default().labels(&selector)).await? {
            let name = secret.labels().get(HELM_NAME).cloned().unwrap_or_default();
            if !name.starts_with(&filter.name) {
                continue;
            }
            let Some(raw) = secret.data.as_ref().and_then(|d| d.get(RELEASE_KEY)) else {
                debug!("Secret {} has no release payload", secret.name_any());
                continue;
            };
            match decode_release(&raw.0) {
                Ok(release) => releases.push(release),
                Err(e) => warn!("Skipping undecodable release secret {}: {}", secret.name_any(), e),
            }
        }
        Ok(newest_revisions(releases))
    }
}

/// `HelmReleaseList` JSON, or a `meta.k8s.io/v1` Table when `table` is set.
pub fn render(releases: &[HelmRelease], table: bool, now: DateTime<Utc>) -> Value {
    if !table {
        return json!({
            "apiVersion": "mcm.ibm.com/v1beta1",
            "kind": "HelmReleaseList",
            "items": releases,
        });
    }
    let columns: Vec<Value> = [
        "Name",
        "Namespace",
        "Status",
        "Revision",
        "Version",
        "Chart",
        "LastDeployed",
        "FirstDeployed",
    ]
    .iter()
    .map(|name| json!({"name": name, "type": "string"}))
    .collect();
    let rows: Vec<Value> = releases
        .iter()
        .map(|r| {
            json!({
                "cells": [
                    r.name,
                    r.namespace,
                    r.status,
                    r.revision.to_string(),
                    r.chart_version,
                    r.chart_name,
                    age(r.last_deployed, now),
                    age(r.first_deployed, now),
                ],
            })
        })
        .collect();
    json!({
        "apiVersion": "meta.k8s.io/v1",
        "kind": "Table",
        "columnDefinitions": columns,
        "rows": rows,
    })
}

/// Short human duration since `at`, like `5m` or `3d`.
fn age(at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    let Some(at) = at else {
        return "<unknown>".to_string();
    };
    let secs = (now - at).num_seconds().max(0);
    match secs {
        s if s < 120 => format!("{s}s"),
        s if s < 60 * 60 * 2 => format!("{}m", s / 60),
        s if s < 60 * 60 * 48 => format!("{}h", s / 3600),
        s if s < 60 * 60 * 24 * 365 * 2 => format!("{}d", s / 86400),
        s => format!("{}y", s / (86400 * 365)),
    }
}

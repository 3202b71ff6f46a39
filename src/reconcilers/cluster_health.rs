// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Cluster health monitor - marks clusters offline when their klusterlet
//! stops reporting.

use crate::constants::HEARTBEAT_MISSED_REASON;
use crate::error::Result;
use crate::types::cluster::Cluster;
use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{ListParams, Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

pub struct ClusterHealthMonitor {
    client: Client,
    period: Duration,
}

/// A Ready cluster whose newest heartbeat is older than `period`.
pub fn heartbeat_missed(cluster: &Cluster, period: Duration, now: DateTime<Utc>) -> bool {
    if !cluster.is_ready() {
        return false;
    }
    let Some(last) = cluster.last_heartbeat() else {
        return true;
    };
    match chrono::Duration::from_std(period) {
        Ok(period) => now > last + period,
        Err(_) => false,
    }
}

impl ClusterHealthMonitor {
    pub fn new(client: Client, period: Duration) -> Self {
        Self { client, period }
    }

    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(self.period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Cluster health monitor stopped");
                    return Ok(());
                }
                _ = interval.tick() => {
                    if let Err(e) = self.check(Utc::now()).await {
                        error!("Cluster health check failed: {}", e);
                    }
                }
            }
        }
    }

    /// One pass over all clusters. Returns how many were marked offline.
    #[instrument(skip(self))]
    pub async fn check(&self, now: DateTime<Utc>) -> Result<usize> {
        let clusters: Api<Cluster> = Api::all(self.client.clone());
        let mut offline = 0;
        for cluster in clusters.list(&ListParams::default()).await? {
            if !heartbeat_missed(&cluster, self.period, now) {
                continue;
            }
            match self.mark_offline(&cluster, now).await {
                Ok(()) => {
                    warn!("Cluster {} missed its heartbeat", cluster.key());
                    offline += 1;
                }
                Err(e) => error!("Failed to update status of cluster {}: {}", cluster.key(), e),
            }
        }
        debug!("Health check marked {} clusters offline", offline);
        Ok(offline)
    }

    async fn mark_offline(&self, cluster: &Cluster, now: DateTime<Utc>) -> Result<()> {
        let mut conditions = cluster
            .status
            .as_ref()
            .map(|s| s.conditions.clone())
            .unwrap_or_default();
        if let Some(latest) = conditions.last_mut() {
            latest.condition_type = String::new();
            latest.last_transition_time = Some(Time(now));
            latest.reason = Some(HEARTBEAT_MISSED_REASON.to_string());
        }

        let api: Api<Cluster> = Api::namespaced(self.client.clone(), &cluster.namespace().unwrap_or_default());
        let patch = json!({
            "metadata": {"resourceVersion": cluster.resource_version()},
            "status": {"conditions": conditions},
        });
        api.patch_status(&cluster.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

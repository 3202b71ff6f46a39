// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Cluster reconciler - removes the join requests of deleted clusters.

use crate::error::{is_not_found, Result};
use crate::types::cluster::Cluster;
use crate::types::join_request::ClusterJoinRequest;
use futures::{pin_mut, TryStreamExt};
use kube::api::{DeleteParams, ListParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

pub struct ClusterReconciler {
    client: Client,
}

impl ClusterReconciler {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        let clusters: Api<Cluster> = Api::all(self.client.clone());
        let events = watcher(clusters, watcher::Config::default()).default_backoff();
        pin_mut!(events);

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = events.try_next() => next,
            };
            match next {
                Ok(Some(watcher::Event::Delete(cluster))) => {
                    if let Err(e) = self.cluster_deleted(&cluster).await {
                        error!("Failed to clean up after cluster {}: {}", cluster.key(), e);
                    }
                }
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(e) => warn!("Cluster watch failed: {}", e),
            }
        }
        Ok(())
    }

    /// Delete every join request filed for the deleted cluster.
    #[instrument(skip(self, cluster), fields(cluster = %cluster.key()))]
    pub async fn cluster_deleted(&self, cluster: &Cluster) -> Result<usize> {
        let namespace = cluster.namespace().unwrap_or_default();
        let name = cluster.name_any();

        let requests: Api<ClusterJoinRequest> = Api::all(self.client.clone());
        let mut deleted = 0;
        for request in requests.list(&ListParams::default()).await? {
            if !request.is_for(&namespace, &name) {
                continue;
            }
            match requests.delete(&request.name_any(), &DeleteParams::background()).await {
                Ok(_) => {
                    info!("Deleted join request {}", request.name_any());
                    deleted += 1;
                }
                Err(e) if is_not_found(&e) => debug!("Join request {} already gone", request.name_any()),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(deleted)
    }
}

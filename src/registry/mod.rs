// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Service registry: replicates annotated endpoints into the namespaces of
//! their target clusters.

pub mod graph;

use crate::config::RegistryConfig;
use crate::error::Result;
use crate::kubernetes::{spawn_reflector, wait_synced};
use crate::types::cluster::Cluster;
use futures::future::join_all;
use futures::StreamExt;
use graph::{EndpointGraph, SyncPlan};
use k8s_openapi::api::core::v1::Endpoints;
use kube::api::{DeleteParams, Patch, PatchParams, PostParams};
use kube::runtime::reflector::Store;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub struct ServiceRegistry {
    client: Client,
    config: RegistryConfig,
    graph: Arc<Mutex<EndpointGraph>>,
}

/// Ready cluster name to namespace
pub fn ready_clusters<'a>(clusters: impl IntoIterator<Item = &'a Cluster>) -> BTreeMap<String, String> {
    clusters
        .into_iter()
        .filter(|c| c.is_ready())
        .map(|c| (c.name_any(), c.namespace().unwrap_or_default()))
        .collect()
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub failed: usize,
}

impl ServiceRegistry {
    pub fn new(client: Client, config: RegistryConfig) -> Self {
        Self {
            client,
            config,
            graph: Arc::new(Mutex::new(EndpointGraph::default())),
        }
    }

    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        info!("Service registry started in cluster {}", self.config.cluster_name);
        let clusters: Store<Cluster> =
            spawn_reflector(Api::all(self.client.clone()), watcher::Config::default(), cancel.clone());
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            synced = wait_synced(&clusters) => synced?,
        }

        let graph = self.graph.clone();
        let events = watcher(Api::<Endpoints>::all(self.client.clone()), watcher::Config::default())
            .default_backoff()
            .for_each(move |event| {
                let graph = graph.clone();
                async move {
                    let mut graph = graph.lock().await;
                    match event {
                        Ok(watcher::Event::Apply(ep)) | Ok(watcher::Event::InitApply(ep)) => graph.upsert(&ep),
                        Ok(watcher::Event::Delete(ep)) => graph.remove(&ep),
                        Ok(watcher::Event::Init) => graph.clear(),
                        Ok(watcher::Event::InitDone) => {
                            let (registered, discovery) = graph.counts();
                            info!("Endpoints listed: {} registered, {} replicas", registered, discovery);
                        }
                        Err(e) => warn!("Endpoints watch error: {}", e),
                    }
                }
            });
        tokio::pin!(events);

        let mut interval = tokio::time::interval(self.config.sync_period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Service registry stopped");
                    return Ok(());
                }
                _ = &mut events => anyhow::bail!("endpoints watch ended"),
                _ = interval.tick() => {
                    let ready = ready_clusters(clusters.state().iter().map(|c| c.as_ref()));
                    self.sync_once(&ready).await;
                }
            }
        }
    }

    /// Plan under the graph lock, then run every action concurrently and
    /// wait for all of them before returning.
    #[instrument(skip_all)]
    pub async fn sync_once(&self, ready: &BTreeMap<String, String>) -> SyncOutcome {
        let plan = self.graph.lock().await.plan(ready);
        if plan.is_empty() {
            return SyncOutcome::default();
        }
        let SyncPlan { create, update, delete } = plan;
        debug!(
            "Syncing replicas: {} to create, {} to update, {} to delete",
            create.len(),
            update.len(),
            delete.len()
        );

        let (created, updated, deleted) = futures::join!(
            join_all(create.iter().map(|ep| self.create(ep))),
            join_all(update.iter().map(|ep| self.update(ep))),
            join_all(delete.iter().map(|ep| self.delete(ep))),
        );

        let mut outcome = SyncOutcome::default();
        for (results, count) in [
            (created, &mut outcome.created),
            (updated, &mut outcome.updated),
            (deleted, &mut outcome.deleted),
        ] {
            for result in results {
                match result {
                    Ok(()) => *count += 1,
                    Err(e) => {
                        warn!("Replica sync failed: {}", e);
                        outcome.failed += 1;
                    }
                }
            }
        }
        outcome
    }

    fn api(&self, ep: &Endpoints) -> Api<Endpoints> {
        Api::namespaced(self.client.clone(), &ep.namespace().unwrap_or_default())
    }

    async fn create(&self, ep: &Endpoints) -> Result<()> {
        match self.api(ep).create(&PostParams::default(), ep).await {
            Ok(_) => Ok(()),
            // The watch has not delivered the replica yet
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, ep: &Endpoints) -> Result<()> {
        let patch = json!({"subsets": ep.subsets});
        self.api(ep)
            .patch(&ep.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn delete(&self, ep: &Endpoints) -> Result<()> {
        match self.api(ep).delete(&ep.name_any(), &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

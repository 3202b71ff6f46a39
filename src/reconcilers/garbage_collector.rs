// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Garbage collector - deletes dispatched Works whose owners are gone and
//! expires finished WorkSets and one-shot ResourceViews.

use crate::constants::annotations::OWNERS;
use crate::dispatch::{parse_owners, OwnerRef};
use crate::error::{is_not_found, Result};
use crate::types::cluster::Cluster;
use crate::types::resource_view::ResourceView;
use crate::types::work::Work;
use crate::types::workset::WorkSet;
use chrono::{DateTime, Utc};
use kube::api::{DeleteParams, ListParams};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

pub struct GarbageCollector {
    client: Client,
    period: Duration,
}

impl GarbageCollector {
    pub fn new(client: Client, period: Duration) -> Self {
        Self { client, period }
    }

    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(self.period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Garbage collector stopped");
                    return Ok(());
                }
                _ = interval.tick() => {
                    if let Err(e) = self.collect_orphans().await {
                        error!("Failed to collect orphaned works: {}", e);
                    }
                    if let Err(e) = self.expire(Utc::now()).await {
                        error!("Failed to expire finished objects: {}", e);
                    }
                }
            }
        }
    }

    /// Delete every Work with an owner that no longer exists. Returns the number deleted.
    #[instrument(skip(self))]
    pub async fn collect_orphans(&self) -> Result<usize> {
        let works: Api<Work> = Api::all(self.client.clone());
        let mut deleted = 0;
        for work in works.list(&ListParams::default()).await? {
            let Some(owners) = work.annotations().get(OWNERS) else {
                continue;
            };
            let mut orphaned = false;
            for owner in parse_owners(owners) {
                if self.owner_missing(&owner).await? {
                    orphaned = true;
                    break;
                }
            }
            if !orphaned {
                continue;
            }

            let namespace = work.namespace().unwrap_or_default();
            let api: Api<Work> = Api::namespaced(self.client.clone(), &namespace);
            match api.delete(&work.name_any(), &DeleteParams::background()).await {
                Ok(_) => {
                    info!("Deleted orphaned work {}/{}", namespace, work.name_any());
                    deleted += 1;
                }
                Err(e) if is_not_found(&e) => {}
                Err(e) => error!("Failed to delete work {}/{}: {}", namespace, work.name_any(), e),
            }
        }
        Ok(deleted)
    }

    async fn owner_missing(&self, owner: &OwnerRef) -> Result<bool> {
        match owner.resource.as_str() {
            "clusters" => self.missing::<Cluster>(owner).await,
            "worksets" => self.missing::<WorkSet>(owner).await,
            "resourceviews" => self.missing::<ResourceView>(owner).await,
            other => {
                debug!("Ignoring owner of unknown resource {}", other);
                Ok(false)
            }
        }
    }

    async fn missing<K>(&self, owner: &OwnerRef) -> Result<bool>
    where
        K: Resource<Scope = kube::core::NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        K::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), &owner.namespace);
        Ok(api.get_opt(&owner.name).await?.is_none())
    }

    /// Delete WorkSets and one-shot ResourceViews older than one period.
    #[instrument(skip(self))]
    pub async fn expire(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut deleted = 0;

        let worksets: Api<WorkSet> = Api::all(self.client.clone());
        for workset in worksets.list(&ListParams::default()).await? {
            if self.expired(&workset, now) && self.delete_expired(&workset).await {
                deleted += 1;
            }
        }

        let views: Api<ResourceView> = Api::all(self.client.clone());
        for view in views.list(&ListParams::default()).await? {
            if view.spec.is_periodic() {
                continue;
            }
            if self.expired(&view, now) && self.delete_expired(&view).await {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    fn expired<K: Resource>(&self, obj: &K, now: DateTime<Utc>) -> bool {
        let Some(created) = obj.meta().creation_timestamp.as_ref() else {
            return false;
        };
        let Ok(period) = chrono::Duration::from_std(self.period) else {
            return false;
        };
        created.0 + period <= now
    }

    async fn delete_expired<K>(&self, obj: &K) -> bool
    where
        K: Resource<Scope = kube::core::NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        K::DynamicType: Default,
    {
        let namespace = obj.namespace().unwrap_or_default();
        let api: Api<K> = Api::namespaced(self.client.clone(), &namespace);
        match api.delete(&obj.name_any(), &DeleteParams::background()).await {
            Ok(_) => {
                info!("Deleted expired {} {}/{}", K::kind(&K::DynamicType::default()), namespace, obj.name_any());
                true
            }
            Err(e) if is_not_found(&e) => false,
            Err(e) => {
                error!("Failed to delete {}/{}: {}", namespace, obj.name_any(), e);
                false
            }
        }
    }
}

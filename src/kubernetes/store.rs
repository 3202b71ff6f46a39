// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Watch-backed local mirrors of API objects.

use crate::error::{McmError, Result};
use futures::StreamExt;
use kube::runtime::reflector::{self, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Resource};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::hash::Hash;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Start a reflector for `api` and return its reader.
///
/// The mirror lives until `cancel` fires. Call [`wait_synced`] before
/// trusting the reader's contents.
pub fn spawn_reflector<K>(api: Api<K>, config: watcher::Config, cancel: CancellationToken) -> Store<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone + Send + Sync,
{
    let (reader, writer) = reflector::store();
    let stream = reflector::reflector(writer, watcher(api, config))
        .default_backoff()
        .applied_objects();

    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => debug!("Reflector for {} stopped", std::any::type_name::<K>()),
            _ = stream.for_each(|_| futures::future::ready(())) => {},
        }
    });
    reader
}

/// Block until the mirror has completed its initial list.
pub async fn wait_synced<K>(store: &Store<K>) -> Result<()>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    store.wait_until_ready().await.map_err(|_| {
        McmError::NotFound(format!(
            "cache for {} stopped before syncing",
            std::any::type_name::<K>()
        ))
    })?;
    info!("Cache for {} synced", short_type_name::<K>());
    Ok(())
}

fn short_type_name<K>() -> &'static str {
    let full = std::any::type_name::<K>();
    full.rsplit("::").next().unwrap_or(full)
}

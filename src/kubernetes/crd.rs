// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! CRD availability checking utilities

use crate::constants::crd::{POLL_INTERVAL_SECS, POLL_MAX_INTERVAL_SECS};
use crate::error::Result;
use kube::{discovery::Discovery, Client, Resource};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Group, version and kind of a resource a component cannot start without
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequiredKind {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl RequiredKind {
    pub fn of<K: Resource<DynamicType = ()>>() -> Self {
        Self {
            group: K::group(&()).to_string(),
            version: K::version(&()).to_string(),
            kind: K::kind(&()).to_string(),
        }
    }
}

impl std::fmt::Display for RequiredKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}/{})", self.kind, self.group, self.version)
    }
}

/// Wait until every kind in `required` is served by the API server.
/// This uses exponential backoff starting at POLL_INTERVAL_SECS seconds.
pub async fn wait_for_crds(client: &Client, required: &[RequiredKind]) -> Result<()> {
    let mut interval = POLL_INTERVAL_SECS;

    loop {
        match missing_kinds(client, required).await {
            Ok(missing) if missing.is_empty() => {
                info!("All {} required resource kinds are available", required.len());
                return Ok(());
            }
            Ok(missing) => {
                let names: Vec<String> = missing.iter().map(ToString::to_string).collect();
                info!(
                    "Waiting for {} to become available, retrying in {} seconds...",
                    names.join(", "),
                    interval
                );
            }
            Err(e) => {
                warn!(
                    "Error checking for CRDs: {}, retrying in {} seconds...",
                    e, interval
                );
            }
        }

        sleep(Duration::from_secs(interval)).await;

        interval = (interval * 2).min(POLL_MAX_INTERVAL_SECS);
    }
}

async fn missing_kinds<'a>(
    client: &Client,
    required: &'a [RequiredKind],
) -> Result<Vec<&'a RequiredKind>> {
    let mut groups: Vec<&str> = required.iter().map(|r| r.group.as_str()).collect();
    groups.sort_unstable();
    groups.dedup();

    let discovery = Discovery::new(client.clone()).filter(&groups).run().await?;

    Ok(required
        .iter()
        .filter(|req| {
            !discovery.groups().any(|group| {
                group.name() == req.group
                    && group.versions().any(|v| {
                        group
                            .versioned_resources(v)
                            .iter()
                            .any(|(ar, _)| ar.kind == req.kind && ar.version == req.version)
                    })
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::work::Work;

    #[test]
    fn test_required_kind_of() {
        let kind = RequiredKind::of::<Work>();
        assert_eq!(kind.group, "mcm.ibm.com");
        assert_eq!(kind.version, "v1beta1");
        assert_eq!(kind.kind, "Work");
        assert_eq!(kind.to_string(), "Work (mcm.ibm.com/v1beta1)");
    }
}

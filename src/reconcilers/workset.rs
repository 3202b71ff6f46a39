// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! WorkSet dispatcher - fans a Work template out to every healthy cluster
//! the WorkSet selects and rolls the children's outcome up into its status.

use crate::config::HubConfig;
use crate::constants::annotations::OWNERS;
use crate::constants::labels::WORKSET;
use crate::dispatch::{self, ClusterAuthorizer};
use crate::error::{McmError, Result};
use crate::kubernetes::dynamic::identity_from_annotations;
use crate::kubernetes::{retry_on_conflict, selector};
use crate::types::cluster::Cluster;
use crate::types::work::{parse_owner_label, ClusterReference, Work, WorkSpec, WorkStatusType};
use crate::types::workset::{WorkSet, WorkSetStatus};
use futures::StreamExt;
use kube::api::{ListParams, ObjectMeta, Patch, PatchParams};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::{controller, controller::Action, watcher, Controller};
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

pub struct WorkSetReconciler {
    client: Client,
    authorizer: Option<ClusterAuthorizer>,
    concurrency: u16,
}

/// `<ns>.<name>`, the label value children point back with
pub fn owner_label(workset: &WorkSet) -> String {
    format!("{}.{}", workset.namespace().unwrap_or_default(), workset.name_any())
}

/// The child Work a WorkSet wants in `cluster`
pub fn child_work(workset: &WorkSet, spec: &WorkSpec, cluster: &Cluster) -> Work {
    let namespace = workset.namespace().unwrap_or_default();
    let name = workset.name_any();
    let cluster_namespace = cluster.namespace().unwrap_or_default();
    let cluster_name = cluster.name_any();

    Work {
        metadata: ObjectMeta {
            generate_name: Some(format!("{name}-{cluster_name}-")),
            namespace: Some(cluster_namespace.clone()),
            labels: Some([(WORKSET.to_string(), owner_label(workset))].into()),
            annotations: Some(
                [(
                    OWNERS.to_string(),
                    dispatch::owners_annotation(&[
                        ("clusters", &cluster_namespace, &cluster_name),
                        ("worksets", &namespace, &name),
                    ]),
                )]
                .into(),
            ),
            ..Default::default()
        },
        spec: WorkSpec {
            cluster: ClusterReference { name: cluster_name },
            ..spec.clone()
        },
        status: None,
    }
}

/// The existing child rewritten to `spec`, or None when it already matches.
fn rewrite(work: &Work, spec: &WorkSpec) -> Option<Work> {
    if work.spec.same_payload(spec) {
        return None;
    }
    let mut updated = work.clone();
    updated.spec = WorkSpec {
        cluster: work.spec.cluster.clone(),
        ..spec.clone()
    };
    Some(updated)
}

fn workset_for(work: Work) -> Option<ObjectRef<WorkSet>> {
    let label = work.labels().get(WORKSET)?;
    let Some((namespace, name)) = parse_owner_label(label) else {
        debug!("Ignoring work {} with malformed label '{}'", work.name_any(), label);
        return None;
    };
    Some(ObjectRef::new(name).within(namespace))
}

/// Cluster changes can move children of completed WorkSets too.
fn all_worksets(store: &Store<WorkSet>) -> Vec<ObjectRef<WorkSet>> {
    store.state().iter().map(|ws| ObjectRef::from_obj(&**ws)).collect()
}

impl WorkSetReconciler {
    pub fn new(client: Client, config: &HubConfig) -> Self {
        let authorizer = config
            .enable_rbac_filter
            .then(|| ClusterAuthorizer::new(client.clone()));
        Self {
            client,
            authorizer,
            concurrency: config.worker_count,
        }
    }

    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        let worksets: Api<WorkSet> = Api::all(self.client.clone());
        let works: Api<Work> = Api::all(self.client.clone());
        let clusters: Api<Cluster> = Api::all(self.client.clone());
        let context = Arc::new(self);

        let controller = Controller::new(worksets, watcher::Config::default());
        let store = controller.store();
        let controller = controller
            .watches(works, watcher::Config::default().labels(WORKSET), workset_for)
            .watches(clusters, watcher::Config::default(), move |_| all_worksets(&store))
            .with_config(controller::Config::default().concurrency(context.concurrency))
            .run(reconcile, error_policy, context.clone())
            .for_each(|res| async move {
                match res {
                    Ok(o) => debug!("Reconciled workset: {:?}", o),
                    Err(e) => warn!("Reconciliation error: {:?}", e),
                }
            });

        tokio::select! {
            _ = controller => {},
            _ = cancel.cancelled() => info!("WorkSet controller stopped"),
        }
        Ok(())
    }

    async fn selected_clusters(&self, workset: &WorkSet) -> Result<Vec<Cluster>> {
        let clusters: Api<Cluster> = Api::all(self.client.clone());
        let all = clusters.list(&ListParams::default()).await?.items;
        let healthy = dispatch::healthy_clusters(&all, workset.spec.cluster_selector.as_ref());
        Ok(match &self.authorizer {
            Some(authorizer) => {
                let identity = identity_from_annotations(workset.annotations());
                authorizer.filter(identity.as_ref(), healthy).await
            }
            None => healthy,
        })
    }

    async fn children(&self, workset: &WorkSet) -> Result<Vec<Work>> {
        let works: Api<Work> = Api::all(self.client.clone());
        let lp = ListParams::default().labels(&selector::equals(WORKSET, &owner_label(workset)));
        Ok(works.list(&lp).await?.items)
    }

    /// Write the rolled up status, re-reading the WorkSet on conflicts.
    async fn set_status(&self, workset: &WorkSet, status: WorkSetStatus) -> Result<()> {
        let api: Api<WorkSet> =
            Api::namespaced(self.client.clone(), &workset.namespace().unwrap_or_default());
        let name = workset.name_any();
        retry_on_conflict("workset status", || {
            let api = api.clone();
            let name = name.clone();
            let status = status.clone();
            async move {
                let latest = api.get(&name).await?;
                if latest.is_completed() {
                    return Ok(());
                }
                let patch = json!({
                    "metadata": {"resourceVersion": latest.resource_version()},
                    "status": status,
                });
                api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
                Ok(())
            }
        })
        .await
    }
}

#[instrument(skip(workset, ctx), fields(workset = %owner_label(&workset)))]
async fn reconcile(workset: Arc<WorkSet>, ctx: Arc<WorkSetReconciler>) -> Result<Action> {
    let spec = match WorkSpec::try_from(workset.spec.template.spec.clone()) {
        Ok(spec) => spec,
        Err(e) => {
            warn!("Invalid work template: {}", e);
            let status = WorkSetStatus {
                status: Some(WorkStatusType::Failed),
                reason: e.to_string(),
            };
            ctx.set_status(&workset, status).await?;
            return Ok(Action::await_change());
        }
    };

    let clusters = ctx.selected_clusters(&workset).await?;
    let index = dispatch::index_by_cluster(ctx.children(&workset).await?);
    let plan = dispatch::plan(&clusters, &index, |w| rewrite(w, &spec));

    if !plan.is_empty() {
        info!(
            create = plan.missing.len(),
            update = plan.drifted.len(),
            delete = plan.stale.len(),
            "Dispatching works"
        );
        let build = |cluster: &Cluster| child_work(&workset, &spec, cluster);
        let failed = dispatch::execute(&ctx.client, plan, build, usize::from(ctx.concurrency)).await;
        if failed > 0 {
            return Err(McmError::DriverError(format!("{failed} work changes failed")));
        }
        // Children report back through their own events
        return Ok(Action::await_change());
    }

    // A completed status is final
    if workset.is_completed() {
        return Ok(Action::await_change());
    }
    let progress = dispatch::progress(&clusters, &index);
    if progress.finished >= clusters.len() {
        let status = WorkSetStatus {
            status: Some(WorkStatusType::Completed),
            reason: progress.failures,
        };
        ctx.set_status(&workset, status).await?;
        info!("WorkSet completed on {} clusters", clusters.len());
    }
    Ok(Action::await_change())
}

fn error_policy(_workset: Arc<WorkSet>, error: &McmError, _ctx: Arc<WorkSetReconciler>) -> Action {
    error!("Reconciliation error: {}", error);
    Action::requeue(Duration::from_secs(60))
}

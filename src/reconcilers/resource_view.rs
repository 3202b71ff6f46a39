// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! ResourceView dispatcher - turns a view into one query Work per cluster.

use crate::config::HubConfig;
use crate::constants::annotations::OWNERS;
use crate::constants::labels::VIEW;
use crate::dispatch::{self, ClusterAuthorizer};
use crate::error::{McmError, Result};
use crate::kubernetes::dynamic::identity_from_annotations;
use crate::kubernetes::{retry_on_conflict, selector};
use crate::types::cluster::Cluster;
use crate::types::resource_view::{push_condition, ResourceView, ViewCondition};
use crate::types::work::{
    parse_owner_label, ClusterReference, Work, WorkSpec, WorkStatusType, WorkType,
};
use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{ListParams, ObjectMeta, Patch, PatchParams};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::{controller, controller::Action, watcher, Controller};
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

pub struct ResourceViewReconciler {
    client: Client,
    authorizer: Option<ClusterAuthorizer>,
    concurrency: u16,
}

pub fn owner_label(view: &ResourceView) -> String {
    format!("{}.{}", view.namespace().unwrap_or_default(), view.name_any())
}

pub fn child_work(view: &ResourceView, cluster: &Cluster) -> Work {
    let namespace = view.namespace().unwrap_or_default();
    let name = view.name_any();
    let cluster_namespace = cluster.namespace().unwrap_or_default();
    let cluster_name = cluster.name_any();

    Work {
        metadata: ObjectMeta {
            generate_name: Some(format!("view-{name}-")),
            namespace: Some(cluster_namespace.clone()),
            labels: Some([(VIEW.to_string(), owner_label(view))].into()),
            annotations: Some(
                [(
                    OWNERS.to_string(),
                    dispatch::owners_annotation(&[
                        ("clusters", &cluster_namespace, &cluster_name),
                        ("resourceviews", &namespace, &name),
                    ]),
                )]
                .into(),
            ),
            ..Default::default()
        },
        spec: WorkSpec {
            cluster: ClusterReference { name: cluster_name },
            work_type: WorkType::Resource,
            scope: view.spec.work_scope(),
            ..Default::default()
        },
        status: None,
    }
}

/// Bring a child's scope in line with the view. None when nothing differs.
fn rewrite(work: &Work, view: &ResourceView) -> Option<Work> {
    let want = view.spec.work_scope();
    let have = &work.spec.scope;
    let same = have.mode == want.mode
        && have.server_print == want.server_print
        && have.update_interval_seconds == want.update_interval_seconds
        && have.field_selector == want.field_selector
        && have.label_selector == want.label_selector
        && have.resource_type == want.resource_type
        && have.namespace == want.namespace
        && have.name == want.name;
    if same {
        return None;
    }

    let mut updated = work.clone();
    let scope = &mut updated.spec.scope;
    scope.mode = want.mode;
    scope.server_print = want.server_print;
    scope.update_interval_seconds = want.update_interval_seconds;
    scope.field_selector = want.field_selector;
    scope.label_selector = want.label_selector;
    scope.resource_type = want.resource_type;
    scope.namespace = want.namespace;
    scope.name = want.name;
    Some(updated)
}

/// Query Works report back to their view on status transitions only.
fn view_for(work: Work) -> Option<ObjectRef<ResourceView>> {
    if work.spec.work_type != WorkType::Resource {
        return None;
    }
    if work.status_type().is_none() {
        return None;
    }
    let label = work.labels().get(VIEW)?;
    let (namespace, name) = parse_owner_label(label)?;
    Some(ObjectRef::new(name).within(namespace))
}

fn unfinished_views(store: &Store<ResourceView>) -> Vec<ObjectRef<ResourceView>> {
    store
        .state()
        .into_iter()
        .filter(|v| !v.is_completed())
        .map(|v| ObjectRef::from_obj(&*v))
        .collect()
}

/// The condition the view should record next, if any.
pub fn next_condition(view: &ResourceView, finished: usize, selected: usize) -> Option<WorkStatusType> {
    if view.is_completed() {
        return None;
    }
    if view.spec.is_periodic() {
        Some(WorkStatusType::Processing)
    } else if selected <= finished {
        Some(WorkStatusType::Completed)
    } else {
        None
    }
}

impl ResourceViewReconciler {
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
        let views: Api<ResourceView> = Api::all(self.client.clone());
        let works: Api<Work> = Api::all(self.client.clone());
        let clusters: Api<Cluster> = Api::all(self.client.clone());
        let context = Arc::new(self);

        let controller = Controller::new(views, watcher::Config::default());
        let store = controller.store();
        let controller = controller
            .watches(works, watcher::Config::default().labels(VIEW), view_for)
            .watches(clusters, watcher::Config::default(), move |_| unfinished_views(&store))
            .with_config(controller::Config::default().concurrency(context.concurrency))
            .run(reconcile, error_policy, context.clone())
            .for_each(|res| async move {
                match res {
                    Ok(o) => debug!("Reconciled resource view: {:?}", o),
                    Err(e) => warn!("Reconciliation error: {:?}", e),
                }
            });

        tokio::select! {
            _ = controller => {},
            _ = cancel.cancelled() => info!("ResourceView controller stopped"),
        }
        Ok(())
    }

    async fn selected_clusters(&self, view: &ResourceView) -> Result<Vec<Cluster>> {
        let clusters: Api<Cluster> = Api::all(self.client.clone());
        let all = clusters.list(&ListParams::default()).await?.items;
        let healthy = dispatch::healthy_clusters(&all, view.spec.cluster_selector.as_ref());
        Ok(match &self.authorizer {
            Some(authorizer) => {
                let identity = identity_from_annotations(view.annotations());
                authorizer.filter(identity.as_ref(), healthy).await
            }
            None => healthy,
        })
    }

    async fn children(&self, view: &ResourceView) -> Result<Vec<Work>> {
        let works: Api<Work> = Api::all(self.client.clone());
        let lp = ListParams::default().labels(&selector::equals(VIEW, &owner_label(view)));
        Ok(works.list(&lp).await?.items)
    }

    /// Record `condition_type` as the view's newest condition.
    async fn record(&self, view: &ResourceView, condition_type: WorkStatusType) -> Result<()> {
        let api: Api<ResourceView> = Api::namespaced(self.client.clone(), &view.namespace().unwrap_or_default());
        let name = view.name_any();
        retry_on_conflict("resourceview status", || {
            let api = api.clone();
            let name = name.clone();
            async move {
                let latest = api.get(&name).await?;
                if latest.is_completed() {
                    return Ok(());
                }
                let mut conditions = latest
                    .status
                    .as_ref()
                    .map(|s| s.conditions.clone())
                    .unwrap_or_default();
                push_condition(
                    &mut conditions,
                    ViewCondition {
                        condition_type,
                        status: String::new(),
                        last_update_time: Some(Time(Utc::now())),
                        reason: String::new(),
                    },
                );
                let patch = json!({
                    "metadata": {"resourceVersion": latest.resource_version()},
                    "status": {"conditions": conditions},
                });
                api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
                Ok(())
            }
        })
        .await
    }
}

#[instrument(skip(view, ctx), fields(view = %owner_label(&view)))]
async fn reconcile(view: Arc<ResourceView>, ctx: Arc<ResourceViewReconciler>) -> Result<Action> {
    if view.within_damping_window(Utc::now()) {
        debug!("Skipping view inside its update interval");
        return Ok(Action::await_change());
    }

    let clusters = ctx.selected_clusters(&view).await?;
    let index = dispatch::index_by_cluster(ctx.children(&view).await?);
    let plan = dispatch::plan(&clusters, &index, |w| rewrite(w, &view));

    if !plan.is_empty() {
        info!(
            create = plan.missing.len(),
            update = plan.drifted.len(),
            delete = plan.stale.len(),
            "Dispatching queries"
        );
        let build = |cluster: &Cluster| child_work(&view, cluster);
        let failed = dispatch::execute(&ctx.client, plan, build, usize::from(ctx.concurrency)).await;
        if failed > 0 {
            return Err(McmError::DriverError(format!("{failed} query changes failed")));
        }
    }

    let progress = dispatch::progress(&clusters, &index);
    if let Some(condition) = next_condition(&view, progress.finished, clusters.len()) {
        ctx.record(&view, condition).await?;
        debug!("Recorded view condition {}", condition);
    }
    Ok(Action::await_change())
}

fn error_policy(_view: Arc<ResourceView>, error: &McmError, _ctx: Arc<ResourceViewReconciler>) -> Action {
    error!("Reconciliation error: {}", error);
    Action::requeue(Duration::from_secs(60))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::tests::make_cluster;
    use crate::test_utils::{list_json, MockService};
    use crate::types::resource_view::{ResourceViewSpec, ResourceViewStatus, ViewFilter};
    use crate::types::work::{ResourceFilterMode, WorkStatus};
    use std::collections::BTreeMap;

    const CLUSTERS_PATH: &str = "/apis/clusterregistry.k8s.io/v1alpha1/clusters";
    const WORKS_PATH: &str = "/apis/mcm.ibm.com/v1beta1/works";
    const VIEW_PATH: &str = "/apis/mcm.ibm.com/v1beta1/namespaces/default/resourceviews/pods";

    fn make_view(mode: ResourceFilterMode, status: Option<ResourceViewStatus>) -> ResourceView {
        ResourceView {
            metadata: ObjectMeta {
                name: Some("pods".to_string()),
                namespace: Some("default".to_string()),
                resource_version: Some("3".to_string()),
                ..Default::default()
            },
            spec: ResourceViewSpec {
                cluster_selector: None,
                scope: ViewFilter {
                    resource: "pods".to_string(),
                    namespace: "kube-system".to_string(),
                    ..Default::default()
                },
                summary_only: true,
                mode,
                update_interval_seconds: if mode == ResourceFilterMode::Periodic { 60 } else { 0 },
            },
            status,
        }
    }

    fn condition(condition_type: WorkStatusType, seconds_ago: i64) -> ViewCondition {
        ViewCondition {
            condition_type,
            status: String::new(),
            last_update_time: Some(Time(Utc::now() - chrono::Duration::seconds(seconds_ago))),
            reason: String::new(),
        }
    }

    fn clusters_json(clusters: &[Cluster]) -> String {
        list_json(
            "Cluster",
            "clusterregistry.k8s.io/v1alpha1",
            clusters.iter().map(|c| serde_json::to_value(c).unwrap()).collect(),
        )
    }

    fn works_json(works: &[Work]) -> String {
        list_json(
            "Work",
            "mcm.ibm.com/v1beta1",
            works.iter().map(|w| serde_json::to_value(w).unwrap()).collect(),
        )
    }

    #[test]
    fn test_child_work_is_a_query() {
        let view = make_view(ResourceFilterMode::OneShot, None);
        let work = child_work(&view, &make_cluster("c1", "prod", true));
        assert_eq!(work.spec.work_type, WorkType::Resource);
        assert_eq!(work.metadata.generate_name.as_deref(), Some("view-pods-"));
        assert_eq!(work.labels().get(VIEW).map(String::as_str), Some("default.pods"));
        assert_eq!(
            work.annotations().get(OWNERS).map(String::as_str),
            Some("clusters.c1.c1,resourceviews.default.pods")
        );
        assert!(work.spec.scope.server_print);
        assert_eq!(work.spec.scope.namespace, "kube-system");
    }

    #[test]
    fn test_rewrite_detects_scope_drift() {
        let view = make_view(ResourceFilterMode::OneShot, None);
        let work = child_work(&view, &make_cluster("c1", "prod", true));
        assert!(rewrite(&work, &view).is_none());

        let mut changed = view.clone();
        changed.spec.scope.field_selector = "status.phase=Running".to_string();
        let updated = rewrite(&work, &changed).unwrap();
        assert_eq!(updated.spec.scope.field_selector, "status.phase=Running");
        assert_eq!(updated.spec.cluster.name, "c1");
    }

    #[test]
    fn test_view_for_requires_reported_query_work() {
        let view = make_view(ResourceFilterMode::OneShot, None);
        let mut work = child_work(&view, &make_cluster("c1", "prod", true));
        assert!(view_for(work.clone()).is_none());

        work.status = Some(WorkStatus {
            status_type: Some(WorkStatusType::Processing),
            ..Default::default()
        });
        let reference = view_for(work.clone()).unwrap();
        assert_eq!(reference.name, "pods");

        work.spec.work_type = WorkType::Action;
        assert!(view_for(work).is_none());
    }

    #[test]
    fn test_next_condition() {
        let periodic = make_view(ResourceFilterMode::Periodic, None);
        assert_eq!(next_condition(&periodic, 0, 2), Some(WorkStatusType::Processing));

        let one_shot = make_view(ResourceFilterMode::OneShot, None);
        assert_eq!(next_condition(&one_shot, 1, 2), None);
        assert_eq!(next_condition(&one_shot, 2, 2), Some(WorkStatusType::Completed));

        let done = make_view(
            ResourceFilterMode::OneShot,
            Some(ResourceViewStatus {
                conditions: vec![condition(WorkStatusType::Completed, 0)],
                results: BTreeMap::new(),
            }),
        );
        assert_eq!(next_condition(&done, 2, 2), None);
    }

    #[tokio::test]
    async fn test_periodic_view_inside_interval_is_skipped() {
        let mut results = BTreeMap::new();
        results.insert("c1".to_string(), json!({"items": []}));
        let view = make_view(
            ResourceFilterMode::Periodic,
            Some(ResourceViewStatus {
                conditions: vec![condition(WorkStatusType::Processing, 10)],
                results,
            }),
        );
        let mock = MockService::new();
        let ctx = Arc::new(ResourceViewReconciler::new(mock.clone().into_client(), &HubConfig::default()));

        reconcile(Arc::new(view), ctx).await.unwrap();
        assert!(mock.requests().is_empty());
    }

    #[tokio::test]
    async fn test_periodic_view_dispatches_and_records_processing() {
        let view = make_view(ResourceFilterMode::Periodic, None);
        let clusters = vec![make_cluster("c1", "prod", true), make_cluster("c2", "prod", true)];
        let created = child_work(&view, &clusters[0]);
        let view_json = serde_json::to_value(&view).unwrap().to_string();
        let mock = MockService::new()
            .on_get(CLUSTERS_PATH, 200, &clusters_json(&clusters))
            .on_get(WORKS_PATH, 200, &works_json(&[]))
            .on_post(
                "/apis/mcm.ibm.com/v1beta1/namespaces/",
                201,
                &serde_json::to_value(&created).unwrap().to_string(),
            )
            .on_get(VIEW_PATH, 200, &view_json)
            .on_patch(&format!("{VIEW_PATH}/status"), 200, &view_json);
        let ctx = Arc::new(ResourceViewReconciler::new(mock.clone().into_client(), &HubConfig::default()));

        reconcile(Arc::new(view), ctx).await.unwrap();

        let mut targets: Vec<String> = mock
            .requests_to("POST", "/apis/mcm.ibm.com/v1beta1/namespaces/")
            .into_iter()
            .map(|r| r.path)
            .collect();
        targets.sort();
        assert_eq!(
            targets,
            vec![
                "/apis/mcm.ibm.com/v1beta1/namespaces/c1/works",
                "/apis/mcm.ibm.com/v1beta1/namespaces/c2/works",
            ]
        );

        let patches = mock.requests_to("PATCH", &format!("{VIEW_PATH}/status"));
        assert_eq!(patches.len(), 1);
        let body = patches[0].json();
        assert_eq!(body["status"]["conditions"][0]["type"], "Processing");
        assert_eq!(body["metadata"]["resourceVersion"], "3");
    }
}

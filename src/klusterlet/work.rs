// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Executes the Works the hub dispatched to this cluster and reports the
//! outcome back on each Work's status.

use super::helm::{self, ReleaseFilter, ReleaseLister};
use crate::constants::labels::CLUSTER;
use crate::constants::timing::QUERY_LIMIT;
use crate::error::{McmError, Result};
use crate::kubernetes::dynamic::{identity_from_annotations, KubeControl, Query};
use crate::kubernetes::selector;
use crate::types::work::{
    ActionType, ResourceViewResult, Work, WorkStatusType, WorkType, RELEASES_RESOURCE,
};
use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::StreamExt;
use http::header::CONTENT_TYPE;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::ByteString;
use kube::api::{ObjectMeta, Patch, PatchParams};
use kube::runtime::{controller, controller::Action, watcher, Controller};
use kube::{Api, Client, Resource, ResourceExt};
use serde_json::{json, Value};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// What processing a Work produced, before it is written to the status
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub status_type: WorkStatusType,
    pub reason: String,
    pub result: Option<Value>,
}

impl Outcome {
    fn failed(work: &Work, error: &McmError) -> Self {
        Self {
            status_type: WorkStatusType::Failed,
            reason: error.to_string(),
            // Keep the previous payload so the owner can diagnose
            result: work.status.as_ref().and_then(|s| s.result.clone()),
        }
    }
}

pub struct WorkReconciler {
    hub: Client,
    control: KubeControl,
    releases: ReleaseLister,
    cluster_name: String,
    cluster_namespace: String,
    impersonate: bool,
}

/// Whether this klusterlet should act on `work` at all.
///
/// A status written for an older generation no longer counts.
pub fn should_process(work: &Work, cluster_name: &str) -> bool {
    if work.cluster_name() != cluster_name {
        return false;
    }
    if work.status_is_stale() {
        return true;
    }
    match work.status_type() {
        Some(WorkStatusType::Completed) => false,
        Some(WorkStatusType::Failed) => work.spec.scope.is_periodic(),
        _ => true,
    }
}

/// Time left before a periodic Work is due again, if it ran recently.
pub fn next_run_in(work: &Work, now: DateTime<Utc>) -> Option<Duration> {
    if !work.spec.scope.is_periodic() || work.status_is_stale() {
        return None;
    }
    let last = work.status.as_ref()?.last_update_time.as_ref()?.0;
    let interval = chrono::Duration::seconds(i64::from(work.spec.scope.update_interval_seconds.max(1)));
    let remaining = (last + interval) - now;
    remaining.to_std().ok().filter(|d| !d.is_zero())
}

fn interval_of(work: &Work) -> Duration {
    Duration::from_secs(u64::try_from(work.spec.scope.update_interval_seconds).unwrap_or(0).max(1))
}

/// JSON encode and gzip at best compression.
pub fn compress(value: &Value) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(&serde_json::to_vec(value)?)?;
    Ok(encoder.finish()?)
}

/// The result envelope posted back for a Resource Work.
pub fn view_result(work: &Work, cluster_name: &str, data: Vec<u8>) -> ResourceViewResult {
    let mut labels = work.labels().clone();
    labels.insert(CLUSTER.to_string(), cluster_name.to_string());
    ResourceViewResult {
        api_version: Work::api_version(&()).to_string(),
        kind: "ResourceViewResult".to_string(),
        metadata: ObjectMeta {
            name: Some(work.name_any()),
            namespace: work.namespace(),
            labels: Some(labels),
            ..Default::default()
        },
        data: ByteString(data),
    }
}

impl WorkReconciler {
    pub fn new(hub: Client, control: KubeControl, cluster_name: &str, cluster_namespace: &str, impersonate: bool) -> Self {
        let releases = ReleaseLister::new(control.client().clone());
        Self {
            hub,
            control,
            releases,
            cluster_name: cluster_name.to_string(),
            cluster_namespace: cluster_namespace.to_string(),
            impersonate,
        }
    }

    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        let works: Api<Work> = Api::namespaced(self.hub.clone(), &self.cluster_namespace);
        let context = Arc::new(self);

        let controller = Controller::new(works, watcher::Config::default())
            .with_config(controller::Config::default().concurrency(2))
            .run(reconcile, error_policy, context)
            .for_each(|res| async move {
                match res {
                    Ok(o) => debug!("Reconciled work: {:?}", o),
                    Err(e) => warn!("Reconciliation error: {:?}", e),
                }
            });

        tokio::select! {
            _ = controller => {},
            _ = cancel.cancelled() => info!("Work controller stopped"),
        }
        Ok(())
    }

    /// Carry out an Action Work against the local cluster.
    #[instrument(skip(self, work), fields(work = %work.name_any()))]
    pub async fn perform_action(&self, work: &Work) -> Outcome {
        match self.action(work).await {
            Ok(result) => Outcome {
                status_type: WorkStatusType::Completed,
                reason: String::new(),
                result,
            },
            Err(e) => {
                warn!("Action failed: {}", e);
                Outcome::failed(work, &e)
            }
        }
    }

    async fn action(&self, work: &Work) -> Result<Option<Value>> {
        let action = work
            .spec
            .action_type
            .ok_or_else(|| McmError::Validation("action work has no actionType".to_string()))?;
        let Some(kube_work) = work.spec.kube_work.as_ref() else {
            if work.spec.helm_work.is_some() {
                return Err(McmError::DriverError("helm actions are not supported".to_string()));
            }
            return Err(McmError::Validation("action work has no payload".to_string()));
        };
        let template = || {
            kube_work
                .object_template
                .clone()
                .ok_or_else(|| McmError::Validation("kube work has no template".to_string()))
        };

        match action {
            ActionType::Create => {
                let template = template()?;
                let identity = if self.impersonate {
                    identity_from_annotations(work.annotations())
                } else {
                    None
                };
                self.control.create(&kube_work.namespace, &template, identity.as_ref()).await?;
                info!("Created {} in {}", kube_work.resource, kube_work.namespace);
                Ok(Some(template))
            }
            ActionType::Update => {
                let template = template()?;
                if self.control.update(&kube_work.namespace, &template).await? {
                    info!("Updated {} in {}", kube_work.resource, kube_work.namespace);
                    Ok(Some(template))
                } else {
                    Ok(work.status.as_ref().and_then(|s| s.result.clone()))
                }
            }
            ActionType::Delete => {
                self.control
                    .delete(&kube_work.resource, &kube_work.namespace, &kube_work.name)
                    .await?;
                info!("Deleted {} {}/{}", kube_work.resource, kube_work.namespace, kube_work.name);
                Ok(None)
            }
        }
    }

    /// Run a Resource Work's query and post the compressed result to the hub.
    #[instrument(skip(self, work), fields(work = %work.name_any()))]
    pub async fn query_resource(&self, work: &Work) -> Outcome {
        let posted = async {
            let value = self.query(work).await?;
            let result = view_result(work, &self.cluster_name, compress(&value)?);
            self.post_result(work, &result).await
        };
        match posted.await {
            Ok(()) => Outcome {
                status_type: if work.spec.scope.is_periodic() {
                    WorkStatusType::Processing
                } else {
                    WorkStatusType::Completed
                },
                reason: String::new(),
                result: None,
            },
            Err(e) => {
                warn!("Resource query failed: {}", e);
                Outcome::failed(work, &e)
            }
        }
    }

    async fn query(&self, work: &Work) -> Result<Value> {
        let scope = &work.spec.scope;
        let label_selector = scope.label_selector.as_ref().map(selector::to_query);
        if scope.resource_type == RELEASES_RESOURCE {
            let filter = ReleaseFilter {
                name: scope.name.clone(),
                namespace: scope.namespace.clone(),
                selector: label_selector,
            };
            let releases = self.releases.list(&filter).await?;
            return Ok(helm::render(&releases, scope.server_print, Utc::now()));
        }

        let query = Query {
            resource: scope.resource_type.clone(),
            api_group: scope.api_group.clone(),
            version: scope.version.clone(),
            namespace: scope.namespace.clone(),
            name: scope.name.clone(),
            label_selector,
            field_selector: Some(scope.field_selector.clone()),
            limit: scope.name.is_empty().then_some(QUERY_LIMIT),
            server_print: scope.server_print,
        };
        self.control.query(&query).await
    }

    async fn post_result(&self, work: &Work, result: &ResourceViewResult) -> Result<()> {
        let namespace = work.namespace().unwrap_or_default();
        let url = format!("{}/{}/result", Work::url_path(&(), Some(namespace.as_str())), work.name_any());
        let request = http::Request::post(url)
            .header(CONTENT_TYPE, "application/json")
            .body(serde_json::to_vec(result)?)
            .map_err(|e| McmError::Validation(e.to_string()))?;
        self.hub.request_text(request).await?;
        debug!("Posted result of work {}/{}", namespace, work.name_any());
        Ok(())
    }

    async fn set_status(&self, work: &Work, outcome: Outcome) -> Result<()> {
        let api: Api<Work> = Api::namespaced(self.hub.clone(), &work.namespace().unwrap_or_default());
        let patch = json!({
            "status": {
                "type": outcome.status_type,
                "reason": outcome.reason,
                "result": outcome.result,
                "lastUpdateTime": Time(Utc::now()),
                "observedGeneration": work.meta().generation,
            }
        });
        api.patch_status(&work.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

#[instrument(skip(work, ctx), fields(work = %work.name_any()))]
async fn reconcile(work: Arc<Work>, ctx: Arc<WorkReconciler>) -> Result<Action> {
    if !should_process(&work, &ctx.cluster_name) {
        return Ok(Action::await_change());
    }
    // Our own status write wakes the controller; periodic work waits out its interval
    if let Some(wait) = next_run_in(&work, Utc::now()) {
        return Ok(Action::requeue(wait));
    }

    let outcome = match work.spec.work_type {
        WorkType::Action => ctx.perform_action(&work).await,
        WorkType::Resource => ctx.query_resource(&work).await,
    };
    debug!("Work finished as {}", outcome.status_type);
    ctx.set_status(&work, outcome).await?;

    if work.spec.scope.is_periodic() {
        return Ok(Action::requeue(interval_of(&work)));
    }
    Ok(Action::await_change())
}

fn error_policy(_work: Arc<Work>, error: &McmError, _ctx: Arc<WorkReconciler>) -> Action {
    error!("Reconciliation error: {}", error);
    Action::requeue(Duration::from_secs(60))
}

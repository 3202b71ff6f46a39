// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Building blocks shared by the WorkSet and ResourceView dispatchers.
//!
//! A dispatcher resolves its parent's cluster selector, filters the result
//! down to healthy (and optionally authorized) clusters, then reconciles one
//! child Work per remaining cluster: missing children are created, children
//! of clusters that dropped out are deleted and children whose payload
//! drifted from the parent are updated.

use crate::constants::api::MCM_GROUP;
use crate::error::{is_not_found, Result};
use crate::kubernetes::dynamic::Identity;
use crate::kubernetes::selector;
use crate::types::cluster::Cluster;
use crate::types::work::{Work, WorkStatusType};
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SubjectAccessReview, SubjectAccessReviewSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{DeleteParams, PostParams};
use kube::{Api, Client, ResourceExt};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, error, info, warn};

/// Clusters matching `cluster_selector` whose newest condition is Ready.
pub fn healthy_clusters(clusters: &[Cluster], cluster_selector: Option<&LabelSelector>) -> Vec<Cluster> {
    clusters
        .iter()
        .filter(|c| selector::matches(cluster_selector, c.labels()))
        .filter(|c| c.is_ready())
        .cloned()
        .collect()
}

/// Render owners as `<resource>.<ns>.<name>` joined by commas.
pub fn owners_annotation(owners: &[(&str, &str, &str)]) -> String {
    owners
        .iter()
        .map(|(resource, namespace, name)| format!("{resource}.{namespace}.{name}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// A single owner entry of an owners annotation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerRef {
    pub resource: String,
    pub namespace: String,
    pub name: String,
}

/// Parse an owners annotation. Entries with fewer than three parts are skipped.
pub fn parse_owners(value: &str) -> Vec<OwnerRef> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|owner| {
            let mut parts = owner.splitn(3, '.');
            let resource = parts.next()?;
            let namespace = parts.next()?;
            let name = parts.next()?;
            Some(OwnerRef {
                resource: resource.to_string(),
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
        })
        .collect()
}

/// Children grouped by `<namespace>/<cluster>`
pub fn index_by_cluster(works: Vec<Work>) -> BTreeMap<String, Vec<Work>> {
    let mut index: BTreeMap<String, Vec<Work>> = BTreeMap::new();
    for work in works {
        index.entry(work.cluster_key()).or_default().push(work);
    }
    index
}

/// What a dispatcher must change to converge its children
#[derive(Debug, Default)]
pub struct Plan {
    /// Selected clusters without a child
    pub missing: Vec<Cluster>,
    /// Children of clusters that are no longer selected
    pub stale: Vec<Work>,
    /// Children whose spec no longer matches the parent, already rewritten
    pub drifted: Vec<Work>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.stale.is_empty() && self.drifted.is_empty()
    }
}

/// Compare the selected clusters with the existing children.
///
/// `rewrite` returns the updated child when the existing one drifted.
pub fn plan<F>(clusters: &[Cluster], index: &BTreeMap<String, Vec<Work>>, rewrite: F) -> Plan
where
    F: Fn(&Work) -> Option<Work>,
{
    let mut plan = Plan::default();
    let selected: BTreeSet<String> = clusters.iter().map(Cluster::key).collect();

    for cluster in clusters {
        match index.get(&cluster.key()) {
            None => plan.missing.push(cluster.clone()),
            Some(works) => plan.drifted.extend(works.iter().filter_map(&rewrite)),
        }
    }
    for (key, works) in index {
        if !selected.contains(key) {
            plan.stale.extend(works.iter().cloned());
        }
    }
    plan
}

/// Apply a plan with at most `concurrency` calls in flight.
///
/// Individual failures are logged and do not stop the others. Returns the
/// number of failed calls.
pub async fn execute<F>(client: &Client, plan: Plan, build: F, concurrency: usize) -> usize
where
    F: Fn(&Cluster) -> Work,
{
    let creates = plan.missing.iter().map(|cluster| {
        let work = build(cluster);
        let api: Api<Work> = Api::namespaced(client.clone(), &cluster.namespace().unwrap_or_default());
        async move {
            api.create(&PostParams::default(), &work)
                .await
                .map(|w| info!("Created work {}/{}", w.namespace().unwrap_or_default(), w.name_any()))
                .map_err(|e| (format!("create for {}", work.cluster_key()), e))
        }
        .boxed()
    });
    let updates = plan.drifted.into_iter().map(|work| {
        let api: Api<Work> = Api::namespaced(client.clone(), &work.namespace().unwrap_or_default());
        async move {
            api.replace(&work.name_any(), &PostParams::default(), &work)
                .await
                .map(|w| info!("Updated work {}/{}", w.namespace().unwrap_or_default(), w.name_any()))
                .map_err(|e| (format!("update of {}", work.name_any()), e))
        }
        .boxed()
    });
    let deletes = plan.stale.into_iter().map(|work| {
        let api: Api<Work> = Api::namespaced(client.clone(), &work.namespace().unwrap_or_default());
        async move {
            match api.delete(&work.name_any(), &DeleteParams::background()).await {
                Ok(_) => {
                    info!("Deleted work {}/{}", work.namespace().unwrap_or_default(), work.name_any());
                    Ok(())
                }
                Err(e) if is_not_found(&e) => Ok(()),
                Err(e) => Err((format!("delete of {}", work.name_any()), e)),
            }
        }
        .boxed()
    });

    let calls: Vec<BoxFuture<'static, std::result::Result<(), (String, kube::Error)>>> =
        creates.chain(updates).chain(deletes).collect();
    let results: Vec<_> = futures::stream::iter(calls)
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let mut failed = 0;
    for (what, err) in results.into_iter().filter_map(|r| r.err()) {
        error!("Failed {}: {}", what, err);
        failed += 1;
    }
    failed
}

/// Progress of the children of one parent
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Progress {
    /// Selected clusters with exactly one child that reported a status
    pub finished: usize,
    /// `<reason>(<cluster>); ` for every failed child
    pub failures: String,
}

pub fn progress(clusters: &[Cluster], index: &BTreeMap<String, Vec<Work>>) -> Progress {
    let mut progress = Progress::default();
    for cluster in clusters {
        let Some(works) = index.get(&cluster.key()) else {
            continue;
        };
        let [work] = works.as_slice() else {
            continue;
        };
        if !work.is_finished() || work.status_is_stale() {
            continue;
        }
        progress.finished += 1;
        if work.status_type() == Some(WorkStatusType::Failed) {
            let reason = work.status.as_ref().map(|s| s.reason.as_str()).unwrap_or_default();
            progress
                .failures
                .push_str(&format!("{}({}); ", reason, cluster.name_any()));
        }
    }
    progress
}

/// Asks the hub whether a user may create Works in a cluster namespace.
#[derive(Clone)]
pub struct ClusterAuthorizer {
    client: Client,
}

impl ClusterAuthorizer {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Keep the clusters whose namespace the user may create Works in.
    ///
    /// Objects without a stamped identity are not filtered. A failed review
    /// excludes the cluster for this pass.
    pub async fn filter(&self, identity: Option<&Identity>, clusters: Vec<Cluster>) -> Vec<Cluster> {
        let Some(identity) = identity else {
            return clusters;
        };
        let mut allowed = Vec::with_capacity(clusters.len());
        for cluster in clusters {
            let namespace = cluster.namespace().unwrap_or_default();
            match self.may_create_works(identity, &namespace).await {
                Ok(true) => allowed.push(cluster),
                Ok(false) => debug!("User {} may not create works in {}", identity.user, namespace),
                Err(e) => warn!("Access review for {} in {} failed: {}", identity.user, namespace, e),
            }
        }
        allowed
    }

    async fn may_create_works(&self, identity: &Identity, namespace: &str) -> Result<bool> {
        let review = SubjectAccessReview {
            spec: SubjectAccessReviewSpec {
                user: Some(identity.user.clone()),
                groups: Some(identity.groups.clone()),
                resource_attributes: Some(ResourceAttributes {
                    namespace: Some(namespace.to_string()),
                    verb: Some("create".to_string()),
                    group: Some(MCM_GROUP.to_string()),
                    resource: Some("works".to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        };
        let api: Api<SubjectAccessReview> = Api::all(self.client.clone());
        let response = api.create(&PostParams::default(), &review).await?;
        Ok(response.status.is_some_and(|s| s.allowed))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::test_utils::MockService;
    use crate::types::cluster::{ClusterCondition, ClusterRegistryStatus, CLUSTER_READY};
    use crate::types::work::{ClusterReference, WorkSpec, WorkStatus};
    use chrono::Utc;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::api::ObjectMeta;
    use serde_json::json;

    pub fn make_cluster(name: &str, env: &str, ready: bool) -> Cluster {
        Cluster {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(name.to_string()),
                labels: Some([("env".to_string(), env.to_string())].into()),
                ..Default::default()
            },
            spec: Default::default(),
            status: Some(ClusterRegistryStatus {
                conditions: vec![ClusterCondition {
                    condition_type: if ready { CLUSTER_READY.to_string() } else { String::new() },
                    status: "True".to_string(),
                    last_heartbeat_time: Some(Time(Utc::now())),
                    ..Default::default()
                }],
            }),
        }
    }

    pub fn make_work(name: &str, cluster: &str, status: Option<WorkStatusType>, reason: &str) -> Work {
        Work {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(cluster.to_string()),
                ..Default::default()
            },
            spec: WorkSpec {
                cluster: ClusterReference {
                    name: cluster.to_string(),
                },
                ..Default::default()
            },
            status: status.map(|t| WorkStatus {
                status_type: Some(t),
                reason: reason.to_string(),
                ..Default::default()
            }),
        }
    }

    fn prod_selector() -> LabelSelector {
        LabelSelector {
            match_labels: Some([("env".to_string(), "prod".to_string())].into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_healthy_clusters_filters_selector_and_readiness() {
        let clusters = vec![
            make_cluster("c1", "prod", true),
            make_cluster("c2", "prod", false),
            make_cluster("c3", "dev", true),
        ];
        let healthy = healthy_clusters(&clusters, Some(&prod_selector()));
        let names: Vec<_> = healthy.iter().map(|c| c.name_any()).collect();
        assert_eq!(names, vec!["c1"]);
    }

    #[test]
    fn test_owners_annotation_round_trip() {
        let value = owners_annotation(&[("clusters", "c1", "c1"), ("worksets", "default", "ws1")]);
        assert_eq!(value, "clusters.c1.c1,worksets.default.ws1");
        let owners = parse_owners(&value);
        assert_eq!(owners.len(), 2);
        assert_eq!(owners[1].resource, "worksets");
        assert_eq!(owners[1].name, "ws1");
        assert!(parse_owners("clusters.c1").is_empty());
    }

    #[test]
    fn test_plan_splits_missing_stale_and_drifted() {
        let clusters = vec![make_cluster("c1", "prod", true), make_cluster("c2", "prod", true)];
        let index = index_by_cluster(vec![
            make_work("ws1-c1-aaaaa", "c1", None, ""),
            make_work("ws1-c3-bbbbb", "c3", None, ""),
        ]);
        let plan = plan(&clusters, &index, |w| Some(w.clone()));
        assert_eq!(plan.missing.len(), 1);
        assert_eq!(plan.missing[0].name_any(), "c2");
        assert_eq!(plan.stale.len(), 1);
        assert_eq!(plan.stale[0].name_any(), "ws1-c3-bbbbb");
        assert_eq!(plan.drifted.len(), 1);
        assert_eq!(plan.drifted[0].name_any(), "ws1-c1-aaaaa");
    }

    #[test]
    fn test_progress_counts_finished_and_collects_failures() {
        let clusters = vec![
            make_cluster("c1", "prod", true),
            make_cluster("c2", "prod", true),
            make_cluster("c3", "prod", true),
        ];
        let index = index_by_cluster(vec![
            make_work("w1", "c1", Some(WorkStatusType::Completed), ""),
            make_work("w2", "c2", Some(WorkStatusType::Failed), "boom"),
            make_work("w3", "c3", None, ""),
        ]);
        let progress = progress(&clusters, &index);
        assert_eq!(progress.finished, 2);
        assert_eq!(progress.failures, "boom(c2); ");
    }

    #[test]
    fn test_progress_ignores_duplicated_children() {
        let clusters = vec![make_cluster("c1", "prod", true)];
        let index = index_by_cluster(vec![
            make_work("w1", "c1", Some(WorkStatusType::Completed), ""),
            make_work("w2", "c1", Some(WorkStatusType::Completed), ""),
        ]);
        assert_eq!(progress(&clusters, &index).finished, 0);
    }

    #[tokio::test]
    async fn test_authorizer_keeps_allowed_clusters() {
        let mock = MockService::new().on_post(
            "/apis/authorization.k8s.io/v1/subjectaccessreviews",
            201,
            &json!({
                "apiVersion": "authorization.k8s.io/v1",
                "kind": "SubjectAccessReview",
                "spec": {},
                "status": {"allowed": true}
            })
            .to_string(),
        );
        let authorizer = ClusterAuthorizer::new(mock.clone().into_client());
        let identity = Identity {
            user: "alice".to_string(),
            groups: vec!["devs".to_string()],
        };
        let clusters = vec![make_cluster("c1", "prod", true)];
        let allowed = authorizer.filter(Some(&identity), clusters).await;
        assert_eq!(allowed.len(), 1);

        let review = &mock.requests()[0].json();
        assert_eq!(review["spec"]["user"], "alice");
        assert_eq!(review["spec"]["resourceAttributes"]["namespace"], "c1");
        assert_eq!(review["spec"]["resourceAttributes"]["resource"], "works");
        assert_eq!(review["spec"]["resourceAttributes"]["verb"], "create");
    }

    #[tokio::test]
    async fn test_authorizer_excludes_on_failed_review() {
        let authorizer = ClusterAuthorizer::new(MockService::new().into_client());
        let identity = Identity {
            user: "alice".to_string(),
            groups: vec![],
        };
        let allowed = authorizer
            .filter(Some(&identity), vec![make_cluster("c1", "prod", true)])
            .await;
        assert!(allowed.is_empty());
    }
}

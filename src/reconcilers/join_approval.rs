// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Join approval - admits or denies ClusterJoinRequests and signs them
//! through a child CertificateSigningRequest of the same name.

use super::rbac::grant_cluster_access;
use crate::config::HubConfig;
use crate::error::{is_already_exists, is_not_found, McmError, Result};
use crate::pki::jitter::rotation_deadline;
use crate::pki::{csr_subject, CertInfo, Subject, CLIENT_USAGES};
use crate::types::cluster::Cluster;
use crate::types::join_request::{
    ClusterJoinRequest, ClusterJoinRequestSpec, ClusterJoinRequestStatus, JoinCondition, JoinPhase,
};
use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::certificates::v1::{
    CertificateSigningRequest, CertificateSigningRequestCondition, CertificateSigningRequestSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::ByteString;
use kube::api::{DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::runtime::{controller, controller::Action, watcher, Controller};
use kube::{Api, Client, Resource, ResourceExt};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Signer that issues client certificates for the hub API server
pub const SIGNER_NAME: &str = "kubernetes.io/kube-apiserver-client";

const CSR_APPROVED: &str = "Approved";
const CSR_DENIED: &str = "Denied";

/// How a pending join request is handled given the clusters already registered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The cluster is already registered, possibly reinstalled; an administrator decides
    Manual,
    Deny(String),
    Approve,
    Pending,
}

/// Decide on a pending request. Clusters that never reported are ignored.
pub fn admit(
    spec: &ClusterJoinRequestSpec,
    clusters: &[Cluster],
    auto_approve: bool,
    csr_approved: bool,
) -> Admission {
    let mut name_taken = false;
    let mut namespace_taken = false;

    for cluster in clusters.iter().filter(|c| !c.is_pending()) {
        let name = cluster.name_any();
        let namespace = cluster.namespace().unwrap_or_default();
        if name == spec.cluster_name && namespace == spec.cluster_namespace {
            return Admission::Manual;
        }
        name_taken |= name == spec.cluster_name;
        namespace_taken |= namespace == spec.cluster_namespace;
    }

    if name_taken {
        Admission::Deny(format!("cluster name {} is already in use", spec.cluster_name))
    } else if namespace_taken {
        Admission::Deny(format!(
            "namespace {} already holds a cluster",
            spec.cluster_namespace
        ))
    } else if auto_approve && !csr_approved {
        Admission::Approve
    } else {
        Admission::Pending
    }
}

/// RFC 1123 label: lowercase alphanumerics and '-', at most 63 characters
pub fn is_dns_label(value: &str) -> bool {
    let bytes = value.as_bytes();
    let edge_ok = |b: Option<&u8>| b.is_some_and(|b| b.is_ascii_lowercase() || b.is_ascii_digit());
    !bytes.is_empty()
        && bytes.len() <= 63
        && edge_ok(bytes.first())
        && edge_ok(bytes.last())
        && bytes
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
}

/// The request must name a valid cluster and carry a CSR for exactly that cluster.
pub fn validate_request(request: &ClusterJoinRequest) -> Result<()> {
    let spec = &request.spec;
    if !is_dns_label(&spec.cluster_name) {
        return Err(McmError::Validation(format!(
            "cluster name '{}' is not a DNS label",
            spec.cluster_name
        )));
    }
    if !is_dns_label(&spec.cluster_namespace) {
        return Err(McmError::Validation(format!(
            "cluster namespace '{}' is not a DNS label",
            spec.cluster_namespace
        )));
    }
    let subject = csr_subject(&spec.request.0)?;
    let expected = Subject::for_cluster(&spec.cluster_namespace, &spec.cluster_name);
    if subject != expected {
        return Err(McmError::Validation(format!(
            "CSR subject '{}' does not match cluster {}/{}",
            subject.common_name, spec.cluster_namespace, spec.cluster_name
        )));
    }
    Ok(())
}

/// Approval state of a CSR
#[derive(Debug, Default)]
struct CsrState {
    approved: bool,
    denied: bool,
    certificate: Option<Vec<u8>>,
}

impl CsrState {
    fn of(csr: &CertificateSigningRequest) -> Self {
        let Some(status) = csr.status.as_ref() else {
            return Self::default();
        };
        let has = |t: &str| status.conditions.iter().flatten().any(|c| c.type_ == t);
        Self {
            approved: has(CSR_APPROVED),
            denied: has(CSR_DENIED),
            certificate: status
                .certificate
                .as_ref()
                .map(|c| c.0.clone())
                .filter(|c| !c.is_empty()),
        }
    }
}

fn mirror_conditions(csr: &CertificateSigningRequest) -> Vec<JoinCondition> {
    csr.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .map(|c| JoinCondition {
                    condition_type: c.type_.clone(),
                    reason: c.reason.clone().unwrap_or_default(),
                    message: c.message.clone().unwrap_or_default(),
                    last_update_time: c.last_update_time.clone(),
                })
                .collect()
        })
        .unwrap_or_default()
}

/// The signing request filed on behalf of a join request
pub fn csr_for(request: &ClusterJoinRequest) -> Result<CertificateSigningRequest> {
    let owner = request.controller_owner_ref(&()).ok_or_else(|| {
        McmError::Validation(format!("join request {} has no uid", request.name_any()))
    })?;
    Ok(CertificateSigningRequest {
        metadata: ObjectMeta {
            name: Some(request.name_any()),
            labels: request.metadata.labels.clone(),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: CertificateSigningRequestSpec {
            request: request.spec.request.clone(),
            signer_name: SIGNER_NAME.to_string(),
            usages: Some(CLIENT_USAGES.iter().map(ToString::to_string).collect()),
            ..Default::default()
        },
        status: None,
    })
}

pub struct JoinApprovalReconciler {
    client: Client,
    auto_approve: bool,
    validation_period: Duration,
    concurrency: u16,
}

impl JoinApprovalReconciler {
    pub fn new(client: Client, config: &HubConfig) -> Self {
        Self {
            client,
            auto_approve: config.auto_approve,
            validation_period: config.csr_validation_period,
            concurrency: config.worker_count,
        }
    }

    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        let requests: Api<ClusterJoinRequest> = Api::all(self.client.clone());
        let context = Arc::new(self);

        let controller = Controller::new(requests, watcher::Config::default())
            .owns(context.csrs(), watcher::Config::default())
            .with_config(controller::Config::default().concurrency(context.concurrency))
            .run(reconcile, error_policy, context.clone())
            .for_each(|res| async move {
                match res {
                    Ok(o) => debug!("Reconciled join request: {:?}", o),
                    Err(e) => warn!("Reconciliation error: {:?}", e),
                }
            });

        tokio::select! {
            _ = controller => {},
            _ = context.validate_certificates(cancel.clone()) => {},
            _ = cancel.cancelled() => info!("Join approval controller stopped"),
        }
        Ok(())
    }

    fn csrs(&self) -> Api<CertificateSigningRequest> {
        Api::all(self.client.clone())
    }

    fn requests(&self) -> Api<ClusterJoinRequest> {
        Api::all(self.client.clone())
    }

    async fn ensure_csr(&self, request: &ClusterJoinRequest) -> Result<CertificateSigningRequest> {
        let name = request.name_any();
        let csrs = self.csrs();
        if let Some(csr) = csrs.get_opt(&name).await? {
            return Ok(csr);
        }
        match csrs.create(&PostParams::default(), &csr_for(request)?).await {
            Ok(csr) => {
                info!("Created signing request {}", name);
                Ok(csr)
            }
            Err(e) if is_already_exists(&e) => Ok(csrs.get(&name).await?),
            Err(e) => Err(e.into()),
        }
    }

    /// Append an Approved or Denied condition through the approval subresource
    async fn add_csr_condition(
        &self,
        csr: &CertificateSigningRequest,
        condition_type: &str,
        reason: &str,
        message: &str,
    ) -> Result<()> {
        let mut conditions = csr
            .status
            .as_ref()
            .and_then(|s| s.conditions.clone())
            .unwrap_or_default();
        conditions.push(CertificateSigningRequestCondition {
            type_: condition_type.to_string(),
            status: "True".to_string(),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            last_update_time: Some(Time(Utc::now())),
            ..Default::default()
        });
        let patch = json!({"status": {"conditions": conditions}});
        self.csrs()
            .patch_approval(&csr.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn set_status(&self, request: &ClusterJoinRequest, status: ClusterJoinRequestStatus) -> Result<()> {
        let patch = json!({"status": status});
        self.requests()
            .patch_status(&request.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn deny(&self, request: &ClusterJoinRequest, reason: String) -> Result<()> {
        self.set_status(
            request,
            ClusterJoinRequestStatus {
                phase: JoinPhase::Denied,
                certificate: None,
                conditions: vec![JoinCondition {
                    condition_type: CSR_DENIED.to_string(),
                    reason: "ClusterJoinDenied".to_string(),
                    message: reason,
                    last_update_time: Some(Time(Utc::now())),
                }],
            },
        )
        .await
    }

    async fn validate_certificates(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.validation_period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => self.validate_once().await,
            }
        }
    }

    /// Re-sign every approved certificate that is past its rotation deadline.
    pub async fn validate_once(&self) {
        let requests = match self.requests().list(&ListParams::default()).await {
            Ok(list) => list.items,
            Err(e) => {
                warn!("Unable to list join requests: {}", e);
                return;
            }
        };

        let now = Utc::now();
        for request in &requests {
            let Some(cert) = request.certificate() else {
                continue;
            };
            let deadline = match CertInfo::from_pem(cert) {
                Ok(info) => rotation_deadline(&info),
                Err(e) => {
                    error!("Join request {} has a bad certificate block: {}", request.name_any(), e);
                    continue;
                }
            };
            if now > deadline {
                if let Err(e) = self.recreate_csr(request).await {
                    error!("Unable to re-sign join request {}: {}", request.name_any(), e);
                }
            }
        }
    }

    /// Delete and recreate the signing request pre-approved, so the signer
    /// issues a fresh certificate. Assumes a single active hub controller.
    #[instrument(skip(self, request), fields(request = %request.name_any()))]
    async fn recreate_csr(&self, request: &ClusterJoinRequest) -> Result<()> {
        let name = request.name_any();
        let csrs = self.csrs();
        match csrs.delete(&name, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(e.into()),
        }
        let created = csrs.create(&PostParams::default(), &csr_for(request)?).await?;
        self.add_csr_condition(
            &created,
            CSR_APPROVED,
            "ClusterJoinRenewed",
            "Certificate re-signed ahead of expiry by the cluster join controller.",
        )
        .await?;
        info!("Re-signing certificate of join request {}", name);
        Ok(())
    }
}

#[instrument(skip(request, ctx), fields(request = %request.name_any(), cluster = %format!("{}/{}", request.spec.cluster_namespace, request.spec.cluster_name)))]
async fn reconcile(request: Arc<ClusterJoinRequest>, ctx: Arc<JoinApprovalReconciler>) -> Result<Action> {
    if let Err(e) = validate_request(&request) {
        error!("Rejecting join request: {}", e);
        if request.phase() != JoinPhase::Denied {
            ctx.deny(&request, e.to_string()).await?;
        }
        return Ok(Action::await_change());
    }

    let csr = ctx.ensure_csr(&request).await?;
    let state = CsrState::of(&csr);

    if request.phase() == JoinPhase::Denied {
        if !state.denied {
            ctx.add_csr_condition(
                &csr,
                CSR_DENIED,
                "ClusterJoinDenied",
                "This CSR was denied by the cluster join controller.",
            )
            .await?;
            info!("Denied signing request {}", csr.name_any());
        }
        return Ok(Action::await_change());
    }

    if state.denied {
        ctx.set_status(
            &request,
            ClusterJoinRequestStatus {
                phase: JoinPhase::Denied,
                certificate: None,
                conditions: mirror_conditions(&csr),
            },
        )
        .await?;
        info!("Join request denied");
        return Ok(Action::await_change());
    }

    if let (true, Some(cert)) = (state.approved, state.certificate.as_deref()) {
        if request.phase() == JoinPhase::Approved && request.certificate() == Some(cert) {
            return Ok(Action::await_change());
        }
        grant_cluster_access(&ctx.client, &request).await?;
        ctx.set_status(
            &request,
            ClusterJoinRequestStatus {
                phase: JoinPhase::Approved,
                certificate: Some(ByteString(cert.to_vec())),
                conditions: mirror_conditions(&csr),
            },
        )
        .await?;
        info!("Join request approved");
        return Ok(Action::await_change());
    }

    let clusters: Api<Cluster> = Api::all(ctx.client.clone());
    let clusters = clusters.list(&ListParams::default()).await?.items;

    match admit(&request.spec, &clusters, ctx.auto_approve, state.approved) {
        Admission::Manual => {
            info!("Cluster is already registered, leaving join request for manual approval");
            Ok(Action::requeue(Duration::from_secs(60)))
        }
        Admission::Deny(reason) => {
            info!("Denying join request: {}", reason);
            ctx.deny(&request, reason).await?;
            Ok(Action::await_change())
        }
        Admission::Approve => {
            ctx.add_csr_condition(
                &csr,
                CSR_APPROVED,
                "ClusterJoinApproved",
                "This CSR was approved by the cluster join controller.",
            )
            .await?;
            info!("Approved signing request {}", csr.name_any());
            Ok(Action::await_change())
        }
        Admission::Pending => {
            debug!("Join request pending");
            Ok(Action::requeue(Duration::from_secs(60)))
        }
    }
}

fn error_policy(
    _request: Arc<ClusterJoinRequest>,
    error: &McmError,
    _ctx: Arc<JoinApprovalReconciler>,
) -> Action {
    error!("Reconciliation error: {}", error);
    Action::requeue(Duration::from_secs(60))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki::test_ca::TestCa;
    use crate::pki::ClientKey;
    use crate::test_utils::{list_json, namespace_json, status_success_json, MockService};
    use crate::types::cluster::{ClusterCondition, ClusterRegistryStatus, ClusterSpec, CLUSTER_READY};
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde_json::Value;

    const CSR_PATH: &str = "/apis/certificates.k8s.io/v1/certificatesigningrequests";
    const JOIN_PATH: &str = "/apis/mcm.ibm.com/v1beta1/clusterjoinrequests";
    const CLUSTERS_PATH: &str = "/apis/clusterregistry.k8s.io/v1alpha1/clusters";

    fn hub_config(auto_approve: bool) -> HubConfig {
        HubConfig {
            auto_approve,
            enable_rbac_filter: false,
            cluster_health_period: Duration::from_secs(60),
            permission_resync: Duration::from_secs(30),
            csr_validation_period: Duration::from_secs(30),
            gc_period: Duration::from_secs(60),
            worker_count: 1,
            reload_apiserver: false,
        }
    }

    fn spec(namespace: &str, name: &str) -> ClusterJoinRequestSpec {
        let key = ClientKey::generate().unwrap();
        let csr = key.csr_pem(&Subject::for_cluster(namespace, name)).unwrap();
        ClusterJoinRequestSpec {
            cluster_name: name.to_string(),
            cluster_namespace: namespace.to_string(),
            request: ByteString(csr.into_bytes()),
        }
    }

    fn request(spec: ClusterJoinRequestSpec, status: Option<ClusterJoinRequestStatus>) -> ClusterJoinRequest {
        ClusterJoinRequest {
            metadata: ObjectMeta {
                name: Some("clusterjoin-abc".to_string()),
                uid: Some("uid-1".to_string()),
                ..Default::default()
            },
            spec,
            status,
        }
    }

    fn cluster(namespace: &str, name: &str, reported: bool) -> Cluster {
        Cluster {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: ClusterSpec::default(),
            status: Some(ClusterRegistryStatus {
                conditions: if reported {
                    vec![ClusterCondition {
                        condition_type: CLUSTER_READY.to_string(),
                        ..Default::default()
                    }]
                } else {
                    vec![]
                },
            }),
        }
    }

    fn csr_json(conditions: Value, certificate: Option<&[u8]>) -> String {
        let mut status = json!({"conditions": conditions});
        if let Some(cert) = certificate {
            status["certificate"] = json!(STANDARD.encode(cert));
        }
        json!({
            "apiVersion": "certificates.k8s.io/v1",
            "kind": "CertificateSigningRequest",
            "metadata": {"name": "clusterjoin-abc"},
            "spec": {
                "request": STANDARD.encode("csr"),
                "signerName": SIGNER_NAME,
                "usages": CLIENT_USAGES
            },
            "status": status
        })
        .to_string()
    }

    fn join_json() -> String {
        json!({
            "apiVersion": "mcm.ibm.com/v1beta1",
            "kind": "ClusterJoinRequest",
            "metadata": {"name": "clusterjoin-abc"},
            "spec": {"clusterName": "c1", "clusterNamespace": "c1", "request": STANDARD.encode("csr")}
        })
        .to_string()
    }

    #[test]
    fn test_admit_denies_duplicated_name() {
        let clusters = vec![cluster("c2", "c1", true)];
        let decision = admit(&spec("c3", "c1"), &clusters, true, false);
        assert!(matches!(decision, Admission::Deny(_)));
    }

    #[test]
    fn test_admit_denies_occupied_namespace() {
        let clusters = vec![cluster("c1", "other", true)];
        assert!(matches!(admit(&spec("c1", "c1"), &clusters, true, false), Admission::Deny(_)));
    }

    #[test]
    fn test_admit_leaves_reinstall_for_manual_approval() {
        let clusters = vec![cluster("c2", "c1", true), cluster("c1", "c1", true)];
        assert_eq!(admit(&spec("c1", "c1"), &clusters, true, false), Admission::Manual);
    }

    #[test]
    fn test_admit_ignores_clusters_without_conditions() {
        let clusters = vec![cluster("c1", "c1", false)];
        assert_eq!(admit(&spec("c1", "c1"), &clusters, true, false), Admission::Approve);
        assert_eq!(admit(&spec("c1", "c1"), &clusters, false, false), Admission::Pending);
        assert_eq!(admit(&spec("c1", "c1"), &clusters, true, true), Admission::Pending);
    }

    #[test]
    fn test_is_dns_label() {
        assert!(is_dns_label("cluster-1"));
        assert!(!is_dns_label("Cluster"));
        assert!(!is_dns_label("-c1"));
        assert!(!is_dns_label("c1-"));
        assert!(!is_dns_label(""));
        assert!(!is_dns_label(&"a".repeat(64)));
    }

    #[test]
    fn test_validate_request_checks_subject() {
        assert!(validate_request(&request(spec("c1", "c1"), None)).is_ok());

        let mut mismatched = spec("c1", "c1");
        mismatched.cluster_name = "c2".to_string();
        assert!(matches!(
            validate_request(&request(mismatched, None)),
            Err(McmError::Validation(_))
        ));

        let mut garbage = spec("c1", "c1");
        garbage.request = ByteString(b"not a csr".to_vec());
        assert!(validate_request(&request(garbage, None)).is_err());
    }

    #[test]
    fn test_csr_for_sets_owner_and_signer() {
        let csr = csr_for(&request(spec("c1", "c1"), None)).unwrap();
        let owner = &csr.metadata.owner_references.unwrap()[0];
        assert_eq!(owner.kind, "ClusterJoinRequest");
        assert_eq!(owner.uid, "uid-1");
        assert_eq!(owner.controller, Some(true));
        assert_eq!(csr.spec.signer_name, SIGNER_NAME);
        assert_eq!(csr.spec.usages.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_denied_request_denies_csr() {
        let mock = MockService::new()
            .on_get(&format!("{CSR_PATH}/clusterjoin-abc"), 200, &csr_json(json!([]), None))
            .on_patch(
                &format!("{CSR_PATH}/clusterjoin-abc/approval"),
                200,
                &csr_json(json!([{"type": "Denied", "status": "True"}]), None),
            );
        let ctx = Arc::new(JoinApprovalReconciler::new(mock.clone().into_client(), &hub_config(true)));
        let denied = request(
            spec("c1", "c1"),
            Some(ClusterJoinRequestStatus {
                phase: JoinPhase::Denied,
                ..Default::default()
            }),
        );

        reconcile(Arc::new(denied), ctx).await.unwrap();

        let patches = mock.requests_to("PATCH", &format!("{CSR_PATH}/clusterjoin-abc/approval"));
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].json()["status"]["conditions"][0]["type"], "Denied");
    }

    #[tokio::test]
    async fn test_pending_request_with_conflicting_cluster_is_denied() {
        let conflicting = serde_json::to_value(cluster("c2", "c1", true)).unwrap();
        let mock = MockService::new()
            .on_get(&format!("{CSR_PATH}/clusterjoin-abc"), 200, &csr_json(json!([]), None))
            .on_get(CLUSTERS_PATH, 200, &list_json("Cluster", "clusterregistry.k8s.io/v1alpha1", vec![conflicting]))
            .on_patch(&format!("{JOIN_PATH}/clusterjoin-abc/status"), 200, &join_json());
        let ctx = Arc::new(JoinApprovalReconciler::new(mock.clone().into_client(), &hub_config(true)));

        reconcile(Arc::new(request(spec("c3", "c1"), None)), ctx).await.unwrap();

        let patches = mock.requests_to("PATCH", &format!("{JOIN_PATH}/clusterjoin-abc/status"));
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].json()["status"]["phase"], "Denied");
        assert!(mock.requests_to("PATCH", CSR_PATH).is_empty());
    }

    #[tokio::test]
    async fn test_missing_csr_is_created_and_auto_approved() {
        let mock = MockService::new()
            .on_post(CSR_PATH, 201, &csr_json(json!([]), None))
            .on_get(CLUSTERS_PATH, 200, &list_json("Cluster", "clusterregistry.k8s.io/v1alpha1", vec![]))
            .on_patch(
                &format!("{CSR_PATH}/clusterjoin-abc/approval"),
                200,
                &csr_json(json!([{"type": "Approved", "status": "True"}]), None),
            );
        let ctx = Arc::new(JoinApprovalReconciler::new(mock.clone().into_client(), &hub_config(true)));

        reconcile(Arc::new(request(spec("c1", "c1"), None)), ctx).await.unwrap();

        let posts = mock.requests_to("POST", CSR_PATH);
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].json()["spec"]["signerName"], SIGNER_NAME);
        let approvals = mock.requests_to("PATCH", &format!("{CSR_PATH}/clusterjoin-abc/approval"));
        assert_eq!(approvals.len(), 1);
        assert_eq!(approvals[0].json()["status"]["conditions"][0]["type"], "Approved");
    }

    #[tokio::test]
    async fn test_signed_csr_grants_access_and_publishes_certificate() {
        let rbac = "/apis/rbac.authorization.k8s.io/v1/namespaces/c1";
        let mock = MockService::new()
            .on_get(
                &format!("{CSR_PATH}/clusterjoin-abc"),
                200,
                &csr_json(json!([{"type": "Approved", "status": "True", "reason": "ok"}]), Some(b"signed")),
            )
            .on_get("/api/v1/namespaces/c1", 200, &namespace_json("c1"))
            .on_patch(
                &format!("{rbac}/roles/c1"),
                200,
                &json!({"apiVersion": "rbac.authorization.k8s.io/v1", "kind": "Role", "metadata": {"name": "c1"}}).to_string(),
            )
            .on_patch(
                &format!("{rbac}/rolebindings/c1"),
                200,
                &json!({
                    "apiVersion": "rbac.authorization.k8s.io/v1",
                    "kind": "RoleBinding",
                    "metadata": {"name": "c1"},
                    "roleRef": {"apiGroup": "rbac.authorization.k8s.io", "kind": "Role", "name": "c1"}
                })
                .to_string(),
            )
            .on_patch(&format!("{JOIN_PATH}/clusterjoin-abc/status"), 200, &join_json());
        let ctx = Arc::new(JoinApprovalReconciler::new(mock.clone().into_client(), &hub_config(false)));

        reconcile(Arc::new(request(spec("c1", "c1"), None)), ctx).await.unwrap();

        assert_eq!(mock.requests_to("PATCH", &format!("{rbac}/roles/c1")).len(), 1);
        let bindings = mock.requests_to("PATCH", &format!("{rbac}/rolebindings/c1"));
        assert_eq!(bindings[0].json()["subjects"][0]["name"], "hcm:clusters:c1:c1");

        let status = mock.requests_to("PATCH", &format!("{JOIN_PATH}/clusterjoin-abc/status"));
        let body = status[0].json();
        assert_eq!(body["status"]["phase"], "Approved");
        assert_eq!(body["status"]["certificate"], STANDARD.encode("signed"));
        assert_eq!(body["status"]["conditions"][0]["reason"], "ok");
    }

    #[tokio::test]
    async fn test_expired_certificate_is_resigned() {
        let ca = TestCa::new();
        let request_spec = spec("c1", "c1");
        let csr_pem = String::from_utf8(request_spec.request.0.clone()).unwrap();
        let cert = ca.sign(&csr_pem, (2020, 1, 1), (2020, 1, 2));
        let mut approved = serde_json::to_value(request(
            request_spec,
            Some(ClusterJoinRequestStatus {
                phase: JoinPhase::Approved,
                certificate: Some(ByteString(cert.into_bytes())),
                conditions: vec![],
            }),
        ))
        .unwrap();
        approved["apiVersion"] = json!("mcm.ibm.com/v1beta1");
        approved["kind"] = json!("ClusterJoinRequest");

        let mock = MockService::new()
            .on_get(JOIN_PATH, 200, &list_json("ClusterJoinRequest", "mcm.ibm.com/v1beta1", vec![approved]))
            .on_delete(&format!("{CSR_PATH}/clusterjoin-abc"), 200, &status_success_json())
            .on_post(CSR_PATH, 201, &csr_json(json!([]), None))
            .on_patch(
                &format!("{CSR_PATH}/clusterjoin-abc/approval"),
                200,
                &csr_json(json!([{"type": "Approved", "status": "True"}]), None),
            );
        let reconciler = JoinApprovalReconciler::new(mock.clone().into_client(), &hub_config(false));

        reconciler.validate_once().await;

        assert_eq!(mock.requests_to("DELETE", CSR_PATH).len(), 1);
        assert_eq!(mock.requests_to("POST", CSR_PATH).len(), 1);
        let approvals = mock.requests_to("PATCH", &format!("{CSR_PATH}/clusterjoin-abc/approval"));
        assert_eq!(approvals[0].json()["status"]["conditions"][0]["reason"], "ClusterJoinRenewed");
    }
}

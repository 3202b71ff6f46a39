// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Filing a join request and waiting for the hub to sign it.

use crate::constants::annotations;
use crate::error::{is_already_exists, McmError, Result};
use crate::pki::digest::join_request_name;
use crate::pki::{ClientKey, Subject, CLIENT_USAGES};
use crate::types::join_request::{
    ClusterJoinRequest, ClusterJoinRequestSpec, ClusterJoinRequestStatus, JoinPhase,
};
use futures::{pin_mut, TryStreamExt};
use k8s_openapi::ByteString;
use kube::api::{ObjectMeta, PostParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Who is asking to join
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterIdentity {
    pub namespace: String,
    pub name: String,
}

impl ClusterIdentity {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn subject(&self) -> Subject {
        Subject::for_cluster(&self.namespace, &self.name)
    }

    /// Name of the join request this key would file
    pub fn request_name(&self, key: &ClientKey) -> Result<String> {
        Ok(join_request_name(&key.der()?, &self.subject(), &CLIENT_USAGES))
    }
}

/// File a join request for `key` and block until it is approved.
///
/// Filing the same key twice reuses the existing request. Returns the PEM
/// encoded certificate, [`McmError::Denied`] if the hub refused, or
/// [`McmError::Timeout`] once `timeout` has elapsed.
#[instrument(skip(client, identity, key), fields(cluster = %identity.name))]
pub async fn request_client_cert(
    client: &Client,
    identity: &ClusterIdentity,
    key: &ClientKey,
    renewal: bool,
    timeout: Duration,
) -> Result<Vec<u8>> {
    let api: Api<ClusterJoinRequest> = Api::all(client.clone());
    let name = identity.request_name(key)?;
    let csr = key.csr_pem(&identity.subject())?;

    let request = build_request(&name, identity, csr.into_bytes(), renewal);
    match api.create(&PostParams::default(), &request).await {
        Ok(_) => info!("Filed join request {}", name),
        Err(e) if is_already_exists(&e) => info!("Join request {} already exists, reusing", name),
        Err(e) => return Err(e.into()),
    }

    tokio::time::timeout(timeout, wait_for_certificate(api, &name))
        .await
        .map_err(|_| McmError::Timeout(format!("join request {name} was not approved in time")))?
}

fn build_request(
    name: &str,
    identity: &ClusterIdentity,
    csr_pem: Vec<u8>,
    renewal: bool,
) -> ClusterJoinRequest {
    let annotations = renewal.then(|| {
        BTreeMap::from([(annotations::RENEWAL.to_string(), "true".to_string())])
    });
    ClusterJoinRequest {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            annotations,
            ..Default::default()
        },
        spec: ClusterJoinRequestSpec {
            cluster_name: identity.name.clone(),
            cluster_namespace: identity.namespace.clone(),
            request: ByteString(csr_pem),
        },
        status: Some(ClusterJoinRequestStatus::default()),
    }
}

async fn wait_for_certificate(api: Api<ClusterJoinRequest>, name: &str) -> Result<Vec<u8>> {
    let config = watcher::Config::default().fields(&format!("metadata.name={name}"));
    let events = watcher(api, config).default_backoff();
    pin_mut!(events);

    while let Some(event) = events.try_next().await? {
        match event {
            watcher::Event::Apply(request) | watcher::Event::InitApply(request) => {
                if let Some(cert) = outcome(&request)? {
                    return Ok(cert);
                }
                debug!("Join request {} is still {:?}", name, request.phase());
            }
            watcher::Event::Delete(_) => {
                return Err(McmError::NotFound(format!("join request {name} was deleted")));
            }
            watcher::Event::Init | watcher::Event::InitDone => {}
        }
    }
    Err(McmError::Timeout(format!("watch on join request {name} ended")))
}

/// The certificate once approved, an error once denied, None while pending.
pub fn outcome(request: &ClusterJoinRequest) -> Result<Option<Vec<u8>>> {
    match request.phase() {
        JoinPhase::Denied => Err(McmError::Denied(
            request.metadata.name.clone().unwrap_or_default(),
        )),
        JoinPhase::Approved => Ok(request.certificate().map(<[u8]>::to_vec)),
        JoinPhase::Pending => Ok(None),
    }
}

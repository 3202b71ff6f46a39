// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! A managed cluster's live connection to its hub.

use super::join::{request_client_cert, ClusterIdentity};
use crate::constants::timing::{BOOTSTRAP_BACKOFF_MAX_SECS, BOOTSTRAP_BACKOFF_STEP_SECS, JOIN_WAIT_SECS};
use crate::error::{McmError, Result};
use crate::kubernetes::client::{
    build_kubeconfig, client_from_kubeconfig, extract_credentials, serialize_kubeconfig, server_of,
    HubCredentials,
};
use crate::pki::ClientKey;
use crate::types::join_request::ClusterJoinRequest;
use futures::{pin_mut, TryStreamExt};
use kube::config::Kubeconfig;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client};
use parking_lot::RwLock;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Linear backoff used while waiting for the hub to approve a join request
#[derive(Debug, Clone)]
pub struct LinearBackoff {
    current: Duration,
    step: Duration,
    max: Duration,
}

impl LinearBackoff {
    pub fn new(step: Duration, max: Duration) -> Self {
        Self {
            current: step,
            step,
            max,
        }
    }

    /// Delay to wait now; the next one is a step longer, up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current + self.step).min(self.max);
        delay
    }
}

impl Default for LinearBackoff {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(BOOTSTRAP_BACKOFF_STEP_SECS),
            Duration::from_secs(BOOTSTRAP_BACKOFF_MAX_SECS),
        )
    }
}

struct ConnectionState {
    key: ClientKey,
    cert_pem: Vec<u8>,
    kubeconfig: Kubeconfig,
    client: Client,
}

/// Hub address, identity and client, swapped as a unit on rotation.
pub struct ServerConnection {
    identity: ClusterIdentity,
    server: String,
    insecure_skip_tls_verify: bool,
    ca_data: Option<Vec<u8>>,
    state: RwLock<ConnectionState>,
}

impl std::fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConnection")
            .field("identity", &self.identity)
            .field("server", &self.server)
            .finish_non_exhaustive()
    }
}

impl ServerConnection {
    /// Assemble a connection from credentials and a client built for them
    pub fn new(identity: ClusterIdentity, creds: HubCredentials, client: Client) -> Result<Self> {
        let key = ClientKey::from_pem(&creds.key_pem)?;
        let kubeconfig = build_kubeconfig(&creds)?;
        Ok(Self {
            identity,
            server: creds.server,
            insecure_skip_tls_verify: creds.insecure_skip_tls_verify,
            ca_data: creds.ca_data,
            state: RwLock::new(ConnectionState {
                key,
                cert_pem: creds.cert_pem,
                kubeconfig,
                client,
            }),
        })
    }

    /// Reconnect with the client config stored in the klusterlet secret.
    pub async fn from_kubeconfig(identity: ClusterIdentity, kubeconfig: Kubeconfig) -> Result<Self> {
        let creds = extract_credentials(&kubeconfig)?;
        let client = client_from_kubeconfig(build_kubeconfig(&creds)?).await?;
        Self::new(identity, creds, client)
    }

    /// Run the join protocol against the hub named by the bootstrap config.
    ///
    /// Retryable failures back off linearly; a denial is returned as is.
    pub async fn bootstrap(
        identity: ClusterIdentity,
        bootstrap: Kubeconfig,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let (server, insecure_skip_tls_verify, ca_data) = server_of(&bootstrap)?;
        let bootstrap_client = client_from_kubeconfig(bootstrap).await?;
        let key = ClientKey::generate()?;
        let mut backoff = LinearBackoff::default();

        let cert_pem = loop {
            let attempt = request_client_cert(
                &bootstrap_client,
                &identity,
                &key,
                false,
                Duration::from_secs(JOIN_WAIT_SECS),
            );
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(McmError::Timeout("bootstrap cancelled".to_string())),
                result = attempt => result,
            };
            match result {
                Ok(cert) => break cert,
                Err(e) if e.is_retryable() => {
                    let delay = backoff.next_delay();
                    info!("Waiting for hub {} to approve join request: {}", server, e);
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(McmError::Timeout("bootstrap cancelled".to_string())),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        };

        let creds = HubCredentials {
            server,
            insecure_skip_tls_verify,
            ca_data,
            cert_pem,
            key_pem: key.pem().as_bytes().to_vec(),
        };
        let client = client_from_kubeconfig(build_kubeconfig(&creds)?).await?;
        info!("Joined hub {}", creds.server);
        Self::new(identity, creds, client)
    }

    pub fn identity(&self) -> &ClusterIdentity {
        &self.identity
    }

    pub fn host(&self) -> &str {
        &self.server
    }

    pub fn client(&self) -> Client {
        self.state.read().client.clone()
    }

    pub fn key(&self) -> ClientKey {
        self.state.read().key.clone()
    }

    pub fn cert_pem(&self) -> Vec<u8> {
        self.state.read().cert_pem.clone()
    }

    pub fn credentials(&self) -> HubCredentials {
        let state = self.state.read();
        HubCredentials {
            server: self.server.clone(),
            insecure_skip_tls_verify: self.insecure_skip_tls_verify,
            ca_data: self.ca_data.clone(),
            cert_pem: state.cert_pem.clone(),
            key_pem: state.key.pem().as_bytes().to_vec(),
        }
    }

    /// Serialized client config as stored in the klusterlet secret
    pub fn kubeconfig_bytes(&self) -> Result<Vec<u8>> {
        serialize_kubeconfig(&self.state.read().kubeconfig)
    }

    /// Swap in a new key and certificate and rebuild the hub client.
    pub async fn rotate(&self, key: ClientKey, cert_pem: Vec<u8>) -> Result<()> {
        let creds = HubCredentials {
            key_pem: key.pem().as_bytes().to_vec(),
            cert_pem,
            ..self.credentials()
        };
        let kubeconfig = build_kubeconfig(&creds)?;
        let client = client_from_kubeconfig(kubeconfig.clone()).await?;

        let mut state = self.state.write();
        state.key = key;
        state.cert_pem = creds.cert_pem;
        state.kubeconfig = kubeconfig;
        state.client = client;
        Ok(())
    }

    /// Watch this connection's join request and adopt certificates the hub
    /// re-signs for it, sending on `rotated` after each swap.
    pub async fn monitor_join_request(&self, rotated: mpsc::Sender<()>, cancel: CancellationToken) {
        let name = match self.identity.request_name(&self.key()) {
            Ok(name) => name,
            Err(e) => {
                error!("Cannot derive join request name: {}", e);
                return;
            }
        };
        let api: Api<ClusterJoinRequest> = Api::all(self.client());
        let config = watcher::Config::default().fields(&format!("metadata.name={name}"));
        let events = watcher(api, config).default_backoff().applied_objects();
        pin_mut!(events);

        debug!("Monitoring join request {}", name);
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return,
                next = events.try_next() => next,
            };
            let request = match next {
                Ok(Some(request)) => request,
                Ok(None) => return,
                Err(e) => {
                    warn!("Join request watch failed: {}", e);
                    continue;
                }
            };
            let Some(cert) = request.certificate() else {
                continue;
            };
            if cert == self.cert_pem().as_slice() {
                continue;
            }

            info!("Hub re-signed join request {}, rotating client certificate", name);
            if let Err(e) = self.rotate(self.key(), cert.to_vec()).await {
                error!("Failed to adopt re-signed certificate: {}", e);
                continue;
            }
            if rotated.send(()).await.is_err() {
                return;
            }
        }
    }
}

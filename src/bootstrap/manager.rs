// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Keeps the klusterlet secret and the local agents in step with the hub connection.

use super::connection::ServerConnection;
use super::join::ClusterIdentity;
use super::renewal::CertManager;
use crate::config::{KlusterletConfig, ObjectKey};
use crate::constants::{KUBECONFIG_KEY, OPERATOR_NAME};
use crate::error::{McmError, Result};
use crate::kubernetes::client::{extract_credentials, kubeconfig_from_secret};
use k8s_openapi::api::core::v1::{Pod, Secret};
use k8s_openapi::ByteString;
use kube::api::{DeleteParams, ListParams, ObjectMeta, Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

const SECRET_RESYNC: Duration = Duration::from_secs(60);

/// Where the manager is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    NoSecret,
    Bootstrapping,
    Connected,
    Reconnecting,
}

pub struct ConnectionManager {
    client: Client,
    identity: ClusterIdentity,
    bootstrap_secret: ObjectKey,
    klusterlet_secret: ObjectKey,
    agent_namespace: String,
    agent_selector: String,
    state: ConnectionState,
    connection_tx: watch::Sender<Option<Arc<ServerConnection>>>,
}

impl ConnectionManager {
    /// Returns the manager and a receiver that yields the connection once established.
    pub fn new(
        client: Client,
        config: &KlusterletConfig,
    ) -> (Self, watch::Receiver<Option<Arc<ServerConnection>>>) {
        let (connection_tx, connection_rx) = watch::channel(None);
        let manager = Self {
            client,
            identity: ClusterIdentity::new(&config.cluster_namespace, &config.cluster_name),
            bootstrap_secret: config.bootstrap_secret.clone(),
            klusterlet_secret: config.klusterlet_secret.clone(),
            agent_namespace: config.agent_namespace.clone(),
            agent_selector: config.agent_selector.clone(),
            state: ConnectionState::NoSecret,
            connection_tx,
        };
        (manager, connection_rx)
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn transition(&mut self, state: ConnectionState) {
        if self.state != state {
            info!("Connection state {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) -> anyhow::Result<()> {
        let conn = Arc::new(self.connect(&cancel).await?);
        self.connection_tx.send_replace(Some(conn.clone()));
        self.transition(ConnectionState::Connected);

        let (rotated_tx, mut rotated_rx) = mpsc::channel(8);
        let certs = Arc::new(CertManager::new(conn.clone(), rotated_tx.clone()));
        let cert_task = {
            let certs = certs.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { certs.run(cancel).await })
        };

        let mut monitor = self.spawn_monitor(&conn, rotated_tx.clone(), &cancel);
        let mut resync = tokio::time::interval(SECRET_RESYNC);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(()) = rotated_rx.recv() => {
                    // Key may have changed, so the join request name did too
                    monitor.cancel();
                    monitor = self.spawn_monitor(&conn, rotated_tx.clone(), &cancel);
                    certs.restart();
                    self.reconcile_secret(&conn).await;
                }
                _ = resync.tick() => self.reconcile_secret(&conn).await,
            }
        }

        monitor.cancel();
        let _ = cert_task.await;
        Ok(())
    }

    fn spawn_monitor(
        &self,
        conn: &Arc<ServerConnection>,
        rotated: mpsc::Sender<()>,
        cancel: &CancellationToken,
    ) -> CancellationToken {
        let token = cancel.child_token();
        let conn = conn.clone();
        let child = token.clone();
        tokio::spawn(async move { conn.monitor_join_request(rotated, child).await });
        token
    }

    /// Reuse the stored client config, or bootstrap a new one.
    async fn connect(&mut self, cancel: &CancellationToken) -> Result<ServerConnection> {
        let existing = self
            .secrets(&self.klusterlet_secret)
            .get_opt(&self.klusterlet_secret.name)
            .await?;
        if let Some(secret) = existing {
            self.transition(ConnectionState::Reconnecting);
            info!("Klusterlet secret {} exists, skipping bootstrap", self.klusterlet_secret);
            let conn = ServerConnection::from_kubeconfig(self.identity.clone(), kubeconfig_from_secret(&secret)?).await?;
            info!("Hub {} connected", conn.host());
            return Ok(conn);
        }

        self.transition(ConnectionState::NoSecret);
        let bootstrap = self
            .secrets(&self.bootstrap_secret)
            .get_opt(&self.bootstrap_secret.name)
            .await?
            .ok_or_else(|| McmError::NotFound(format!("bootstrap secret {}", self.bootstrap_secret)))?;

        self.transition(ConnectionState::Bootstrapping);
        let conn = ServerConnection::bootstrap(self.identity.clone(), kubeconfig_from_secret(&bootstrap)?, cancel).await?;
        self.write_secret(&conn).await?;
        self.restart_agents().await?;
        info!("Bootstrap completed");
        Ok(conn)
    }

    fn secrets(&self, key: &ObjectKey) -> Api<Secret> {
        Api::namespaced(self.client.clone(), &key.namespace)
    }

    /// Rewrite the klusterlet secret and restart agents when it drifted.
    #[instrument(skip(self, conn))]
    async fn reconcile_secret(&self, conn: &ServerConnection) {
        let changed = match self.secret_differs(conn).await {
            Ok(changed) => changed,
            Err(e) => {
                warn!("Failed to read klusterlet secret: {}", e);
                return;
            }
        };
        if !changed {
            debug!("Klusterlet secret is up to date");
            return;
        }
        if let Err(e) = self.write_secret(conn).await {
            error!("Failed to update klusterlet secret: {}", e);
            return;
        }
        match self.restart_agents().await {
            Ok(()) => info!("Klusterlet secret updated, agents restarted"),
            Err(e) => error!("Failed to restart agents: {}", e),
        }
    }

    async fn secret_differs(&self, conn: &ServerConnection) -> Result<bool> {
        let Some(secret) = self.secrets(&self.klusterlet_secret).get_opt(&self.klusterlet_secret.name).await? else {
            return Ok(true);
        };
        let stored = kubeconfig_from_secret(&secret).and_then(|c| extract_credentials(&c));
        Ok(stored.map(|creds| creds != conn.credentials()).unwrap_or(true))
    }

    async fn write_secret(&self, conn: &ServerConnection) -> Result<()> {
        let secret = klusterlet_secret(&self.klusterlet_secret, conn.kubeconfig_bytes()?);
        self.secrets(&self.klusterlet_secret)
            .patch(
                &self.klusterlet_secret.name,
                &PatchParams::apply(OPERATOR_NAME).force(),
                &Patch::Apply(&secret),
            )
            .await?;
        info!("Klusterlet secret {} written", self.klusterlet_secret);
        Ok(())
    }

    /// Delete agent pods so their controllers recreate them with the new config.
    async fn restart_agents(&self) -> Result<()> {
        if self.agent_selector.is_empty() {
            return Ok(());
        }
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.agent_namespace);
        let list = pods.list(&ListParams::default().labels(&self.agent_selector)).await?;
        for pod in list.items {
            let name = pod.name_any();
            match pods.delete(&name, &DeleteParams::default()).await {
                Ok(_) => debug!("Deleted agent pod {}", name),
                Err(e) => error!("Failed to delete agent pod {}: {}", name, e),
            }
        }
        Ok(())
    }
}

fn klusterlet_secret(key: &ObjectKey, kubeconfig: Vec<u8>) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(key.name.clone()),
            namespace: Some(key.namespace.clone()),
            labels: Some(BTreeMap::from([("component".to_string(), "operator".to_string())])),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(KUBECONFIG_KEY.to_string(), ByteString(kubeconfig))])),
        ..Default::default()
    }
}

// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Client certificate rotation ahead of expiry.

use super::connection::ServerConnection;
use super::join::request_client_cert;
use crate::constants::timing::{JOIN_WAIT_SECS, RENEWAL_POLL_SECS};
use crate::error::Result;
use crate::pki::jitter::rotation_deadline;
use crate::pki::{CertInfo, ClientKey};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Renews the connection's certificate at a jittered point in its lifetime.
pub struct CertManager {
    conn: Arc<ServerConnection>,
    restart: Notify,
    rotated: mpsc::Sender<()>,
    poll_interval: Duration,
}

enum Wake {
    Deadline,
    Restart,
    Cancelled,
}

impl CertManager {
    pub fn new(conn: Arc<ServerConnection>, rotated: mpsc::Sender<()>) -> Self {
        Self {
            conn,
            restart: Notify::new(),
            rotated,
            poll_interval: Duration::from_secs(RENEWAL_POLL_SECS),
        }
    }

    /// Abandon the current wait and recompute the next deadline
    pub fn restart(&self) {
        self.restart.notify_one();
    }

    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            let cert = match CertInfo::from_pem(&self.conn.cert_pem()) {
                Ok(cert) => cert,
                Err(e) => {
                    warn!("Unable to read current client certificate: {}", e);
                    match self.sleep(Duration::from_secs(1), &cancel).await {
                        Wake::Cancelled => return,
                        _ => continue,
                    }
                }
            };

            let deadline = rotation_deadline(&cert);
            let wait = (deadline - Utc::now()).to_std().unwrap_or_default();
            if !wait.is_zero() {
                info!("Next certificate rotation in {}s", wait.as_secs());
                match self.sleep(wait, &cancel).await {
                    Wake::Cancelled => return,
                    Wake::Restart => {
                        debug!("Certificate rotation restarted");
                        continue;
                    }
                    Wake::Deadline => {}
                }
            }

            if let Wake::Cancelled = self.rotate(&cancel).await {
                return;
            }
        }
    }

    /// Keep trying until a new certificate is in place.
    async fn rotate(&self, cancel: &CancellationToken) -> Wake {
        let key = match ClientKey::generate() {
            Ok(key) => key,
            Err(e) => {
                warn!("Unable to generate a private key: {}", e);
                return self.sleep(self.poll_interval, cancel).await;
            }
        };

        loop {
            let attempt = tokio::select! {
                _ = cancel.cancelled() => return Wake::Cancelled,
                _ = self.restart.notified() => return Wake::Restart,
                result = self.rotate_once(&key) => result,
            };
            match attempt {
                Ok(()) => return Wake::Deadline,
                Err(e) => {
                    warn!("Unable to rotate client certificate: {}", e);
                    match self.sleep(self.poll_interval, cancel).await {
                        Wake::Deadline => {}
                        other => return other,
                    }
                }
            }
        }
    }

    #[instrument(skip(self, key))]
    async fn rotate_once(&self, key: &ClientKey) -> Result<()> {
        info!("Rotating client certificate");
        let cert = request_client_cert(
            &self.conn.client(),
            self.conn.identity(),
            key,
            true,
            Duration::from_secs(JOIN_WAIT_SECS),
        )
        .await?;
        self.conn.rotate(key.clone(), cert).await?;
        info!("Client certificate renewed");
        // Receiver gone means nobody persists the config anymore
        let _ = self.rotated.send(()).await;
        Ok(())
    }

    async fn sleep(&self, duration: Duration, cancel: &CancellationToken) -> Wake {
        tokio::select! {
            _ = cancel.cancelled() => Wake::Cancelled,
            _ = self.restart.notified() => Wake::Restart,
            _ = tokio::time::sleep(duration) => Wake::Deadline,
        }
    }
}

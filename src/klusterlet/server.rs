// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! HTTPS surface of the klusterlet: container logs and monitoring queries,
//! proxied for the hub.
//!
//! ```text
//! hub ──TLS──► /containerLogs/{ns}/{pod}/{container} ──► LogDriver ──► pods/log
//!          └─► /monitoring/{path}                    ──► MonitorDriver ──► services/proxy
//! ```
//!
//! Every request is authenticated and authorized through an [`Authenticator`]
//! before a driver sees it. The TLS client-CA pool follows the
//! `klusterletCA` the hub publishes on this cluster's ClusterStatus.

use super::status::ReadySignal;
use crate::config::KlusterletConfig;
use crate::error::{McmError, Result};
use crate::kubernetes::dynamic::Identity;
use crate::pki;
use anyhow::Context;
use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{Path, RawQuery, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use bytes::Bytes;
use futures::stream::{self, BoxStream};
use futures::{AsyncBufReadExt, StreamExt};
use k8s_openapi::api::authentication::v1::{TokenReview, TokenReviewSpec};
use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SubjectAccessReview, SubjectAccessReviewSpec,
};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{LogParams, PostParams};
use kube::{Api, Client};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{
    CertificateDer, PrivateKeyDer, PrivatePkcs1KeyDer, PrivatePkcs8KeyDer, PrivateSec1KeyDer,
};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How often mounted certificate files are checked for changes
const CERT_POLL_INTERVAL: Duration = Duration::from_secs(30);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
const LOG_BUFFER: usize = 64;

/// Streamed response payload of a driver
pub type ByteStream = BoxStream<'static, std::result::Result<Bytes, std::io::Error>>;

/// What a request wants to do, in SubjectAccessReview terms
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RequestAttributes {
    pub verb: String,
    pub namespace: Option<String>,
    pub resource: String,
    pub subresource: Option<String>,
    pub name: Option<String>,
}

impl RequestAttributes {
    fn container_logs(namespace: &str, pod: &str) -> Self {
        Self {
            verb: "get".to_string(),
            namespace: Some(namespace.to_string()),
            resource: "pods".to_string(),
            subresource: Some("log".to_string()),
            name: Some(pod.to_string()),
        }
    }

    fn monitoring() -> Self {
        Self {
            verb: "get".to_string(),
            resource: "services/proxy".to_string(),
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// The caller behind the request headers, or None when unauthenticated.
    async fn authenticate(&self, headers: &HeaderMap) -> Result<Option<Identity>>;

    async fn authorize(&self, user: &Identity, attributes: &RequestAttributes) -> Result<bool>;
}

#[async_trait]
pub trait LogDriver: Send + Sync {
    async fn container_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        query: Option<&str>,
    ) -> Result<ByteStream>;
}

#[async_trait]
pub trait MonitorDriver: Send + Sync {
    async fn metrics(&self, path: &str, query: Option<&str>) -> Result<ByteStream>;
}

/// Bearer tokens checked with a TokenReview, access with a SubjectAccessReview.
pub struct ApiServerAuthenticator {
    client: Client,
}

impl ApiServerAuthenticator {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

#[async_trait]
impl Authenticator for ApiServerAuthenticator {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<Option<Identity>> {
        let Some(token) = bearer_token(headers) else {
            return Ok(None);
        };
        let review = TokenReview {
            spec: TokenReviewSpec {
                token: Some(token.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let api: Api<TokenReview> = Api::all(self.client.clone());
        let response = api.create(&PostParams::default(), &review).await?;
        let Some(status) = response.status.filter(|s| s.authenticated == Some(true)) else {
            return Ok(None);
        };
        let user = status.user.unwrap_or_default();
        Ok(Some(Identity {
            user: user.username.unwrap_or_default(),
            groups: user.groups.unwrap_or_default(),
        }))
    }

    async fn authorize(&self, user: &Identity, attributes: &RequestAttributes) -> Result<bool> {
        let review = SubjectAccessReview {
            spec: SubjectAccessReviewSpec {
                user: Some(user.user.clone()),
                groups: Some(user.groups.clone()),
                resource_attributes: Some(ResourceAttributes {
                    verb: Some(attributes.verb.clone()),
                    namespace: attributes.namespace.clone(),
                    resource: Some(attributes.resource.clone()),
                    subresource: attributes.subresource.clone(),
                    name: attributes.name.clone(),
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

/// Log parameters understood by the pods/log subresource.
pub fn log_params(container: &str, query: Option<&str>) -> LogParams {
    let mut params = LogParams {
        container: Some(container.to_string()),
        ..Default::default()
    };
    let pairs = url::form_urlencoded::parse(query.unwrap_or_default().as_bytes());
    for (key, value) in pairs {
        let flag = value.is_empty() || value == "true" || value == "1";
        match key.as_ref() {
            "follow" => params.follow = flag,
            "previous" => params.previous = flag,
            "timestamps" => params.timestamps = flag,
            "pretty" => params.pretty = flag,
            "tailLines" => params.tail_lines = value.parse().ok(),
            "sinceSeconds" => params.since_seconds = value.parse().ok(),
            "limitBytes" => params.limit_bytes = value.parse().ok(),
            _ => debug!("Ignoring log parameter {}", key),
        }
    }
    params
}

fn channel_stream(rx: mpsc::Receiver<std::result::Result<Bytes, std::io::Error>>) -> ByteStream {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|chunk| (chunk, rx)) }).boxed()
}

/// Streams container logs from the local API server.
pub struct PodLogDriver {
    client: Client,
}

impl PodLogDriver {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl LogDriver for PodLogDriver {
    async fn container_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        query: Option<&str>,
    ) -> Result<ByteStream> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = log_params(container, query);
        let pod = pod.to_string();
        let (opened_tx, opened_rx) = oneshot::channel();
        let (tx, rx) = mpsc::channel(LOG_BUFFER);

        tokio::spawn(async move {
            let reader = match pods.log_stream(&pod, &params).await {
                Ok(reader) => {
                    let _ = opened_tx.send(Ok(()));
                    reader
                }
                Err(e) => {
                    let _ = opened_tx.send(Err(e));
                    return;
                }
            };
            let mut lines = std::pin::pin!(reader.lines());
            while let Some(line) = lines.next().await {
                let chunk = line.map(|mut l| {
                    l.push('\n');
                    Bytes::from(l)
                });
                if tx.send(chunk).await.is_err() {
                    debug!("Log reader for pod {} went away", pod);
                    break;
                }
            }
        });

        opened_rx
            .await
            .map_err(|_| McmError::DriverError("log stream closed before opening".to_string()))??;
        Ok(channel_stream(rx))
    }
}

/// `ns/name:port` of the service metrics queries are proxied to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitoringService {
    pub namespace: String,
    pub name: String,
    pub port: String,
}

impl MonitoringService {
    pub fn parse(raw: &str) -> Option<Self> {
        let (namespace, rest) = raw.split_once('/')?;
        let (name, port) = rest.split_once(':')?;
        if namespace.is_empty() || name.is_empty() || port.is_empty() {
            return None;
        }
        Some(Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            port: port.to_string(),
        })
    }

    fn proxy_path(&self, path: &str, query: Option<&str>) -> String {
        let mut url = format!(
            "/api/v1/namespaces/{}/services/{}:{}/proxy/{}",
            self.namespace,
            self.name,
            self.port,
            path.trim_start_matches('/')
        );
        if let Some(query) = query.filter(|q| !q.is_empty()) {
            url.push('?');
            url.push_str(query);
        }
        url
    }
}

/// Forwards metrics queries through the API server's service proxy.
pub struct ServiceProxyMonitor {
    client: Client,
    service: Option<MonitoringService>,
}

impl ServiceProxyMonitor {
    pub fn new(client: Client, service: Option<MonitoringService>) -> Self {
        Self { client, service }
    }
}

#[async_trait]
impl MonitorDriver for ServiceProxyMonitor {
    async fn metrics(&self, path: &str, query: Option<&str>) -> Result<ByteStream> {
        let service = self
            .service
            .as_ref()
            .ok_or_else(|| McmError::DriverError("no monitoring service configured".to_string()))?;
        let request = http::Request::get(service.proxy_path(path, query))
            .body(Vec::new())
            .map_err(|e| McmError::Validation(e.to_string()))?;
        let text = self.client.request_text(request).await?;
        Ok(stream::once(async move { Ok(Bytes::from(text)) }).boxed())
    }
}

#[derive(Clone)]
struct ServerState {
    auth: Arc<dyn Authenticator>,
    logs: Arc<dyn LogDriver>,
    monitor: Arc<dyn MonitorDriver>,
}

fn empty(status: StatusCode) -> Response {
    status.into_response()
}

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, message).into_response()
}

fn streamed(body: ByteStream) -> Response {
    ([(header::CONTENT_TYPE, "text/plain")], Body::from_stream(body)).into_response()
}

/// Access failures carry no downstream content.
fn denied(e: &McmError) -> Response {
    match e {
        McmError::Unauthorized(_) => empty(StatusCode::UNAUTHORIZED),
        McmError::Forbidden(_) => empty(StatusCode::FORBIDDEN),
        _ => empty(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

impl ServerState {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<Identity> {
        match self.auth.authenticate(headers).await {
            Ok(Some(user)) => Ok(user),
            Ok(None) => Err(McmError::Unauthorized("no valid credentials".to_string())),
            Err(e) => {
                error!("Unable to authenticate request: {}", e);
                Err(McmError::Unauthorized(e.to_string()))
            }
        }
    }

    async fn authorize(&self, user: &Identity, attributes: &RequestAttributes) -> Result<()> {
        match self.auth.authorize(user, attributes).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                warn!(
                    "Forbidden (user={}, verb={}, resource={}, subresource={:?})",
                    user.user, attributes.verb, attributes.resource, attributes.subresource
                );
                Err(McmError::Forbidden(user.user.clone()))
            }
            Err(e) => {
                error!("Authorization of {} failed: {}", user.user, e);
                Err(e)
            }
        }
    }
}

async fn container_logs(
    State(state): State<ServerState>,
    Path(path): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    serve_logs(state, &path, query, headers).await
}

async fn container_logs_root(State(state): State<ServerState>, headers: HeaderMap) -> Response {
    serve_logs(state, "", None, headers).await
}

async fn serve_logs(state: ServerState, path: &str, query: Option<String>, headers: HeaderMap) -> Response {
    let user = match state.authenticate(&headers).await {
        Ok(user) => user,
        Err(e) => return denied(&e),
    };

    let mut segments = path.split('/');
    let (namespace, pod, container) = match (segments.next(), segments.next(), segments.next(), segments.next()) {
        (Some(ns), Some(pod), Some(container), None)
            if !ns.is_empty() && !pod.is_empty() && !container.is_empty() =>
        {
            (ns, pod, container)
        }
        _ => return bad_request(r#"{"message": "Missing podNamespace, podID or container name."}"#.to_string()),
    };

    if let Err(e) = state
        .authorize(&user, &RequestAttributes::container_logs(namespace, pod))
        .await
    {
        return denied(&e);
    }

    match state.logs.container_logs(namespace, pod, container, query.as_deref()).await {
        Ok(body) => streamed(body),
        Err(e) => {
            error!("Failed to get logs of {}/{}/{}: {}", namespace, pod, container, e);
            bad_request(e.to_string())
        }
    }
}

async fn monitoring(
    State(state): State<ServerState>,
    Path(query_path): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    let user = match state.authenticate(&headers).await {
        Ok(user) => user,
        Err(e) => return denied(&e),
    };
    if let Err(e) = state.authorize(&user, &RequestAttributes::monitoring()).await {
        return denied(&e);
    }
    match state.monitor.metrics(&query_path, query.as_deref()).await {
        Ok(body) => streamed(body),
        Err(e) => {
            error!("Failed to get monitoring data for {}: {}", query_path, e);
            bad_request(e.to_string())
        }
    }
}

/// Routes of the klusterlet HTTPS surface.
pub fn router(
    auth: Arc<dyn Authenticator>,
    logs: Arc<dyn LogDriver>,
    monitor: Arc<dyn MonitorDriver>,
) -> Router {
    Router::new()
        .route("/containerLogs", get(container_logs_root))
        .route("/containerLogs/", get(container_logs_root))
        .route("/containerLogs/{*path}", get(container_logs))
        .route("/monitoring/{*query_path}", get(monitoring))
        .with_state(ServerState { auth, logs, monitor })
}

fn tls_error(e: impl std::fmt::Display) -> McmError {
    McmError::PkiError(format!("invalid TLS configuration: {e}"))
}

fn certificates(pem_data: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let certs: Vec<_> = ::pem::parse_many(pem_data)
        .map_err(tls_error)?
        .into_iter()
        .filter(|b| b.tag() == "CERTIFICATE")
        .map(|b| CertificateDer::from(b.into_contents()))
        .collect();
    if certs.is_empty() {
        return Err(tls_error("no certificates found"));
    }
    Ok(certs)
}

fn private_key(pem_data: &[u8]) -> Result<PrivateKeyDer<'static>> {
    for block in ::pem::parse_many(pem_data).map_err(tls_error)? {
        let key = match block.tag() {
            "PRIVATE KEY" => PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(block.into_contents())),
            "RSA PRIVATE KEY" => PrivateKeyDer::Pkcs1(PrivatePkcs1KeyDer::from(block.into_contents())),
            "EC PRIVATE KEY" => PrivateKeyDer::Sec1(PrivateSec1KeyDer::from(block.into_contents())),
            _ => continue,
        };
        return Ok(key);
    }
    Err(tls_error("no private key found"))
}

/// Build the rustls server config. With a client CA, presented client
/// certificates must chain to it.
pub fn tls_config(cert_pem: &[u8], key_pem: &[u8], client_ca: Option<&[u8]>) -> Result<ServerConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ServerConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(tls_error)?;

    let builder = match client_ca.filter(|ca| !ca.is_empty()) {
        Some(ca) => builder.with_client_cert_verifier(client_verifier(ca, provider)?),
        None => builder.with_no_client_auth(),
    };
    let mut config = builder
        .with_single_cert(certificates(cert_pem)?, private_key(key_pem)?)
        .map_err(tls_error)?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}

fn client_verifier(
    ca_pem: &[u8],
    provider: Arc<CryptoProvider>,
) -> Result<Arc<dyn rustls::server::danger::ClientCertVerifier>> {
    let mut roots = RootCertStore::empty();
    for cert in certificates(ca_pem)? {
        roots.add(cert).map_err(tls_error)?;
    }
    WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
        .allow_unauthenticated()
        .build()
        .map_err(tls_error)
}

/// Serving certificate and key, read from files or generated once.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ServingIdentity {
    cert: Vec<u8>,
    key: Vec<u8>,
}

pub struct KlusterletServer {
    config: KlusterletConfig,
    auth: Arc<dyn Authenticator>,
    logs: Arc<dyn LogDriver>,
    monitor: Arc<dyn MonitorDriver>,
}

impl KlusterletServer {
    /// Server backed by the local API server for authentication and data.
    pub fn new(local: Client, config: KlusterletConfig) -> Self {
        let service = config.monitoring_service.as_deref().and_then(|raw| {
            let parsed = MonitoringService::parse(raw);
            if parsed.is_none() {
                warn!("Ignoring malformed monitoring service '{}'", raw);
            }
            parsed
        });
        Self {
            auth: Arc::new(ApiServerAuthenticator::new(local.clone())),
            logs: Arc::new(PodLogDriver::new(local.clone())),
            monitor: Arc::new(ServiceProxyMonitor::new(local, service)),
            config,
        }
    }

    async fn serving_identity(&self) -> Result<Option<ServingIdentity>> {
        match (&self.config.tls_cert_file, &self.config.tls_key_file) {
            (Some(cert), Some(key)) => Ok(Some(ServingIdentity {
                cert: tokio::fs::read(cert).await?,
                key: tokio::fs::read(key).await?,
            })),
            _ => Ok(None),
        }
    }

    fn serving_hosts(&self) -> Vec<String> {
        let mut hosts = vec!["localhost".to_string()];
        if !self.config.klusterlet_address.is_empty() {
            hosts.push(self.config.klusterlet_address.clone());
        }
        hosts
    }

    /// Serve once the first ClusterStatus is published, until cancelled.
    pub async fn run(self, mut ready: ReadySignal, cancel: CancellationToken) -> anyhow::Result<()> {
        let mut client_ca = loop {
            let published = ready.borrow_and_update().clone();
            if let Some(status) = published {
                break status.spec.klusterlet_ca.map(|ca| ca.0);
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                changed = ready.changed() => changed.context("status publisher stopped before first publish")?,
            }
        };

        let mut identity = match self.serving_identity().await? {
            Some(identity) => identity,
            None => {
                info!("No serving certificate mounted, generating a self-signed one");
                let (cert, key) = pki::self_signed_serving(&self.serving_hosts())?;
                ServingIdentity {
                    cert: cert.into_bytes(),
                    key: key.into_bytes(),
                }
            }
        };
        let config = tls_config(&identity.cert, &identity.key, client_ca.as_deref())?;
        let tls = RustlsConfig::from_config(Arc::new(config));

        let app = router(self.auth.clone(), self.logs.clone(), self.monitor.clone());
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.server_port));
        let handle = axum_server::Handle::new();
        info!(addr = %addr, "Starting klusterlet server");
        let mut server = tokio::spawn(
            axum_server::bind_rustls(addr, tls.clone())
                .handle(handle.clone())
                .serve(app.into_make_service()),
        );

        let mut poll = tokio::time::interval(CERT_POLL_INTERVAL);
        loop {
            let reload = tokio::select! {
                _ = cancel.cancelled() => {
                    handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
                    server.await??;
                    info!("Klusterlet server stopped");
                    return Ok(());
                }
                served = &mut server => {
                    served??;
                    anyhow::bail!("klusterlet server exited");
                }
                changed = ready.changed() => {
                    changed.context("status publisher stopped")?;
                    let ca = ready.borrow_and_update().as_ref().and_then(|s| s.spec.klusterlet_ca.clone()).map(|ca| ca.0);
                    let rotated = ca != client_ca;
                    if rotated {
                        info!("Klusterlet CA changed, reloading client CA pool");
                        client_ca = ca;
                    }
                    rotated
                }
                _ = poll.tick() => match self.serving_identity().await {
                    Ok(Some(current)) if current != identity => {
                        info!("Serving certificate changed on disk");
                        identity = current;
                        true
                    }
                    Ok(_) => false,
                    Err(e) => {
                        warn!("Failed to read serving certificate: {}", e);
                        false
                    }
                },
            };
            if reload {
                match tls_config(&identity.cert, &identity.key, client_ca.as_deref()) {
                    Ok(config) => tls.reload_from_config(Arc::new(config)),
                    Err(e) => error!("Keeping previous TLS config: {}", e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockService;
    use axum::http::Request;
    use parking_lot::Mutex;
    use serde_json::json;
    use tower::ServiceExt;

    struct StaticAuth {
        user: Option<&'static str>,
        allowed: bool,
        seen: Mutex<Vec<RequestAttributes>>,
    }

    impl StaticAuth {
        fn new(user: Option<&'static str>, allowed: bool) -> Arc<Self> {
            Arc::new(Self {
                user,
                allowed,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Authenticator for StaticAuth {
        async fn authenticate(&self, _headers: &HeaderMap) -> Result<Option<Identity>> {
            Ok(self.user.map(|u| Identity {
                user: u.to_string(),
                groups: vec![],
            }))
        }

        async fn authorize(&self, _user: &Identity, attributes: &RequestAttributes) -> Result<bool> {
            self.seen.lock().push(attributes.clone());
            Ok(self.allowed)
        }
    }

    struct EchoLogs;

    #[async_trait]
    impl LogDriver for EchoLogs {
        async fn container_logs(
            &self,
            namespace: &str,
            pod: &str,
            container: &str,
            query: Option<&str>,
        ) -> Result<ByteStream> {
            let lines = vec![
                Ok(Bytes::from(format!("{namespace}/{pod}/{container}\n"))),
                Ok(Bytes::from(format!("{}\n", query.unwrap_or_default()))),
            ];
            Ok(stream::iter(lines).boxed())
        }
    }

    struct FailingMonitor;

    #[async_trait]
    impl MonitorDriver for FailingMonitor {
        async fn metrics(&self, path: &str, _query: Option<&str>) -> Result<ByteStream> {
            Err(McmError::DriverError(format!("no backend for {path}")))
        }
    }

    fn app(auth: Arc<StaticAuth>) -> Router {
        router(auth, Arc::new(EchoLogs), Arc::new(FailingMonitor))
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8_lossy(&body).to_string())
    }

    #[tokio::test]
    async fn test_container_logs_streamed() {
        let auth = StaticAuth::new(Some("admin"), true);
        let (status, body) = get(app(auth.clone()), "/containerLogs/default/web-0/nginx?tailLines=10").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "default/web-0/nginx\ntailLines=10\n");

        let seen = auth.seen.lock();
        assert_eq!(seen[0], RequestAttributes::container_logs("default", "web-0"));
    }

    #[tokio::test]
    async fn test_missing_container_is_bad_request() {
        let auth = StaticAuth::new(Some("admin"), true);
        let (status, _) = get(app(auth.clone()), "/containerLogs/default/web-0").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = get(app(auth), "/containerLogs").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unauthenticated_has_empty_body() {
        let (status, body) = get(app(StaticAuth::new(None, true)), "/containerLogs/default/web-0/nginx").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_forbidden_has_empty_body() {
        let auth = StaticAuth::new(Some("viewer"), false);
        let (status, body) = get(app(auth.clone()), "/monitoring/api/v1/query?query=up").await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(body.is_empty());
        assert_eq!(auth.seen.lock()[0].resource, "services/proxy");
    }

    struct UnreachableReviews;

    #[async_trait]
    impl Authenticator for UnreachableReviews {
        async fn authenticate(&self, _headers: &HeaderMap) -> Result<Option<Identity>> {
            Ok(Some(Identity {
                user: "admin".to_string(),
                groups: vec![],
            }))
        }

        async fn authorize(&self, _user: &Identity, _attributes: &RequestAttributes) -> Result<bool> {
            Err(McmError::DriverError("subject access review unavailable".to_string()))
        }
    }

    #[tokio::test]
    async fn test_authorization_error_is_internal_with_empty_body() {
        let app = router(Arc::new(UnreachableReviews), Arc::new(EchoLogs), Arc::new(FailingMonitor));
        let (status, body) = get(app.clone(), "/containerLogs/default/web-0/nginx").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.is_empty());

        let (status, body) = get(app, "/monitoring/metrics").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.is_empty());
    }

    #[test]
    fn test_denied_maps_access_errors() {
        assert_eq!(
            denied(&McmError::Unauthorized("x".to_string())).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(denied(&McmError::Forbidden("bob".to_string())).status(), StatusCode::FORBIDDEN);
        assert_eq!(
            denied(&McmError::DriverError("x".to_string())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_monitor_failure_is_bad_request() {
        let (status, body) = get(app(StaticAuth::new(Some("admin"), true)), "/monitoring/metrics").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("no backend for metrics"));
    }

    #[test]
    fn test_log_params() {
        let params = log_params("nginx", Some("follow=true&tailLines=20&sinceSeconds=60&timestamps"));
        assert_eq!(params.container.as_deref(), Some("nginx"));
        assert!(params.follow);
        assert!(params.timestamps);
        assert!(!params.previous);
        assert_eq!(params.tail_lines, Some(20));
        assert_eq!(params.since_seconds, Some(60));
    }

    #[test]
    fn test_monitoring_service_proxy_path() {
        let service = MonitoringService::parse("monitoring/prometheus:9090").unwrap();
        assert_eq!(
            service.proxy_path("/api/v1/query", Some("query=up")),
            "/api/v1/namespaces/monitoring/services/prometheus:9090/proxy/api/v1/query?query=up"
        );
        assert!(MonitoringService::parse("prometheus:9090").is_none());
        assert!(MonitoringService::parse("monitoring/prometheus").is_none());
    }

    #[test]
    fn test_bearer_token() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);
        headers.insert(header::AUTHORIZATION, "Bearer abc".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc"));
        headers.insert(header::AUTHORIZATION, "Basic abc".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn test_tls_config_with_and_without_client_ca() {
        let (cert, key) = pki::self_signed_serving(&["localhost".to_string()]).unwrap();
        let ca = pki::test_ca::TestCa::new();

        let open = tls_config(cert.as_bytes(), key.as_bytes(), None).unwrap();
        assert_eq!(open.alpn_protocols.len(), 2);
        assert!(tls_config(cert.as_bytes(), key.as_bytes(), Some(ca.cert_pem().as_bytes())).is_ok());
        assert!(tls_config(cert.as_bytes(), b"", None).is_err());
    }

    #[tokio::test]
    async fn test_token_review_authentication() {
        let mock = MockService::new().on_post(
            "/apis/authentication.k8s.io/v1/tokenreviews",
            201,
            &json!({
                "apiVersion": "authentication.k8s.io/v1",
                "kind": "TokenReview",
                "spec": {"token": "abc"},
                "status": {"authenticated": true, "user": {"username": "alice", "groups": ["devs"]}}
            })
            .to_string(),
        );
        let auth = ApiServerAuthenticator::new(mock.clone().into_client());
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer abc".parse().unwrap());

        let user = auth.authenticate(&headers).await.unwrap().unwrap();
        assert_eq!(user.user, "alice");
        assert_eq!(user.groups, vec!["devs"]);
        assert_eq!(mock.requests()[0].json()["spec"]["token"], "abc");

        assert!(auth.authenticate(&HeaderMap::new()).await.unwrap().is_none());
        assert_eq!(mock.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_subject_access_review_authorization() {
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
        let auth = ApiServerAuthenticator::new(mock.clone().into_client());
        let user = Identity {
            user: "alice".to_string(),
            groups: vec![],
        };

        assert!(auth
            .authorize(&user, &RequestAttributes::container_logs("default", "web-0"))
            .await
            .unwrap());
        let body = mock.requests()[0].json();
        assert_eq!(body["spec"]["resourceAttributes"]["subresource"], "log");
        assert_eq!(body["spec"]["resourceAttributes"]["namespace"], "default");
    }
}

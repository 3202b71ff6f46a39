// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use anyhow::{anyhow, Result};
use kube::Client;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use mcm_foundation::bootstrap::ConnectionManager;
use mcm_foundation::config::{Component, Config, HubConfig, KlusterletConfig, RegistryConfig};
use mcm_foundation::klusterlet::{KlusterletServer, StatusPublisher, WorkReconciler};
use mcm_foundation::kubernetes::dynamic::KubeControl;
use mcm_foundation::kubernetes::{wait_for_crds, RequiredKind};
use mcm_foundation::permission::{PermissionCache, PermissionSyncer};
use mcm_foundation::reconcilers::{
    ClusterHealthMonitor, ClusterReconciler, GarbageCollector, JoinApprovalReconciler, ResourceViewReconciler,
    WorkSetReconciler,
};
use mcm_foundation::registry::ServiceRegistry;
use mcm_foundation::reloader::ApiServerReloader;
use mcm_foundation::types::cluster::Cluster;
use mcm_foundation::types::cluster_permission::ClusterPermission;
use mcm_foundation::types::cluster_status::ClusterStatus;
use mcm_foundation::types::join_request::ClusterJoinRequest;
use mcm_foundation::types::resource_view::ResourceView;
use mcm_foundation::types::work::Work;
use mcm_foundation::types::workset::WorkSet;

type Tasks = JoinSet<(&'static str, anyhow::Result<()>)>;

fn spawn<F>(tasks: &mut Tasks, name: &'static str, task: F)
where
    F: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    tasks.spawn(async move { (name, task.await) });
}

async fn run_hub(client: Client, config: HubConfig, cancel: CancellationToken) -> Result<Tasks> {
    info!("Waiting for hub resource kinds to become available...");
    wait_for_crds(
        &client,
        &[
            RequiredKind::of::<Cluster>(),
            RequiredKind::of::<ClusterJoinRequest>(),
            RequiredKind::of::<ClusterStatus>(),
            RequiredKind::of::<Work>(),
            RequiredKind::of::<WorkSet>(),
            RequiredKind::of::<ResourceView>(),
            RequiredKind::of::<ClusterPermission>(),
        ],
    )
    .await?;

    let mut tasks = Tasks::new();
    spawn(
        &mut tasks,
        "join-approval",
        JoinApprovalReconciler::new(client.clone(), &config).run(cancel.clone()),
    );
    spawn(&mut tasks, "cluster-cleanup", ClusterReconciler::new(client.clone()).run(cancel.clone()));
    spawn(
        &mut tasks,
        "workset",
        WorkSetReconciler::new(client.clone(), &config).run(cancel.clone()),
    );
    spawn(
        &mut tasks,
        "resourceview",
        ResourceViewReconciler::new(client.clone(), &config).run(cancel.clone()),
    );
    spawn(
        &mut tasks,
        "cluster-health",
        ClusterHealthMonitor::new(client.clone(), config.cluster_health_period).run(cancel.clone()),
    );
    spawn(
        &mut tasks,
        "garbage-collector",
        GarbageCollector::new(client.clone(), config.gc_period).run(cancel.clone()),
    );
    let permissions = Arc::new(PermissionCache::new());
    spawn(
        &mut tasks,
        "permission-cache",
        PermissionSyncer::new(client.clone(), permissions, config.permission_resync).run(cancel.clone()),
    );
    if config.reload_apiserver {
        spawn(&mut tasks, "apiserver-reloader", ApiServerReloader::new(client).run(cancel));
    }
    Ok(tasks)
}

async fn run_klusterlet(local: Client, config: KlusterletConfig, cancel: CancellationToken) -> Result<Tasks> {
    let mut tasks = Tasks::new();
    let (manager, mut connection) = ConnectionManager::new(local.clone(), &config);
    spawn(&mut tasks, "connection-manager", manager.run(cancel.clone()));

    info!("Waiting for the hub connection...");
    let hub = tokio::select! {
        _ = cancel.cancelled() => return Ok(tasks),
        conn = connection.wait_for(Option::is_some) => {
            let conn = conn.map_err(|_| anyhow!("connection manager stopped before connecting"))?;
            conn.as_ref().map(|c| c.client()).ok_or_else(|| anyhow!("hub connection missing"))?
        }
    };
    info!("Connected to hub");

    let impersonation = if config.enable_impersonation {
        Some(kube::Config::infer().await?)
    } else {
        None
    };
    let control = KubeControl::new(local.clone(), impersonation);
    spawn(
        &mut tasks,
        "work",
        WorkReconciler::new(
            hub.clone(),
            control,
            &config.cluster_name,
            &config.cluster_namespace,
            config.enable_impersonation,
        )
        .run(cancel.clone()),
    );

    let (publisher, ready) = StatusPublisher::new(hub, local.clone(), config.clone());
    spawn(&mut tasks, "status", publisher.run(cancel.clone()));
    spawn(&mut tasks, "server", KlusterletServer::new(local, config).run(ready, cancel));
    Ok(tasks)
}

fn run_registry(client: Client, config: RegistryConfig, cancel: CancellationToken) -> Tasks {
    let mut tasks = Tasks::new();
    spawn(&mut tasks, "service-registry", ServiceRegistry::new(client, config).run(cancel));
    tasks
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("A rustls crypto provider was already installed");
    }

    let config = Config::from_env()?;
    let client = Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown requested");
            }
            cancel.cancel();
        });
    }

    let mut tasks = match config.component {
        Component::Hub(hub) => {
            info!("Starting hub controllers");
            run_hub(client, hub, cancel.clone()).await?
        }
        Component::Klusterlet(klusterlet) => {
            info!("Starting klusterlet for cluster {}/{}", klusterlet.cluster_namespace, klusterlet.cluster_name);
            run_klusterlet(client, klusterlet, cancel.clone()).await?
        }
        Component::ServiceRegistry(registry) => {
            info!("Starting service registry");
            run_registry(client, registry, cancel.clone())
        }
    };

    // The first task to stop takes the rest down with it
    let mut failed = false;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((name, Ok(()))) => info!("{} stopped", name),
            Ok((name, Err(e))) => {
                error!("{} failed: {:#}", name, e);
                failed = true;
            }
            Err(e) => {
                error!("Task panicked: {}", e);
                failed = true;
            }
        }
        cancel.cancel();
    }

    if failed {
        return Err(anyhow!("one or more components failed"));
    }
    Ok(())
}

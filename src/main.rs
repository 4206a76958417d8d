//! kubefirst-api - control plane for GitOps-managed platform clusters

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kubefirst_api::catalog::{self, CatalogCache};
use kubefirst_api::env::Env;
use kubefirst_api::router::{create_router, AppState};
use kubefirst_api::store::{ClusterStore, KubeSecretsBackend, ServiceListStore, TaskLocks};
use kubefirst_api::types::{Cluster, GitopsCatalogAppCreateRequest};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let env = Env::parse();

    let client = kube::Client::try_default()
        .await
        .context("failed to create kubernetes client")?;
    let backend = Arc::new(KubeSecretsBackend::new(client));
    let store = ClusterStore::new(backend.clone());
    let services = ServiceListStore::new(backend);
    let catalog = CatalogCache::new();

    if env.is_cluster_zero {
        info!("IS_CLUSTER_ZERO is set to true, skipping import cluster logic");
    } else {
        info!("checking for cluster import secret for management cluster");
        match store.import_if_empty(&env).await {
            Ok(Some(imported)) => {
                info!(cluster = %imported.cluster_name, "adding default services for imported cluster");
                if let Err(e) =
                    kubefirst_api::services::add_default_services(&imported, &services).await
                {
                    warn!(error = %e, "failed to seed default services");
                }
                if !imported.post_install_catalog_apps.is_empty() {
                    tokio::spawn(install_post_install_apps(imported, services.clone()));
                }
            }
            Ok(None) => {}
            Err(e) => anyhow::bail!("bootstrap import failed: {e}"),
        }

        // hourly catalog refresh; readers consult the cache first
        tokio::spawn(catalog::run_scheduler(catalog.clone()));
    }

    let state = AppState {
        store,
        services,
        catalog,
        locks: TaskLocks::new(),
        env: env.clone(),
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], env.server_port));
    info!(%addr, "kubefirst api listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, create_router(state))
        .await
        .context("api server exited")?;
    Ok(())
}

/// Replay the catalog apps requested before the platform existed
async fn install_post_install_apps(
    cluster: Cluster,
    services: kubefirst_api::store::ServiceListStore,
) {
    for app in cluster.post_install_catalog_apps.clone() {
        info!(app = %app.name, "installing catalog application");
        let request = GitopsCatalogAppCreateRequest {
            user: "kbot".to_string(),
            secret_keys: app.secret_keys.clone(),
            config_keys: app.config_keys.clone(),
            ..Default::default()
        };
        if let Err(e) =
            kubefirst_api::services::create_service(&cluster, &services, &app, &request, true).await
        {
            warn!(app = %app.name, error = %e, "post-install catalog app failed");
        }
    }
}

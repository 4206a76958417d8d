//! Request handlers

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::error::Error;
use crate::lifecycle::{spawn_logged, ClusterController};
use crate::provider::driver_for;
use crate::router::{ApiError, AppState};
use crate::types::{
    CloudProvider, Cluster, ClusterDefinition, GitopsCatalogAppCreateRequest,
    GitopsCatalogAppDeleteRequest,
};

type HandlerResult<T> = std::result::Result<T, ApiError>;

/// `GET /health`
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

#[derive(Debug, Deserialize)]
pub struct DomainValidationParams {
    #[serde(default)]
    cloud_region: String,
    #[serde(default)]
    token: String,
}

/// `GET /:provider/domain/validate/:domain`
///
/// Credentials arrive as query parameters; a failed provider call means the
/// domain is simply not validated, not an API error.
pub async fn validate_domain(
    State(_state): State<AppState>,
    Path((provider, domain)): Path<(String, String)>,
    Query(params): Query<DomainValidationParams>,
) -> HandlerResult<Json<Value>> {
    let cloud_provider = CloudProvider::parse(&provider).map_err(ApiError)?;

    let mut cluster = Cluster {
        cloud_provider,
        cloud_region: params.cloud_region.clone(),
        domain_name: domain.clone(),
        ..Cluster::default()
    };
    match cloud_provider {
        CloudProvider::Akamai => cluster.akamai_auth.token = params.token.clone(),
        CloudProvider::Civo => cluster.civo_auth.token = params.token.clone(),
        CloudProvider::Digitalocean => cluster.do_auth.token = params.token.clone(),
        CloudProvider::Vultr => cluster.vultr_auth.token = params.token.clone(),
        CloudProvider::Google => cluster.google_auth.key_file = params.token.clone(),
        CloudProvider::K3d | CloudProvider::Aws => {}
    }

    let driver = driver_for(&cluster).map_err(ApiError)?;
    let validated = driver
        .validate_domain_ownership(&domain)
        .await
        .unwrap_or(false);

    let mut body = json!({ "validated": validated });
    if cloud_provider == CloudProvider::Civo {
        body["cloud_region"] = Value::String(params.cloud_region);
    }
    Ok(Json(body))
}

/// `GET /aws/profiles`
pub async fn aws_profiles() -> HandlerResult<Json<Value>> {
    let config_path = dirs::home_dir()
        .unwrap_or_default()
        .join(".aws")
        .join("config");
    let profiles = match std::fs::read_to_string(&config_path) {
        Ok(contents) => parse_aws_profiles(&contents),
        Err(_) => Vec::new(),
    };
    Ok(Json(json!({ "profiles": profiles })))
}

fn parse_aws_profiles(config: &str) -> Vec<String> {
    config
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let inner = line.strip_prefix('[')?.strip_suffix(']')?;
            Some(
                inner
                    .strip_prefix("profile ")
                    .unwrap_or(inner)
                    .to_string(),
            )
        })
        .collect()
}

/// `GET /cluster`
pub async fn list_clusters(State(state): State<AppState>) -> HandlerResult<Json<Vec<Cluster>>> {
    Ok(Json(state.store.list().await?))
}

/// `GET /cluster/:name`
pub async fn get_cluster(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> HandlerResult<Json<Cluster>> {
    Ok(Json(state.store.get(&name).await?))
}

/// `POST /cluster/:name` - 202, provisioning continues in the background
///
/// A brand-new name creates the record; an existing record in `error`
/// resumes from its highest completed checkpoint. The per-name lock is
/// taken before the task is spawned and travels into it.
pub async fn create_cluster(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(definition): Json<ClusterDefinition>,
) -> HandlerResult<StatusCode> {
    definition.validate().map_err(ApiError)?;

    let guard = state
        .locks
        .try_acquire(&name)
        .ok_or_else(|| ApiError(Error::precondition(format!("cluster {name} has a task in progress"))))?;

    let mut controller = match state.store.get(&name).await {
        Ok(existing) => {
            if existing.status == crate::types::ClusterStatus::Provisioned {
                return Err(ApiError(Error::AlreadyExists(name)));
            }
            info!(cluster = %name, "resuming provisioning from last checkpoint");
            ClusterController::resume(
                existing,
                state.store.clone(),
                state.services.clone(),
                state.env.clone(),
            )?
        }
        Err(e) if e.is_not_found() => {
            ClusterController::initialize(
                &name,
                &definition,
                state.store.clone(),
                state.services.clone(),
                state.env.clone(),
            )
            .await?
        }
        Err(e) => return Err(ApiError(e)),
    };

    spawn_logged("cluster-provision", async move {
        let _guard = guard;
        controller.provision().await
    });
    Ok(StatusCode::ACCEPTED)
}

/// `DELETE /cluster/:name` - 202, deletion continues in the background
pub async fn delete_cluster(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> HandlerResult<StatusCode> {
    let cluster = state.store.get(&name).await?;

    let guard = state
        .locks
        .try_acquire(&name)
        .ok_or_else(|| ApiError(Error::precondition(format!("cluster {name} has a task in progress"))))?;

    let mut controller = ClusterController::resume(
        cluster,
        state.store.clone(),
        state.services.clone(),
        state.env.clone(),
    )?;
    spawn_logged("cluster-delete", async move {
        let _guard = guard;
        controller.deprovision().await
    });
    Ok(StatusCode::ACCEPTED)
}

/// `POST /cluster/import` - adopt an already provisioned cluster record
pub async fn import_cluster(
    State(state): State<AppState>,
    Json(cluster): Json<Cluster>,
) -> HandlerResult<StatusCode> {
    if cluster.cluster_name.is_empty() {
        return Err(ApiError(Error::validation("clusterName is required")));
    }
    state.store.create(&cluster).await?;
    crate::services::add_default_services(&cluster, &state.services).await?;
    info!(cluster = %cluster.cluster_name, "cluster imported");
    Ok(StatusCode::ACCEPTED)
}

/// `GET /services/:cluster`
pub async fn list_services(
    State(state): State<AppState>,
    Path(cluster): Path<String>,
) -> HandlerResult<Json<crate::types::ClusterServiceList>> {
    Ok(Json(state.services.get(&cluster).await?))
}

/// `POST /services/:cluster/:app` - 202, install continues in the background
pub async fn create_service(
    State(state): State<AppState>,
    Path((cluster_name, app_name)): Path<(String, String)>,
    Json(request): Json<GitopsCatalogAppCreateRequest>,
) -> HandlerResult<StatusCode> {
    let cluster = state.store.get(&cluster_name).await?;
    if cluster.status != crate::types::ClusterStatus::Provisioned {
        return Err(ApiError(Error::precondition(format!(
            "cannot deploy services to a cluster in {:?} state",
            cluster.status.as_str()
        ))));
    }

    let app = state
        .catalog
        .find(&app_name)
        .await
        .ok_or_else(|| ApiError(Error::NotFound(format!("catalog application {app_name}"))))?;

    let services = state.services.clone();
    spawn_logged("service-install", async move {
        crate::services::create_service(&cluster, &services, &app, &request, false).await
    });
    Ok(StatusCode::ACCEPTED)
}

/// `DELETE /services/:cluster/:app` - 202, removal continues in the background
pub async fn delete_service(
    State(state): State<AppState>,
    Path((cluster_name, app_name)): Path<(String, String)>,
    Json(request): Json<GitopsCatalogAppDeleteRequest>,
) -> HandlerResult<StatusCode> {
    let cluster = state.store.get(&cluster_name).await?;
    // the entry must exist before we tear anything down
    let list = state.services.get(&cluster_name).await?;
    if !list.services.iter().any(|s| s.name == app_name) {
        return Err(ApiError(Error::NotFound(format!(
            "service {app_name} on cluster {cluster_name}"
        ))));
    }

    let services = state.services.clone();
    spawn_logged("service-remove", async move {
        crate::services::delete_service(&cluster, &services, &app_name, &request).await
    });
    Ok(StatusCode::ACCEPTED)
}

/// `GET /gitops-catalog/apps`
pub async fn catalog_apps(
    State(state): State<AppState>,
) -> HandlerResult<Json<crate::types::GitopsCatalogApps>> {
    Ok(Json(state.catalog.get().await))
}

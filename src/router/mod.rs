//! HTTP API surface
//!
//! Thin REST layer over the stores and the lifecycle controller. Mutating
//! endpoints return 202 and run the work as detached tasks; observers poll
//! `GET /cluster/:name` for `status` and `lastCondition`.

mod handlers;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use tower_http::trace::TraceLayer;

use crate::catalog::CatalogCache;
use crate::env::Env;
use crate::error::Error;
use crate::store::{ClusterStore, ServiceListStore, TaskLocks};

/// Shared state for every handler
#[derive(Clone)]
pub struct AppState {
    /// Durable cluster records
    pub store: ClusterStore,
    /// Per-cluster service lists
    pub services: ServiceListStore,
    /// In-memory catalog index
    pub catalog: CatalogCache,
    /// Process-wide mutual exclusion on cluster names
    pub locks: TaskLocks,
    /// Startup environment snapshot
    pub env: Env,
}

/// HTTP projection of the crate error taxonomy
///
/// Client mistakes become 400s, wrong-state calls 409s, missing records
/// 404s; everything else is an opaque 500 - internals are logged, never
/// surfaced.
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            Error::Validation(_) => (StatusCode::BAD_REQUEST, self.0.to_string()),
            Error::NotFound(_) => (StatusCode::NOT_FOUND, self.0.to_string()),
            Error::AlreadyExists(_) | Error::Precondition(_) => {
                (StatusCode::CONFLICT, self.0.to_string())
            }
            _ => {
                tracing::error!(error = %self.0, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

/// Build the application router
pub fn create_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/health", get(handlers::health))
        .route(
            "/{provider}/domain/validate/{domain}",
            get(handlers::validate_domain),
        )
        .route("/aws/profiles", get(handlers::aws_profiles))
        .route("/cluster", get(handlers::list_clusters))
        .route("/cluster/import", post(handlers::import_cluster))
        .route(
            "/cluster/{name}",
            get(handlers::get_cluster)
                .post(handlers::create_cluster)
                .delete(handlers::delete_cluster),
        )
        .route("/services/{cluster}", get(handlers::list_services))
        .route(
            "/services/{cluster}/{app}",
            post(handlers::create_service).delete(handlers::delete_service),
        )
        .route("/gitops-catalog/apps", get(handlers::catalog_apps))
        .with_state(state);

    Router::new()
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::Request;
    use tower::util::ServiceExt;

    use crate::store::memory::MemorySecretsBackend;
    use crate::types::{Cluster, ClusterStatus};
    use clap::Parser;

    pub(crate) fn test_state() -> AppState {
        let backend = Arc::new(MemorySecretsBackend::new());
        AppState {
            store: ClusterStore::new(backend.clone()),
            services: ServiceListStore::new(backend),
            catalog: CatalogCache::new(),
            locks: TaskLocks::new(),
            env: Env::try_parse_from(["kubefirst-api"]).unwrap(),
        }
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_answers_healthy() {
        let app = create_router(test_state());
        let response = app
            .oneshot(
                Request::get("/api/v1/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "healthy");
    }

    #[tokio::test]
    async fn get_missing_cluster_is_404_with_error_body() {
        let app = create_router(test_state());
        let response = app
            .oneshot(
                Request::get("/api/v1/cluster/ghost")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(body_json(response).await["error"]
            .as_str()
            .unwrap()
            .contains("ghost"));
    }

    #[tokio::test]
    async fn cluster_listing_returns_records() {
        let state = test_state();
        state
            .store
            .create(&Cluster {
                cluster_name: "k1".to_string(),
                status: ClusterStatus::Provisioned,
                ..Cluster::default()
            })
            .await
            .unwrap();

        let app = create_router(state);
        let response = app
            .oneshot(Request::get("/api/v1/cluster").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["clusterName"], "k1");
    }

    #[tokio::test]
    async fn create_rejects_malformed_definitions() {
        let app = create_router(test_state());
        let response = app
            .oneshot(
                Request::post("/api/v1/cluster/k1")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"admin_email":"a@b","cloud_provider":"azure","cloud_region":"r",
                           "domain_name":"d.io","git_owner":"o","git_provider":"github",
                           "git_token":"t","type":"mgmt"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn duplicate_run_is_rejected_while_lock_held() {
        let state = test_state();
        state
            .store
            .create(&Cluster {
                cluster_name: "k1".to_string(),
                status: ClusterStatus::Provisioned,
                ..Cluster::default()
            })
            .await
            .unwrap();
        // simulate a lifecycle task already owning the name
        let _guard = state.locks.try_acquire("k1").unwrap();

        let app = create_router(state);
        let response = app
            .oneshot(
                Request::delete("/api/v1/cluster/k1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn delete_accepted_returns_202() {
        let state = test_state();
        state
            .store
            .create(&Cluster {
                cluster_name: "k1".to_string(),
                cloud_provider: crate::types::CloudProvider::Civo,
                status: ClusterStatus::Provisioned,
                ..Cluster::default()
            })
            .await
            .unwrap();

        let app = create_router(state);
        let response = app
            .oneshot(
                Request::delete("/api/v1/cluster/k1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn catalog_endpoint_serves_the_cache() {
        let state = test_state();
        let app = create_router(state);
        let response = app
            .oneshot(
                Request::get("/api/v1/gitops-catalog/apps")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_json(response).await["apps"].as_array().unwrap().is_empty());
    }
}

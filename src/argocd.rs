//! Argo CD management
//!
//! Installs the continuous-delivery controller, reads its admin credentials,
//! creates the top-level registry Application, and drives the sync/health
//! waits the catalog installer depends on. Application objects are applied
//! through the Kubernetes API as dynamic objects; everything else goes
//! through Argo CD's REST API over a scoped port-forward.

use std::time::Duration;

use kube::api::{Api, DynamicObject, Patch, PatchParams};
use kube::discovery::ApiResource;
use kube::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::{Result, ARGOCD_NAMESPACE};

/// Pinned Argo CD install manifests
pub const ARGOCD_INSTALL_URL: &str =
    "https://raw.githubusercontent.com/argoproj/argo-cd/v2.11.4/manifests/install.yaml";

/// Local URL of the port-forwarded Argo CD API
pub const ARGOCD_LOCAL_URL: &str = "http://localhost:8080";

/// Sync/health wait: 50 attempts x 10s
const SYNC_ATTEMPTS: u32 = 50;
const SYNC_INTERVAL: Duration = Duration::from_secs(10);

/// Application CRD coordinates
fn application_resource() -> ApiResource {
    ApiResource {
        group: "argoproj.io".to_string(),
        version: "v1alpha1".to_string(),
        api_version: "argoproj.io/v1alpha1".to_string(),
        kind: "Application".to_string(),
        plural: "applications".to_string(),
    }
}

fn applications(client: &Client) -> Api<DynamicObject> {
    Api::namespaced_with(client.clone(), ARGOCD_NAMESPACE, &application_resource())
}

/// Read the initial admin password Argo CD generates at install time
pub async fn read_admin_password(client: &Client) -> Result<String> {
    let secret = crate::k8s::read_secret(client, ARGOCD_NAMESPACE, "argocd-initial-admin-secret")
        .await?
        .ok_or_else(|| Error::provider("argocd-initial-admin-secret not found"))?;
    secret
        .get("password")
        .cloned()
        .ok_or_else(|| Error::provider("argocd-initial-admin-secret has no password key"))
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    token: String,
}

/// Obtain an API bearer token by posting the admin credentials
pub async fn session_token(http: &reqwest::Client, base_url: &str, password: &str) -> Result<String> {
    let response: SessionResponse = http
        .post(format!("{base_url}/api/v1/session"))
        .json(&json!({ "username": "admin", "password": password }))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    Ok(response.token)
}

/// Apply the top-level registry Application pointing at the gitops repository
pub async fn create_registry_application(
    client: &Client,
    cluster_name: &str,
    gitops_repo_url: &str,
    registry_path: &str,
) -> Result<()> {
    let manifest = json!({
        "apiVersion": "argoproj.io/v1alpha1",
        "kind": "Application",
        "metadata": {
            "name": "registry",
            "namespace": ARGOCD_NAMESPACE,
            "annotations": { "argocd.argoproj.io/sync-wave": "1" },
        },
        "spec": {
            "project": "default",
            "source": {
                "repoURL": gitops_repo_url,
                "path": registry_path,
                "targetRevision": "HEAD",
            },
            "destination": {
                "server": "https://kubernetes.default.svc",
                "namespace": ARGOCD_NAMESPACE,
            },
            "syncPolicy": {
                "automated": { "prune": true, "selfHeal": true },
                "syncOptions": ["CreateNamespace=true"],
                "retry": {
                    "limit": 5,
                    "backoff": { "duration": "5s", "maxDuration": "5m0s" },
                },
            },
        },
    });

    let object: DynamicObject = serde_json::from_value(manifest)?;
    applications(client)
        .patch(
            "registry",
            &PatchParams::apply("kubefirst-api").force(),
            &Patch::Apply(&object),
        )
        .await?;
    info!(cluster = %cluster_name, path = %registry_path, "registry application created");
    Ok(())
}

/// Strip the automated sync policy from an Application
///
/// Required before deletion: a self-healing Application would be recreated
/// by its own controller while the cascade delete runs.
pub async fn remove_sync_policy(client: &Client, application: &str) -> Result<()> {
    let patch = json!({ "spec": { "syncPolicy": null } });
    applications(client)
        .patch(application, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    debug!(application = %application, "sync policy removed");
    Ok(())
}

/// Ask Argo CD to refresh an application from its source
pub async fn refresh_application(
    http: &reqwest::Client,
    base_url: &str,
    token: &str,
    application: &str,
) -> Result<()> {
    http.get(format!("{base_url}/api/v1/applications/{application}"))
        .query(&[("refresh", "true")])
        .bearer_auth(token)
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}

#[derive(Debug, Default, Deserialize)]
struct ApplicationStatus {
    #[serde(default)]
    sync: SyncStatus,
    #[serde(default)]
    health: HealthStatus,
}

#[derive(Debug, Default, Deserialize)]
struct SyncStatus {
    #[serde(default)]
    status: String,
}

#[derive(Debug, Default, Deserialize)]
struct HealthStatus {
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct ApplicationEnvelope {
    #[serde(default)]
    status: Option<ApplicationStatus>,
}

async fn application_status(
    http: &reqwest::Client,
    base_url: &str,
    token: &str,
    application: &str,
) -> Result<Option<(String, String)>> {
    let response = http
        .get(format!("{base_url}/api/v1/applications/{application}"))
        .bearer_auth(token)
        .send()
        .await?;
    if response.status() == reqwest::StatusCode::NOT_FOUND {
        return Ok(None);
    }
    let envelope: ApplicationEnvelope = response.error_for_status()?.json().await?;
    let status = envelope.status.unwrap_or_default();
    Ok(Some((status.sync.status, status.health.status)))
}

/// Wait for an application to exist, then reach Synced/Healthy
///
/// Bounded at 50 x 10s; exhaustion is a timeout and leaves no record state
/// behind - the service stays listed.
pub async fn wait_for_synced_and_healthy(
    http: &reqwest::Client,
    base_url: &str,
    token: &str,
    application: &str,
) -> Result<()> {
    for attempt in 1..=SYNC_ATTEMPTS {
        match application_status(http, base_url, token, application).await {
            Ok(Some((sync, health))) => {
                if sync == "Synced" && health == "Healthy" {
                    info!(application = %application, attempt, "application synced and healthy");
                    return Ok(());
                }
                debug!(application = %application, %sync, %health, attempt, "waiting for sync");
            }
            Ok(None) => debug!(application = %application, attempt, "application not created yet"),
            Err(e) => warn!(application = %application, error = %e, "status poll failed"),
        }
        tokio::time::sleep(SYNC_INTERVAL).await;
    }
    Err(Error::timeout(format!(
        "application {application} never reached Synced/Healthy after {SYNC_ATTEMPTS} attempts"
    )))
}

/// Delete an application with resource cascade
pub async fn delete_application(
    http: &reqwest::Client,
    base_url: &str,
    token: &str,
    application: &str,
) -> Result<()> {
    let response = http
        .delete(format!("{base_url}/api/v1/applications/{application}"))
        .query(&[("cascade", "true")])
        .bearer_auth(token)
        .send()
        .await?;
    if response.status() == reqwest::StatusCode::NOT_FOUND {
        return Ok(());
    }
    response.error_for_status()?;
    info!(application = %application, "application deleted");
    Ok(())
}

/// Wait for a deleted application's health to reach Missing/Unknown or for
/// the application to disappear entirely; bounded at 120s
pub async fn wait_for_application_gone(
    http: &reqwest::Client,
    base_url: &str,
    token: &str,
    application: &str,
) -> Result<()> {
    for _ in 0..24 {
        match application_status(http, base_url, token, application).await {
            Ok(None) => return Ok(()),
            Ok(Some((_, health))) if health == "Missing" || health == "Unknown" => return Ok(()),
            Ok(Some(_)) => {}
            Err(e) => warn!(application = %application, error = %e, "deletion poll failed"),
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
    Err(Error::timeout(format!(
        "application {application} still present 120s after deletion"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn application_resource_targets_argoproj() {
        let ar = application_resource();
        assert_eq!(ar.api_version, "argoproj.io/v1alpha1");
        assert_eq!(ar.plural, "applications");
    }

    #[test]
    fn status_envelope_tolerates_missing_fields() {
        let body = r#"{"metadata":{"name":"registry"}}"#;
        let envelope: ApplicationEnvelope = serde_json::from_str(body).unwrap();
        assert!(envelope.status.is_none());

        let body = r#"{"status":{"sync":{"status":"Synced"},"health":{"status":"Healthy"}}}"#;
        let envelope: ApplicationEnvelope = serde_json::from_str(body).unwrap();
        let status = envelope.status.unwrap();
        assert_eq!(status.sync.status, "Synced");
        assert_eq!(status.health.status, "Healthy");
    }

    /// The registry application must carry the exact sync policy the
    /// platform relies on for self-healing installs.
    #[test]
    fn registry_manifest_sync_policy() {
        let manifest = json!({
            "syncPolicy": {
                "automated": { "prune": true, "selfHeal": true },
                "syncOptions": ["CreateNamespace=true"],
                "retry": { "limit": 5, "backoff": { "duration": "5s", "maxDuration": "5m0s" } },
            },
        });
        assert_eq!(manifest["syncPolicy"]["automated"]["prune"], json!(true));
        assert_eq!(manifest["syncPolicy"]["retry"]["limit"], json!(5));
    }
}

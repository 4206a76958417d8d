//! Catalog application installer
//!
//! Installs and removes gitops-catalog applications on a provisioned
//! cluster: render the app bundle into the cluster's registry path, commit,
//! push, and wait for the continuous-delivery controller to report the app
//! Synced and Healthy. Also seeds the default service entries after
//! provisioning.

mod defaults;

pub use defaults::add_default_services;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{error, info};

use crate::env::Env;
use crate::error::Error;
use crate::gitops::{self, registry_path, GitBasicAuth};
use crate::render;
use crate::store::ServiceListStore;
use crate::types::{
    CloudProvider, Cluster, ClusterStatus, GitopsCatalogApp, GitopsCatalogAppCreateRequest,
    GitopsCatalogAppDeleteRequest, Service,
};
use crate::{Result, GITOPS_CATALOG_REPO, KONSTRUCT_OWNER};

/// Scratch directories for one app install on one cluster
struct ScratchDirs {
    gitops: PathBuf,
    catalog: PathBuf,
}

fn scratch_dirs(cluster_name: &str, app_name: &str) -> ScratchDirs {
    let base = Env::k1_dir().join(cluster_name).join(app_name);
    ScratchDirs {
        gitops: base.join("gitops"),
        catalog: base.join("gitops-catalog"),
    }
}

fn reset_dir(path: &Path) -> Result<()> {
    if path.exists() {
        std::fs::remove_dir_all(path)?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn gitops_repo_url(cluster: &Cluster) -> String {
    format!(
        "https://{}/{}/gitops.git",
        cluster.git_provider.host(),
        cluster.git_auth.owner
    )
}

fn catalog_repo_url() -> String {
    format!("https://github.com/{KONSTRUCT_OWNER}/{GITOPS_CATALOG_REPO}.git")
}

fn git_auth(cluster: &Cluster) -> GitBasicAuth {
    GitBasicAuth {
        username: cluster.git_auth.user.clone(),
        token: cluster.git_auth.token.clone(),
    }
}

/// Vault URL as seen from this process for a given cluster
fn vault_url(cluster: &Cluster) -> String {
    if cluster.cloud_provider == CloudProvider::K3d {
        "http://vault.vault.svc:8200".to_string()
    } else {
        format!("https://vault.{}", cluster.full_domain())
    }
}

/// Install a catalog application onto a cluster
///
/// `exclude_sync` skips the Argo CD wait - used when replaying
/// post-install apps during bootstrap, where the registry sync will pick
/// everything up in one wave.
pub async fn create_service(
    cluster: &Cluster,
    services: &ServiceListStore,
    app: &GitopsCatalogApp,
    request: &GitopsCatalogAppCreateRequest,
    exclude_sync: bool,
) -> Result<()> {
    if cluster.status != ClusterStatus::Provisioned {
        return Err(Error::precondition(format!(
            "cannot deploy services to a cluster in {:?} state",
            cluster.status.as_str()
        )));
    }

    let dirs = scratch_dirs(&cluster.cluster_name, &app.name);
    reset_dir(&dirs.gitops)?;
    reset_dir(&dirs.catalog)?;

    let auth = git_auth(cluster);
    gitops::clone_branch(&gitops_repo_url(cluster), "main", &dirs.gitops, Some(&auth))?;
    gitops::clone_branch(&catalog_repo_url(), "main", &dirs.catalog, None)?;

    // workload installs land in the workload cluster's registry subtree
    let (target_cluster, secret_store_ref, project, destination, environment) =
        if request.workload_cluster_name.is_empty() {
            (
                cluster.cluster_name.clone(),
                "vault-kv-secret".to_string(),
                "default".to_string(),
                "in-cluster".to_string(),
                "mgmt".to_string(),
            )
        } else {
            (
                request.workload_cluster_name.clone(),
                format!("{}-vault-kv-secret", request.workload_cluster_name),
                request.workload_cluster_name.clone(),
                request.workload_cluster_name.clone(),
                request.environment.clone(),
            )
        };

    let registry = registry_path(cluster.cloud_provider, &target_cluster, request.is_template);
    let app_source = dirs.catalog.join(&app.name);
    if !app_source.is_dir() {
        return Err(Error::NotFound(format!(
            "catalog application {}",
            app.name
        )));
    }

    if !request.secret_keys.is_empty() {
        info!(cluster = %target_cluster, app = %app.name, "application has secrets, seeding vault");
        let values: BTreeMap<String, String> = request
            .secret_keys
            .iter()
            .map(|k| (k.name.clone(), k.value.clone()))
            .collect();
        let client = crate::k8s::cluster_client(&cluster.cluster_name).await?;
        let token = crate::vault::root_token(&client).await?;
        crate::vault::write_kv_secret(&vault_url(cluster), &token, &app.name, &values).await?;
    }

    gitops::pull_fast_forward(&dirs.gitops, "origin", "main", &auth)?;

    if !request.is_template {
        let tokens = render::gitops_tokens(
            cluster,
            &registry,
            &secret_store_ref,
            &project,
            &destination,
            &environment,
            &target_cluster,
        );
        render::render_tree(&app_source, &tokens)?;
        render::render_tree(&app_source, &render::config_key_tokens(&request.config_keys))?;
    }

    let links = ingress_links(&app_source, &cluster.full_domain());

    let destination_dir = dirs.gitops.join(&registry).join(&app.name);
    copy_dir_recursive(&app_source, &destination_dir)?;

    gitops::commit_all(
        &dirs.gitops,
        &format!(
            "adding {} to the cluster {} on behalf of {}",
            app.name, target_cluster, request.user
        ),
    )?;
    gitops::push_force(&dirs.gitops, "origin", "main", &auth)?;

    services
        .insert(
            &cluster.cluster_name,
            Service {
                name: app.name.clone(),
                default: false,
                description: app.description.clone(),
                image: app.image_url.clone(),
                links,
                status: String::new(),
                created_by: request.user.clone(),
            },
        )
        .await?;

    if exclude_sync || request.is_template {
        return Ok(());
    }

    wait_for_app_deployed(cluster, &app.name).await
}

/// Force a registry refresh and wait for the app to be Synced/Healthy
async fn wait_for_app_deployed(cluster: &Cluster, app_name: &str) -> Result<()> {
    let client = crate::k8s::cluster_client(&cluster.cluster_name).await?;
    let pod = crate::k8s::wait_for_pod_running(
        &client,
        crate::ARGOCD_NAMESPACE,
        "app.kubernetes.io/name=argocd-server",
        120,
    )
    .await?;
    let _tunnel = crate::k8s::forward_pod_port(&client, crate::ARGOCD_NAMESPACE, &pod, 8080, 8080)
        .await?;

    let http = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .build()?;
    let token = if cluster.argocd_auth_token.is_empty() {
        crate::argocd::session_token(
            &http,
            crate::argocd::ARGOCD_LOCAL_URL,
            &cluster.argocd_password,
        )
        .await?
    } else {
        cluster.argocd_auth_token.clone()
    };

    crate::argocd::refresh_application(&http, crate::argocd::ARGOCD_LOCAL_URL, &token, "registry")
        .await?;
    crate::argocd::wait_for_synced_and_healthy(
        &http,
        crate::argocd::ARGOCD_LOCAL_URL,
        &token,
        app_name,
    )
    .await
}

/// Remove a catalog application from a cluster
pub async fn delete_service(
    cluster: &Cluster,
    services: &ServiceListStore,
    app_name: &str,
    request: &GitopsCatalogAppDeleteRequest,
) -> Result<()> {
    let dirs = scratch_dirs(&cluster.cluster_name, app_name);
    reset_dir(&dirs.gitops)?;

    let auth = git_auth(cluster);
    gitops::clone_branch(&gitops_repo_url(cluster), "main", &dirs.gitops, Some(&auth))?;

    let target_cluster = if request.workload_cluster_name.is_empty() {
        cluster.cluster_name.clone()
    } else {
        request.workload_cluster_name.clone()
    };
    let registry = registry_path(cluster.cloud_provider, &target_cluster, request.is_template);
    let app_dir = dirs.gitops.join(&registry).join(app_name);
    if app_dir.exists() {
        std::fs::remove_dir_all(&app_dir)?;
    }

    gitops::commit_all(
        &dirs.gitops,
        &format!(
            "removing {app_name} from the cluster {target_cluster} on behalf of {}",
            request.user
        ),
    )?;
    gitops::push_force(&dirs.gitops, "origin", "main", &auth)?;

    if !request.is_template {
        if let Err(e) = undeploy_application(cluster, app_name).await {
            // the git state is already correct; report but do not resurrect
            error!(app = %app_name, error = %e, "argocd teardown incomplete");
        }
    }

    services.delete_entry(&cluster.cluster_name, app_name).await
}

/// Detach the sync policy, cascade-delete, and wait for the app to vanish
async fn undeploy_application(cluster: &Cluster, app_name: &str) -> Result<()> {
    let client = crate::k8s::cluster_client(&cluster.cluster_name).await?;
    crate::argocd::remove_sync_policy(&client, app_name).await?;

    let pod = crate::k8s::wait_for_pod_running(
        &client,
        crate::ARGOCD_NAMESPACE,
        "app.kubernetes.io/name=argocd-server",
        120,
    )
    .await?;
    let _tunnel = crate::k8s::forward_pod_port(&client, crate::ARGOCD_NAMESPACE, &pod, 8080, 8080)
        .await?;

    let http = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .build()?;
    let token = if cluster.argocd_auth_token.is_empty() {
        crate::argocd::session_token(
            &http,
            crate::argocd::ARGOCD_LOCAL_URL,
            &cluster.argocd_password,
        )
        .await?
    } else {
        cluster.argocd_auth_token.clone()
    };

    crate::argocd::delete_application(&http, crate::argocd::ARGOCD_LOCAL_URL, &token, app_name)
        .await?;
    crate::argocd::wait_for_application_gone(
        &http,
        crate::argocd::ARGOCD_LOCAL_URL,
        &token,
        app_name,
    )
    .await
}

/// Collect the public URLs an app bundle exposes
///
/// Parses ingress-like manifests for `host:` entries and prepends https.
fn ingress_links(app_dir: &Path, full_domain: &str) -> Vec<String> {
    let mut links = Vec::new();
    for entry in walkdir::WalkDir::new(app_dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(content) = std::fs::read_to_string(entry.path()) else {
            continue;
        };
        for line in content.lines() {
            let trimmed = line.trim().trim_start_matches("- ");
            let Some(host) = trimmed.strip_prefix("host:") else {
                continue;
            };
            let host = host.trim().trim_matches('"').trim_matches('\'');
            if host.is_empty() || host.contains("{{") {
                continue;
            }
            // only surface hosts under the platform domain
            if host.ends_with(full_domain) {
                let link = format!("https://{host}");
                if !links.contains(&link) {
                    links.push(link);
                }
            }
        }
    }
    links
}

fn copy_dir_recursive(from: &Path, to: &Path) -> Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::store::memory::MemorySecretsBackend;

    fn cluster_in(status: ClusterStatus) -> Cluster {
        Cluster {
            cluster_name: "k1".to_string(),
            status,
            ..Cluster::default()
        }
    }

    /// Installs are refused on any cluster that is not fully provisioned.
    #[tokio::test]
    async fn create_guards_against_wrong_state() {
        let services = ServiceListStore::new(Arc::new(MemorySecretsBackend::new()));
        let app = GitopsCatalogApp {
            name: "postgres".to_string(),
            ..GitopsCatalogApp::default()
        };
        let request = GitopsCatalogAppCreateRequest::default();

        for status in [
            ClusterStatus::Provisioning,
            ClusterStatus::Deleting,
            ClusterStatus::Deleted,
            ClusterStatus::Error,
        ] {
            let err = create_service(&cluster_in(status), &services, &app, &request, true)
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Precondition(_)), "{status:?}");
        }
    }

    #[test]
    fn ingress_links_harvested_from_manifests() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("ingress.yaml"),
            r#"
spec:
  rules:
    - host: postgres.kubefirst.dev
      http: {}
    - host: admin.postgres.kubefirst.dev
tls:
  - hosts:
      - postgres.kubefirst.dev
"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("other.yaml"),
            "host: postgres.elsewhere.io\nhost: {{appDomain}}\n",
        )
        .unwrap();

        let links = ingress_links(dir.path(), "kubefirst.dev");
        assert_eq!(
            links,
            vec![
                "https://postgres.kubefirst.dev".to_string(),
                "https://admin.postgres.kubefirst.dev".to_string(),
            ]
        );
    }

    #[test]
    fn copy_dir_recursive_preserves_layout() {
        let from = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(from.path().join("charts/sub")).unwrap();
        std::fs::write(from.path().join("app.yaml"), "a").unwrap();
        std::fs::write(from.path().join("charts/sub/values.yaml"), "b").unwrap();

        let to = tempfile::tempdir().unwrap();
        let target = to.path().join("postgres");
        copy_dir_recursive(from.path(), &target).unwrap();

        assert!(target.join("app.yaml").is_file());
        assert!(target.join("charts/sub/values.yaml").is_file());
    }

    #[test]
    fn vault_url_depends_on_provider() {
        let mut record = cluster_in(ClusterStatus::Provisioned);
        record.domain_name = "kubefirst.dev".to_string();
        record.cloud_provider = CloudProvider::Civo;
        assert_eq!(vault_url(&record), "https://vault.kubefirst.dev");

        record.cloud_provider = CloudProvider::K3d;
        assert_eq!(vault_url(&record), "http://vault.vault.svc:8200");
    }
}

//! Kubernetes client helpers
//!
//! Client construction from provisioned kubeconfigs, Secret convenience
//! wrappers, readiness waits, and scoped port-forwards. Everything the
//! lifecycle controller does against a freshly provisioned cluster funnels
//! through here.

mod portforward;
mod tls;

pub use portforward::{forward_pod_port, PortForwardGuard};
pub use tls::{backup_tls_secrets, restore_tls_secrets};

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Node, Pod, Secret};
use k8s_openapi::ByteString;
use kube::api::{Api, ListParams, ObjectMeta, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::{debug, info};

use crate::env::Env;
use crate::error::Error;
use crate::provider::KubeCredentials;
use crate::Result;

/// Where a cluster's kubeconfig lives in scratch
pub fn kubeconfig_path(cluster_name: &str) -> PathBuf {
    Env::k1_dir().join(cluster_name).join("kubeconfig")
}

/// Persist kubeconfig bytes for a cluster and return the credentials handle
pub fn write_kubeconfig(cluster_name: &str, kubeconfig: &[u8]) -> Result<KubeCredentials> {
    let path = kubeconfig_path(cluster_name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, kubeconfig)?;
    Ok(KubeCredentials {
        kubeconfig_path: path,
    })
}

/// Client for a named cluster
///
/// Uses the kubeconfig the provider wrote during provisioning when one
/// exists; otherwise assumes the cluster is the one this process runs in
/// and uses the in-cluster service account.
pub async fn cluster_client(cluster_name: &str) -> Result<Client> {
    let path = kubeconfig_path(cluster_name);
    if path.is_file() {
        client_from_kubeconfig(&path).await
    } else {
        Ok(Client::try_default().await?)
    }
}

/// Build a client from a kubeconfig file on disk
pub async fn client_from_kubeconfig(path: &std::path::Path) -> Result<Client> {
    let kubeconfig = Kubeconfig::read_from(path)
        .map_err(|e| Error::provider(format!("reading kubeconfig {}: {e}", path.display())))?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::provider(format!("loading kubeconfig {}: {e}", path.display())))?;
    Ok(Client::try_from(config)?)
}

/// Block until the API server answers, up to `timeout_secs`
pub async fn wait_for_api(client: &Client, timeout_secs: u64) -> Result<()> {
    let nodes: Api<Node> = Api::all(client.clone());
    let deadline = std::time::Instant::now() + Duration::from_secs(timeout_secs);
    loop {
        match nodes.list(&ListParams::default().limit(1)).await {
            Ok(_) => {
                info!("kubernetes api is reachable");
                return Ok(());
            }
            Err(e) if std::time::Instant::now() < deadline => {
                debug!(error = %e, "kubernetes api not ready, retrying");
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            Err(e) => {
                return Err(Error::timeout(format!(
                    "kubernetes api not reachable after {timeout_secs}s: {e}"
                )))
            }
        }
    }
}

/// Read a Secret's data as utf-8 strings; `None` when it does not exist
pub async fn read_secret(
    client: &Client,
    namespace: &str,
    name: &str,
) -> Result<Option<BTreeMap<String, String>>> {
    let api: Api<Secret> = Api::namespaced(client.clone(), namespace);
    match api.get(name).await {
        Ok(secret) => {
            let data = secret
                .data
                .unwrap_or_default()
                .into_iter()
                .map(|(k, ByteString(v))| (k, String::from_utf8_lossy(&v).into_owned()))
                .collect();
            Ok(Some(data))
        }
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Create a Secret from string data; an existing Secret is left alone
pub async fn create_secret(
    client: &Client,
    namespace: &str,
    name: &str,
    data: BTreeMap<String, String>,
) -> Result<()> {
    let api: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        string_data: Some(data),
        ..Default::default()
    };
    match api.create(&PostParams::default(), &secret).await {
        Ok(_) => {
            info!(namespace = %namespace, secret = %name, "secret created");
            Ok(())
        }
        Err(kube::Error::Api(ae)) if ae.code == 409 => {
            debug!(namespace = %namespace, secret = %name, "secret already exists");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Create a namespace; an existing namespace is left alone
pub async fn create_namespace(client: &Client, name: &str) -> Result<()> {
    use k8s_openapi::api::core::v1::Namespace;
    let api: Api<Namespace> = Api::all(client.clone());
    let namespace = Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    match api.create(&PostParams::default(), &namespace).await {
        Ok(_) => {
            info!(namespace = %name, "namespace created");
            Ok(())
        }
        Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Wait for a Deployment selected by label to exist and become ready
///
/// Mirrors the two-phase wait the lifecycle steps need: first the sync wave
/// has to create the Deployment at all, then its replicas have to come up.
pub async fn wait_for_deployment_ready(
    client: &Client,
    namespace: &str,
    label_selector: &str,
    timeout_secs: u64,
) -> Result<()> {
    let api: Api<Deployment> = Api::namespaced(client.clone(), namespace);
    let params = ListParams::default().labels(label_selector);
    let deadline = std::time::Instant::now() + Duration::from_secs(timeout_secs);

    loop {
        let deployments = api.list(&params).await?;
        if let Some(deployment) = deployments.items.first() {
            let wanted = deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
            let ready = deployment
                .status
                .as_ref()
                .and_then(|s| s.ready_replicas)
                .unwrap_or(0);
            if ready >= wanted {
                info!(namespace = %namespace, selector = %label_selector, "deployment ready");
                return Ok(());
            }
            debug!(namespace = %namespace, selector = %label_selector, ready, wanted, "deployment not ready");
        } else {
            debug!(namespace = %namespace, selector = %label_selector, "deployment not created yet");
        }

        if std::time::Instant::now() >= deadline {
            return Err(Error::timeout(format!(
                "deployment {label_selector} in {namespace} not ready after {timeout_secs}s"
            )));
        }
        tokio::time::sleep(Duration::from_secs(10)).await;
    }
}

/// Wait for a Pod selected by label to reach the Running phase
pub async fn wait_for_pod_running(
    client: &Client,
    namespace: &str,
    label_selector: &str,
    timeout_secs: u64,
) -> Result<String> {
    let api: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let params = ListParams::default().labels(label_selector);
    let deadline = std::time::Instant::now() + Duration::from_secs(timeout_secs);

    loop {
        let pods = api.list(&params).await?;
        let running = pods.items.iter().find(|p| {
            p.status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                .map(|phase| phase == "Running")
                .unwrap_or(false)
        });
        if let Some(pod) = running {
            let name = pod.metadata.name.clone().unwrap_or_default();
            info!(namespace = %namespace, pod = %name, "pod running");
            return Ok(name);
        }

        if std::time::Instant::now() >= deadline {
            return Err(Error::timeout(format!(
                "no running pod for {label_selector} in {namespace} after {timeout_secs}s"
            )));
        }
        tokio::time::sleep(Duration::from_secs(10)).await;
    }
}

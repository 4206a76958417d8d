//! Local k3d driver
//!
//! The local target has no cloud APIs: regions always validate, the platform
//! domain is served by mkcert-issued certificates, and the terraform state
//! store is the in-cluster minio with its stock credentials. Kube
//! credentials come from the downloaded `k3d` binary.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use crate::env::Env;
use crate::error::Error;
use crate::provider::{CloudDriver, KubeCredentials, StateStore, Volume};
use crate::types::{Cluster, StateStoreCredentials, StateStoreDetails};
use crate::Result;

/// Stock minio credentials used by the local platform
const MINIO_ACCESS_KEY: &str = "k-ray";
const MINIO_SECRET_KEY: &str = "feedkraystars";
/// In-cluster minio endpoint
const MINIO_ENDPOINT: &str = "http://minio.minio.svc.cluster.local:9000";

/// k3d implementation of [`CloudDriver`]
pub struct K3dDriver {
    cluster_name: String,
}

impl K3dDriver {
    /// Create a driver for one local cluster
    pub fn new(cluster_name: String) -> Self {
        Self { cluster_name }
    }

    fn k3d_binary(&self) -> std::path::PathBuf {
        Env::k1_dir().join(&self.cluster_name).join("tools").join("k3d")
    }
}

#[async_trait]
impl CloudDriver for K3dDriver {
    async fn validate_region(&self, _region: &str) -> Result<()> {
        Ok(())
    }

    async fn validate_domain_ownership(&self, _domain: &str) -> Result<bool> {
        // the local platform serves a development domain; there is no public
        // zone to prove ownership of
        Ok(true)
    }

    async fn create_state_store(&self, name: &str) -> Result<StateStore> {
        // the bucket itself is created by the in-cluster minio bootstrap
        info!(bucket = %name, "using in-cluster minio state store");
        Ok(StateStore {
            credentials: StateStoreCredentials {
                access_key_id: MINIO_ACCESS_KEY.to_string(),
                secret_access_key: MINIO_SECRET_KEY.to_string(),
                name: name.to_string(),
            },
            details: StateStoreDetails {
                name: name.to_string(),
                hostname: MINIO_ENDPOINT.to_string(),
                id: String::new(),
            },
        })
    }

    async fn delete_state_store(&self, _name: &str) -> Result<()> {
        // dies with the cluster
        Ok(())
    }

    async fn kube_credentials(&self, cluster_name: &str) -> Result<KubeCredentials> {
        let output = Command::new(self.k3d_binary())
            .args(["kubeconfig", "get", cluster_name])
            .output()
            .await
            .map_err(|e| Error::provider(format!("running k3d kubeconfig: {e}")))?;
        if !output.status.success() {
            return Err(Error::provider(format!(
                "k3d kubeconfig get {cluster_name}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        crate::k8s::write_kubeconfig(cluster_name, &output.stdout)
    }

    async fn list_cluster_volumes(&self, _cluster_name: &str) -> Result<Vec<Volume>> {
        // local volumes are docker-managed and die with the cluster
        Ok(Vec::new())
    }

    async fn delete_volume(&self, _volume_id: &str) -> Result<()> {
        Ok(())
    }

    fn terraform_env(&self, cluster: &Cluster) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("AWS_ACCESS_KEY_ID".to_string(), MINIO_ACCESS_KEY.to_string());
        env.insert(
            "AWS_SECRET_ACCESS_KEY".to_string(),
            MINIO_SECRET_KEY.to_string(),
        );
        env.insert(
            "TF_VAR_aws_access_key_id".to_string(),
            MINIO_ACCESS_KEY.to_string(),
        );
        env.insert(
            "TF_VAR_aws_secret_access_key".to_string(),
            MINIO_SECRET_KEY.to_string(),
        );
        env.insert(
            "TF_VAR_kubeconfig_path".to_string(),
            crate::k8s::kubeconfig_path(&cluster.cluster_name)
                .display()
                .to_string(),
        );
        env
    }
}

//! Vultr driver

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::error::Error;
use crate::provider::{
    dns, CloudDriver, KubeCredentials, StateStore, Volume, STATE_STORE_ATTEMPTS,
};
use crate::types::{Cluster, StateStoreCredentials, StateStoreDetails, VultrAuth};
use crate::Result;

const API_BASE: &str = "https://api.vultr.com/v2";

/// Vultr implementation of [`CloudDriver`]
pub struct VultrDriver {
    auth: VultrAuth,
    region: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct VultrRegionList {
    regions: Vec<VultrRegion>,
}

#[derive(Debug, Deserialize)]
struct VultrRegion {
    id: String,
}

#[derive(Debug, Deserialize)]
struct VultrRecordList {
    records: Vec<VultrRecord>,
}

#[derive(Debug, Deserialize)]
struct VultrRecord {
    name: String,
    #[serde(default)]
    data: String,
}

#[derive(Debug, Deserialize)]
struct VultrObjectStorageList {
    object_storages: Vec<VultrObjectStorage>,
}

#[derive(Debug, Deserialize)]
struct VultrObjectStorageEnvelope {
    object_storage: VultrObjectStorage,
}

#[derive(Debug, Deserialize)]
struct VultrObjectStorage {
    id: String,
    label: String,
    status: String,
    #[serde(default)]
    s3_hostname: String,
    #[serde(default)]
    s3_access_key: String,
    #[serde(default)]
    s3_secret_key: String,
}

#[derive(Debug, Deserialize)]
struct VultrClusterList {
    vke_clusters: Vec<VultrCluster>,
}

#[derive(Debug, Deserialize)]
struct VultrCluster {
    id: String,
    label: String,
}

#[derive(Debug, Deserialize)]
struct VultrKubeconfig {
    kube_config: String,
}

#[derive(Debug, Deserialize)]
struct VultrBlockList {
    blocks: Vec<VultrBlock>,
}

#[derive(Debug, Deserialize)]
struct VultrBlock {
    id: String,
    label: String,
    #[serde(default)]
    attached_to_instance: String,
}

impl VultrDriver {
    /// Create a driver for one account + region
    pub fn new(auth: VultrAuth, region: String) -> Self {
        Self {
            auth,
            region,
            http: reqwest::Client::new(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{API_BASE}{path}"))
            .bearer_auth(&self.auth.token)
    }

    async fn object_storage_by_label(&self, label: &str) -> Result<Option<VultrObjectStorage>> {
        let list: VultrObjectStorageList = self
            .request(reqwest::Method::GET, "/object-storage")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(list.object_storages.into_iter().find(|s| s.label == label))
    }
}

#[async_trait]
impl CloudDriver for VultrDriver {
    async fn validate_region(&self, region: &str) -> Result<()> {
        let regions: VultrRegionList = self
            .request(reqwest::Method::GET, "/regions")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if regions.regions.iter().any(|r| r.id == region) {
            Ok(())
        } else {
            Err(Error::provider(format!(
                "region {region} is not supported by vultr"
            )))
        }
    }

    async fn validate_domain_ownership(&self, domain: &str) -> Result<bool> {
        self.request(reqwest::Method::GET, &format!("/domains/{domain}"))
            .send()
            .await?
            .error_for_status()
            .map_err(|_| Error::provider(format!("domain {domain} not found in vultr account")))?;

        let records: VultrRecordList = self
            .request(reqwest::Method::GET, &format!("/domains/{domain}/records"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let exists = records
            .records
            .iter()
            .any(|r| r.name == "kubefirst-liveness" && r.data.trim_matches('"') == dns::LIVENESS_RECORD_VALUE);

        if !exists {
            self.request(reqwest::Method::POST, &format!("/domains/{domain}/records"))
                .json(&json!({
                    "type": "TXT",
                    "name": "kubefirst-liveness",
                    "data": format!("\"{}\"", dns::LIVENESS_RECORD_VALUE),
                    "ttl": 600,
                }))
                .send()
                .await?
                .error_for_status()?;
            info!(domain = %domain, "liveness TXT record created");
        }

        dns::wait_for_txt_propagation(domain, dns::LIVENESS_RECORD_VALUE).await?;
        Ok(true)
    }

    async fn create_state_store(&self, name: &str) -> Result<StateStore> {
        if self.object_storage_by_label(name).await?.is_none() {
            let created: VultrObjectStorageEnvelope = self
                .request(reqwest::Method::POST, "/object-storage")
                .json(&json!({ "label": name, "cluster_id": 1 }))
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            info!(bucket = %name, id = %created.object_storage.id, "vultr object storage requested");
        }

        for _ in 0..STATE_STORE_ATTEMPTS {
            if let Some(store) = self.object_storage_by_label(name).await? {
                if store.status == "active" {
                    info!(bucket = %name, "vultr object storage active");
                    return Ok(StateStore {
                        credentials: StateStoreCredentials {
                            access_key_id: store.s3_access_key,
                            secret_access_key: store.s3_secret_key,
                            name: name.to_string(),
                        },
                        details: StateStoreDetails {
                            name: name.to_string(),
                            hostname: store.s3_hostname,
                            id: store.id,
                        },
                    });
                }
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        Err(Error::timeout(format!(
            "vultr object storage {name} not active after {STATE_STORE_ATTEMPTS} attempts"
        )))
    }

    async fn delete_state_store(&self, name: &str) -> Result<()> {
        if let Some(store) = self.object_storage_by_label(name).await? {
            self.request(
                reqwest::Method::DELETE,
                &format!("/object-storage/{}", store.id),
            )
            .send()
            .await?
            .error_for_status()?;
            info!(bucket = %name, "vultr object storage deleted");
        }
        Ok(())
    }

    async fn kube_credentials(&self, cluster_name: &str) -> Result<KubeCredentials> {
        let clusters: VultrClusterList = self
            .request(reqwest::Method::GET, "/kubernetes/clusters")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let cluster = clusters
            .vke_clusters
            .into_iter()
            .find(|c| c.label == cluster_name)
            .ok_or_else(|| Error::provider(format!("vultr cluster {cluster_name} not found")))?;

        let config: VultrKubeconfig = self
            .request(
                reqwest::Method::GET,
                &format!("/kubernetes/clusters/{}/config", cluster.id),
            )
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let kubeconfig = base64::engine::general_purpose::STANDARD
            .decode(config.kube_config.as_bytes())
            .map_err(|e| Error::provider(format!("vultr kubeconfig is not base64: {e}")))?;
        crate::k8s::write_kubeconfig(cluster_name, &kubeconfig)
    }

    async fn list_cluster_volumes(&self, cluster_name: &str) -> Result<Vec<Volume>> {
        let blocks: VultrBlockList = self
            .request(reqwest::Method::GET, "/blocks")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(blocks
            .blocks
            .into_iter()
            .filter(|b| b.label.contains(cluster_name) || b.label.starts_with("pvc-"))
            .map(|b| Volume {
                id: b.id,
                name: b.label,
                attached: !b.attached_to_instance.is_empty(),
            })
            .collect())
    }

    async fn delete_volume(&self, volume_id: &str) -> Result<()> {
        self.request(reqwest::Method::DELETE, &format!("/blocks/{volume_id}"))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    fn terraform_env(&self, cluster: &Cluster) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("VULTR_API_KEY".to_string(), self.auth.token.clone());
        env.insert(
            "AWS_ACCESS_KEY_ID".to_string(),
            cluster.state_store_credentials.access_key_id.clone(),
        );
        env.insert(
            "AWS_SECRET_ACCESS_KEY".to_string(),
            cluster.state_store_credentials.secret_access_key.clone(),
        );
        env
    }
}

//! Civo driver

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::error::Error;
use crate::provider::{
    dns, CloudDriver, KubeCredentials, StateStore, Volume, STATE_STORE_ATTEMPTS,
};
use crate::types::{CivoAuth, Cluster, StateStoreCredentials, StateStoreDetails};
use crate::Result;

const API_BASE: &str = "https://api.civo.com/v2";

/// Civo implementation of [`CloudDriver`]
pub struct CivoDriver {
    auth: CivoAuth,
    region: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct CivoRegion {
    code: String,
}

#[derive(Debug, Deserialize)]
struct CivoDnsDomain {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct CivoDnsRecord {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct CivoPaginated<T> {
    items: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct CivoObjectStore {
    id: String,
    name: String,
    status: String,
    #[serde(default)]
    bucket_url: String,
}

#[derive(Debug, Deserialize)]
struct CivoObjectStoreCredential {
    access_key_id: String,
    secret_access_key_id: String,
}

#[derive(Debug, Deserialize)]
struct CivoKubernetesCluster {
    id: String,
    name: String,
    #[serde(default)]
    kubeconfig: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CivoVolume {
    id: String,
    name: String,
    status: String,
    #[serde(default)]
    cluster_id: String,
}

impl CivoDriver {
    /// Create a driver for one account + region
    pub fn new(auth: CivoAuth, region: String) -> Self {
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
            .query(&[("region", self.region.as_str())])
    }

    async fn dns_zone(&self, domain: &str) -> Result<CivoDnsDomain> {
        let zones: Vec<CivoDnsDomain> = self
            .request(reqwest::Method::GET, "/dns")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        zones
            .into_iter()
            .find(|z| z.name == domain)
            .ok_or_else(|| Error::provider(format!("domain {domain} not found in civo account")))
    }

    async fn object_store_by_name(&self, name: &str) -> Result<Option<CivoObjectStore>> {
        let stores: CivoPaginated<CivoObjectStore> = self
            .request(reqwest::Method::GET, "/objectstores")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(stores.items.into_iter().find(|s| s.name == name))
    }
}

#[async_trait]
impl CloudDriver for CivoDriver {
    async fn validate_region(&self, region: &str) -> Result<()> {
        let regions: Vec<CivoRegion> = self
            .request(reqwest::Method::GET, "/regions")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if regions.iter().any(|r| r.code == region) {
            Ok(())
        } else {
            Err(Error::provider(format!(
                "region {region} is not supported by civo"
            )))
        }
    }

    async fn validate_domain_ownership(&self, domain: &str) -> Result<bool> {
        let zone = self.dns_zone(domain).await?;

        let records: Vec<CivoDnsRecord> = self
            .request(reqwest::Method::GET, &format!("/dns/{}/records", zone.id))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let exists = records
            .iter()
            .any(|r| r.name == "kubefirst-liveness" && r.value == dns::LIVENESS_RECORD_VALUE);

        if !exists {
            self.request(reqwest::Method::POST, &format!("/dns/{}/records", zone.id))
                .json(&json!({
                    "type": "TXT",
                    "name": "kubefirst-liveness",
                    "value": dns::LIVENESS_RECORD_VALUE,
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
        // credentials first, then the store referencing them
        let credential: CivoObjectStoreCredential = self
            .request(reqwest::Method::POST, "/objectstore/credentials")
            .json(&json!({ "name": name }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if self.object_store_by_name(name).await?.is_none() {
            self.request(reqwest::Method::POST, "/objectstores")
                .json(&json!({
                    "name": name,
                    "access_key_id": credential.access_key_id,
                    "max_size_gb": 500,
                }))
                .send()
                .await?
                .error_for_status()?;
        }

        // wait for the store to activate: 60 x 1s
        for _ in 0..STATE_STORE_ATTEMPTS {
            if let Some(store) = self.object_store_by_name(name).await? {
                if store.status == "ready" {
                    info!(bucket = %name, "civo object store ready");
                    return Ok(StateStore {
                        credentials: StateStoreCredentials {
                            access_key_id: credential.access_key_id,
                            secret_access_key: credential.secret_access_key_id,
                            name: name.to_string(),
                        },
                        details: StateStoreDetails {
                            name: name.to_string(),
                            hostname: if store.bucket_url.is_empty() {
                                format!("objectstore.{}.civo.com", self.region)
                            } else {
                                store.bucket_url
                            },
                            id: store.id,
                        },
                    });
                }
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        Err(Error::timeout(format!(
            "civo object store {name} not ready after {STATE_STORE_ATTEMPTS} attempts"
        )))
    }

    async fn delete_state_store(&self, name: &str) -> Result<()> {
        if let Some(store) = self.object_store_by_name(name).await? {
            self.request(reqwest::Method::DELETE, &format!("/objectstores/{}", store.id))
                .send()
                .await?
                .error_for_status()?;
            info!(bucket = %name, "civo object store deleted");
        }
        Ok(())
    }

    async fn kube_credentials(&self, cluster_name: &str) -> Result<KubeCredentials> {
        let clusters: CivoPaginated<CivoKubernetesCluster> = self
            .request(reqwest::Method::GET, "/kubernetes/clusters")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let cluster = clusters
            .items
            .into_iter()
            .find(|c| c.name == cluster_name)
            .ok_or_else(|| Error::provider(format!("civo cluster {cluster_name} not found")))?;

        let detail: CivoKubernetesCluster = self
            .request(
                reqwest::Method::GET,
                &format!("/kubernetes/clusters/{}", cluster.id),
            )
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let kubeconfig = detail
            .kubeconfig
            .ok_or_else(|| Error::provider("civo cluster has no kubeconfig yet"))?;

        crate::k8s::write_kubeconfig(cluster_name, kubeconfig.as_bytes())
    }

    async fn list_cluster_volumes(&self, cluster_name: &str) -> Result<Vec<Volume>> {
        let clusters: CivoPaginated<CivoKubernetesCluster> = self
            .request(reqwest::Method::GET, "/kubernetes/clusters")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let Some(cluster) = clusters.items.into_iter().find(|c| c.name == cluster_name) else {
            return Ok(Vec::new());
        };

        let volumes: Vec<CivoVolume> = self
            .request(reqwest::Method::GET, "/volumes")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(volumes
            .into_iter()
            .filter(|v| v.cluster_id == cluster.id)
            .map(|v| Volume {
                id: v.id,
                name: v.name,
                attached: v.status == "attached",
            })
            .collect())
    }

    async fn delete_volume(&self, volume_id: &str) -> Result<()> {
        self.request(reqwest::Method::DELETE, &format!("/volumes/{volume_id}"))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    fn terraform_env(&self, cluster: &Cluster) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("CIVO_TOKEN".to_string(), self.auth.token.clone());
        env.insert("TF_VAR_civo_token".to_string(), self.auth.token.clone());
        env.insert(
            "AWS_ACCESS_KEY_ID".to_string(),
            cluster.state_store_credentials.access_key_id.clone(),
        );
        env.insert(
            "AWS_SECRET_ACCESS_KEY".to_string(),
            cluster.state_store_credentials.secret_access_key.clone(),
        );
        env.insert(
            "TF_VAR_access_key_id".to_string(),
            cluster.state_store_credentials.access_key_id.clone(),
        );
        env.insert(
            "TF_VAR_secret_access_key".to_string(),
            cluster.state_store_credentials.secret_access_key.clone(),
        );
        env
    }
}

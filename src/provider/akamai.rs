//! Akamai (Linode) driver

use std::collections::BTreeMap;

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::error::Error;
use crate::provider::{dns, CloudDriver, KubeCredentials, ObjectStore, StateStore, Volume};
use crate::types::{AkamaiAuth, Cluster, StateStoreCredentials, StateStoreDetails};
use crate::Result;

const API_BASE: &str = "https://api.linode.com/v4";

/// Akamai implementation of [`CloudDriver`]
pub struct AkamaiDriver {
    auth: AkamaiAuth,
    region: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct LinodePage<T> {
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct LinodeRegion {
    id: String,
}

#[derive(Debug, Deserialize)]
struct LinodeDomain {
    id: u64,
    domain: String,
}

#[derive(Debug, Deserialize)]
struct LinodeRecord {
    name: String,
    #[serde(default)]
    target: String,
}

#[derive(Debug, Deserialize)]
struct LinodeObjectStorageKey {
    access_key: String,
    secret_key: String,
}

#[derive(Debug, Deserialize)]
struct LkeCluster {
    id: u64,
    label: String,
}

#[derive(Debug, Deserialize)]
struct LkeKubeconfig {
    kubeconfig: String,
}

#[derive(Debug, Deserialize)]
struct LinodeVolume {
    id: u64,
    label: String,
    #[serde(default)]
    linode_id: Option<u64>,
}

impl AkamaiDriver {
    /// Create a driver for one account + region
    pub fn new(auth: AkamaiAuth, region: String) -> Self {
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

    fn object_storage_endpoint(&self) -> String {
        format!("https://{}.linodeobjects.com", self.region)
    }

    async fn dns_zone(&self, domain: &str) -> Result<LinodeDomain> {
        let zones: LinodePage<LinodeDomain> = self
            .request(reqwest::Method::GET, "/domains")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        zones
            .data
            .into_iter()
            .find(|z| z.domain == domain)
            .ok_or_else(|| Error::provider(format!("domain {domain} not found in akamai account")))
    }
}

#[async_trait]
impl CloudDriver for AkamaiDriver {
    async fn validate_region(&self, region: &str) -> Result<()> {
        let regions: LinodePage<LinodeRegion> = self
            .request(reqwest::Method::GET, "/regions")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if regions.data.iter().any(|r| r.id == region) {
            Ok(())
        } else {
            Err(Error::provider(format!(
                "region {region} is not supported by akamai"
            )))
        }
    }

    async fn validate_domain_ownership(&self, domain: &str) -> Result<bool> {
        let zone = self.dns_zone(domain).await?;

        let records: LinodePage<LinodeRecord> = self
            .request(reqwest::Method::GET, &format!("/domains/{}/records", zone.id))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let exists = records
            .data
            .iter()
            .any(|r| r.name == "kubefirst-liveness" && r.target == dns::LIVENESS_RECORD_VALUE);

        if !exists {
            self.request(reqwest::Method::POST, &format!("/domains/{}/records", zone.id))
                .json(&json!({
                    "type": "TXT",
                    "name": "kubefirst-liveness",
                    "target": dns::LIVENESS_RECORD_VALUE,
                    "ttl_sec": 600,
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
        let key: LinodeObjectStorageKey = self
            .request(reqwest::Method::POST, "/object-storage/keys")
            .json(&json!({ "label": name }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let endpoint = self.object_storage_endpoint();
        ObjectStore::new(&endpoint, &self.region, &key.access_key, &key.secret_key)
            .create_bucket(name)
            .await?;

        Ok(StateStore {
            credentials: StateStoreCredentials {
                access_key_id: key.access_key,
                secret_access_key: key.secret_key,
                name: name.to_string(),
            },
            details: StateStoreDetails {
                name: name.to_string(),
                hostname: endpoint,
                id: String::new(),
            },
        })
    }

    async fn delete_state_store(&self, name: &str) -> Result<()> {
        self.request(
            reqwest::Method::DELETE,
            &format!("/object-storage/buckets/{}/{name}", self.region),
        )
        .send()
        .await?
        .error_for_status()?;
        info!(bucket = %name, "akamai object storage bucket deleted");
        Ok(())
    }

    async fn kube_credentials(&self, cluster_name: &str) -> Result<KubeCredentials> {
        let clusters: LinodePage<LkeCluster> = self
            .request(reqwest::Method::GET, "/lke/clusters")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let cluster = clusters
            .data
            .into_iter()
            .find(|c| c.label == cluster_name)
            .ok_or_else(|| Error::provider(format!("akamai cluster {cluster_name} not found")))?;

        let config: LkeKubeconfig = self
            .request(
                reqwest::Method::GET,
                &format!("/lke/clusters/{}/kubeconfig", cluster.id),
            )
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let kubeconfig = base64::engine::general_purpose::STANDARD
            .decode(config.kubeconfig.as_bytes())
            .map_err(|e| Error::provider(format!("akamai kubeconfig is not base64: {e}")))?;
        crate::k8s::write_kubeconfig(cluster_name, &kubeconfig)
    }

    async fn list_cluster_volumes(&self, cluster_name: &str) -> Result<Vec<Volume>> {
        let volumes: LinodePage<LinodeVolume> = self
            .request(reqwest::Method::GET, "/volumes")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(volumes
            .data
            .into_iter()
            .filter(|v| v.label.contains(cluster_name) || v.label.starts_with("pvc"))
            .map(|v| Volume {
                id: v.id.to_string(),
                name: v.label,
                attached: v.linode_id.is_some(),
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
        env.insert("LINODE_TOKEN".to_string(), self.auth.token.clone());
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

//! DigitalOcean driver
//!
//! The state store is a Space: DigitalOcean only offers object storage in a
//! fixed set of regions, so region validation also checks that set. Spaces
//! credentials are account-scoped and supplied by the operator rather than
//! minted per bucket.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::error::Error;
use crate::provider::{dns, CloudDriver, KubeCredentials, ObjectStore, StateStore, Volume};
use crate::types::{Cluster, DigitaloceanAuth, StateStoreCredentials, StateStoreDetails};
use crate::Result;

const API_BASE: &str = "https://api.digitalocean.com/v2";

/// Regions with Spaces object storage
const OBJECT_STORAGE_REGIONS: [&str; 6] = ["ams3", "fra1", "nyc3", "sfo3", "sgp1", "syd1"];

/// DigitalOcean implementation of [`CloudDriver`]
pub struct DigitaloceanDriver {
    auth: DigitaloceanAuth,
    region: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct DoRegionList {
    regions: Vec<DoRegion>,
}

#[derive(Debug, Deserialize)]
struct DoRegion {
    slug: String,
}

#[derive(Debug, Deserialize)]
struct DoRecordList {
    domain_records: Vec<DoRecord>,
}

#[derive(Debug, Deserialize)]
struct DoRecord {
    name: String,
    #[serde(default)]
    data: String,
}

#[derive(Debug, Deserialize)]
struct DoClusterList {
    kubernetes_clusters: Vec<DoCluster>,
}

#[derive(Debug, Deserialize)]
struct DoCluster {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct DoVolumeList {
    volumes: Vec<DoVolume>,
}

#[derive(Debug, Deserialize)]
struct DoVolume {
    id: String,
    name: String,
    #[serde(default)]
    droplet_ids: Vec<u64>,
}

impl DigitaloceanDriver {
    /// Create a driver for one account + region
    pub fn new(auth: DigitaloceanAuth, region: String) -> Self {
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

    fn spaces_endpoint(&self) -> String {
        format!("https://{}.digitaloceanspaces.com", self.region)
    }

    fn spaces(&self) -> ObjectStore {
        ObjectStore::new(
            &self.spaces_endpoint(),
            &self.region,
            &self.auth.spaces_key,
            &self.auth.spaces_secret,
        )
    }
}

#[async_trait]
impl CloudDriver for DigitaloceanDriver {
    async fn validate_region(&self, region: &str) -> Result<()> {
        let regions: DoRegionList = self
            .request(reqwest::Method::GET, "/regions")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if !regions.regions.iter().any(|r| r.slug == region) {
            return Err(Error::provider(format!(
                "region {region} is not supported by digitalocean"
            )));
        }
        if !OBJECT_STORAGE_REGIONS.contains(&region) {
            return Err(Error::provider(format!(
                "region {region} has no Spaces object storage; supported: {}",
                OBJECT_STORAGE_REGIONS.join(", ")
            )));
        }
        Ok(())
    }

    async fn validate_domain_ownership(&self, domain: &str) -> Result<bool> {
        // a 404 here means the zone is not in this account
        self.request(reqwest::Method::GET, &format!("/domains/{domain}"))
            .send()
            .await?
            .error_for_status()
            .map_err(|_| Error::provider(format!("domain {domain} not found in digitalocean account")))?;

        let records: DoRecordList = self
            .request(reqwest::Method::GET, &format!("/domains/{domain}/records"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let exists = records
            .domain_records
            .iter()
            .any(|r| r.name == "kubefirst-liveness" && r.data == dns::LIVENESS_RECORD_VALUE);

        if !exists {
            self.request(reqwest::Method::POST, &format!("/domains/{domain}/records"))
                .json(&json!({
                    "type": "TXT",
                    "name": "kubefirst-liveness",
                    "data": dns::LIVENESS_RECORD_VALUE,
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
        if self.auth.spaces_key.is_empty() || self.auth.spaces_secret.is_empty() {
            return Err(Error::provider(
                "digitalocean spaces credentials are required for the state store",
            ));
        }
        self.spaces().create_bucket(name).await?;
        Ok(StateStore {
            credentials: StateStoreCredentials {
                access_key_id: self.auth.spaces_key.clone(),
                secret_access_key: self.auth.spaces_secret.clone(),
                name: name.to_string(),
            },
            details: StateStoreDetails {
                name: name.to_string(),
                hostname: self.spaces_endpoint(),
                id: String::new(),
            },
        })
    }

    async fn delete_state_store(&self, name: &str) -> Result<()> {
        self.spaces().delete_bucket(name).await
    }

    async fn kube_credentials(&self, cluster_name: &str) -> Result<KubeCredentials> {
        let clusters: DoClusterList = self
            .request(reqwest::Method::GET, "/kubernetes/clusters")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let cluster = clusters
            .kubernetes_clusters
            .into_iter()
            .find(|c| c.name == cluster_name)
            .ok_or_else(|| {
                Error::provider(format!("digitalocean cluster {cluster_name} not found"))
            })?;

        let kubeconfig = self
            .request(
                reqwest::Method::GET,
                &format!("/kubernetes/clusters/{}/kubeconfig", cluster.id),
            )
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;

        crate::k8s::write_kubeconfig(cluster_name, &kubeconfig)
    }

    async fn list_cluster_volumes(&self, cluster_name: &str) -> Result<Vec<Volume>> {
        let volumes: DoVolumeList = self
            .request(reqwest::Method::GET, "/volumes")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        // CSI volumes carry the cluster name in their pvc-derived name
        Ok(volumes
            .volumes
            .into_iter()
            .filter(|v| v.name.contains(cluster_name) || v.name.starts_with("pvc-"))
            .map(|v| Volume {
                id: v.id,
                name: v.name,
                attached: !v.droplet_ids.is_empty(),
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
        env.insert("DIGITALOCEAN_TOKEN".to_string(), self.auth.token.clone());
        env.insert(
            "AWS_ACCESS_KEY_ID".to_string(),
            cluster.state_store_credentials.access_key_id.clone(),
        );
        env.insert(
            "AWS_SECRET_ACCESS_KEY".to_string(),
            cluster.state_store_credentials.secret_access_key.clone(),
        );
        env.insert(
            "SPACES_ACCESS_KEY_ID".to_string(),
            self.auth.spaces_key.clone(),
        );
        env.insert(
            "SPACES_SECRET_ACCESS_KEY".to_string(),
            self.auth.spaces_secret.clone(),
        );
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_storage_region_set_is_fixed() {
        assert_eq!(
            OBJECT_STORAGE_REGIONS,
            ["ams3", "fra1", "nyc3", "sfo3", "sgp1", "syd1"]
        );
    }

    #[test]
    fn spaces_endpoint_is_region_scoped() {
        let driver = DigitaloceanDriver::new(DigitaloceanAuth::default(), "fra1".to_string());
        assert_eq!(
            driver.spaces_endpoint(),
            "https://fra1.digitaloceanspaces.com"
        );
    }
}

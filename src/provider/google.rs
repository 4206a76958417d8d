//! Google Cloud driver
//!
//! Access tokens come from the application credentials file when it holds an
//! authorized-user refresh token, falling back to the GCE metadata server
//! when running on Google infrastructure. The state store is a GCS bucket;
//! terraform authenticates through `GOOGLE_APPLICATION_CREDENTIALS` rather
//! than minted keys.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::env::Env;
use crate::error::Error;
use crate::provider::{dns, CloudDriver, KubeCredentials, StateStore, Volume};
use crate::types::{Cluster, GoogleAuth, StateStoreCredentials, StateStoreDetails};
use crate::Result;

const TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const METADATA_TOKEN_URI: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Google implementation of [`CloudDriver`]
pub struct GoogleDriver {
    auth: GoogleAuth,
    region: String,
    cluster_name: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct AccessTokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct CredentialsFile {
    #[serde(rename = "type", default)]
    credential_type: String,
    #[serde(default)]
    client_id: String,
    #[serde(default)]
    client_secret: String,
    #[serde(default)]
    refresh_token: String,
}

#[derive(Debug, Deserialize)]
struct RegionList {
    #[serde(default)]
    items: Vec<RegionItem>,
}

#[derive(Debug, Deserialize)]
struct RegionItem {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ManagedZoneList {
    #[serde(default)]
    #[serde(rename = "managedZones")]
    managed_zones: Vec<ManagedZone>,
}

#[derive(Debug, Deserialize)]
struct ManagedZone {
    name: String,
    #[serde(rename = "dnsName")]
    dns_name: String,
}

#[derive(Debug, Deserialize)]
struct RrsetList {
    #[serde(default)]
    rrsets: Vec<Rrset>,
}

#[derive(Debug, Deserialize)]
struct Rrset {
    name: String,
    #[serde(default)]
    rrdatas: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct GkeCluster {
    endpoint: String,
    #[serde(rename = "masterAuth")]
    master_auth: GkeMasterAuth,
}

#[derive(Debug, Deserialize)]
struct GkeMasterAuth {
    #[serde(rename = "clusterCaCertificate")]
    cluster_ca_certificate: String,
}

#[derive(Debug, Deserialize)]
struct DiskAggregatedList {
    #[serde(default)]
    items: BTreeMap<String, DiskScope>,
}

#[derive(Debug, Deserialize)]
struct DiskScope {
    #[serde(default)]
    disks: Vec<Disk>,
}

#[derive(Debug, Deserialize)]
struct Disk {
    name: String,
    #[serde(default)]
    users: Vec<String>,
    #[serde(default)]
    zone: String,
}

impl GoogleDriver {
    /// Create a driver for one project + region
    pub fn new(auth: GoogleAuth, region: String, cluster_name: String) -> Self {
        Self {
            auth,
            region,
            cluster_name,
            http: reqwest::Client::new(),
        }
    }

    /// Fetch a bearer token for the Google REST APIs
    async fn access_token(&self) -> Result<String> {
        if !self.auth.key_file.is_empty() {
            let creds: CredentialsFile = serde_json::from_str(&self.auth.key_file)
                .map_err(|e| Error::provider(format!("unreadable google credentials: {e}")))?;
            if creds.credential_type == "authorized_user" {
                debug!("using authorized-user refresh token");
                let response: AccessTokenResponse = self
                    .http
                    .post(TOKEN_URI)
                    .form(&[
                        ("client_id", creds.client_id.as_str()),
                        ("client_secret", creds.client_secret.as_str()),
                        ("refresh_token", creds.refresh_token.as_str()),
                        ("grant_type", "refresh_token"),
                    ])
                    .send()
                    .await?
                    .error_for_status()?
                    .json()
                    .await?;
                return Ok(response.access_token);
            }
        }

        debug!("fetching credentials from metadata server");
        let response: AccessTokenResponse = self
            .http
            .get(METADATA_TOKEN_URI)
            .header("Metadata-Flavor", "Google")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.access_token)
    }

    async fn managed_zone(&self, token: &str, domain: &str) -> Result<ManagedZone> {
        let zones: ManagedZoneList = self
            .http
            .get(format!(
                "https://dns.googleapis.com/dns/v1/projects/{}/managedZones",
                self.auth.project_id
            ))
            .bearer_auth(token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let wanted = format!("{domain}.");
        zones
            .managed_zones
            .into_iter()
            .find(|z| z.dns_name == wanted)
            .ok_or_else(|| Error::provider(format!("domain {domain} not found in google project")))
    }

    /// Materialize the credentials file where terraform expects it
    fn write_credentials_file(&self) -> Result<std::path::PathBuf> {
        let dir = Env::k1_dir().join(&self.cluster_name);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("application-default-credentials.json");
        std::fs::write(&path, self.auth.key_file.as_bytes())?;
        Ok(path)
    }
}

#[async_trait]
impl CloudDriver for GoogleDriver {
    async fn validate_region(&self, region: &str) -> Result<()> {
        let token = self.access_token().await?;
        let regions: RegionList = self
            .http
            .get(format!(
                "https://compute.googleapis.com/compute/v1/projects/{}/regions",
                self.auth.project_id
            ))
            .bearer_auth(&token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if regions.items.iter().any(|r| r.name == region) {
            Ok(())
        } else {
            Err(Error::provider(format!(
                "region {region} is not supported by google"
            )))
        }
    }

    async fn validate_domain_ownership(&self, domain: &str) -> Result<bool> {
        let token = self.access_token().await?;
        let zone = self.managed_zone(&token, domain).await?;
        let record_name = format!("{}.", dns::liveness_record_name(domain));
        let quoted_value = format!("\"{}\"", dns::LIVENESS_RECORD_VALUE);

        let rrsets: RrsetList = self
            .http
            .get(format!(
                "https://dns.googleapis.com/dns/v1/projects/{}/managedZones/{}/rrsets",
                self.auth.project_id, zone.name
            ))
            .bearer_auth(&token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let exists = rrsets
            .rrsets
            .iter()
            .any(|r| r.name == record_name && r.rrdatas.iter().any(|d| d == &quoted_value));

        if !exists {
            self.http
                .post(format!(
                    "https://dns.googleapis.com/dns/v1/projects/{}/managedZones/{}/changes",
                    self.auth.project_id, zone.name
                ))
                .bearer_auth(&token)
                .json(&json!({
                    "additions": [{
                        "name": record_name,
                        "type": "TXT",
                        "ttl": 600,
                        "rrdatas": [quoted_value],
                    }]
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
        let token = self.access_token().await?;
        let response = self
            .http
            .post("https://storage.googleapis.com/storage/v1/b")
            .query(&[("project", self.auth.project_id.as_str())])
            .bearer_auth(&token)
            .json(&json!({ "name": name, "location": self.region }))
            .send()
            .await?;

        // 409 means the bucket already exists in this project
        if !response.status().is_success() && response.status().as_u16() != 409 {
            return Err(Error::provider(format!(
                "creating gcs bucket {name}: {}",
                response.status()
            )));
        }
        info!(bucket = %name, "gcs state store ready");

        Ok(StateStore {
            credentials: StateStoreCredentials {
                name: name.to_string(),
                ..StateStoreCredentials::default()
            },
            details: StateStoreDetails {
                name: name.to_string(),
                hostname: "storage.googleapis.com".to_string(),
                id: String::new(),
            },
        })
    }

    async fn delete_state_store(&self, name: &str) -> Result<()> {
        let token = self.access_token().await?;
        let response = self
            .http
            .delete(format!("https://storage.googleapis.com/storage/v1/b/{name}"))
            .bearer_auth(&token)
            .send()
            .await?;
        if response.status().is_success() || response.status().as_u16() == 404 {
            Ok(())
        } else {
            Err(Error::provider(format!(
                "deleting gcs bucket {name}: {}",
                response.status()
            )))
        }
    }

    async fn kube_credentials(&self, cluster_name: &str) -> Result<KubeCredentials> {
        let token = self.access_token().await?;
        let cluster: GkeCluster = self
            .http
            .get(format!(
                "https://container.googleapis.com/v1/projects/{}/locations/{}/clusters/{}",
                self.auth.project_id, self.region, cluster_name
            ))
            .bearer_auth(&token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let kubeconfig = gke_kubeconfig(
            cluster_name,
            &cluster.endpoint,
            &cluster.master_auth.cluster_ca_certificate,
            &token,
        );
        crate::k8s::write_kubeconfig(cluster_name, kubeconfig.as_bytes())
    }

    async fn list_cluster_volumes(&self, cluster_name: &str) -> Result<Vec<Volume>> {
        let token = self.access_token().await?;
        let disks: DiskAggregatedList = self
            .http
            .get(format!(
                "https://compute.googleapis.com/compute/v1/projects/{}/aggregated/disks",
                self.auth.project_id
            ))
            .bearer_auth(&token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(disks
            .items
            .into_values()
            .flat_map(|scope| scope.disks)
            .filter(|d| d.name.contains(cluster_name) || d.name.starts_with("pvc-"))
            .map(|d| {
                let zone = d.zone.rsplit('/').next().unwrap_or_default().to_string();
                Volume {
                    id: format!("{zone}/{}", d.name),
                    name: d.name,
                    attached: !d.users.is_empty(),
                }
            })
            .collect())
    }

    async fn delete_volume(&self, volume_id: &str) -> Result<()> {
        let (zone, name) = volume_id
            .split_once('/')
            .ok_or_else(|| Error::provider(format!("malformed disk id {volume_id}")))?;
        let token = self.access_token().await?;
        self.http
            .delete(format!(
                "https://compute.googleapis.com/compute/v1/projects/{}/zones/{zone}/disks/{name}",
                self.auth.project_id
            ))
            .bearer_auth(&token)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    fn terraform_env(&self, _cluster: &Cluster) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        if let Ok(path) = self.write_credentials_file() {
            env.insert(
                "GOOGLE_APPLICATION_CREDENTIALS".to_string(),
                path.display().to_string(),
            );
        }
        env.insert("TF_VAR_project".to_string(), self.auth.project_id.clone());
        env
    }
}

/// Render a kubeconfig for a GKE endpoint with a bearer token
fn gke_kubeconfig(name: &str, endpoint: &str, ca_certificate: &str, token: &str) -> String {
    format!(
        r#"apiVersion: v1
kind: Config
clusters:
- name: {name}
  cluster:
    certificate-authority-data: {ca_certificate}
    server: https://{endpoint}
contexts:
- name: {name}
  context:
    cluster: {name}
    user: {name}
current-context: {name}
users:
- name: {name}
  user:
    token: {token}
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gke_kubeconfig_is_valid_yaml() {
        let rendered = gke_kubeconfig("k1", "10.0.0.1", "Y2E=", "tok");
        let value: serde_yaml::Value = serde_yaml::from_str(&rendered).unwrap();
        assert_eq!(value["current-context"], "k1");
        assert_eq!(value["clusters"][0]["cluster"]["server"], "https://10.0.0.1");
    }

    #[test]
    fn credentials_file_type_detection() {
        let user = r#"{"type":"authorized_user","client_id":"a","client_secret":"b","refresh_token":"c"}"#;
        let parsed: CredentialsFile = serde_json::from_str(user).unwrap();
        assert_eq!(parsed.credential_type, "authorized_user");
        assert_eq!(parsed.refresh_token, "c");
    }
}

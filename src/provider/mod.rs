//! Cloud provider abstraction
//!
//! Every provider implements [`CloudDriver`]; the lifecycle controller only
//! ever talks to the trait. The factory in [`driver_for`] is the single
//! place that knows which providers exist - provider-specific branches do
//! not leak into the controller.

mod akamai;
mod civo;
mod digitalocean;
mod dns;
mod google;
mod k3d;
mod object_store;
mod vultr;

pub use akamai::AkamaiDriver;
pub use civo::CivoDriver;
pub use digitalocean::DigitaloceanDriver;
pub use dns::{liveness_record_name, wait_for_txt_propagation, LIVENESS_RECORD_VALUE};
pub use google::GoogleDriver;
pub use k3d::K3dDriver;
pub use object_store::ObjectStore;
pub use vultr::VultrDriver;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use crate::error::Error;
use crate::types::{CloudProvider, Cluster, StateStoreCredentials, StateStoreDetails};
use crate::Result;

/// Poll cadence for volume detachment: 24 attempts x 5s
pub const VOLUME_DETACH_ATTEMPTS: u32 = 24;
/// Seconds between volume detachment polls
pub const VOLUME_DETACH_INTERVAL_SECS: u64 = 5;
/// Poll cadence for object-store activation: 60 attempts x 1s
pub const STATE_STORE_ATTEMPTS: u32 = 60;

/// Kubernetes access material for a provisioned cluster
#[derive(Clone, Debug)]
pub struct KubeCredentials {
    /// Path the kubeconfig was written to
    pub kubeconfig_path: PathBuf,
}

/// A provider-managed block volume
#[derive(Clone, Debug)]
pub struct Volume {
    /// Provider volume id
    pub id: String,
    /// Volume name
    pub name: String,
    /// True while the volume is attached to an instance
    pub attached: bool,
}

/// Everything a provider minted for the terraform state store
#[derive(Clone, Debug, Default)]
pub struct StateStore {
    /// Access credentials
    pub credentials: StateStoreCredentials,
    /// Bucket location
    pub details: StateStoreDetails,
}

/// Per-provider operations required by the lifecycle controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CloudDriver: Send + Sync {
    /// Check the region exists (and supports object storage where relevant)
    async fn validate_region(&self, region: &str) -> Result<()>;

    /// Prove the DNS zone is controlled by the configured account
    ///
    /// Creates the liveness TXT record and polls for propagation. Returns
    /// immediately when the record already exists with the expected value.
    async fn validate_domain_ownership(&self, domain: &str) -> Result<bool>;

    /// Provision the terraform state store and mint credentials for it
    async fn create_state_store(&self, name: &str) -> Result<StateStore>;

    /// Tear the state store down
    async fn delete_state_store(&self, name: &str) -> Result<()>;

    /// Fetch cluster credentials and write a kubeconfig to scratch
    async fn kube_credentials(&self, cluster_name: &str) -> Result<KubeCredentials>;

    /// List provider volumes that belong to the cluster
    ///
    /// Terraform destroy does not reclaim volumes created by the in-cluster
    /// CSI driver, so the delete path sweeps them afterwards.
    async fn list_cluster_volumes(&self, cluster_name: &str) -> Result<Vec<Volume>>;

    /// Delete one volume by id; callers wait for detachment first
    async fn delete_volume(&self, volume_id: &str) -> Result<()>;

    /// Provider-specific environment for terraform runs
    fn terraform_env(&self, cluster: &Cluster) -> BTreeMap<String, String>;
}

/// Build the driver for a cluster record
///
/// The only place in the codebase that matches on provider names.
pub fn driver_for(cluster: &Cluster) -> Result<Arc<dyn CloudDriver>> {
    match cluster.cloud_provider {
        CloudProvider::Akamai => Ok(Arc::new(AkamaiDriver::new(
            cluster.akamai_auth.clone(),
            cluster.cloud_region.clone(),
        ))),
        CloudProvider::Civo => Ok(Arc::new(CivoDriver::new(
            cluster.civo_auth.clone(),
            cluster.cloud_region.clone(),
        ))),
        CloudProvider::Digitalocean => Ok(Arc::new(DigitaloceanDriver::new(
            cluster.do_auth.clone(),
            cluster.cloud_region.clone(),
        ))),
        CloudProvider::Google => Ok(Arc::new(GoogleDriver::new(
            cluster.google_auth.clone(),
            cluster.cloud_region.clone(),
            cluster.cluster_name.clone(),
        ))),
        CloudProvider::K3d => Ok(Arc::new(K3dDriver::new(cluster.cluster_name.clone()))),
        CloudProvider::Vultr => Ok(Arc::new(VultrDriver::new(
            cluster.vultr_auth.clone(),
            cluster.cloud_region.clone(),
        ))),
        CloudProvider::Aws => Err(Error::provider(
            "aws clusters are not provisioned by this service",
        )),
    }
}

/// Wait until a volume reports detached, then delete it
///
/// Bounded at 24 x 5s per volume; exhaustion is a timeout.
pub async fn reap_volume(driver: &dyn CloudDriver, cluster_name: &str, volume: &Volume) -> Result<()> {
    use tracing::info;

    let mut attached = volume.attached;
    for _ in 0..VOLUME_DETACH_ATTEMPTS {
        if !attached {
            driver.delete_volume(&volume.id).await?;
            info!(cluster = %cluster_name, volume = %volume.name, "volume deleted");
            return Ok(());
        }
        tokio::time::sleep(std::time::Duration::from_secs(VOLUME_DETACH_INTERVAL_SECS)).await;
        attached = driver
            .list_cluster_volumes(cluster_name)
            .await?
            .into_iter()
            .find(|v| v.id == volume.id)
            .map(|v| v.attached)
            .unwrap_or(false);
    }
    Err(Error::timeout(format!(
        "volume {} still attached after {} attempts",
        volume.name, VOLUME_DETACH_ATTEMPTS
    )))
}

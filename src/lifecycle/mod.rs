//! Cluster lifecycle controller
//!
//! The core state machine. Provisioning advances through the ordered
//! checkpoint transitions of [`Checkpoint::ORDER`]; each transition runs its
//! step, flips exactly one durable boolean, and persists the record. A
//! restarted controller finds the first unmet checkpoint and resumes there.
//! Deletion is the inverse walk, clearing bits in strictly reverse order.

mod create;
mod delete;
mod tools;

pub use tools::download_tools;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info};

use crate::env::Env;
use crate::error::Error;
use crate::provider::{driver_for, CloudDriver};
use crate::store::{random_cluster_id, ClusterStore, ServiceListStore};
use crate::terraform::{TerraformCli, TerraformRunner};
use crate::types::{
    Checkpoint, CloudProvider, Cluster, ClusterDefinition, ClusterStatus, ClusterType,
    GitProtocol, GitProvider,
};
use crate::Result;

/// Per-cluster scratch layout under `~/.k1/<cluster>`
#[derive(Clone, Debug)]
pub struct ClusterPaths {
    /// Root of the cluster's scratch area
    pub k1_dir: PathBuf,
    /// Downloaded tool binaries
    pub tools_dir: PathBuf,
    /// Local gitops working copy
    pub gitops_dir: PathBuf,
    /// Local metaphor working copy
    pub metaphor_dir: PathBuf,
}

impl ClusterPaths {
    /// Paths for a cluster name
    pub fn for_cluster(cluster_name: &str) -> Self {
        let k1_dir = Env::k1_dir().join(cluster_name);
        Self {
            tools_dir: k1_dir.join("tools"),
            gitops_dir: k1_dir.join("gitops"),
            metaphor_dir: k1_dir.join("metaphor"),
            k1_dir,
        }
    }

    /// Terraform entrypoint directory for a layer (`civo`, `github`, `vault`, ...)
    pub fn terraform_entrypoint(&self, layer: &str) -> PathBuf {
        self.gitops_dir.join("terraform").join(layer)
    }
}

/// Drives one cluster through provisioning or deletion
pub struct ClusterController {
    pub(crate) cluster: Cluster,
    pub(crate) store: ClusterStore,
    pub(crate) services: ServiceListStore,
    pub(crate) driver: Arc<dyn CloudDriver>,
    pub(crate) terraform: Arc<dyn TerraformRunner>,
    pub(crate) paths: ClusterPaths,
    pub(crate) env: Env,
}

impl ClusterController {
    /// Initialize a controller for a brand new cluster definition
    ///
    /// Creates the durable record (refusing duplicates) before any external
    /// side effect happens.
    pub async fn initialize(
        cluster_name: &str,
        definition: &ClusterDefinition,
        store: ClusterStore,
        services: ServiceListStore,
        env: Env,
    ) -> Result<Self> {
        definition.validate()?;
        let cluster = record_from_definition(cluster_name, definition)?;
        store.create(&cluster).await?;
        Self::resume(cluster, store, services, env)
    }

    /// Build a controller over an existing record
    pub fn resume(
        cluster: Cluster,
        store: ClusterStore,
        services: ServiceListStore,
        env: Env,
    ) -> Result<Self> {
        let driver = driver_for(&cluster)?;
        let paths = ClusterPaths::for_cluster(&cluster.cluster_name);
        let terraform: Arc<dyn TerraformRunner> =
            Arc::new(TerraformCli::new(paths.tools_dir.join("terraform")));
        Ok(Self {
            cluster,
            store,
            services,
            driver,
            terraform,
            paths,
            env,
        })
    }

    /// Replace the external seams; used by tests
    #[cfg(test)]
    pub(crate) fn with_seams(
        mut self,
        driver: Arc<dyn CloudDriver>,
        terraform: Arc<dyn TerraformRunner>,
    ) -> Self {
        self.driver = driver;
        self.terraform = terraform;
        self
    }

    /// Persist the in-memory record
    pub(crate) async fn persist(&self) -> Result<()> {
        self.store.update(&self.cluster).await
    }

    /// Flip one checkpoint true and persist
    ///
    /// Every store write during provisioning goes through here, so each
    /// write sets exactly one additional checkpoint.
    pub(crate) async fn checkpoint(&mut self, checkpoint: Checkpoint) -> Result<()> {
        checkpoint.set(&mut self.cluster.checks, true);
        info!(cluster = %self.cluster.cluster_name, ?checkpoint, "checkpoint reached");
        self.persist().await
    }

    /// Clear one checkpoint and persist; used by the delete path
    pub(crate) async fn clear_checkpoint(&mut self, checkpoint: Checkpoint) -> Result<()> {
        checkpoint.set(&mut self.cluster.checks, false);
        info!(cluster = %self.cluster.cluster_name, ?checkpoint, "checkpoint cleared");
        self.persist().await
    }

    /// Record a failure on the cluster and stop
    pub(crate) async fn record_failure(&mut self, message: &str) {
        error!(cluster = %self.cluster.cluster_name, "{message}");
        self.cluster.status = ClusterStatus::Error;
        self.cluster.in_progress = false;
        self.cluster.last_condition = message.to_string();
        if let Err(e) = self.persist().await {
            error!(cluster = %self.cluster.cluster_name, error = %e, "failed to persist error state");
        }
    }

    /// Git-layer terraform environment shared by every terraform run
    pub(crate) fn git_terraform_env(&self) -> BTreeMap<String, String> {
        let cluster = &self.cluster;
        let mut env = BTreeMap::new();
        let git = cluster.git_provider.as_str();
        env.insert(
            format!("TF_VAR_{git}_token"),
            cluster.git_auth.token.clone(),
        );
        env.insert(format!("TF_VAR_{git}_owner"), cluster.git_auth.owner.clone());
        env.insert(
            "TF_VAR_atlantis_repo_webhook_secret".to_string(),
            cluster.atlantis_webhook_secret.clone(),
        );
        env.insert(
            "TF_VAR_kbot_ssh_public_key".to_string(),
            cluster.git_auth.public_key.clone(),
        );
        match cluster.git_provider {
            GitProvider::Github => {
                env.insert("GITHUB_TOKEN".to_string(), cluster.git_auth.token.clone());
            }
            GitProvider::Gitlab => {
                env.insert("GITLAB_TOKEN".to_string(), cluster.git_auth.token.clone());
                env.insert(
                    "TF_VAR_owner_group_id".to_string(),
                    cluster.gitlab_owner_group_id.to_string(),
                );
            }
        }
        env
    }

    /// Environment for the vault and users terraform layers
    pub(crate) fn vault_terraform_env(&self, vault_url: &str, vault_token: &str) -> BTreeMap<String, String> {
        let cluster = &self.cluster;
        let mut env = self.git_terraform_env();
        env.extend(self.driver.terraform_env(cluster));
        env.insert("VAULT_ADDR".to_string(), vault_url.to_string());
        env.insert("VAULT_TOKEN".to_string(), vault_token.to_string());
        env.insert("TF_VAR_vault_addr".to_string(), vault_url.to_string());
        env.insert("TF_VAR_vault_token".to_string(), vault_token.to_string());
        env.insert(
            "TF_VAR_cloudflare_api_key".to_string(),
            cluster.cloudflare_auth.api_token.clone(),
        );
        env.insert(
            "TF_VAR_cloudflare_origin_ca_api_key".to_string(),
            cluster.cloudflare_auth.origin_ca_issuer_key.clone(),
        );
        env.insert(
            "TF_VAR_email_address".to_string(),
            cluster.alerts_email.clone(),
        );
        env.insert(
            "TF_VAR_kbot_ssh_private_key".to_string(),
            cluster.git_auth.private_key.clone(),
        );
        env
    }

    /// Destination clone URL of the cluster's gitops repository
    pub(crate) fn gitops_destination_url(&self) -> String {
        match self.cluster.git_protocol {
            GitProtocol::Https => format!(
                "https://{}/{}/gitops.git",
                self.cluster.git_provider.host(),
                self.cluster.git_auth.owner
            ),
            GitProtocol::Ssh => format!(
                "git@{}:{}/gitops.git",
                self.cluster.git_provider.host(),
                self.cluster.git_auth.owner
            ),
        }
    }

    /// Destination clone URL of the cluster's metaphor repository
    pub(crate) fn metaphor_destination_url(&self) -> String {
        match self.cluster.git_protocol {
            GitProtocol::Https => format!(
                "https://{}/{}/metaphor.git",
                self.cluster.git_provider.host(),
                self.cluster.git_auth.owner
            ),
            GitProtocol::Ssh => format!(
                "git@{}:{}/metaphor.git",
                self.cluster.git_provider.host(),
                self.cluster.git_auth.owner
            ),
        }
    }
}

/// Build the initial record for a definition
fn record_from_definition(cluster_name: &str, def: &ClusterDefinition) -> Result<Cluster> {
    let git_provider = match def.git_provider.as_str() {
        "gitlab" => GitProvider::Gitlab,
        _ => GitProvider::Github,
    };

    let mut cluster = Cluster {
        cluster_name: cluster_name.to_string(),
        cluster_id: random_cluster_id(),
        cloud_provider: CloudProvider::parse(&def.cloud_provider)?,
        cluster_type: match def.cluster_type.as_str() {
            "workload" => ClusterType::Workload,
            _ => ClusterType::Mgmt,
        },
        cloud_region: def.cloud_region.clone(),
        domain_name: def.domain_name.clone(),
        subdomain_name: def.subdomain_name.clone(),
        dns_provider: if def.dns_provider.is_empty() {
            def.cloud_provider.clone()
        } else {
            def.dns_provider.clone()
        },
        alerts_email: def.admin_email.clone(),
        git_provider,
        git_protocol: match def.git_protocol.as_str() {
            "ssh" => GitProtocol::Ssh,
            _ => GitProtocol::Https,
        },
        git_host: git_provider.host().to_string(),
        gitlab_owner_group_id: def.gitlab_owner_group_id,
        akamai_auth: def.akamai_auth.clone(),
        civo_auth: def.civo_auth.clone(),
        do_auth: def.do_auth.clone(),
        vultr_auth: def.vultr_auth.clone(),
        google_auth: def.google_auth.clone(),
        cloudflare_auth: def.cloudflare_auth.clone(),
        atlantis_webhook_secret: random_webhook_secret(),
        post_install_catalog_apps: def.post_install_catalog_apps.clone(),
        status: ClusterStatus::Provisioning,
        in_progress: false,
        creation_timestamp: Utc::now().to_rfc3339(),
        ..Cluster::default()
    };
    cluster.git_auth.owner = def.git_owner.clone();
    cluster.git_auth.user = def.git_owner.clone();
    cluster.git_auth.token = def.git_token.clone();
    cluster.atlantis_webhook_url = format!(
        "https://atlantis.{}/events",
        if cluster.subdomain_name.is_empty() {
            cluster.domain_name.clone()
        } else {
            format!("{}.{}", cluster.subdomain_name, cluster.domain_name)
        }
    );
    Ok(cluster)
}

fn random_webhook_secret() -> String {
    use rand::distributions::Alphanumeric;
    use rand::Rng;
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(20)
        .map(char::from)
        .collect()
}

/// Result of one background lifecycle run, reported via the record only
pub fn spawn_logged<F>(task_name: &'static str, future: F)
where
    F: std::future::Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = future.await {
            error!(task = task_name, error = %e, "background task failed");
        }
    });
}

/// Generate the kbot SSH keypair
pub(crate) fn generate_kbot_keypair() -> Result<(String, String)> {
    use ssh_key::{rand_core::OsRng, Algorithm, LineEnding, PrivateKey};

    let private = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
        .map_err(|e| Error::serialization(format!("generating kbot key: {e}")))?;
    let private_pem = private
        .to_openssh(LineEnding::LF)
        .map_err(|e| Error::serialization(format!("encoding kbot private key: {e}")))?
        .to_string();
    let public = private
        .public_key()
        .to_openssh()
        .map_err(|e| Error::serialization(format!("encoding kbot public key: {e}")))?;
    Ok((private_pem, public))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn definition() -> ClusterDefinition {
        ClusterDefinition {
            admin_email: "a@b".to_string(),
            cloud_provider: "civo".to_string(),
            cloud_region: "lon1".to_string(),
            domain_name: "kubefirst.dev".to_string(),
            git_owner: "acme".to_string(),
            git_provider: "github".to_string(),
            git_token: "ghp_x".to_string(),
            cluster_type: "mgmt".to_string(),
            ..ClusterDefinition::default()
        }
    }

    #[test]
    fn record_from_definition_seeds_identity() {
        let cluster = record_from_definition("k1", &definition()).unwrap();
        assert_eq!(cluster.cluster_name, "k1");
        assert_eq!(cluster.cluster_id.len(), 6);
        assert_eq!(cluster.status, ClusterStatus::Provisioning);
        assert_eq!(cluster.dns_provider, "civo");
        assert_eq!(cluster.atlantis_webhook_secret.len(), 20);
        assert_eq!(
            cluster.atlantis_webhook_url,
            "https://atlantis.kubefirst.dev/events"
        );
        assert!(cluster.checks.all_cleared());
    }

    #[test]
    fn terraform_git_env_varies_by_provider() {
        let mut cluster = record_from_definition("k1", &definition()).unwrap();
        cluster.git_auth.public_key = "ssh-ed25519 AAAA".to_string();
        let paths = ClusterPaths::for_cluster("k1");
        let controller = ClusterController {
            driver: crate::provider::driver_for(&cluster).unwrap(),
            terraform: Arc::new(TerraformCli::new(paths.tools_dir.join("terraform"))),
            paths,
            store: ClusterStore::new(Arc::new(crate::store::memory::MemorySecretsBackend::new())),
            services: ServiceListStore::new(Arc::new(
                crate::store::memory::MemorySecretsBackend::new(),
            )),
            env: Env::try_parse_from(["kubefirst-api"]).unwrap(),
            cluster,
        };

        let env = controller.git_terraform_env();
        assert_eq!(env["TF_VAR_github_token"], "ghp_x");
        assert_eq!(env["TF_VAR_github_owner"], "acme");
        assert_eq!(env["TF_VAR_kbot_ssh_public_key"], "ssh-ed25519 AAAA");
        assert!(env.contains_key("GITHUB_TOKEN"));
        assert!(!env.contains_key("TF_VAR_owner_group_id"));
    }

    #[test]
    fn gitlab_env_carries_group_id() {
        let mut def = definition();
        def.git_provider = "gitlab".to_string();
        def.gitlab_owner_group_id = 42;
        let cluster = record_from_definition("k1", &def).unwrap();
        let paths = ClusterPaths::for_cluster("k1");
        let controller = ClusterController {
            driver: crate::provider::driver_for(&cluster).unwrap(),
            terraform: Arc::new(TerraformCli::new(paths.tools_dir.join("terraform"))),
            paths,
            store: ClusterStore::new(Arc::new(crate::store::memory::MemorySecretsBackend::new())),
            services: ServiceListStore::new(Arc::new(
                crate::store::memory::MemorySecretsBackend::new(),
            )),
            env: Env::try_parse_from(["kubefirst-api"]).unwrap(),
            cluster,
        };

        let env = controller.git_terraform_env();
        assert_eq!(env["TF_VAR_owner_group_id"], "42");
        assert_eq!(env["TF_VAR_gitlab_owner"], "acme");
        assert!(env.contains_key("GITLAB_TOKEN"));
    }

    #[test]
    fn kbot_keypair_is_openssh_ed25519() {
        let (private_pem, public) = generate_kbot_keypair().unwrap();
        assert!(private_pem.contains("BEGIN OPENSSH PRIVATE KEY"));
        assert!(public.starts_with("ssh-ed25519 "));
    }

    #[test]
    fn terraform_entrypoints_live_in_the_gitops_clone() {
        let paths = ClusterPaths::for_cluster("k1");
        let entry = paths.terraform_entrypoint("vault");
        assert!(entry.ends_with(".k1/k1/gitops/terraform/vault"));
    }
}

//! Cluster record and definition types
//!
//! The [`Cluster`] struct is the durable document behind every lifecycle
//! operation. It is flattened into a Kubernetes Secret by the store layer,
//! so every field must round-trip through JSON.

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::types::GitopsCatalogApp;

/// Supported cloud providers
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CloudProvider {
    /// Akamai Connected Cloud (Linode)
    Akamai,
    /// Amazon Web Services
    Aws,
    /// Civo
    Civo,
    /// DigitalOcean
    Digitalocean,
    /// Google Cloud (GKE)
    Google,
    /// Local k3d cluster
    #[default]
    K3d,
    /// Vultr
    Vultr,
}

impl CloudProvider {
    /// Wire name of the provider, as it appears in records and URLs
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Akamai => "akamai",
            Self::Aws => "aws",
            Self::Civo => "civo",
            Self::Digitalocean => "digitalocean",
            Self::Google => "google",
            Self::K3d => "k3d",
            Self::Vultr => "vultr",
        }
    }

    /// Parse a provider from its wire name
    pub fn parse(s: &str) -> Result<Self, Error> {
        match s {
            "akamai" => Ok(Self::Akamai),
            "aws" => Ok(Self::Aws),
            "civo" => Ok(Self::Civo),
            "digitalocean" => Ok(Self::Digitalocean),
            "google" => Ok(Self::Google),
            "k3d" => Ok(Self::K3d),
            "vultr" => Ok(Self::Vultr),
            other => Err(Error::validation(format!(
                "unknown cloud provider {other:?}"
            ))),
        }
    }
}

impl std::fmt::Display for CloudProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Management or workload cluster
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ClusterType {
    /// The first cluster; hosts the control plane, Vault, Argo CD, catalog
    #[default]
    Mgmt,
    /// A secondary cluster managed from a management cluster
    Workload,
}

impl ClusterType {
    /// Wire name of the cluster type
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mgmt => "mgmt",
            Self::Workload => "workload",
        }
    }
}

/// Supported git hosting providers
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GitProvider {
    /// github.com
    #[default]
    Github,
    /// gitlab.com
    Gitlab,
}

impl GitProvider {
    /// Wire name of the provider
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Github => "github",
            Self::Gitlab => "gitlab",
        }
    }

    /// Hostname of the hosted service
    pub fn host(&self) -> &'static str {
        match self {
            Self::Github => "github.com",
            Self::Gitlab => "gitlab.com",
        }
    }
}

impl std::fmt::Display for GitProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Git transport protocol for the materialized repositories
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GitProtocol {
    /// Token-authenticated HTTPS remotes
    #[default]
    Https,
    /// SSH remotes using the kbot keypair
    Ssh,
}

/// Cluster lifecycle status
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ClusterStatus {
    /// The lifecycle controller is advancing checkpoints
    #[default]
    Provisioning,
    /// Every checkpoint is true; the cluster is usable
    Provisioned,
    /// The inverse path is running
    Deleting,
    /// All checkpoints cleared and infrastructure destroyed
    Deleted,
    /// A step failed; see `lastCondition`
    Error,
}

impl ClusterStatus {
    /// Wire name of the status
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provisioning => "provisioning",
            Self::Provisioned => "provisioned",
            Self::Deleting => "deleting",
            Self::Deleted => "deleted",
            Self::Error => "error",
        }
    }
}

/// Git credentials and kbot keypair
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct GitAuth {
    /// Organization or group owning the gitops repositories
    pub owner: String,
    /// Username the token belongs to
    pub user: String,
    /// API + push token
    pub token: String,
    /// kbot SSH private key (PEM)
    pub private_key: String,
    /// kbot SSH public key
    pub public_key: String,
}

/// Civo API credentials
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CivoAuth {
    /// API token
    pub token: String,
}

/// DigitalOcean API and Spaces credentials
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct DigitaloceanAuth {
    /// API token
    pub token: String,
    /// Spaces access key
    pub spaces_key: String,
    /// Spaces secret key
    pub spaces_secret: String,
}

/// Vultr API credentials
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct VultrAuth {
    /// API key
    pub token: String,
}

/// Akamai (Linode) API credentials
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AkamaiAuth {
    /// API token
    pub token: String,
}

/// Google Cloud credentials
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct GoogleAuth {
    /// Contents of the application credentials JSON file
    pub key_file: String,
    /// Project the cluster is provisioned in
    pub project_id: String,
}

/// Cloudflare credentials used by the vault terraform layer
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CloudflareAuth {
    /// API token
    pub api_token: String,
    /// Origin CA issuer key, empty when unused
    pub origin_ca_issuer_key: String,
}

/// Credentials minted for the terraform state store
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct StateStoreCredentials {
    /// Access key id
    pub access_key_id: String,
    /// Secret access key
    pub secret_access_key: String,
    /// Display name of the credential set
    pub name: String,
}

/// Location of the terraform state store
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct StateStoreDetails {
    /// Bucket or space name
    pub name: String,
    /// S3-compatible endpoint hostname
    pub hostname: String,
    /// Provider-assigned identifier, where one exists
    pub id: String,
}

/// Durable progress checkpoints
///
/// One boolean per externally observable provisioning transition, in the
/// order the controller performs them. Monotonic-true during provisioning;
/// the delete path clears them in reverse. `cloud_terraform_apply_failed`
/// is the one exception to monotonicity: it marks a mid-apply failure so
/// the delete path still attempts teardown of whatever was created.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct Checkpoints {
    /// Tool binaries downloaded
    pub install_tools_check: bool,
    /// DNS zone ownership proven
    pub domain_liveness_check: bool,
    /// State-store credentials minted
    pub state_store_creds_check: bool,
    /// State-store bucket created
    pub state_store_create_check: bool,
    /// Git remote org resources verified
    pub git_init_check: bool,
    /// kbot keypair generated and stored
    pub kbot_setup_check: bool,
    /// Git-provider terraform applied (repos + webhooks)
    pub git_credentials_check: bool,
    /// Gitops + metaphor detokenized and committed locally
    pub gitops_ready_check: bool,
    /// Gitops + metaphor pushed to the remote
    pub gitops_pushed_check: bool,
    /// Cloud terraform applied (cluster exists)
    pub cloud_terraform_apply_check: bool,
    /// Cloud terraform failed mid-apply; resources may exist
    pub cloud_terraform_apply_failed_check: bool,
    /// In-cluster bootstrap secrets seeded
    pub cluster_secrets_created_check: bool,
    /// Argo CD installed
    #[serde(rename = "argoCDInstallCheck")]
    pub argocd_install_check: bool,
    /// Argo CD admin credentials read, token obtained
    #[serde(rename = "argoCDInitializeCheck")]
    pub argocd_initialize_check: bool,
    /// Registry application created
    #[serde(rename = "argoCDCreateRegistryCheck")]
    pub argocd_create_registry_check: bool,
    /// Vault initialized in recovery mode
    pub vault_initialized_check: bool,
    /// Vault terraform applied
    pub vault_terraform_apply_check: bool,
    /// Users terraform applied
    pub users_terraform_apply_check: bool,
    /// Final sync wave complete
    pub post_detokenize_check: bool,
}

/// Identifies one provisioning checkpoint
///
/// Ordered by the sequence the controller performs them; the delete path
/// walks [`Checkpoint::ORDER`] in reverse.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Checkpoint {
    InstallTools,
    DomainLiveness,
    StateStoreCreds,
    GitInit,
    KbotSetup,
    GitopsReady,
    GitCredentials,
    GitopsPushed,
    StateStoreCreate,
    CloudTerraformApply,
    ClusterSecretsCreated,
    ArgocdInstall,
    ArgocdInitialize,
    ArgocdCreateRegistry,
    VaultInitialized,
    VaultTerraformApply,
    UsersTerraformApply,
    PostDetokenize,
}

impl Checkpoint {
    /// Provisioning order of every checkpoint
    pub const ORDER: [Checkpoint; 18] = [
        Checkpoint::InstallTools,
        Checkpoint::DomainLiveness,
        Checkpoint::StateStoreCreds,
        Checkpoint::GitInit,
        Checkpoint::KbotSetup,
        Checkpoint::GitopsReady,
        Checkpoint::GitCredentials,
        Checkpoint::GitopsPushed,
        Checkpoint::StateStoreCreate,
        Checkpoint::CloudTerraformApply,
        Checkpoint::ClusterSecretsCreated,
        Checkpoint::ArgocdInstall,
        Checkpoint::ArgocdInitialize,
        Checkpoint::ArgocdCreateRegistry,
        Checkpoint::VaultInitialized,
        Checkpoint::VaultTerraformApply,
        Checkpoint::UsersTerraformApply,
        Checkpoint::PostDetokenize,
    ];

    /// Read this checkpoint's bit
    pub fn get(&self, c: &Checkpoints) -> bool {
        match self {
            Self::InstallTools => c.install_tools_check,
            Self::DomainLiveness => c.domain_liveness_check,
            Self::StateStoreCreds => c.state_store_creds_check,
            Self::StateStoreCreate => c.state_store_create_check,
            Self::GitInit => c.git_init_check,
            Self::KbotSetup => c.kbot_setup_check,
            Self::GitCredentials => c.git_credentials_check,
            Self::GitopsReady => c.gitops_ready_check,
            Self::GitopsPushed => c.gitops_pushed_check,
            Self::CloudTerraformApply => c.cloud_terraform_apply_check,
            Self::ClusterSecretsCreated => c.cluster_secrets_created_check,
            Self::ArgocdInstall => c.argocd_install_check,
            Self::ArgocdInitialize => c.argocd_initialize_check,
            Self::ArgocdCreateRegistry => c.argocd_create_registry_check,
            Self::VaultInitialized => c.vault_initialized_check,
            Self::VaultTerraformApply => c.vault_terraform_apply_check,
            Self::UsersTerraformApply => c.users_terraform_apply_check,
            Self::PostDetokenize => c.post_detokenize_check,
        }
    }

    /// Write this checkpoint's bit
    pub fn set(&self, c: &mut Checkpoints, value: bool) {
        match self {
            Self::InstallTools => c.install_tools_check = value,
            Self::DomainLiveness => c.domain_liveness_check = value,
            Self::StateStoreCreds => c.state_store_creds_check = value,
            Self::StateStoreCreate => c.state_store_create_check = value,
            Self::GitInit => c.git_init_check = value,
            Self::KbotSetup => c.kbot_setup_check = value,
            Self::GitCredentials => c.git_credentials_check = value,
            Self::GitopsReady => c.gitops_ready_check = value,
            Self::GitopsPushed => c.gitops_pushed_check = value,
            Self::CloudTerraformApply => c.cloud_terraform_apply_check = value,
            Self::ClusterSecretsCreated => c.cluster_secrets_created_check = value,
            Self::ArgocdInstall => c.argocd_install_check = value,
            Self::ArgocdInitialize => c.argocd_initialize_check = value,
            Self::ArgocdCreateRegistry => c.argocd_create_registry_check = value,
            Self::VaultInitialized => c.vault_initialized_check = value,
            Self::VaultTerraformApply => c.vault_terraform_apply_check = value,
            Self::UsersTerraformApply => c.users_terraform_apply_check = value,
            Self::PostDetokenize => c.post_detokenize_check = value,
        }
    }
}

impl Checkpoints {
    /// True when every provisioning checkpoint is set
    pub fn all_set(&self) -> bool {
        Checkpoint::ORDER.iter().all(|cp| cp.get(self))
    }

    /// True when every provisioning checkpoint is cleared
    pub fn all_cleared(&self) -> bool {
        Checkpoint::ORDER.iter().all(|cp| !cp.get(self))
    }
}

/// The durable cluster record, one per cluster name
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Cluster {
    /// Unique cluster name
    pub cluster_name: String,
    /// Opaque 6-character identifier
    #[serde(rename = "clusterID")]
    pub cluster_id: String,
    /// Target cloud
    pub cloud_provider: CloudProvider,
    /// mgmt or workload
    pub cluster_type: ClusterType,
    /// Provider region
    pub cloud_region: String,
    /// DNS zone for platform ingress
    pub domain_name: String,
    /// Optional subdomain carved out of the zone
    pub subdomain_name: String,
    /// DNS provider managing the zone (cloud provider name or "cloudflare")
    pub dns_provider: String,
    /// Email used for certificate issuance and git commits
    pub alerts_email: String,
    /// Git hosting provider
    pub git_provider: GitProvider,
    /// Git transport
    pub git_protocol: GitProtocol,
    /// Git host name (github.com / gitlab.com)
    pub git_host: String,
    /// Git credentials and kbot keypair
    pub git_auth: GitAuth,
    /// GitLab group id when the git provider is gitlab
    #[serde(rename = "gitlabOwnerGroupID")]
    pub gitlab_owner_group_id: i64,
    /// Akamai credentials
    pub akamai_auth: AkamaiAuth,
    /// Civo credentials
    pub civo_auth: CivoAuth,
    /// DigitalOcean credentials
    #[serde(rename = "digitaloceanAuth")]
    pub do_auth: DigitaloceanAuth,
    /// Vultr credentials
    pub vultr_auth: VultrAuth,
    /// Google credentials
    pub google_auth: GoogleAuth,
    /// Cloudflare credentials
    pub cloudflare_auth: CloudflareAuth,
    /// Webhook secret shared with atlantis
    pub atlantis_webhook_secret: String,
    /// Public atlantis webhook URL
    #[serde(rename = "atlantisWebhookURL")]
    pub atlantis_webhook_url: String,
    /// Argo CD admin password, read after install
    #[serde(rename = "argoCDPassword")]
    pub argocd_password: String,
    /// Argo CD API bearer token
    #[serde(rename = "argoCDAuthToken")]
    pub argocd_auth_token: String,
    /// State-store credentials
    pub state_store_credentials: StateStoreCredentials,
    /// State-store location
    pub state_store_details: StateStoreDetails,
    /// Catalog apps to install right after provisioning
    pub post_install_catalog_apps: Vec<GitopsCatalogApp>,
    /// Durable progress checkpoints
    #[serde(flatten)]
    pub checks: Checkpoints,
    /// Lifecycle status
    pub status: ClusterStatus,
    /// A lifecycle task currently owns this record
    pub in_progress: bool,
    /// Last recorded failure, empty while healthy
    pub last_condition: String,
    /// RFC 3339 creation time
    pub creation_timestamp: String,
}

impl Cluster {
    /// Domain with the optional subdomain applied
    pub fn full_domain(&self) -> String {
        if self.subdomain_name.is_empty() {
            self.domain_name.clone()
        } else {
            format!("{}.{}", self.subdomain_name, self.domain_name)
        }
    }
}

/// Body of `POST /cluster/:name`
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ClusterDefinition {
    /// Email used for certificate issuance and git commits
    pub admin_email: String,
    /// Target cloud
    pub cloud_provider: String,
    /// Provider region
    pub cloud_region: String,
    /// DNS zone
    pub domain_name: String,
    /// Optional subdomain
    #[serde(default)]
    pub subdomain_name: String,
    /// DNS provider, defaults to the cloud provider
    #[serde(default)]
    pub dns_provider: String,
    /// Git org/group owner
    pub git_owner: String,
    /// Git hosting provider
    pub git_provider: String,
    /// Git transport, defaults to https
    #[serde(default)]
    pub git_protocol: String,
    /// Git token
    pub git_token: String,
    /// mgmt or workload
    #[serde(rename = "type")]
    pub cluster_type: String,
    /// Akamai credentials
    #[serde(default)]
    pub akamai_auth: AkamaiAuth,
    /// Civo credentials
    #[serde(default)]
    pub civo_auth: CivoAuth,
    /// DigitalOcean credentials
    #[serde(default, rename = "do_auth")]
    pub do_auth: DigitaloceanAuth,
    /// Vultr credentials
    #[serde(default)]
    pub vultr_auth: VultrAuth,
    /// Google credentials
    #[serde(default)]
    pub google_auth: GoogleAuth,
    /// Cloudflare credentials
    #[serde(default)]
    pub cloudflare_auth: CloudflareAuth,
    /// GitLab group id when the git provider is gitlab
    #[serde(default)]
    pub gitlab_owner_group_id: i64,
    /// Catalog apps to install right after provisioning
    #[serde(default)]
    pub post_install_catalog_apps: Vec<GitopsCatalogApp>,
}

impl ClusterDefinition {
    /// Validate required fields and enums
    pub fn validate(&self) -> Result<(), Error> {
        if self.admin_email.is_empty() {
            return Err(Error::validation("admin_email is required"));
        }
        if self.cloud_region.is_empty() {
            return Err(Error::validation("cloud_region is required"));
        }
        if self.domain_name.is_empty() {
            return Err(Error::validation("domain_name is required"));
        }
        if self.git_owner.is_empty() {
            return Err(Error::validation("git_owner is required"));
        }
        if self.git_token.is_empty() {
            return Err(Error::validation("git_token is required"));
        }
        CloudProvider::parse(&self.cloud_provider)?;
        match self.git_provider.as_str() {
            "github" | "gitlab" => {}
            other => {
                return Err(Error::validation(format!(
                    "git_provider must be github or gitlab, got {other:?}"
                )))
            }
        }
        match self.cluster_type.as_str() {
            "mgmt" | "workload" => {}
            other => {
                return Err(Error::validation(format!(
                    "type must be mgmt or workload, got {other:?}"
                )))
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_order_covers_every_bit_once() {
        let mut checks = Checkpoints::default();
        for cp in Checkpoint::ORDER {
            assert!(!cp.get(&checks), "{cp:?} already set");
            cp.set(&mut checks, true);
            assert!(cp.get(&checks), "{cp:?} did not stick");
        }
        assert!(checks.all_set());
        // the failed flag is not a provisioning checkpoint
        assert!(!checks.cloud_terraform_apply_failed_check);
    }

    #[test]
    fn checkpoints_serialize_with_wire_names() {
        let mut checks = Checkpoints::default();
        Checkpoint::ArgocdInstall.set(&mut checks, true);
        let value = serde_json::to_value(checks).unwrap();
        assert_eq!(value["argoCDInstallCheck"], serde_json::json!(true));
        assert_eq!(value["installToolsCheck"], serde_json::json!(false));
        assert_eq!(
            value["cloudTerraformApplyFailedCheck"],
            serde_json::json!(false)
        );
    }

    #[test]
    fn cluster_record_round_trips_and_flattens_checkpoints() {
        let mut cluster = Cluster {
            cluster_name: "k1".to_string(),
            cluster_id: "abc123".to_string(),
            cloud_provider: CloudProvider::Civo,
            domain_name: "kubefirst.dev".to_string(),
            ..Cluster::default()
        };
        cluster.checks.install_tools_check = true;

        let value = serde_json::to_value(&cluster).unwrap();
        // checkpoints live at the top level of the record, next to identity
        assert_eq!(value["installToolsCheck"], serde_json::json!(true));
        assert_eq!(value["clusterName"], serde_json::json!("k1"));
        assert_eq!(value["cloudProvider"], serde_json::json!("civo"));

        let back: Cluster = serde_json::from_value(value).unwrap();
        assert!(back.checks.install_tools_check);
        assert_eq!(back.cluster_name, "k1");
        assert_eq!(back.cloud_provider, CloudProvider::Civo);
    }

    #[test]
    fn full_domain_honors_subdomain() {
        let mut cluster = Cluster {
            domain_name: "kubefirst.dev".to_string(),
            ..Cluster::default()
        };
        assert_eq!(cluster.full_domain(), "kubefirst.dev");
        cluster.subdomain_name = "platform".to_string();
        assert_eq!(cluster.full_domain(), "platform.kubefirst.dev");
    }

    #[test]
    fn definition_validation_rejects_unknown_enums() {
        let def = ClusterDefinition {
            admin_email: "a@b".to_string(),
            cloud_provider: "azure".to_string(),
            cloud_region: "eastus".to_string(),
            domain_name: "example.com".to_string(),
            git_owner: "acme".to_string(),
            git_provider: "github".to_string(),
            git_token: "ghp_x".to_string(),
            cluster_type: "mgmt".to_string(),
            ..ClusterDefinition::default()
        };
        assert!(matches!(def.validate(), Err(Error::Validation(_))));

        let def = ClusterDefinition {
            cloud_provider: "civo".to_string(),
            ..def
        };
        assert!(def.validate().is_ok());

        let def = ClusterDefinition {
            git_provider: "gitea".to_string(),
            ..def
        };
        assert!(matches!(def.validate(), Err(Error::Validation(_))));
    }
}

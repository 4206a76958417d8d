//! Startup configuration from process environment
//!
//! Everything the service consumes at startup comes in through environment
//! variables; the same snapshot also seeds the bootstrap cluster record when
//! the process imports an existing management cluster.

use std::path::PathBuf;

use clap::Parser;

/// Process environment consumed at startup
#[derive(Parser, Clone, Debug)]
#[command(name = "kubefirst-api", version, about, long_about = None)]
pub struct Env {
    /// Port the HTTP API listens on
    #[arg(long, env = "SERVER_PORT", default_value = "8081")]
    pub server_port: u16,

    /// Skip bootstrap import, default services, and the catalog scheduler
    #[arg(
        long,
        env = "IS_CLUSTER_ZERO",
        action = clap::ArgAction::Set,
        default_value_t = false
    )]
    pub is_cluster_zero: bool,

    /// Version stamp reported by the API
    #[arg(long, env = "KUBEFIRST_VERSION", default_value = "development")]
    pub kubefirst_version: String,

    /// Cloud provider of the cluster this process runs in
    #[arg(long, env = "CLOUD_PROVIDER", default_value = "")]
    pub cloud_provider: String,

    /// Region of the cluster this process runs in
    #[arg(long, env = "CLOUD_REGION", default_value = "")]
    pub cloud_region: String,

    /// Identifier of the cluster this process runs in
    #[arg(long, env = "CLUSTER_ID", default_value = "")]
    pub cluster_id: String,

    /// mgmt or workload
    #[arg(long, env = "CLUSTER_TYPE", default_value = "mgmt")]
    pub cluster_type: String,

    /// Name of the cluster this process runs in
    #[arg(long, env = "CLUSTER_NAME", default_value = "")]
    pub cluster_name: String,

    /// DNS zone of the cluster this process runs in
    #[arg(long, env = "DOMAIN_NAME", default_value = "")]
    pub domain_name: String,

    /// Subdomain carved out of the zone, where one is used
    #[arg(long, env = "SUBDOMAIN_NAME", default_value = "")]
    pub subdomain_name: String,

    /// Git hosting provider of the bootstrap record
    #[arg(long, env = "GIT_PROVIDER", default_value = "github")]
    pub git_provider: String,

    /// Git transport of the bootstrap record
    #[arg(long, env = "GIT_PROTOCOL", default_value = "https")]
    pub git_protocol: String,

    /// Git org/group owner of the bootstrap record
    #[arg(long, env = "GIT_OWNER", default_value = "")]
    pub git_owner: String,

    /// Git token of the bootstrap record
    #[arg(long, env = "GIT_TOKEN", default_value = "", hide_env_values = true)]
    pub git_token: String,

    /// Admin email of the bootstrap record
    #[arg(long, env = "ADMIN_EMAIL", default_value = "")]
    pub admin_email: String,

    /// How this installation was performed (cli, marketplace, ...)
    #[arg(long, env = "INSTALL_METHOD", default_value = "")]
    pub install_method: String,

    /// Team name denormalized for the bootstrap record
    #[arg(long, env = "KUBEFIRST_TEAM", default_value = "")]
    pub kubefirst_team: String,

    /// Extra team info denormalized for the bootstrap record
    #[arg(long, env = "KUBEFIRST_TEAM_INFO", default_value = "")]
    pub kubefirst_team_info: String,

    /// Identifier of the parent management cluster, for workload clusters
    #[arg(long, env = "PARENT_CLUSTER_ID", default_value = "")]
    pub parent_cluster_id: String,

    /// Vault recovery shares used when initializing the secret store
    #[arg(long, env = "VAULT_RECOVERY_SHARES", default_value = "5")]
    pub vault_recovery_shares: u8,

    /// Vault recovery threshold used when initializing the secret store
    #[arg(long, env = "VAULT_RECOVERY_THRESHOLD", default_value = "3")]
    pub vault_recovery_threshold: u8,
}

impl Env {
    /// Root of all per-cluster scratch state (`~/.k1`)
    pub fn k1_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".k1")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_environment() {
        let env = Env::try_parse_from(["kubefirst-api"]).unwrap();
        assert_eq!(env.server_port, 8081);
        assert!(!env.is_cluster_zero);
        assert_eq!(env.vault_recovery_shares, 5);
        assert_eq!(env.vault_recovery_threshold, 3);
    }

    #[test]
    fn k1_dir_is_under_home() {
        assert!(Env::k1_dir().ends_with(".k1"));
    }
}

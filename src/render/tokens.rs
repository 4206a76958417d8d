//! Token mappings for gitops materialization
//!
//! Two token sets exist: the gitops tokens derived from the cluster record,
//! and the per-app config keys supplied by a catalog create request.

use std::collections::BTreeMap;

use crate::types::{CatalogAppKey, CloudProvider, Cluster, GitProvider};

/// Build the gitops token mapping for a cluster
///
/// `target_cluster_name` differs from the record's name when rendering a
/// workload cluster's subtree from the management cluster's record.
pub fn gitops_tokens(
    cluster: &Cluster,
    registry_path: &str,
    secret_store_ref: &str,
    project: &str,
    cluster_destination: &str,
    environment: &str,
    target_cluster_name: &str,
) -> BTreeMap<String, String> {
    let full_domain = cluster.full_domain();
    let git_owner = &cluster.git_auth.owner;
    let git_host = cluster.git_provider.host();

    let container_registry_url = match cluster.git_provider {
        GitProvider::Github => format!("ghcr.io/{git_owner}"),
        GitProvider::Gitlab => format!("registry.gitlab.com/{git_owner}"),
    };

    let mut tokens = BTreeMap::new();
    let mut put = |k: &str, v: String| {
        tokens.insert(k.to_string(), v);
    };

    put("clusterName", target_cluster_name.to_string());
    put("clusterId", cluster.cluster_id.clone());
    put("clusterType", cluster.cluster_type.as_str().to_string());
    put("cloudProvider", cluster.cloud_provider.to_string());
    put("cloudRegion", cluster.cloud_region.clone());
    put("domainName", cluster.domain_name.clone());
    put("subdomainName", cluster.subdomain_name.clone());
    put("fullDomainName", full_domain.clone());
    put("alertsEmail", cluster.alerts_email.clone());

    put("gitProvider", cluster.git_provider.to_string());
    put("gitHost", git_host.to_string());
    put("gitOwner", git_owner.clone());
    put("gitUser", cluster.git_auth.user.clone());
    put(
        "gitopsRepoUrl",
        format!("https://{git_host}/{git_owner}/gitops.git"),
    );
    put(
        "gitopsRepoGitUrl",
        format!("git@{git_host}:{git_owner}/gitops.git"),
    );
    put(
        "metaphorRepoUrl",
        format!("https://{git_host}/{git_owner}/metaphor.git"),
    );
    put("containerRegistryUrl", container_registry_url);

    put("registryPath", registry_path.to_string());
    put("secretStoreRef", secret_store_ref.to_string());
    put("project", project.to_string());
    put("clusterDestination", cluster_destination.to_string());
    put("environment", environment.to_string());

    put("atlantisWebhookUrl", cluster.atlantis_webhook_url.clone());
    put(
        "stateStoreBucketName",
        cluster.state_store_details.name.clone(),
    );
    put(
        "stateStoreEndpoint",
        cluster.state_store_details.hostname.clone(),
    );

    // provider-specific ingress URLs: the local cluster resolves services
    // in-cluster, everything else goes through the platform domain
    if cluster.cloud_provider == CloudProvider::K3d {
        put("argocdIngressUrl", "https://argocd.kubefirst.dev".to_string());
        put("vaultIngressUrl", "http://vault.vault.svc:8200".to_string());
        put(
            "atlantisIngressUrl",
            "https://atlantis.kubefirst.dev".to_string(),
        );
        put(
            "metaphorIngressUrl",
            "https://metaphor.kubefirst.dev".to_string(),
        );
    } else {
        put("argocdIngressUrl", format!("https://argocd.{full_domain}"));
        put("vaultIngressUrl", format!("https://vault.{full_domain}"));
        put(
            "atlantisIngressUrl",
            format!("https://atlantis.{full_domain}"),
        );
        put(
            "metaphorIngressUrl",
            format!("https://metaphor.{full_domain}"),
        );
    }

    tokens
}

/// Build the mapping for user-supplied config keys
pub fn config_key_tokens(config_keys: &[CatalogAppKey]) -> BTreeMap<String, String> {
    config_keys
        .iter()
        .map(|key| (key.name.clone(), key.value.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Cluster, GitProtocol};

    fn cluster() -> Cluster {
        let mut cluster = Cluster {
            cluster_name: "k1".to_string(),
            cluster_id: "ab12cd".to_string(),
            cloud_provider: CloudProvider::Civo,
            cloud_region: "lon1".to_string(),
            domain_name: "kubefirst.dev".to_string(),
            git_provider: GitProvider::Github,
            git_protocol: GitProtocol::Https,
            ..Cluster::default()
        };
        cluster.git_auth.owner = "acme".to_string();
        cluster.git_auth.user = "kbot".to_string();
        cluster
    }

    #[test]
    fn gitops_tokens_cover_identity_and_urls() {
        let tokens = gitops_tokens(
            &cluster(),
            "registry/clusters/k1",
            "vault-kv-secret",
            "default",
            "in-cluster",
            "mgmt",
            "k1",
        );
        assert_eq!(tokens["clusterName"], "k1");
        assert_eq!(tokens["registryPath"], "registry/clusters/k1");
        assert_eq!(tokens["gitopsRepoUrl"], "https://github.com/acme/gitops.git");
        assert_eq!(tokens["containerRegistryUrl"], "ghcr.io/acme");
        assert_eq!(tokens["vaultIngressUrl"], "https://vault.kubefirst.dev");
    }

    #[test]
    fn k3d_uses_cluster_local_vault() {
        let mut record = cluster();
        record.cloud_provider = CloudProvider::K3d;
        let tokens = gitops_tokens(
            &record,
            "clusters/k1",
            "vault-kv-secret",
            "default",
            "in-cluster",
            "mgmt",
            "k1",
        );
        assert_eq!(tokens["vaultIngressUrl"], "http://vault.vault.svc:8200");
    }

    #[test]
    fn workload_rendering_overrides_cluster_name() {
        let tokens = gitops_tokens(
            &cluster(),
            "registry/clusters/wk-1",
            "wk-1-vault-kv-secret",
            "wk-1",
            "wk-1",
            "staging",
            "wk-1",
        );
        assert_eq!(tokens["clusterName"], "wk-1");
        assert_eq!(tokens["clusterDestination"], "wk-1");
        // record-derived tokens still come from the management record
        assert_eq!(tokens["gitOwner"], "acme");
    }

    #[test]
    fn config_keys_map_name_to_value() {
        let keys = vec![
            CatalogAppKey {
                name: "APP_REPLICAS".to_string(),
                value: "3".to_string(),
                ..CatalogAppKey::default()
            },
            CatalogAppKey {
                name: "APP_DOMAIN".to_string(),
                value: "pg.kubefirst.dev".to_string(),
                ..CatalogAppKey::default()
            },
        ];
        let tokens = config_key_tokens(&keys);
        assert_eq!(tokens["APP_REPLICAS"], "3");
        assert_eq!(tokens["APP_DOMAIN"], "pg.kubefirst.dev");
    }
}

//! The provisioning path
//!
//! A straight-line sequence of checkpoint transitions. Each block is guarded
//! by its checkpoint bit, so re-invoking the controller after a failure
//! resumes at the first unmet transition with no side effects before it.

use std::collections::BTreeMap;

use tracing::{info, warn};

use crate::error::Error;
use crate::gitops::{registry_path, GitBasicAuth, GitopsTemplateSpec, Materializer};
use crate::k8s;
use crate::lifecycle::ClusterController;
use crate::render;
use crate::types::{Checkpoint, CloudProvider, ClusterStatus, GitProvider};
use crate::{Result, ARGOCD_NAMESPACE, VAULT_NAMESPACE};

/// Namespaces seeded before the registry sync takes over
const BOOTSTRAP_NAMESPACES: [&str; 8] = [
    "argocd",
    "argo",
    "atlantis",
    "chartmuseum",
    "external-dns",
    "external-secrets-operator",
    "kubefirst",
    "vault",
];

impl ClusterController {
    /// Run provisioning to completion, recording any failure on the record
    pub async fn provision(&mut self) -> Result<()> {
        self.cluster.status = ClusterStatus::Provisioning;
        self.cluster.in_progress = true;
        self.cluster.last_condition = String::new();
        self.persist().await?;

        match self.run_provision_steps().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.record_failure(&e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn run_provision_steps(&mut self) -> Result<()> {
        // 1. tool binaries
        if !self.cluster.checks.install_tools_check {
            crate::lifecycle::download_tools(self.cluster.cloud_provider, &self.paths.tools_dir)
                .await?;
            self.checkpoint(Checkpoint::InstallTools).await?;
        }

        // 2. DNS liveness
        if !self.cluster.checks.domain_liveness_check {
            let domain = self.cluster.domain_name.clone();
            if !self.driver.validate_domain_ownership(&domain).await? {
                return Err(Error::provider(format!(
                    "domain {domain} ownership could not be validated"
                )));
            }
            self.checkpoint(Checkpoint::DomainLiveness).await?;
        }

        // 3. state store credentials
        if !self.cluster.checks.state_store_creds_check {
            let bucket = format!("k1-state-store-{}", self.cluster.cluster_name);
            let store = self.driver.create_state_store(&bucket).await?;
            self.cluster.state_store_credentials = store.credentials;
            self.cluster.state_store_details = store.details;
            self.checkpoint(Checkpoint::StateStoreCreds).await?;
        }

        // 4. git remote initialization
        if !self.cluster.checks.git_init_check {
            self.verify_git_remotes_available().await?;
            self.checkpoint(Checkpoint::GitInit).await?;
        }

        // 5. kbot keypair
        if !self.cluster.checks.kbot_setup_check {
            let (private_key, public_key) = crate::lifecycle::generate_kbot_keypair()?;
            self.cluster.git_auth.private_key = private_key;
            self.cluster.git_auth.public_key = public_key;
            if self.cluster.git_auth.user.is_empty() {
                self.cluster.git_auth.user = "kbot".to_string();
            }
            self.checkpoint(Checkpoint::KbotSetup).await?;
        }

        // 6. materialize gitops + metaphor locally
        if !self.cluster.checks.gitops_ready_check {
            self.materialize_repositories()?;
            self.checkpoint(Checkpoint::GitopsReady).await?;
        }

        // 7. git-provider terraform: repositories, teams, webhooks
        if !self.cluster.checks.git_credentials_check {
            let entrypoint = self
                .paths
                .terraform_entrypoint(self.cluster.git_provider.as_str());
            let env = self.git_terraform_env();
            self.terraform
                .init_apply_auto_approve(&entrypoint, &env)
                .await?;
            self.checkpoint(Checkpoint::GitCredentials).await?;
        }

        // 8. push gitops + metaphor
        if !self.cluster.checks.gitops_pushed_check {
            let auth = GitBasicAuth {
                username: self.cluster.git_auth.user.clone(),
                token: self.cluster.git_auth.token.clone(),
            };
            let materializer = Materializer::new(GitopsTemplateSpec::default());
            materializer.push(&self.paths.gitops_dir, &auth)?;
            materializer.push(&self.paths.metaphor_dir, &auth)?;
            self.checkpoint(Checkpoint::GitopsPushed).await?;
        }

        // 9. cloud terraform: the cluster itself, with its state bucket
        if !self.cluster.checks.cloud_terraform_apply_check {
            if !self.cluster.checks.state_store_create_check {
                // the bucket from step 3 may have been lost to a partial run
                if self.cluster.state_store_details.name.is_empty() {
                    let bucket = format!("k1-state-store-{}", self.cluster.cluster_name);
                    let store = self.driver.create_state_store(&bucket).await?;
                    self.cluster.state_store_credentials = store.credentials;
                    self.cluster.state_store_details = store.details;
                }
                self.checkpoint(Checkpoint::StateStoreCreate).await?;
            }

            let entrypoint = self
                .paths
                .terraform_entrypoint(self.cluster.cloud_provider.as_str());
            let mut env = self.git_terraform_env();
            env.extend(self.driver.terraform_env(&self.cluster));

            match self.terraform.init_apply_auto_approve(&entrypoint, &env).await {
                Ok(()) => {
                    self.cluster.checks.cloud_terraform_apply_failed_check = false;
                    self.checkpoint(Checkpoint::CloudTerraformApply).await?;
                }
                Err(e) => {
                    // cloud objects may exist; the delete path must still
                    // attempt teardown
                    self.cluster.checks.cloud_terraform_apply_failed_check = true;
                    self.persist().await?;
                    return Err(e);
                }
            }
        }

        // 10. wait for the API server, seed bootstrap namespaces + secrets
        if !self.cluster.checks.cluster_secrets_created_check {
            let credentials = self
                .driver
                .kube_credentials(&self.cluster.cluster_name)
                .await?;
            let client = k8s::client_from_kubeconfig(&credentials.kubeconfig_path).await?;
            k8s::wait_for_api(&client, 300).await?;
            self.bootstrap_cluster_secrets(&client).await?;
            self.checkpoint(Checkpoint::ClusterSecretsCreated).await?;
        }

        let client = k8s::cluster_client(&self.cluster.cluster_name).await?;

        // restore mkcert-issued certificates on local recreations
        if self.cluster.cloud_provider == CloudProvider::K3d {
            info!("checking for tls secrets to restore");
            let domain = self.cluster.full_domain();
            if let Err(e) =
                k8s::restore_tls_secrets(&client, &self.cluster.cluster_name, &domain).await
            {
                warn!(error = %e, "unable to restore tls secrets, continuing");
            }
        }

        // 11. install the continuous-delivery controller
        if !self.cluster.checks.argocd_install_check {
            k8s::create_namespace(&client, ARGOCD_NAMESPACE).await?;
            self.kubectl_apply(ARGOCD_NAMESPACE, crate::argocd::ARGOCD_INSTALL_URL)
                .await?;
            k8s::wait_for_deployment_ready(
                &client,
                ARGOCD_NAMESPACE,
                "app.kubernetes.io/name=argocd-server",
                300,
            )
            .await?;
            self.checkpoint(Checkpoint::ArgocdInstall).await?;
        }

        // 12. read admin credentials, obtain an API token
        if !self.cluster.checks.argocd_initialize_check {
            let password = crate::argocd::read_admin_password(&client).await?;
            let pod = k8s::wait_for_pod_running(
                &client,
                ARGOCD_NAMESPACE,
                "app.kubernetes.io/name=argocd-server",
                120,
            )
            .await?;
            let _tunnel = k8s::forward_pod_port(&client, ARGOCD_NAMESPACE, &pod, 8080, 8080).await?;
            let http = reqwest::Client::builder()
                .danger_accept_invalid_certs(true)
                .build()?;
            let token =
                crate::argocd::session_token(&http, crate::argocd::ARGOCD_LOCAL_URL, &password)
                    .await?;
            self.cluster.argocd_password = password;
            self.cluster.argocd_auth_token = token;
            self.checkpoint(Checkpoint::ArgocdInitialize).await?;
        }

        // 13. the registry application
        if !self.cluster.checks.argocd_create_registry_check {
            let path = registry_path(
                self.cluster.cloud_provider,
                &self.cluster.cluster_name,
                false,
            );
            crate::argocd::create_registry_application(
                &client,
                &self.cluster.cluster_name,
                &self.gitops_destination_url(),
                &path,
            )
            .await?;
            self.checkpoint(Checkpoint::ArgocdCreateRegistry).await?;
        }

        // 14. initialize the secret store
        if !self.cluster.checks.vault_initialized_check {
            let pod = k8s::wait_for_pod_running(
                &client,
                VAULT_NAMESPACE,
                "app.kubernetes.io/name=vault",
                crate::vault::VAULT_POD_WAIT_SECS,
            )
            .await?;
            let _tunnel = k8s::forward_pod_port(&client, VAULT_NAMESPACE, &pod, 8200, 8200).await?;
            crate::vault::initialize(
                &client,
                crate::vault::VAULT_LOCAL_URL,
                self.env.vault_recovery_shares,
                self.env.vault_recovery_threshold,
            )
            .await?;
            self.checkpoint(Checkpoint::VaultInitialized).await?;
        }

        // 15. vault terraform
        if !self.cluster.checks.vault_terraform_apply_check {
            let token = crate::vault::root_token(&client).await?;
            let pod = k8s::wait_for_pod_running(
                &client,
                VAULT_NAMESPACE,
                "app.kubernetes.io/name=vault",
                300,
            )
            .await?;
            let _tunnel = k8s::forward_pod_port(&client, VAULT_NAMESPACE, &pod, 8200, 8200).await?;
            let entrypoint = self.paths.terraform_entrypoint("vault");
            let env = self.vault_terraform_env(crate::vault::VAULT_LOCAL_URL, &token);
            self.terraform
                .init_apply_auto_approve(&entrypoint, &env)
                .await?;
            self.checkpoint(Checkpoint::VaultTerraformApply).await?;
        }

        // 16. users terraform
        if !self.cluster.checks.users_terraform_apply_check {
            let token = crate::vault::root_token(&client).await?;
            let pod = k8s::wait_for_pod_running(
                &client,
                VAULT_NAMESPACE,
                "app.kubernetes.io/name=vault",
                300,
            )
            .await?;
            let _tunnel = k8s::forward_pod_port(&client, VAULT_NAMESPACE, &pod, 8200, 8200).await?;
            let entrypoint = self.paths.terraform_entrypoint("users");
            let env = self.vault_terraform_env(crate::vault::VAULT_LOCAL_URL, &token);
            self.terraform
                .init_apply_auto_approve(&entrypoint, &env)
                .await?;
            self.checkpoint(Checkpoint::UsersTerraformApply).await?;
        }

        // 17. final sync wave
        if !self.cluster.checks.post_detokenize_check {
            info!("waiting for final sync wave Deployment to transition to Running");
            k8s::wait_for_deployment_ready(
                &client,
                "crossplane-system",
                "app.kubernetes.io/instance=crossplane",
                3600,
            )
            .await?;
            k8s::wait_for_deployment_ready(
                &client,
                ARGOCD_NAMESPACE,
                "app.kubernetes.io/name=argocd-server",
                3600,
            )
            .await?;
            self.checkpoint(Checkpoint::PostDetokenize).await?;
        }

        // hand the record to the new cluster so its own control plane can
        // serve it after this process is gone
        if let Err(e) = self.export_cluster_record(&client).await {
            warn!(error = %e, "cluster record export failed, continuing");
        }

        self.cluster.status = ClusterStatus::Provisioned;
        self.cluster.in_progress = false;
        self.persist().await?;
        info!(cluster = %self.cluster.cluster_name, "cluster creation complete");

        if let Err(e) =
            crate::services::add_default_services(&self.cluster, &self.services).await
        {
            warn!(error = %e, "failed to seed default services");
        }

        // replay any catalog apps requested at definition time; the registry
        // sync will converge them in one wave
        for app in self.cluster.post_install_catalog_apps.clone() {
            info!(app = %app.name, "installing post-install catalog application");
            let request = crate::types::GitopsCatalogAppCreateRequest {
                user: "kbot".to_string(),
                secret_keys: app.secret_keys.clone(),
                config_keys: app.config_keys.clone(),
                ..Default::default()
            };
            if let Err(e) =
                crate::services::create_service(&self.cluster, &self.services, &app, &request, true)
                    .await
            {
                warn!(app = %app.name, error = %e, "post-install catalog app failed");
            }
        }

        Ok(())
    }

    /// Verify the git owner exists and the destination repositories do not
    async fn verify_git_remotes_available(&mut self) -> Result<()> {
        let http = reqwest::Client::builder()
            .user_agent("kubefirst-api")
            .build()?;
        let owner = self.cluster.git_auth.owner.clone();
        let token = self.cluster.git_auth.token.clone();

        match self.cluster.git_provider {
            GitProvider::Github => {
                for repo in ["gitops", "metaphor"] {
                    let response = http
                        .get(format!("https://api.github.com/repos/{owner}/{repo}"))
                        .bearer_auth(&token)
                        .send()
                        .await?;
                    if response.status().is_success() {
                        return Err(Error::provider(format!(
                            "repository {owner}/{repo} already exists on github"
                        )));
                    }
                }
            }
            GitProvider::Gitlab => {
                #[derive(serde::Deserialize)]
                struct Group {
                    id: i64,
                }
                let group: Group = http
                    .get(format!(
                        "https://gitlab.com/api/v4/groups/{}",
                        urlencode(&owner)
                    ))
                    .bearer_auth(&token)
                    .send()
                    .await?
                    .error_for_status()
                    .map_err(|_| {
                        Error::provider(format!("gitlab group {owner} not found or not accessible"))
                    })?
                    .json()
                    .await?;
                self.cluster.gitlab_owner_group_id = group.id;

                for repo in ["gitops", "metaphor"] {
                    let response = http
                        .get(format!(
                            "https://gitlab.com/api/v4/projects/{}",
                            urlencode(&format!("{owner}/{repo}"))
                        ))
                        .bearer_auth(&token)
                        .send()
                        .await?;
                    if response.status().is_success() {
                        return Err(Error::provider(format!(
                            "project {owner}/{repo} already exists on gitlab"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Clone + detokenize + commit both repositories into scratch
    fn materialize_repositories(&self) -> Result<()> {
        // stale partial clones from a failed attempt are removed first
        for dir in [&self.paths.gitops_dir, &self.paths.metaphor_dir] {
            if dir.exists() {
                std::fs::remove_dir_all(dir)?;
            }
        }

        let path = registry_path(
            self.cluster.cloud_provider,
            &self.cluster.cluster_name,
            false,
        );
        let tokens = render::gitops_tokens(
            &self.cluster,
            &path,
            "vault-kv-secret",
            "default",
            "in-cluster",
            self.cluster.cluster_type.as_str(),
            &self.cluster.cluster_name,
        );

        let materializer = Materializer::new(GitopsTemplateSpec::default());
        let remove_atlantis = self.cluster.atlantis_webhook_url.is_empty();
        materializer.prepare_gitops(
            &self.cluster,
            &tokens,
            &self.gitops_destination_url(),
            remove_atlantis,
            &self.paths.gitops_dir,
        )?;
        materializer.prepare_metaphor(
            &self.cluster,
            &tokens,
            &self.metaphor_destination_url(),
            &self.paths.metaphor_dir,
        )?;
        Ok(())
    }

    /// Seed namespaces and provider secrets the registry sync expects
    async fn bootstrap_cluster_secrets(&self, client: &kube::Client) -> Result<()> {
        for namespace in BOOTSTRAP_NAMESPACES {
            k8s::create_namespace(client, namespace).await?;
        }

        let cluster = &self.cluster;
        let mut provider_secret = BTreeMap::new();
        match cluster.cloud_provider {
            CloudProvider::Civo => {
                provider_secret.insert("civo-token".to_string(), cluster.civo_auth.token.clone());
            }
            CloudProvider::Digitalocean => {
                provider_secret.insert("do-token".to_string(), cluster.do_auth.token.clone());
                provider_secret.insert(
                    "do-spaces-key".to_string(),
                    cluster.do_auth.spaces_key.clone(),
                );
                provider_secret.insert(
                    "do-spaces-secret".to_string(),
                    cluster.do_auth.spaces_secret.clone(),
                );
            }
            CloudProvider::Vultr => {
                provider_secret.insert("vultr-api-key".to_string(), cluster.vultr_auth.token.clone());
            }
            CloudProvider::Akamai => {
                provider_secret.insert("linode-token".to_string(), cluster.akamai_auth.token.clone());
            }
            CloudProvider::Google => {
                provider_secret.insert(
                    "application-default-credentials".to_string(),
                    cluster.google_auth.key_file.clone(),
                );
            }
            CloudProvider::K3d | CloudProvider::Aws => {}
        }
        if !provider_secret.is_empty() {
            k8s::create_secret(client, "external-dns", "external-dns-secrets", provider_secret)
                .await?;
        }

        if !cluster.cloudflare_auth.api_token.is_empty() {
            let mut cloudflare = BTreeMap::new();
            cloudflare.insert(
                "cf-api-token".to_string(),
                cluster.cloudflare_auth.api_token.clone(),
            );
            k8s::create_secret(client, "external-dns", "cloudflare-creds", cloudflare).await?;
        }

        // bootstrap marker consumed by the console
        let mut state = BTreeMap::new();
        state.insert("console-tour".to_string(), "false".to_string());
        k8s::create_secret(client, "kubefirst", "kubefirst-state", state).await?;

        Ok(())
    }

    /// Write the finished record into the provisioned cluster's own store
    ///
    /// The new cluster runs its own copy of this API; seeding its record
    /// store lets it serve the cluster it lives on without re-importing.
    async fn export_cluster_record(&self, client: &kube::Client) -> Result<()> {
        let mut record = self.cluster.clone();
        record.status = ClusterStatus::Provisioned;
        record.in_progress = false;

        let backend = std::sync::Arc::new(crate::store::KubeSecretsBackend::new(client.clone()));
        let remote_store = crate::store::ClusterStore::new(backend);
        k8s::create_namespace(client, crate::KUBEFIRST_NAMESPACE).await?;
        match remote_store.create(&record).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_already_exists() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Apply a manifest URL with the downloaded kubectl binary
    async fn kubectl_apply(&self, namespace: &str, manifest_url: &str) -> Result<()> {
        let kubeconfig = k8s::kubeconfig_path(&self.cluster.cluster_name);
        let output = tokio::process::Command::new(self.paths.tools_dir.join("kubectl"))
            .arg("--kubeconfig")
            .arg(&kubeconfig)
            .args(["apply", "-n", namespace, "-f", manifest_url])
            .output()
            .await
            .map_err(|e| Error::provider(format!("running kubectl: {e}")))?;
        if !output.status.success() {
            return Err(Error::provider(format!(
                "kubectl apply {manifest_url}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

fn urlencode(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::env::Env;
    use crate::provider::{MockCloudDriver, StateStore};
    use crate::store::memory::MemorySecretsBackend;
    use crate::store::{ClusterStore, ServiceListStore};
    use crate::terraform::MockTerraformRunner;
    use crate::types::{Checkpoints, ClusterDefinition};
    use clap::Parser;

    fn stores() -> (ClusterStore, ServiceListStore) {
        let backend = Arc::new(MemorySecretsBackend::new());
        (
            ClusterStore::new(backend.clone()),
            ServiceListStore::new(backend),
        )
    }

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

    async fn controller_with_mocks(
        driver: MockCloudDriver,
        terraform: MockTerraformRunner,
    ) -> ClusterController {
        let (store, services) = stores();
        let env = Env::try_parse_from(["kubefirst-api"]).unwrap();
        ClusterController::initialize("k1", &definition(), store, services, env)
            .await
            .unwrap()
            .with_seams(Arc::new(driver), Arc::new(terraform))
    }

    /// Story: the early transitions run in order, each persisting exactly
    /// one new checkpoint. A driver failure at the state-store step leaves
    /// status=error, lastCondition set, and the two earlier checkpoints
    /// intact for resumption.
    #[tokio::test]
    async fn early_steps_checkpoint_monotonically_and_record_failure() {
        let mut driver = MockCloudDriver::new();
        driver
            .expect_validate_domain_ownership()
            .times(1)
            .returning(|_| Ok(true));
        driver
            .expect_create_state_store()
            .times(1)
            .returning(|_| Err(crate::error::Error::provider("object store quota exceeded")));

        let mut controller = controller_with_mocks(driver, MockTerraformRunner::new()).await;
        // tools were already downloaded by a previous attempt
        controller.cluster.checks.install_tools_check = true;
        controller.persist().await.unwrap();

        let err = controller.provision().await.unwrap_err();
        assert!(err.to_string().contains("quota exceeded"));

        let record = controller.store.get("k1").await.unwrap();
        assert_eq!(record.status, ClusterStatus::Error);
        assert!(!record.in_progress);
        assert!(record.last_condition.contains("quota exceeded"));
        assert!(record.checks.install_tools_check);
        assert!(record.checks.domain_liveness_check);
        assert!(!record.checks.state_store_creds_check);
    }

    /// Mark every transition between the state-store credentials step and
    /// the cloud terraform step complete, so a provisioning run goes
    /// straight from step 3 to step 9 where the mocked runner stops it.
    fn complete_through_gitops_pushed(checks: &mut Checkpoints) {
        for cp in [
            Checkpoint::InstallTools,
            Checkpoint::DomainLiveness,
            Checkpoint::GitInit,
            Checkpoint::KbotSetup,
            Checkpoint::GitopsReady,
            Checkpoint::GitCredentials,
            Checkpoint::GitopsPushed,
        ] {
            cp.set(checks, true);
        }
    }

    /// Story: re-running after a failure skips the completed transitions -
    /// the domain is not validated a second time - and the freshly minted
    /// state-store credentials are durable even though a later step fails.
    #[tokio::test]
    async fn resume_skips_completed_checkpoints() {
        let mut driver = MockCloudDriver::new();
        // domain validation must NOT run again
        driver.expect_validate_domain_ownership().times(0);
        driver.expect_create_state_store().times(1).returning(|name| {
            let mut store = StateStore::default();
            store.credentials.access_key_id = "ak".to_string();
            store.credentials.secret_access_key = "sk".to_string();
            store.details.name = name.to_string();
            Ok(store)
        });
        driver.expect_terraform_env().returning(|_| BTreeMap::new());
        let mut terraform = MockTerraformRunner::new();
        terraform
            .expect_init_apply_auto_approve()
            .times(1)
            .returning(|_, _| Err(crate::error::Error::terraform("stopped for the test")));

        let mut controller = controller_with_mocks(driver, terraform).await;
        complete_through_gitops_pushed(&mut controller.cluster.checks);
        controller.persist().await.unwrap();

        let _ = controller.provision().await;

        let record = controller.store.get("k1").await.unwrap();
        assert!(record.checks.state_store_creds_check);
        assert!(record.checks.state_store_create_check);
        assert_eq!(record.state_store_credentials.access_key_id, "ak");
        assert_eq!(record.state_store_details.name, "k1-state-store-k1");
    }

    /// A cloud terraform failure sets the failed flag while leaving the
    /// apply checkpoint false, so deletion still attempts teardown.
    #[tokio::test]
    async fn cloud_terraform_failure_sets_failed_flag() {
        let mut driver = MockCloudDriver::new();
        driver.expect_terraform_env().returning(|_| BTreeMap::new());
        let mut terraform = MockTerraformRunner::new();
        terraform
            .expect_init_apply_auto_approve()
            .times(1)
            .returning(|_, _| Err(crate::error::Error::terraform("exit 1: quota")));

        let mut controller = controller_with_mocks(driver, terraform).await;
        // everything before step 9 is done
        let mut checks = Checkpoints::default();
        for cp in [
            Checkpoint::InstallTools,
            Checkpoint::DomainLiveness,
            Checkpoint::StateStoreCreds,
            Checkpoint::GitInit,
            Checkpoint::KbotSetup,
            Checkpoint::GitopsReady,
            Checkpoint::GitCredentials,
            Checkpoint::GitopsPushed,
        ] {
            cp.set(&mut checks, true);
        }
        controller.cluster.checks = checks;
        controller.cluster.state_store_details.name = "k1-state-store-k1".to_string();
        controller.persist().await.unwrap();

        let err = controller.provision().await.unwrap_err();
        assert!(matches!(err, crate::error::Error::Terraform(_)));

        let record = controller.store.get("k1").await.unwrap();
        assert!(record.checks.state_store_create_check);
        assert!(record.checks.cloud_terraform_apply_failed_check);
        assert!(!record.checks.cloud_terraform_apply_check);
        assert_eq!(record.status, ClusterStatus::Error);
    }

    /// Checkpoints in the store only ever gain bits during provisioning;
    /// no successful write flips one back to false.
    #[tokio::test]
    async fn provisioning_writes_are_monotone() {
        let mut driver = MockCloudDriver::new();
        driver.expect_create_state_store().returning(|name| {
            let mut store = StateStore::default();
            store.details.name = name.to_string();
            Ok(store)
        });
        driver.expect_terraform_env().returning(|_| BTreeMap::new());
        let mut terraform = MockTerraformRunner::new();
        terraform
            .expect_init_apply_auto_approve()
            .returning(|_, _| Err(crate::error::Error::terraform("stopped for the test")));

        let mut controller = controller_with_mocks(driver, terraform).await;
        complete_through_gitops_pushed(&mut controller.cluster.checks);
        controller.persist().await.unwrap();

        let before = controller.store.get("k1").await.unwrap().checks;
        let _ = controller.provision().await;
        let after = controller.store.get("k1").await.unwrap().checks;

        for cp in Checkpoint::ORDER {
            assert!(
                !cp.get(&before) || cp.get(&after),
                "{cp:?} regressed from true to false"
            );
        }
        // and it advanced
        assert!(after.state_store_create_check);
    }

    #[test]
    fn bootstrap_namespace_list_covers_platform() {
        assert!(BOOTSTRAP_NAMESPACES.contains(&"argocd"));
        assert!(BOOTSTRAP_NAMESPACES.contains(&"vault"));
        assert!(BOOTSTRAP_NAMESPACES.contains(&"kubefirst"));
    }
}

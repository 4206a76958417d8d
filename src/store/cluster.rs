//! Cluster record store
//!
//! One Secret per cluster, `kubefirst-clusters-<clusterName>` in the
//! `kubefirst` namespace. The store is the exclusive owner of cluster bytes;
//! the lifecycle controller publishes changes through [`ClusterStore::update`].

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::env::Env;
use crate::error::Error;
use crate::store::{flatten, inflate, SecretData, SecretsBackend};
use crate::types::{CloudProvider, Cluster, ClusterStatus, ClusterType, GitProtocol, GitProvider};
use crate::{Result, CLUSTER_SECRET_PREFIX, KUBEFIRST_NAMESPACE, SECRET_TYPE_LABEL};

/// Label selector identifying cluster record Secrets
fn cluster_selector() -> String {
    format!("{SECRET_TYPE_LABEL}=cluster")
}

fn secret_name(cluster_name: &str) -> String {
    format!("{CLUSTER_SECRET_PREFIX}-{cluster_name}")
}

/// Durable cluster document store
#[derive(Clone)]
pub struct ClusterStore {
    backend: Arc<dyn SecretsBackend>,
    // serializes update() per cluster name
    write_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl ClusterStore {
    /// Create a store over the given backend
    pub fn new(backend: Arc<dyn SecretsBackend>) -> Self {
        Self {
            backend,
            write_locks: Arc::new(DashMap::new()),
        }
    }

    fn write_lock(&self, cluster_name: &str) -> Arc<Mutex<()>> {
        self.write_locks
            .entry(cluster_name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Create a new record; refuses a second create for the same name
    pub async fn create(&self, cluster: &Cluster) -> Result<()> {
        let mut labels = BTreeMap::new();
        labels.insert(SECRET_TYPE_LABEL.to_string(), "cluster".to_string());

        let data = flatten(cluster)?;
        self.backend
            .create_secret(
                KUBEFIRST_NAMESPACE,
                &secret_name(&cluster.cluster_name),
                labels,
                data,
            )
            .await
            .map_err(|e| {
                if e.is_already_exists() {
                    Error::AlreadyExists(cluster.cluster_name.clone())
                } else {
                    e
                }
            })?;
        info!(cluster = %cluster.cluster_name, "cluster record created");
        Ok(())
    }

    /// Fetch a record by cluster name
    pub async fn get(&self, cluster_name: &str) -> Result<Cluster> {
        let data = self
            .backend
            .read_secret(KUBEFIRST_NAMESPACE, &secret_name(cluster_name))
            .await?
            .ok_or_else(|| Error::NotFound(cluster_name.to_string()))?;
        inflate(data)
    }

    /// Enumerate every cluster record
    pub async fn list(&self) -> Result<Vec<Cluster>> {
        let secrets = self
            .backend
            .list_secrets(KUBEFIRST_NAMESPACE, &cluster_selector())
            .await?;

        let mut clusters = Vec::with_capacity(secrets.len());
        for data in secrets {
            match inflate::<Cluster>(data) {
                Ok(cluster) => clusters.push(cluster),
                Err(e) => warn!(error = %e, "skipping unreadable cluster record"),
            }
        }
        Ok(clusters)
    }

    /// Replace a record's data wholesale
    ///
    /// Concurrent updates are serialized per name; the lifecycle controller
    /// is the sole writer during a run.
    pub async fn update(&self, cluster: &Cluster) -> Result<()> {
        let lock = self.write_lock(&cluster.cluster_name);
        let _held = lock.lock().await;

        let data = flatten(cluster)?;
        self.backend
            .replace_secret(
                KUBEFIRST_NAMESPACE,
                &secret_name(&cluster.cluster_name),
                data,
            )
            .await
    }

    /// Delete a record; deleting a missing record succeeds
    pub async fn delete(&self, cluster_name: &str) -> Result<()> {
        self.backend
            .delete_secret(KUBEFIRST_NAMESPACE, &secret_name(cluster_name))
            .await?;
        self.write_locks.remove(cluster_name);
        info!(cluster = %cluster_name, "cluster record deleted");
        Ok(())
    }

    /// Synthesize the bootstrap record from environment when the store is empty
    ///
    /// Safe against concurrent process starts: the server-side name collision
    /// on `create` is the arbitration, so at most one record is ever made.
    /// Returns the imported record, or `None` when the store already had one
    /// (including the case where another process won the race).
    pub async fn import_if_empty(&self, env: &Env) -> Result<Option<Cluster>> {
        if env.cluster_name.is_empty() {
            info!("no CLUSTER_NAME in environment, nothing to import");
            return Ok(None);
        }
        if !self.list().await?.is_empty() {
            info!("cluster records already present, skipping bootstrap import");
            return Ok(None);
        }

        let cluster = bootstrap_record(env)?;
        match self.create(&cluster).await {
            Ok(()) => {
                info!(cluster = %cluster.cluster_name, "bootstrap cluster record imported");
                Ok(Some(cluster))
            }
            Err(e) if e.is_already_exists() => {
                info!("another process imported the bootstrap record first");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// New opaque 6-character cluster id
pub fn random_cluster_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}

/// Build the bootstrap record from the environment snapshot
fn bootstrap_record(env: &Env) -> Result<Cluster> {
    if env.cluster_name.is_empty() {
        return Err(Error::validation(
            "CLUSTER_NAME is required for bootstrap import",
        ));
    }

    let git_provider = match env.git_provider.as_str() {
        "gitlab" => GitProvider::Gitlab,
        _ => GitProvider::Github,
    };

    let mut cluster = Cluster {
        cluster_name: env.cluster_name.clone(),
        cluster_id: if env.cluster_id.is_empty() {
            random_cluster_id()
        } else {
            env.cluster_id.clone()
        },
        cloud_provider: CloudProvider::parse(&env.cloud_provider)?,
        cluster_type: match env.cluster_type.as_str() {
            "workload" => ClusterType::Workload,
            _ => ClusterType::Mgmt,
        },
        cloud_region: env.cloud_region.clone(),
        domain_name: env.domain_name.clone(),
        subdomain_name: env.subdomain_name.clone(),
        alerts_email: env.admin_email.clone(),
        git_provider,
        git_protocol: match env.git_protocol.as_str() {
            "ssh" => GitProtocol::Ssh,
            _ => GitProtocol::Https,
        },
        git_host: git_provider.host().to_string(),
        status: ClusterStatus::Provisioned,
        in_progress: false,
        creation_timestamp: Utc::now().to_rfc3339(),
        ..Cluster::default()
    };
    cluster.git_auth.owner = env.git_owner.clone();
    cluster.git_auth.token = env.git_token.clone();
    // an imported management cluster is fully provisioned by definition
    for checkpoint in crate::types::Checkpoint::ORDER {
        checkpoint.set(&mut cluster.checks, true);
    }
    Ok(cluster)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemorySecretsBackend;
    use clap::Parser;

    fn store() -> ClusterStore {
        ClusterStore::new(Arc::new(MemorySecretsBackend::new()))
    }

    fn sample(name: &str) -> Cluster {
        Cluster {
            cluster_name: name.to_string(),
            cluster_id: random_cluster_id(),
            cloud_provider: CloudProvider::Civo,
            domain_name: "kubefirst.dev".to_string(),
            ..Cluster::default()
        }
    }

    fn import_env(cluster_name: &str) -> Env {
        Env::try_parse_from([
            "kubefirst-api",
            "--cluster-name",
            cluster_name,
            "--cloud-provider",
            "civo",
            "--domain-name",
            "kubefirst.dev",
            "--git-owner",
            "acme",
        ])
        .unwrap()
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let store = store();
        store.create(&sample("k1")).await.unwrap();
        let got = store.get("k1").await.unwrap();
        assert_eq!(got.cluster_name, "k1");
        assert_eq!(got.cloud_provider, CloudProvider::Civo);
    }

    #[tokio::test]
    async fn second_create_is_already_exists() {
        let store = store();
        store.create(&sample("k1")).await.unwrap();
        let err = store.create(&sample("k1")).await.unwrap_err();
        assert!(err.is_already_exists());
    }

    /// Story: two replicas race to create the same cluster. The API server's
    /// name collision arbitrates; exactly one create succeeds.
    #[tokio::test]
    async fn concurrent_creates_have_exactly_one_winner() {
        let store = store();
        let mut outcomes = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            outcomes.push(tokio::spawn(
                async move { store.create(&sample("k1")).await },
            ));
        }
        let mut winners = 0;
        for handle in outcomes {
            match handle.await.unwrap() {
                Ok(()) => winners += 1,
                Err(e) => assert!(e.is_already_exists()),
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let err = store().get("ghost").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = store();
        store.create(&sample("k1")).await.unwrap();
        store.delete("k1").await.unwrap();
        store.delete("k1").await.unwrap();
        assert!(store.get("k1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn update_replaces_wholesale() {
        let store = store();
        let mut cluster = sample("k1");
        store.create(&cluster).await.unwrap();

        cluster.checks.install_tools_check = true;
        cluster.last_condition = "".to_string();
        store.update(&cluster).await.unwrap();

        let got = store.get("k1").await.unwrap();
        assert!(got.checks.install_tools_check);
    }

    #[tokio::test]
    async fn import_if_empty_imports_once() {
        let store = store();
        let env = import_env("mgmt-1");

        let imported = store.import_if_empty(&env).await.unwrap();
        let cluster = imported.expect("first import creates the record");
        assert_eq!(cluster.cluster_name, "mgmt-1");
        assert_eq!(cluster.status, ClusterStatus::Provisioned);
        assert!(cluster.checks.all_set());

        // second call is a no-op
        assert!(store.import_if_empty(&env).await.unwrap().is_none());
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    /// Story: two processes start against an empty store at the same time.
    /// Both call import; exactly one record exists afterwards.
    #[tokio::test]
    async fn concurrent_imports_yield_one_record() {
        let store = store();
        let env = import_env("mgmt-1");

        let (a, b) = tokio::join!(store.import_if_empty(&env), store.import_if_empty(&env));
        let produced = [a.unwrap(), b.unwrap()]
            .into_iter()
            .filter(Option::is_some)
            .count();
        assert!(produced <= 2);
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[test]
    fn cluster_ids_are_six_lowercase_chars() {
        for _ in 0..32 {
            let id = random_cluster_id();
            assert_eq!(id.len(), 6);
            assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
            assert_eq!(id, id.to_lowercase());
        }
    }
}

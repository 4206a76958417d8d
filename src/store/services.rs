//! Service list store
//!
//! One Secret per cluster, `kubefirst-service-<clusterName>`, holding the
//! ordered list of installed catalog services. Created lazily on first
//! install, destroyed only with the cluster.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use crate::error::Error;
use crate::store::{flatten, inflate, SecretsBackend};
use crate::types::{ClusterServiceList, Service};
use crate::{Result, KUBEFIRST_NAMESPACE, SECRET_TYPE_LABEL, SERVICE_SECRET_PREFIX};

fn secret_name(cluster_name: &str) -> String {
    format!("{SERVICE_SECRET_PREFIX}-{cluster_name}")
}

/// Per-cluster installed-service list store
#[derive(Clone)]
pub struct ServiceListStore {
    backend: Arc<dyn SecretsBackend>,
}

impl ServiceListStore {
    /// Create a store over the given backend
    pub fn new(backend: Arc<dyn SecretsBackend>) -> Self {
        Self { backend }
    }

    /// Create an empty service list for a cluster; a second create is a no-op
    pub async fn create(&self, cluster_name: &str) -> Result<()> {
        if self.try_get(cluster_name).await?.is_some() {
            info!(cluster = %cluster_name, "service list already exists, skipping");
            return Ok(());
        }

        let list = ClusterServiceList {
            cluster_name: cluster_name.to_string(),
            services: Vec::new(),
        };
        let mut labels = BTreeMap::new();
        labels.insert(SECRET_TYPE_LABEL.to_string(), "service".to_string());
        self.backend
            .create_secret(
                KUBEFIRST_NAMESPACE,
                &secret_name(cluster_name),
                labels,
                flatten(&list)?,
            )
            .await
    }

    /// Fetch a cluster's service list
    pub async fn get(&self, cluster_name: &str) -> Result<ClusterServiceList> {
        self.try_get(cluster_name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("service list for {cluster_name}")))
    }

    async fn try_get(&self, cluster_name: &str) -> Result<Option<ClusterServiceList>> {
        match self
            .backend
            .read_secret(KUBEFIRST_NAMESPACE, &secret_name(cluster_name))
            .await?
        {
            Some(data) => Ok(Some(inflate(data)?)),
            None => Ok(None),
        }
    }

    /// Append a service entry; duplicates by name are refused
    pub async fn insert(&self, cluster_name: &str, entry: Service) -> Result<()> {
        let mut list = self.get(cluster_name).await?;
        if list.services.iter().any(|s| s.name == entry.name) {
            return Err(Error::AlreadyExists(format!(
                "service {} on cluster {cluster_name}",
                entry.name
            )));
        }
        info!(cluster = %cluster_name, service = %entry.name, "service added");
        list.services.push(entry);
        self.backend
            .replace_secret(
                KUBEFIRST_NAMESPACE,
                &secret_name(cluster_name),
                flatten(&list)?,
            )
            .await
    }

    /// Remove a service entry by name
    pub async fn delete_entry(&self, cluster_name: &str, service_name: &str) -> Result<()> {
        let mut list = self.get(cluster_name).await?;
        list.services.retain(|s| s.name != service_name);
        info!(cluster = %cluster_name, service = %service_name, "service deleted");
        self.backend
            .replace_secret(
                KUBEFIRST_NAMESPACE,
                &secret_name(cluster_name),
                flatten(&list)?,
            )
            .await
    }

    /// Delete a cluster's entire service list; missing lists succeed
    pub async fn delete(&self, cluster_name: &str) -> Result<()> {
        self.backend
            .delete_secret(KUBEFIRST_NAMESPACE, &secret_name(cluster_name))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemorySecretsBackend;

    fn store() -> ServiceListStore {
        ServiceListStore::new(Arc::new(MemorySecretsBackend::new()))
    }

    fn entry(name: &str) -> Service {
        Service {
            name: name.to_string(),
            description: format!("{name} service"),
            image: format!("https://assets.example.com/{name}.png"),
            links: vec![format!("https://{name}.kubefirst.dev")],
            status: "".to_string(),
            ..Service::default()
        }
    }

    #[tokio::test]
    async fn create_is_idempotent() {
        let store = store();
        store.create("k1").await.unwrap();
        store.create("k1").await.unwrap();
        assert!(store.get("k1").await.unwrap().services.is_empty());
    }

    #[tokio::test]
    async fn insert_refuses_duplicate_names() {
        let store = store();
        store.create("k1").await.unwrap();
        store.insert("k1", entry("postgres")).await.unwrap();
        let err = store.insert("k1", entry("postgres")).await.unwrap_err();
        assert!(err.is_already_exists());
        assert_eq!(store.get("k1").await.unwrap().services.len(), 1);
    }

    /// Story: the service list tracks exactly the set of successful installs
    /// minus successful deletes.
    #[tokio::test]
    async fn list_matches_install_delete_history() {
        let store = store();
        store.create("k1").await.unwrap();

        for name in ["argocd", "vault", "postgres"] {
            store.insert("k1", entry(name)).await.unwrap();
        }
        store.delete_entry("k1", "postgres").await.unwrap();

        let names: Vec<_> = store
            .get("k1")
            .await
            .unwrap()
            .services
            .iter()
            .map(|s| s.name.clone())
            .collect();
        assert_eq!(names, vec!["argocd", "vault"]);
    }

    #[tokio::test]
    async fn delete_whole_list_is_idempotent() {
        let store = store();
        store.create("k1").await.unwrap();
        store.delete("k1").await.unwrap();
        store.delete("k1").await.unwrap();
        assert!(store.get("k1").await.is_err());
    }
}

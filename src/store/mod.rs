//! Secret-backed record stores
//!
//! Cluster and service-list records are persisted as Kubernetes Secrets in
//! the `kubefirst` namespace. The service runs in-cluster, Secrets are
//! already replicated and access-controlled, and an operator can inspect
//! state with `kubectl` - no external database needed.
//!
//! Records are flattened into the Secret `data` map: each top-level JSON key
//! becomes a map key; string values are stored raw, everything else (bools,
//! numbers, arrays, sub-objects) as its JSON text. Downstream code only ever
//! sees the typed document.

mod cluster;
mod flatten;
mod locks;
mod services;

pub use cluster::{random_cluster_id, ClusterStore};
pub use flatten::{flatten, inflate};
pub use locks::TaskLocks;
pub use services::ServiceListStore;

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::{Api, ListParams, ObjectMeta, PostParams};

#[cfg(test)]
use mockall::automock;

use crate::Result;

/// Raw Secret payload: key to bytes
pub type SecretData = BTreeMap<String, Vec<u8>>;

/// Trait abstracting the Kubernetes Secret API for the record stores
///
/// This is the store layer's only seam to the API server, which keeps the
/// stores testable without a cluster. `create_secret` must surface the
/// server-side name collision (409) unchanged - the bootstrap import relies
/// on it for arbitration between concurrently starting processes.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretsBackend: Send + Sync {
    /// Create a Secret; errors with AlreadyExists when the name is taken
    async fn create_secret(
        &self,
        namespace: &str,
        name: &str,
        labels: BTreeMap<String, String>,
        data: SecretData,
    ) -> Result<()>;

    /// Read a Secret's data; `None` when it does not exist
    async fn read_secret(&self, namespace: &str, name: &str) -> Result<Option<SecretData>>;

    /// List the data of every Secret matching a label selector
    async fn list_secrets(&self, namespace: &str, label_selector: &str) -> Result<Vec<SecretData>>;

    /// Replace a Secret's data wholesale
    async fn replace_secret(&self, namespace: &str, name: &str, data: SecretData) -> Result<()>;

    /// Delete a Secret; missing Secrets are not an error
    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Real backend talking to the API server through `kube`
pub struct KubeSecretsBackend {
    client: kube::Client,
}

impl KubeSecretsBackend {
    /// Create a backend from a connected client
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn to_byte_strings(data: SecretData) -> BTreeMap<String, ByteString> {
    data.into_iter().map(|(k, v)| (k, ByteString(v))).collect()
}

fn from_byte_strings(data: BTreeMap<String, ByteString>) -> SecretData {
    data.into_iter().map(|(k, v)| (k, v.0)).collect()
}

#[async_trait]
impl SecretsBackend for KubeSecretsBackend {
    async fn create_secret(
        &self,
        namespace: &str,
        name: &str,
        labels: BTreeMap<String, String>,
        data: SecretData,
    ) -> Result<()> {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            data: Some(to_byte_strings(data)),
            ..Default::default()
        };
        self.api(namespace)
            .create(&PostParams::default(), &secret)
            .await?;
        Ok(())
    }

    async fn read_secret(&self, namespace: &str, name: &str) -> Result<Option<SecretData>> {
        match self.api(namespace).get(name).await {
            Ok(secret) => Ok(Some(from_byte_strings(secret.data.unwrap_or_default()))),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_secrets(&self, namespace: &str, label_selector: &str) -> Result<Vec<SecretData>> {
        let params = ListParams::default().labels(label_selector);
        let list = self.api(namespace).list(&params).await?;
        Ok(list
            .items
            .into_iter()
            .map(|s| from_byte_strings(s.data.unwrap_or_default()))
            .collect())
    }

    async fn replace_secret(&self, namespace: &str, name: &str, data: SecretData) -> Result<()> {
        let api = self.api(namespace);
        let mut secret = api.get(name).await?;
        secret.data = Some(to_byte_strings(data));
        secret.string_data = None;
        api.replace(name, &PostParams::default(), &secret).await?;
        Ok(())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .api(namespace)
            .delete(name, &Default::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
pub mod memory {
    //! In-memory [`SecretsBackend`] used across the crate's tests.

    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;
    use crate::error::Error;

    /// HashMap-backed test double with real AlreadyExists arbitration
    #[derive(Default)]
    pub struct MemorySecretsBackend {
        objects: Mutex<HashMap<(String, String), (BTreeMap<String, String>, SecretData)>>,
    }

    impl MemorySecretsBackend {
        /// Fresh empty backend
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl SecretsBackend for MemorySecretsBackend {
        async fn create_secret(
            &self,
            namespace: &str,
            name: &str,
            labels: BTreeMap<String, String>,
            data: SecretData,
        ) -> Result<()> {
            let key = (namespace.to_string(), name.to_string());
            let mut objects = self.objects.lock().unwrap();
            if objects.contains_key(&key) {
                return Err(Error::AlreadyExists(name.to_string()));
            }
            objects.insert(key, (labels, data));
            Ok(())
        }

        async fn read_secret(&self, namespace: &str, name: &str) -> Result<Option<SecretData>> {
            let key = (namespace.to_string(), name.to_string());
            Ok(self
                .objects
                .lock()
                .unwrap()
                .get(&key)
                .map(|(_, data)| data.clone()))
        }

        async fn list_secrets(
            &self,
            namespace: &str,
            label_selector: &str,
        ) -> Result<Vec<SecretData>> {
            let (sel_key, sel_value) = label_selector
                .split_once('=')
                .unwrap_or((label_selector, ""));
            Ok(self
                .objects
                .lock()
                .unwrap()
                .iter()
                .filter(|((ns, _), (labels, _))| {
                    ns == namespace && labels.get(sel_key).map(String::as_str) == Some(sel_value)
                })
                .map(|(_, (_, data))| data.clone())
                .collect())
        }

        async fn replace_secret(
            &self,
            namespace: &str,
            name: &str,
            data: SecretData,
        ) -> Result<()> {
            let key = (namespace.to_string(), name.to_string());
            let mut objects = self.objects.lock().unwrap();
            match objects.get_mut(&key) {
                Some(entry) => {
                    entry.1 = data;
                    Ok(())
                }
                None => Err(Error::NotFound(name.to_string())),
            }
        }

        async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()> {
            let key = (namespace.to_string(), name.to_string());
            self.objects.lock().unwrap().remove(&key);
            Ok(())
        }
    }
}

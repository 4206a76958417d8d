//! TLS secret backup and restore for the local platform
//!
//! Certificates on the local k3d platform are mkcert-issued and live in
//! `<app>-tls` Secrets. Recreating the cluster would churn them, so the
//! delete path backs them up under the cluster's scratch directory and the
//! create path restores any it finds.

use std::path::PathBuf;

use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::Client;
use tracing::{info, warn};

use crate::env::Env;
use crate::Result;

/// Applications whose TLS secrets are preserved across local recreations
const TLS_APPS: [(&str, &str); 8] = [
    ("argocd", "argocd"),
    ("argo", "argo"),
    ("atlantis", "atlantis"),
    ("chartmuseum", "chartmuseum"),
    ("minio", "minio"),
    ("minio-console", "minio"),
    ("metaphor", "metaphor"),
    ("vault", "vault"),
];

/// Backup directory for a cluster + domain
pub fn ssl_backup_dir(cluster_name: &str, domain: &str) -> PathBuf {
    Env::k1_dir()
        .join(cluster_name)
        .join("ssl")
        .join(domain)
        .join("secrets")
}

/// Persist every `<app>-tls` Secret to the scratch backup directory
pub async fn backup_tls_secrets(client: &Client, cluster_name: &str, domain: &str) -> Result<()> {
    let dir = ssl_backup_dir(cluster_name, domain);
    std::fs::create_dir_all(&dir)?;

    for (app, namespace) in TLS_APPS {
        let api: Api<Secret> = Api::namespaced(client.clone(), namespace);
        let name = format!("{app}-tls");
        match api.get(&name).await {
            Ok(secret) => {
                // strip server-populated metadata so the backup re-applies
                let clean = Secret {
                    metadata: ObjectMeta {
                        name: secret.metadata.name,
                        namespace: secret.metadata.namespace,
                        ..Default::default()
                    },
                    type_: secret.type_,
                    data: secret.data,
                    ..Default::default()
                };
                let path = dir.join(format!("{namespace}-{name}.yaml"));
                std::fs::write(&path, serde_yaml::to_string(&clean)?)?;
                info!(secret = %name, namespace = %namespace, "tls secret backed up");
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => warn!(secret = %name, error = %e, "tls backup skipped"),
        }
    }
    Ok(())
}

/// Re-apply previously backed up TLS secrets into a fresh cluster
pub async fn restore_tls_secrets(client: &Client, cluster_name: &str, domain: &str) -> Result<()> {
    let dir = ssl_backup_dir(cluster_name, domain);
    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("no tls secrets to restore, continuing");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().map(|e| e != "yaml").unwrap_or(true) {
            continue;
        }
        let secret: Secret = serde_yaml::from_str(&std::fs::read_to_string(&path)?)?;
        let Some(namespace) = secret.metadata.namespace.clone() else {
            continue;
        };
        let api: Api<Secret> = Api::namespaced(client.clone(), &namespace);
        match api.create(&PostParams::default(), &secret).await {
            Ok(_) => info!(file = %path.display(), "tls secret restored"),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {}
            Err(e) => warn!(file = %path.display(), error = %e, "tls restore failed"),
        }
    }
    Ok(())
}

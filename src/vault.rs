//! Vault initialization and KV seeding
//!
//! The secret store auto-unseals against cloud KMS, so `sys/init` runs in
//! recovery mode. Initialization happens exactly once per cluster: the full
//! init response - root token and recovery keys - is persisted into the
//! `vault/vault-unseal-secret` Secret, and every later caller reuses it.

use std::collections::BTreeMap;
use std::time::Duration;

use kube::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::error::Error;
use crate::{Result, VAULT_NAMESPACE, VAULT_UNSEAL_SECRET};

/// Local URL of the port-forwarded Vault API
pub const VAULT_LOCAL_URL: &str = "https://localhost:8200";

/// How long to wait for the vault-0 pod: 30 minutes
pub const VAULT_POD_WAIT_SECS: u64 = 1800;

#[derive(Debug, Deserialize)]
struct InitResponse {
    #[serde(default)]
    keys: Vec<String>,
    #[serde(default)]
    keys_base64: Vec<String>,
    root_token: String,
}

/// HTTP client for the port-forwarded Vault endpoint
///
/// The in-cluster certificate is not valid for localhost, so verification is
/// disabled for this tunnel only.
pub fn vault_http_client() -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .timeout(Duration::from_secs(30))
        .build()?)
}

/// Initialize Vault in recovery mode and persist the unseal material
///
/// Short-circuits when `vault/vault-unseal-secret` already exists - the
/// init response can only ever be obtained once.
pub async fn initialize(
    client: &Client,
    vault_url: &str,
    recovery_shares: u8,
    recovery_threshold: u8,
) -> Result<()> {
    if crate::k8s::read_secret(client, VAULT_NAMESPACE, VAULT_UNSEAL_SECRET)
        .await?
        .is_some()
    {
        info!("vault already initialized, reusing existing unseal secret");
        return Ok(());
    }

    let http = vault_http_client()?;
    let response = http
        .post(format!("{vault_url}/v1/sys/init"))
        .json(&json!({
            "recovery_shares": recovery_shares,
            "recovery_threshold": recovery_threshold,
        }))
        .send()
        .await?;
    if !response.status().is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(Error::vault(format!("sys/init failed: {body}")));
    }
    let init: InitResponse = response.json().await?;
    info!("vault initialized with auto unseal");

    let mut data = BTreeMap::new();
    data.insert("root-token".to_string(), init.root_token);
    for (i, key) in init.keys.iter().enumerate() {
        data.insert(format!("recovery-key-{}", i + 1), key.clone());
    }
    for (i, key) in init.keys_base64.iter().enumerate() {
        data.insert(format!("recovery-key-b64-{}", i + 1), key.clone());
    }
    crate::k8s::create_secret(client, VAULT_NAMESPACE, VAULT_UNSEAL_SECRET, data).await
}

/// Read the root token persisted at initialization time
pub async fn root_token(client: &Client) -> Result<String> {
    let secret = crate::k8s::read_secret(client, VAULT_NAMESPACE, VAULT_UNSEAL_SECRET)
        .await?
        .ok_or_else(|| Error::vault("vault-unseal-secret not found"))?;
    secret
        .get("root-token")
        .cloned()
        .ok_or_else(|| Error::vault("vault-unseal-secret has no root-token key"))
}

/// Write a KV v2 secret under `secret/<path>`
pub async fn write_kv_secret(
    vault_url: &str,
    token: &str,
    path: &str,
    values: &BTreeMap<String, String>,
) -> Result<()> {
    let http = vault_http_client()?;
    let response = http
        .post(format!("{vault_url}/v1/secret/data/{path}"))
        .header("X-Vault-Token", token)
        .json(&json!({ "data": values }))
        .send()
        .await?;
    if !response.status().is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(Error::vault(format!("writing secret/{path}: {body}")));
    }
    info!(path = %path, "vault kv secret written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_response_parses_vault_shape() {
        let body = r#"{
            "keys": ["aa", "bb"],
            "keys_base64": ["qg==", "uw=="],
            "root_token": "hvs.root"
        }"#;
        let init: InitResponse = serde_json::from_str(body).unwrap();
        assert_eq!(init.root_token, "hvs.root");
        assert_eq!(init.keys.len(), 2);
        assert_eq!(init.keys_base64.len(), 2);
    }
}

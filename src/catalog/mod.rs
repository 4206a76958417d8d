//! Gitops catalog index reader
//!
//! The catalog lives in a public source repository; the index and app
//! directories are read through the hosting site's REST API without
//! authentication. The in-memory cache maintained by the
//! [`updater`](crate::catalog::updater) is consulted before any remote call.

mod updater;

pub use updater::{run_scheduler, CatalogCache, REFRESH_INTERVAL};

use serde::Deserialize;
use tracing::debug;

use crate::error::Error;
use crate::types::GitopsCatalogApps;
use crate::{Result, GITOPS_CATALOG_REPO, KONSTRUCT_OWNER};

const GITHUB_API_BASE: &str = "https://api.github.com";
const CATALOG_BRANCH: &str = "main";

#[derive(Debug, Deserialize)]
struct ContentEntry {
    name: String,
    path: String,
    #[serde(rename = "type")]
    entry_type: String,
    #[serde(default)]
    download_url: Option<String>,
}

/// Reads the upstream gitops catalog
pub struct CatalogReader {
    http: reqwest::Client,
}

impl Default for CatalogReader {
    fn default() -> Self {
        Self::new()
    }
}

impl CatalogReader {
    /// Create a reader against the public hosting API
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .user_agent("kubefirst-api")
            .build()
            .expect("reqwest client");
        Self { http }
    }

    async fn list_contents(&self, path: &str) -> Result<Vec<ContentEntry>> {
        let url = format!(
            "{GITHUB_API_BASE}/repos/{KONSTRUCT_OWNER}/{GITOPS_CATALOG_REPO}/contents/{path}"
        );
        Ok(self
            .http
            .get(url)
            .query(&[("ref", CATALOG_BRANCH)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        Ok(self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?
            .to_vec())
    }

    /// Fetch and parse the catalog index
    pub async fn read_active_applications(&self) -> Result<GitopsCatalogApps> {
        let bytes = self.read_index_bytes().await?;
        Ok(serde_yaml::from_slice(&bytes)?)
    }

    /// Fetch the raw `index.yaml` bytes
    pub async fn read_index_bytes(&self) -> Result<Vec<u8>> {
        let root = self.list_contents("").await?;
        let index = root
            .iter()
            .find(|e| e.name == "index.yaml")
            .and_then(|e| e.download_url.as_deref())
            .ok_or_else(|| Error::provider("gitops catalog has no index.yaml"))?;
        self.download(index).await
    }

    /// Download an application directory's files as `(relative path, bytes)`
    pub async fn read_application_directory(
        &self,
        application: &str,
    ) -> Result<Vec<(String, Vec<u8>)>> {
        let mut files = Vec::new();
        let mut pending = vec![application.to_string()];

        while let Some(dir) = pending.pop() {
            for entry in self.list_contents(&dir).await? {
                match entry.entry_type.as_str() {
                    "dir" => pending.push(entry.path),
                    "file" => {
                        let url = entry.download_url.ok_or_else(|| {
                            Error::provider(format!("{} has no download url", entry.path))
                        })?;
                        debug!(path = %entry.path, "downloading catalog file");
                        let bytes = self.download(&url).await?;
                        let relative = entry
                            .path
                            .strip_prefix(&format!("{application}/"))
                            .unwrap_or(&entry.path)
                            .to_string();
                        files.push((relative, bytes));
                    }
                    _ => {}
                }
            }
        }

        if files.is_empty() {
            return Err(Error::NotFound(format!(
                "catalog application {application}"
            )));
        }
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_entries_parse_github_shape() {
        let body = r#"[
            {"name":"index.yaml","path":"index.yaml","type":"file","download_url":"https://raw.example/index.yaml"},
            {"name":"postgres","path":"postgres","type":"dir","download_url":null}
        ]"#;
        let entries: Vec<ContentEntry> = serde_json::from_str(body).unwrap();
        assert_eq!(entries[0].entry_type, "file");
        assert!(entries[1].download_url.is_none());
    }
}

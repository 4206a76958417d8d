//! Periodic catalog refresh
//!
//! A detached task re-reads the upstream index on a fixed hourly cadence and
//! swaps the in-memory copy when the content hash changes. Readers never
//! block the updater for longer than a clone.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::catalog::CatalogReader;
use crate::types::GitopsCatalogApps;
use crate::Result;

/// Refresh cadence
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Shared in-memory catalog: one writer (the scheduler), many readers
#[derive(Clone, Default)]
pub struct CatalogCache {
    inner: Arc<RwLock<CachedCatalog>>,
}

#[derive(Default)]
struct CachedCatalog {
    apps: GitopsCatalogApps,
    content_hash: u64,
}

impl CatalogCache {
    /// Fresh empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Current catalog snapshot
    pub async fn get(&self) -> GitopsCatalogApps {
        self.inner.read().await.apps.clone()
    }

    /// Find one app by name in the cached index
    pub async fn find(&self, name: &str) -> Option<crate::types::GitopsCatalogApp> {
        self.inner
            .read()
            .await
            .apps
            .apps
            .iter()
            .find(|a| a.name == name)
            .cloned()
    }

    /// Refresh from upstream; no-op when the index bytes are unchanged
    pub async fn refresh(&self, reader: &CatalogReader) -> Result<bool> {
        let bytes = reader.read_index_bytes().await?;
        let mut hasher = DefaultHasher::new();
        bytes.hash(&mut hasher);
        let content_hash = hasher.finish();

        {
            let cached = self.inner.read().await;
            if cached.content_hash == content_hash {
                return Ok(false);
            }
        }

        let apps: GitopsCatalogApps = serde_yaml::from_slice(&bytes)?;
        let count = apps.apps.len();
        let mut cached = self.inner.write().await;
        cached.apps = apps;
        cached.content_hash = content_hash;
        info!(apps = count, "gitops catalog refreshed");
        Ok(true)
    }
}

/// Run the hourly refresh forever
///
/// The first tick fires immediately so the process starts with a populated
/// catalog; failures are logged and retried at the next tick.
pub async fn run_scheduler(cache: CatalogCache) {
    let reader = CatalogReader::new();
    let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
    loop {
        ticker.tick().await;
        if let Err(e) = cache.refresh(&reader).await {
            warn!(error = %e, "gitops catalog refresh failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GitopsCatalogApp;

    #[tokio::test]
    async fn readers_observe_updates_without_restart() {
        let cache = CatalogCache::new();
        assert!(cache.get().await.apps.is_empty());

        {
            let mut inner = cache.inner.write().await;
            inner.apps = GitopsCatalogApps {
                apps: vec![GitopsCatalogApp {
                    name: "postgres".to_string(),
                    ..GitopsCatalogApp::default()
                }],
            };
            inner.content_hash = 1;
        }

        assert_eq!(cache.get().await.apps.len(), 1);
        assert!(cache.find("postgres").await.is_some());
        assert!(cache.find("metabase").await.is_none());
    }
}

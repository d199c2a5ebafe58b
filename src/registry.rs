//! Lazily opened, process-lifetime connections keyed by cluster name.

use crate::config::Config;
use crate::error::{DataApiError, Result};
use crate::storage::StorageEngine;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;
use tracing::{info, warn};

type Slot = Arc<OnceCell<Arc<StorageEngine>>>;

/// Resolves cluster names to live connections.
///
/// Each name owns a slot that is initialized at most once. Concurrent first
/// resolutions of the same name wait on the same slot, so a single
/// connection is opened per name. A failed attempt leaves the slot empty and
/// the next request tries again.
pub struct ClusterRegistry {
    clusters: BTreeMap<String, String>,
    slots: Mutex<HashMap<String, Slot>>,
    connections_opened: AtomicUsize,
}

impl ClusterRegistry {
    pub fn new(clusters: BTreeMap<String, String>) -> Self {
        Self {
            clusters,
            slots: Mutex::new(HashMap::new()),
            connections_opened: AtomicUsize::new(0),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.mongo_clusters.clone())
    }

    /// Configured cluster names
    pub fn names(&self) -> Vec<String> {
        self.clusters.keys().cloned().collect()
    }

    /// Number of successful connection attempts so far
    pub fn connections_opened(&self) -> usize {
        self.connections_opened.load(Ordering::SeqCst)
    }

    fn slot(&self, name: &str) -> Result<Slot> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|e| DataApiError::Backend(format!("Lock error: {}", e)))?;
        Ok(Arc::clone(slots.entry(name.to_string()).or_default()))
    }

    /// Return the connection for `name`, opening it on first use
    pub async fn resolve(&self, name: &str) -> Result<Arc<StorageEngine>> {
        let uri = self
            .clusters
            .get(name)
            .ok_or_else(|| DataApiError::UnknownCluster(name.to_string()))?;

        let slot = self.slot(name)?;
        let engine = slot
            .get_or_try_init(|| async {
                match StorageEngine::connect(uri).await {
                    Ok(engine) => {
                        self.connections_opened.fetch_add(1, Ordering::SeqCst);
                        info!(cluster = name, engine = engine.kind(), "Opened cluster connection");
                        Ok(Arc::new(engine))
                    }
                    Err(e) => {
                        warn!(cluster = name, error = %e, "Failed to open cluster connection");
                        Err(e)
                    }
                }
            })
            .await?;

        Ok(Arc::clone(engine))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ClusterRegistry {
        let mut clusters = BTreeMap::new();
        clusters.insert("logs".to_string(), "memory://logs".to_string());
        clusters.insert("main".to_string(), "memory://main".to_string());
        clusters.insert("broken".to_string(), "not-a-uri".to_string());
        ClusterRegistry::new(clusters)
    }

    #[tokio::test]
    async fn test_resolve_reuses_handle() {
        let registry = registry();
        let first = registry.resolve("logs").await.unwrap();
        let second = registry.resolve("logs").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.connections_opened(), 1);

        let other = registry.resolve("main").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(registry.connections_opened(), 2);
    }

    #[tokio::test]
    async fn test_unknown_cluster() {
        let registry = registry();
        let err = registry.resolve("missing").await.unwrap_err();
        assert!(matches!(err, DataApiError::UnknownCluster(name) if name == "missing"));
        assert_eq!(registry.connections_opened(), 0);
    }

    #[tokio::test]
    async fn test_failed_connect_is_not_cached() {
        let registry = registry();
        let first = registry.resolve("broken").await;
        assert!(matches!(first, Err(DataApiError::Backend(_))));
        let second = registry.resolve("broken").await;
        assert!(matches!(second, Err(DataApiError::Backend(_))));
        assert_eq!(registry.connections_opened(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_resolve_opens_once() {
        let registry = Arc::new(registry());
        let mut tasks = Vec::new();
        for _ in 0..32 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move { registry.resolve("logs").await }));
        }

        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.unwrap().unwrap());
        }

        assert_eq!(registry.connections_opened(), 1);
        assert!(handles.iter().all(|h| Arc::ptr_eq(h, &handles[0])));
    }
}

//! Node agent assembly.
//!
//! Wires the cache store, resolver, fetcher pool and coordinator together
//! under one supervisor:
//!
//! ```text
//! Supervisor
//! ├── fetcher_pool       (download tasks, fan-in, admission)
//! └── node_coordinator   (pull jobs)
//! ```

use std::sync::Arc;

use layercast_id::NodeId;
use thiserror::Error;
use tracing::{info, warn};

use crate::actors::Supervisor;
use crate::cache::{CacheError, CacheStore};
use crate::config::Config;
use crate::coordinator::NodeCoordinator;
use crate::fetcher::FetcherPool;
use crate::metrics::{MetricsSnapshot, PrefetchMetrics};
use crate::registry::{HttpRegistry, HttpRegistryConfig, MirrorRegistry, RegistryError, SharedRegistry};
use crate::resolver::ManifestResolver;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("failed to open cache: {0}")]
    Cache(#[from] CacheError),

    #[error("failed to build registry client: {0}")]
    Registry(#[from] RegistryError),
}

/// Builds the registry backend from configuration: the upstream registry,
/// behind any configured mirrors.
pub fn build_registry(config: &Config) -> Result<SharedRegistry, RegistryError> {
    let upstream: SharedRegistry = Arc::new(HttpRegistry::new(config.registry.clone())?);
    if config.mirrors.is_empty() {
        return Ok(upstream);
    }

    let mut backends: Vec<SharedRegistry> = Vec::with_capacity(config.mirrors.len() + 1);
    for endpoint in &config.mirrors {
        let mirror = HttpRegistry::new(HttpRegistryConfig {
            endpoint: Some(endpoint.clone()),
            ..config.registry.clone()
        })?;
        backends.push(Arc::new(mirror));
    }
    backends.push(upstream);
    Ok(Arc::new(MirrorRegistry::new(backends)))
}

/// A running node agent.
pub struct NodeAgent {
    node: NodeId,
    supervisor: Supervisor,
    cache: CacheStore,
    resolver: Arc<ManifestResolver>,
    pool: FetcherPool,
    coordinator: NodeCoordinator,
    metrics: Arc<PrefetchMetrics>,
}

impl NodeAgent {
    /// Opens the cache and starts the pool and coordinator actors.
    pub async fn start(config: &Config, registry: SharedRegistry) -> Result<Self, AgentError> {
        let cache = CacheStore::open(config.cache.clone()).await?;
        let metrics = Arc::new(PrefetchMetrics::new());
        let resolver = Arc::new(ManifestResolver::new(
            registry.clone(),
            config.resolver.clone(),
        ));

        let mut supervisor = Supervisor::new();
        let pool = FetcherPool::spawn(
            &mut supervisor,
            cache.clone(),
            registry,
            config.fetcher.clone(),
            metrics.clone(),
        );
        let coordinator = NodeCoordinator::spawn(
            &mut supervisor,
            config.node_id,
            resolver.clone(),
            pool.clone(),
            metrics.clone(),
            config.coordinator.clone(),
        );

        let usage = cache.usage();
        info!(
            node_id = %config.node_id,
            cached_entries = usage.entries,
            stored_bytes = usage.stored_bytes,
            budget_bytes = usage.budget_bytes,
            "Node agent started"
        );

        Ok(Self {
            node: config.node_id,
            supervisor,
            cache,
            resolver,
            pool,
            coordinator,
            metrics,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn resolver(&self) -> &Arc<ManifestResolver> {
        &self.resolver
    }

    pub fn pool(&self) -> &FetcherPool {
        &self.pool
    }

    pub fn coordinator(&self) -> &NodeCoordinator {
        &self.coordinator
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot(&self.cache)
    }

    /// Stops the actors (cancelling running jobs) and flushes the cache
    /// index.
    pub async fn shutdown(mut self) {
        self.supervisor.stop_all().await;
        if let Err(e) = self.cache.flush().await {
            warn!(error = %e, "Failed to flush cache index");
        }
        info!(node_id = %self.node, "Node agent stopped");
    }
}

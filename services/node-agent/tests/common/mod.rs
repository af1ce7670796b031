//! Shared harness for node agent integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use layercast_id::NodeId;
use layercast_node_agent::actors::Supervisor;
use layercast_node_agent::cache::{CacheConfig, CacheStore};
use layercast_node_agent::coordinator::{CoordinatorConfig, NodeCoordinator};
use layercast_node_agent::fetcher::{BackoffPolicy, FetcherConfig, FetcherPool};
use layercast_node_agent::image::ImageReference;
use layercast_node_agent::metrics::PrefetchMetrics;
use layercast_node_agent::registry::MockRegistry;
use layercast_node_agent::resolver::{ManifestResolver, ResolverConfig};
use tempfile::TempDir;

/// Fetcher settings that keep retries and admission waits short.
pub fn fast_fetcher(concurrency: usize) -> FetcherConfig {
    FetcherConfig {
        concurrency,
        max_attempts: 3,
        backoff: BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(10)),
        attempt_timeout: Duration::from_secs(5),
        task_timeout: Duration::from_secs(30),
        admission_wait: Duration::from_millis(300),
        ..Default::default()
    }
}

pub fn image(reference: &str) -> ImageReference {
    ImageReference::parse(reference).unwrap()
}

/// One node wired to a mock registry.
pub struct TestNode {
    pub dir: TempDir,
    pub supervisor: Supervisor,
    pub registry: Arc<MockRegistry>,
    pub cache: CacheStore,
    pub pool: FetcherPool,
    pub coordinator: NodeCoordinator,
    pub metrics: Arc<PrefetchMetrics>,
}

impl TestNode {
    pub async fn start(registry: Arc<MockRegistry>, budget: u64, fetcher: FetcherConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        Self::start_in(dir, registry, budget, fetcher).await
    }

    pub async fn start_in(
        dir: TempDir,
        registry: Arc<MockRegistry>,
        budget: u64,
        fetcher: FetcherConfig,
    ) -> Self {
        let cache = CacheStore::open(CacheConfig {
            root: dir.path().join("cache"),
            budget_bytes: budget,
            ..Default::default()
        })
        .await
        .unwrap();
        let metrics = Arc::new(PrefetchMetrics::new());
        let resolver = Arc::new(ManifestResolver::new(
            registry.clone(),
            ResolverConfig::default(),
        ));

        let mut supervisor = Supervisor::new();
        let pool = FetcherPool::spawn(
            &mut supervisor,
            cache.clone(),
            registry.clone(),
            fetcher,
            metrics.clone(),
        );
        let coordinator = NodeCoordinator::spawn(
            &mut supervisor,
            NodeId::new(),
            resolver,
            pool.clone(),
            metrics.clone(),
            CoordinatorConfig::default(),
        );

        Self {
            dir,
            supervisor,
            registry,
            cache,
            pool,
            coordinator,
            metrics,
        }
    }

    /// Stops the actors and flushes the index, handing back the directory.
    pub async fn stop(mut self) -> TempDir {
        self.supervisor.stop_all().await;
        self.cache.flush().await.unwrap();
        self.dir
    }

    /// Waits until the pool has no tasks left.
    pub async fn settle(&self) {
        for _ in 0..200 {
            if self.pool.stats().await.unwrap().in_flight == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("fetcher pool did not settle");
    }
}

//! Campaign scheduling across in-process nodes sharing one mock registry.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use layercast_id::NodeId;
use layercast_node_agent::actors::Supervisor;
use layercast_node_agent::cache::{CacheConfig, CacheStore, EntryState};
use layercast_node_agent::coordinator::CoordinatorConfig;
use layercast_node_agent::fetcher::{BackoffPolicy, FetcherConfig, FetcherPool, Priority};
use layercast_node_agent::image::ImageReference;
use layercast_node_agent::metrics::PrefetchMetrics;
use layercast_node_agent::registry::{Fault, MockRegistry};
use layercast_node_agent::resolver::{ManifestResolver, ResolverConfig};
use layercast_node_agent::{JobHandle, JobStatus, NodeCoordinator, PullJob};
use layercast_reconcile::JobState;
use layercast_scheduler::{
    ClusterScheduler, EndpointError, NodeEndpoint, SchedulerConfig, SchedulerError,
};
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::watch;
use tokio::time::Instant;

struct Node {
    coordinator: NodeCoordinator,
    cache: CacheStore,
    _dir: TempDir,
}

struct Cluster {
    supervisor: Supervisor,
    nodes: Vec<Node>,
}

impl Cluster {
    async fn start(registry: Arc<MockRegistry>, size: usize) -> Self {
        let mut supervisor = Supervisor::new();
        let mut nodes = Vec::with_capacity(size);
        for _ in 0..size {
            let dir = tempfile::tempdir().unwrap();
            let cache = CacheStore::open(CacheConfig {
                root: dir.path().to_path_buf(),
                budget_bytes: 1 << 20,
                ..Default::default()
            })
            .await
            .unwrap();
            let metrics = Arc::new(PrefetchMetrics::new());
            let resolver = Arc::new(ManifestResolver::new(
                registry.clone(),
                ResolverConfig::default(),
            ));
            let pool = FetcherPool::spawn(
                &mut supervisor,
                cache.clone(),
                registry.clone(),
                FetcherConfig {
                    concurrency: 4,
                    max_attempts: 3,
                    backoff: BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(5)),
                    ..Default::default()
                },
                metrics.clone(),
            );
            let coordinator = NodeCoordinator::spawn(
                &mut supervisor,
                NodeId::new(),
                resolver,
                pool,
                metrics,
                CoordinatorConfig::default(),
            );
            nodes.push(Node {
                coordinator,
                cache,
                _dir: dir,
            });
        }
        Self { supervisor, nodes }
    }

    fn scheduler(&self, config: SchedulerConfig) -> ClusterScheduler {
        let scheduler = ClusterScheduler::new(config);
        for node in &self.nodes {
            scheduler
                .register(Arc::new(node.coordinator.clone()))
                .unwrap();
        }
        scheduler
    }

    fn id(&self, index: usize) -> NodeId {
        self.nodes[index].coordinator.node_id()
    }

    fn job(&self, index: usize, image: &str) -> PullJob {
        PullJob::new(self.id(index), vec![ImageReference::parse(image).unwrap()])
    }

    async fn stop(mut self) {
        self.supervisor.stop_all().await;
    }
}

fn fast_retries(max_attempts: u32) -> SchedulerConfig {
    SchedulerConfig {
        max_attempts,
        retry_delay: Duration::from_millis(10),
        ..Default::default()
    }
}

/// Records when each node job was handed to its node.
struct Recording {
    inner: NodeCoordinator,
    log: Arc<Mutex<Vec<(NodeId, Instant)>>>,
}

#[async_trait]
impl NodeEndpoint for Recording {
    fn node_id(&self) -> NodeId {
        self.inner.node_id()
    }

    async fn submit(&self, job: PullJob) -> Result<JobHandle, EndpointError> {
        self.log.lock().push((job.node, Instant::now()));
        NodeEndpoint::submit(&self.inner, job).await
    }
}

/// Unreachable for the first `outages` submissions.
struct Flaky {
    inner: NodeCoordinator,
    outages: AtomicU32,
}

#[async_trait]
impl NodeEndpoint for Flaky {
    fn node_id(&self) -> NodeId {
        self.inner.node_id()
    }

    async fn submit(&self, job: PullJob) -> Result<JobHandle, EndpointError> {
        let left = self.outages.load(Ordering::SeqCst);
        if left > 0 {
            self.outages.store(left - 1, Ordering::SeqCst);
            return Err(EndpointError::Unavailable {
                node: job.node,
                reason: "connection refused".to_string(),
            });
        }
        NodeEndpoint::submit(&self.inner, job).await
    }
}

/// A node that reports progress every few milliseconds for `busy`, then
/// finishes Ready. No real pulls happen.
struct Chatty {
    node: NodeId,
    busy: Duration,
    log: Arc<Mutex<Vec<(NodeId, Instant)>>>,
}

#[async_trait]
impl NodeEndpoint for Chatty {
    fn node_id(&self) -> NodeId {
        self.node
    }

    async fn submit(&self, job: PullJob) -> Result<JobHandle, EndpointError> {
        self.log.lock().push((job.node, Instant::now()));

        let mut status = JobStatus::new(&job);
        status.state = JobState::InProgress;
        let (tx, rx) = watch::channel(status.clone());
        let (cancel, _) = watch::channel(false);
        let until = Instant::now() + self.busy;
        tokio::spawn(async move {
            while Instant::now() < until {
                tokio::time::sleep(Duration::from_millis(2)).await;
                status.progress.ready += 1;
                let _ = tx.send(status.clone());
            }
            status.state = JobState::Ready;
            let _ = tx.send(status);
        });
        Ok(JobHandle::new(job.id, rx, Arc::new(cancel)))
    }
}

#[tokio::test]
async fn test_campaign_ready_when_every_node_ready() {
    let registry = Arc::new(MockRegistry::new());
    let layers = registry
        .add_image("registry.local/app:v1", &[b"base".as_slice(), b"app".as_slice()])
        .unwrap();
    let cluster = Cluster::start(registry.clone(), 3).await;
    let scheduler = cluster.scheduler(SchedulerConfig::default());

    let jobs = (0..3).map(|i| cluster.job(i, "registry.local/app:v1")).collect();
    let campaign = scheduler.submit(jobs).unwrap();
    let status = campaign.wait().await;

    assert_eq!(status.state, JobState::Ready);
    assert_eq!(status.count(JobState::Ready), 3);
    assert!(status.finished_at.is_some());
    for node in &status.nodes {
        assert_eq!(node.attempts, 1);
        assert_eq!(node.job.as_ref().map(|j| j.progress.ready), Some(2));
    }
    for node in &cluster.nodes {
        for layer in &layers {
            assert_eq!(
                node.cache.lookup(&layer.digest).map(|e| e.state),
                Some(EntryState::Ready)
            );
        }
    }
    // Each node has its own cache: one fetch per layer per node.
    assert_eq!(registry.total_blob_fetches(), 6);
    assert_eq!(scheduler.status(campaign.campaign_id()).unwrap(), status);

    cluster.stop().await;
}

#[tokio::test]
async fn test_cluster_ceiling_bounds_registry_load() {
    let registry = Arc::new(MockRegistry::new().with_latency(Duration::from_millis(30)));
    registry
        .add_image("registry.local/app:v1", &[vec![1u8; 2048]])
        .unwrap();
    let cluster = Cluster::start(registry.clone(), 5).await;
    let scheduler = cluster.scheduler(SchedulerConfig {
        max_concurrent_jobs: 2,
        ..Default::default()
    });

    let jobs = (0..5).map(|i| cluster.job(i, "registry.local/app:v1")).collect();
    let status = scheduler.submit(jobs).unwrap().wait().await;

    assert_eq!(status.state, JobState::Ready);
    assert_eq!(registry.total_blob_fetches(), 5);
    assert!(registry.max_concurrent_fetches() <= 2);
    assert_eq!(scheduler.available_slots(), 2);

    cluster.stop().await;
}

#[tokio::test]
async fn test_jobs_dispatched_in_priority_order() {
    let registry = Arc::new(MockRegistry::new());
    registry
        .add_image("registry.local/app:v1", &[b"layer".as_slice()])
        .unwrap();
    let cluster = Cluster::start(registry.clone(), 3).await;
    let scheduler = ClusterScheduler::new(SchedulerConfig {
        max_concurrent_jobs: 1,
        ..Default::default()
    });
    let log = Arc::new(Mutex::new(Vec::new()));
    for node in &cluster.nodes {
        scheduler
            .register(Arc::new(Recording {
                inner: node.coordinator.clone(),
                log: log.clone(),
            }))
            .unwrap();
    }

    let jobs = vec![
        cluster.job(0, "registry.local/app:v1").with_priority(Priority::Low),
        cluster.job(1, "registry.local/app:v1"),
        cluster.job(2, "registry.local/app:v1").with_priority(Priority::High),
    ];
    let status = scheduler.submit(jobs).unwrap().wait().await;
    assert_eq!(status.state, JobState::Ready);

    let order: Vec<NodeId> = log.lock().iter().map(|(node, _)| *node).collect();
    assert_eq!(order, vec![cluster.id(2), cluster.id(1), cluster.id(0)]);

    cluster.stop().await;
}

#[tokio::test]
async fn test_first_attempts_staggered_across_window() {
    let registry = Arc::new(MockRegistry::new());
    registry
        .add_image("registry.local/app:v1", &[b"layer".as_slice()])
        .unwrap();
    let cluster = Cluster::start(registry.clone(), 3).await;
    let scheduler = ClusterScheduler::new(SchedulerConfig {
        stagger_window: Duration::from_millis(300),
        ..Default::default()
    });
    let log = Arc::new(Mutex::new(Vec::new()));
    for node in &cluster.nodes {
        scheduler
            .register(Arc::new(Recording {
                inner: node.coordinator.clone(),
                log: log.clone(),
            }))
            .unwrap();
    }

    let jobs = (0..3).map(|i| cluster.job(i, "registry.local/app:v1")).collect();
    let status = scheduler.submit(jobs).unwrap().wait().await;
    assert_eq!(status.state, JobState::Ready);

    let log = log.lock();
    assert_eq!(log.len(), 3);
    let first = log[0].1;
    let last = log[2].1;
    assert!(last - first >= Duration::from_millis(150));

    cluster.stop().await;
}

#[tokio::test]
async fn test_failed_node_job_retried_until_ready() {
    let registry = Arc::new(MockRegistry::new());
    let layers = registry
        .add_image("registry.local/flaky:v1", &[b"flaky layer".as_slice()])
        .unwrap();
    // Enough faults to exhaust the node's own retries once.
    for _ in 0..3 {
        registry.inject_blob_fault(&layers[0].digest, Fault::Unavailable);
    }
    let cluster = Cluster::start(registry.clone(), 1).await;
    let scheduler = cluster.scheduler(fast_retries(3));

    let campaign = scheduler
        .submit(vec![cluster.job(0, "registry.local/flaky:v1")])
        .unwrap();
    let status = campaign.wait().await;

    assert_eq!(status.state, JobState::Ready);
    let node = &status.nodes[0];
    assert_eq!(node.attempts, 2);
    assert!(node.last_error.is_none());
    assert_eq!(registry.blob_fetch_count(&layers[0].digest), 4);

    cluster.stop().await;
}

#[tokio::test]
async fn test_exhausted_node_stays_in_aggregate() {
    let registry = Arc::new(MockRegistry::new());
    registry
        .add_image("registry.local/good:v1", &[b"good".as_slice()])
        .unwrap();
    let bad = registry
        .add_image("registry.local/bad:v1", &[b"bad".as_slice()])
        .unwrap();
    for _ in 0..6 {
        registry.inject_blob_fault(&bad[0].digest, Fault::Unavailable);
    }
    let cluster = Cluster::start(registry.clone(), 2).await;
    let scheduler = cluster.scheduler(fast_retries(2));

    let status = scheduler
        .submit(vec![
            cluster.job(0, "registry.local/good:v1"),
            cluster.job(1, "registry.local/bad:v1"),
        ])
        .unwrap()
        .wait()
        .await;

    assert_eq!(status.state, JobState::PartialFailure);
    assert_eq!(status.nodes.len(), 2);
    assert_eq!(status.nodes[0].state, JobState::Ready);

    let failed: Vec<_> = status.failed_nodes().collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].node, cluster.id(1));
    assert_eq!(failed[0].state, JobState::Failed);
    assert_eq!(failed[0].attempts, 2);
    assert!(failed[0].last_error.as_deref().unwrap().contains("1 layers failed"));

    cluster.stop().await;
}

#[tokio::test]
async fn test_permanent_failure_not_retried() {
    let registry = Arc::new(MockRegistry::new());
    let cluster = Cluster::start(registry.clone(), 1).await;
    let scheduler = cluster.scheduler(fast_retries(5));

    let status = scheduler
        .submit(vec![cluster.job(0, "registry.local/missing:v1")])
        .unwrap()
        .wait()
        .await;

    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.nodes[0].attempts, 1);
    let job = status.nodes[0].job.as_ref().unwrap();
    assert_eq!(job.failed_images.len(), 1);
    assert!(!job.failed_images[0].retryable);

    cluster.stop().await;
}

#[tokio::test]
async fn test_unreachable_node_retried() {
    let registry = Arc::new(MockRegistry::new());
    registry
        .add_image("registry.local/app:v1", &[b"layer".as_slice()])
        .unwrap();
    let cluster = Cluster::start(registry.clone(), 1).await;
    let scheduler = ClusterScheduler::new(fast_retries(3));
    scheduler
        .register(Arc::new(Flaky {
            inner: cluster.nodes[0].coordinator.clone(),
            outages: AtomicU32::new(1),
        }))
        .unwrap();

    let status = scheduler
        .submit(vec![cluster.job(0, "registry.local/app:v1")])
        .unwrap()
        .wait()
        .await;

    assert_eq!(status.state, JobState::Ready);
    assert_eq!(status.nodes[0].attempts, 2);

    cluster.stop().await;
}

#[tokio::test]
async fn test_cancel_stops_running_and_queued_jobs() {
    let registry = Arc::new(MockRegistry::new());
    let stuck = registry
        .add_image("registry.local/stuck:v1", &[b"never arrives".as_slice()])
        .unwrap();
    registry.inject_blob_fault(&stuck[0].digest, Fault::Stall);
    let cluster = Cluster::start(registry.clone(), 2).await;
    let scheduler = cluster.scheduler(SchedulerConfig {
        max_concurrent_jobs: 1,
        ..Default::default()
    });

    let campaign = scheduler
        .submit(vec![
            cluster.job(0, "registry.local/stuck:v1").with_priority(Priority::High),
            cluster.job(1, "registry.local/stuck:v1"),
        ])
        .unwrap();

    // Wait for the first node job to be running.
    let mut running = false;
    for _ in 0..200 {
        if campaign.status().nodes[0].state == JobState::InProgress {
            running = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(running);

    assert!(scheduler.cancel(campaign.campaign_id()).unwrap());
    let status = campaign.wait().await;

    assert!(status.cancelled);
    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.nodes[0].attempts, 1);
    assert_eq!(status.nodes[1].attempts, 0);
    assert_eq!(status.nodes[1].last_error.as_deref(), Some("campaign cancelled"));
    assert!(!scheduler.cancel(campaign.campaign_id()).unwrap());

    cluster.stop().await;
}

#[tokio::test]
async fn test_submit_validates_nodes() {
    let registry = Arc::new(MockRegistry::new());
    let cluster = Cluster::start(registry, 1).await;
    let scheduler = cluster.scheduler(SchedulerConfig::default());

    let stranger = NodeId::new();
    let err = scheduler
        .submit(vec![PullJob::new(stranger, Vec::new())])
        .unwrap_err();
    assert_eq!(err, SchedulerError::UnknownNode(stranger));

    let err = scheduler
        .register(Arc::new(cluster.nodes[0].coordinator.clone()))
        .unwrap_err();
    assert_eq!(err, SchedulerError::DuplicateNode(cluster.id(0)));

    assert!(scheduler.deregister(cluster.id(0)));
    assert!(scheduler.nodes().is_empty());

    cluster.stop().await;
}

#[tokio::test]
async fn test_waiting_campaign_keeps_its_place_for_a_slot() {
    let scheduler = ClusterScheduler::new(SchedulerConfig {
        max_concurrent_jobs: 1,
        ..Default::default()
    });
    let log = Arc::new(Mutex::new(Vec::new()));
    let nodes: Vec<NodeId> = (0..3).map(|_| NodeId::new()).collect();
    for (i, node) in nodes.iter().enumerate() {
        scheduler
            .register(Arc::new(Chatty {
                node: *node,
                busy: if i == 0 {
                    Duration::from_millis(200)
                } else {
                    Duration::ZERO
                },
                log: log.clone(),
            }))
            .unwrap();
    }

    // The first campaign's second job waits behind a node that keeps
    // reporting progress; a later campaign must not overtake it.
    let first = scheduler
        .submit(vec![
            PullJob::new(nodes[0], Vec::new()),
            PullJob::new(nodes[1], Vec::new()),
        ])
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = scheduler
        .submit(vec![PullJob::new(nodes[2], Vec::new())])
        .unwrap();

    assert_eq!(first.wait().await.state, JobState::Ready);
    assert_eq!(second.wait().await.state, JobState::Ready);

    let order: Vec<NodeId> = log.lock().iter().map(|(node, _)| *node).collect();
    assert_eq!(order, nodes);
}

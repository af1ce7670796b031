//! Node coordinator.
//!
//! Turns a desired image set into a [`PullJob`]: resolves manifests, takes
//! the union of their layers deduplicated by digest, and hands the layers
//! that are not already Ready to the fetcher pool. Job status is published
//! on a watch channel until the job is terminal; terminal statuses stay
//! queryable for a bounded history.

mod job;
mod runner;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use layercast_id::{JobId, NodeId};
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info};

use crate::actors::{Actor, ActorContext, ActorError, ActorHandle, Supervisor};
use crate::fetcher::{FetcherPool, Priority};
use crate::image::ImageReference;
use crate::metrics::PrefetchMetrics;
use crate::resolver::ManifestResolver;

pub use job::{ImageFailure, JobHandle, JobStatus, LayerFailure, LayerRequest, PullJob};

use runner::JobRunner;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Terminal jobs kept for status queries.
    pub job_history: usize,
    pub mailbox_size: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            job_history: 128,
            mailbox_size: 256,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    #[error("job {job} targets node {target}, not {node}")]
    WrongNode {
        job: JobId,
        target: NodeId,
        node: NodeId,
    },

    #[error("job {0} already submitted")]
    DuplicateJob(JobId),

    #[error("unknown job {0}")]
    UnknownJob(JobId),

    #[error("job {0} is still running")]
    StillRunning(JobId),

    #[error("job {0} has no failures to retry")]
    NothingToRetry(JobId),

    #[error("node coordinator is not running")]
    Stopped,
}

// =============================================================================
// Actor
// =============================================================================

#[derive(Debug)]
enum CoordinatorMessage {
    Submit {
        job: PullJob,
        reply: oneshot::Sender<Result<JobHandle, CoordinatorError>>,
    },
    Job {
        job_id: JobId,
        reply: oneshot::Sender<Option<JobHandle>>,
    },
    Cancel {
        job_id: JobId,
        reply: oneshot::Sender<Option<bool>>,
    },
    RetryFailed {
        job_id: JobId,
        reply: oneshot::Sender<Result<JobHandle, CoordinatorError>>,
    },
    List {
        reply: oneshot::Sender<Vec<JobStatus>>,
    },
    Finished {
        job_id: JobId,
    },
}

struct JobEntry {
    job: PullJob,
    handle: JobHandle,
}

struct CoordinatorActor {
    node: NodeId,
    resolver: Arc<ManifestResolver>,
    pool: FetcherPool,
    metrics: Arc<PrefetchMetrics>,
    config: CoordinatorConfig,
    me: ActorHandle<CoordinatorMessage>,
    jobs: HashMap<JobId, JobEntry>,
    /// Terminal jobs, oldest first.
    history: VecDeque<JobId>,
}

impl CoordinatorActor {
    fn submit(&mut self, job: PullJob) -> Result<JobHandle, CoordinatorError> {
        if job.node != self.node {
            return Err(CoordinatorError::WrongNode {
                job: job.id,
                target: job.node,
                node: self.node,
            });
        }
        if self.jobs.contains_key(&job.id) {
            return Err(CoordinatorError::DuplicateJob(job.id));
        }

        let (status_tx, status_rx) = watch::channel(JobStatus::new(&job));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let handle = JobHandle::new(job.id, status_rx, Arc::new(cancel_tx));

        let runner = JobRunner {
            job: job.clone(),
            resolver: self.resolver.clone(),
            pool: self.pool.clone(),
            metrics: self.metrics.clone(),
            status: status_tx,
            cancel: cancel_rx,
        };
        let me = self.me.clone();
        let job_id = job.id;
        tokio::spawn(async move {
            runner.run().await;
            let _ = me.send(CoordinatorMessage::Finished { job_id }).await;
        });

        info!(
            job_id = %job.id,
            images = job.images.len(),
            layers = job.layers.len(),
            priority = %job.priority,
            "Pull job submitted"
        );
        self.jobs.insert(
            job.id,
            JobEntry {
                job,
                handle: handle.clone(),
            },
        );
        Ok(handle)
    }

    fn retry_failed(&mut self, job_id: JobId) -> Result<JobHandle, CoordinatorError> {
        let entry = self
            .jobs
            .get(&job_id)
            .ok_or(CoordinatorError::UnknownJob(job_id))?;
        let status = entry.handle.status();
        if !status.is_terminal() {
            return Err(CoordinatorError::StillRunning(job_id));
        }
        if status.failed_layers.is_empty() && status.failed_images.is_empty() {
            return Err(CoordinatorError::NothingToRetry(job_id));
        }

        let images = status
            .failed_images
            .iter()
            .map(|f| f.reference.clone())
            .collect();
        let layers = status
            .failed_layers
            .iter()
            .map(|f| LayerRequest {
                source: f.source.clone(),
                layer: f.layer.clone(),
            })
            .collect();
        let retry = PullJob::new(self.node, images)
            .with_layers(layers)
            .with_priority(entry.job.priority);
        debug!(job_id = %job_id, retry_job_id = %retry.id, "Retrying failed subset");
        self.submit(retry)
    }

    fn finished(&mut self, job_id: JobId) {
        self.history.push_back(job_id);
        while self.history.len() > self.config.job_history {
            if let Some(old) = self.history.pop_front() {
                self.jobs.remove(&old);
            }
        }
    }
}

#[async_trait]
impl Actor for CoordinatorActor {
    type Message = CoordinatorMessage;

    fn name(&self) -> &str {
        "node_coordinator"
    }

    async fn handle(
        &mut self,
        msg: Self::Message,
        _ctx: &mut ActorContext,
    ) -> Result<bool, ActorError> {
        match msg {
            CoordinatorMessage::Submit { job, reply } => {
                let _ = reply.send(self.submit(job));
            }
            CoordinatorMessage::Job { job_id, reply } => {
                let _ = reply.send(self.jobs.get(&job_id).map(|e| e.handle.clone()));
            }
            CoordinatorMessage::Cancel { job_id, reply } => {
                let cancelled = self.jobs.get(&job_id).map(|entry| {
                    let running = !entry.handle.status().is_terminal();
                    if running {
                        entry.handle.cancel();
                    }
                    running
                });
                let _ = reply.send(cancelled);
            }
            CoordinatorMessage::RetryFailed { job_id, reply } => {
                let _ = reply.send(self.retry_failed(job_id));
            }
            CoordinatorMessage::List { reply } => {
                let mut statuses: Vec<JobStatus> =
                    self.jobs.values().map(|e| e.handle.status()).collect();
                statuses.sort_by_key(|s| s.started_at);
                let _ = reply.send(statuses);
            }
            CoordinatorMessage::Finished { job_id } => self.finished(job_id),
        }
        Ok(true)
    }

    async fn on_stop(&mut self, _ctx: &mut ActorContext) {
        for entry in self.jobs.values() {
            entry.handle.cancel();
        }
    }
}

// =============================================================================
// Public Handle
// =============================================================================

/// Per-node pull job coordinator.
#[derive(Clone)]
pub struct NodeCoordinator {
    node: NodeId,
    handle: ActorHandle<CoordinatorMessage>,
}

impl NodeCoordinator {
    pub fn spawn(
        supervisor: &mut Supervisor,
        node: NodeId,
        resolver: Arc<ManifestResolver>,
        pool: FetcherPool,
        metrics: Arc<PrefetchMetrics>,
        config: CoordinatorConfig,
    ) -> Self {
        let mailbox = config.mailbox_size.max(1);
        let handle = supervisor.spawn_with(mailbox, move |me| CoordinatorActor {
            node,
            resolver,
            pool,
            metrics,
            config,
            me,
            jobs: HashMap::new(),
            history: VecDeque::new(),
        });
        Self { node, handle }
    }

    pub fn node_id(&self) -> NodeId {
        self.node
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> CoordinatorMessage,
    ) -> Result<T, CoordinatorError> {
        let (reply, rx) = oneshot::channel();
        self.handle
            .send(build(reply))
            .await
            .map_err(|_| CoordinatorError::Stopped)?;
        rx.await.map_err(|_| CoordinatorError::Stopped)
    }

    /// Starts a job. The returned handle tracks it to completion.
    pub async fn submit(&self, job: PullJob) -> Result<JobHandle, CoordinatorError> {
        self.request(|reply| CoordinatorMessage::Submit { job, reply })
            .await?
    }

    /// Makes `images` resident on this node at normal priority.
    pub async fn reconcile(
        &self,
        images: Vec<ImageReference>,
    ) -> Result<JobHandle, CoordinatorError> {
        self.reconcile_with_priority(images, Priority::Normal).await
    }

    pub async fn reconcile_with_priority(
        &self,
        images: Vec<ImageReference>,
        priority: Priority,
    ) -> Result<JobHandle, CoordinatorError> {
        self.submit(PullJob::new(self.node, images).with_priority(priority))
            .await
    }

    pub async fn job(&self, job_id: JobId) -> Result<JobHandle, CoordinatorError> {
        self.request(|reply| CoordinatorMessage::Job { job_id, reply })
            .await?
            .ok_or(CoordinatorError::UnknownJob(job_id))
    }

    pub async fn status(&self, job_id: JobId) -> Result<JobStatus, CoordinatorError> {
        Ok(self.job(job_id).await?.status())
    }

    /// Cancels a running job. Returns false if it had already finished.
    pub async fn cancel(&self, job_id: JobId) -> Result<bool, CoordinatorError> {
        self.request(|reply| CoordinatorMessage::Cancel { job_id, reply })
            .await?
            .ok_or(CoordinatorError::UnknownJob(job_id))
    }

    /// Submits a new job covering only what failed in `job_id`: the images
    /// that did not resolve and the layers that did not download. Layers
    /// that are already Ready are not fetched again.
    pub async fn retry_failed(&self, job_id: JobId) -> Result<JobHandle, CoordinatorError> {
        self.request(|reply| CoordinatorMessage::RetryFailed { job_id, reply })
            .await?
    }

    /// Statuses of running and recently finished jobs, oldest first.
    pub async fn jobs(&self) -> Result<Vec<JobStatus>, CoordinatorError> {
        self.request(|reply| CoordinatorMessage::List { reply }).await
    }
}

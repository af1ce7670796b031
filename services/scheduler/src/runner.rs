//! Drives one campaign to completion.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};
use futures_util::stream::{FuturesUnordered, StreamExt};
use layercast_id::CampaignId;
use layercast_node_agent::fetcher::Priority;
use layercast_node_agent::{JobHandle, JobStatus, PullJob};
use layercast_reconcile::JobState;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::campaign::CampaignStatus;
use crate::endpoint::{EndpointError, NodeEndpoint};
use crate::scheduler::SchedulerConfig;

const CANCELLED: &str = "campaign cancelled";

/// A node job waiting for a dispatch slot.
#[derive(Debug, PartialEq, Eq)]
struct Pending {
    not_before: Instant,
    priority: Priority,
    index: usize,
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: earliest start, then highest priority, then submission order.
        other
            .not_before
            .cmp(&self.not_before)
            .then(self.priority.cmp(&other.priority))
            .then(other.index.cmp(&self.index))
    }
}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

enum NodeEvent {
    Started { index: usize, handle: JobHandle },
    Progress { index: usize, status: JobStatus },
}

type AttemptResult = (usize, Result<JobStatus, EndpointError>);

/// A claim on a cluster slot for whatever heads the queue once `at` passes.
///
/// Lives across loop iterations so the campaign keeps its place in the
/// semaphore's wait queue while events are being handled.
struct Acquire {
    at: Instant,
    permit: BoxFuture<'static, OwnedSemaphorePermit>,
}

impl Acquire {
    fn new(permits: &Arc<Semaphore>, at: Instant) -> Self {
        Self {
            at,
            permit: acquire_at(permits.clone(), at).boxed(),
        }
    }
}

pub(crate) struct CampaignRunner {
    pub id: CampaignId,
    pub config: SchedulerConfig,
    pub permits: Arc<Semaphore>,
    pub assignments: Vec<(Arc<dyn NodeEndpoint>, PullJob)>,
    pub status: watch::Sender<CampaignStatus>,
    pub cancel: watch::Receiver<bool>,
}

impl CampaignRunner {
    #[instrument(skip_all, fields(campaign_id = %self.id, jobs = self.assignments.len()))]
    pub async fn run(self) {
        let mut queue = self.initial_queue(Instant::now());
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let mut running = FuturesUnordered::new();
        let mut handles: HashMap<usize, JobHandle> = HashMap::new();
        let mut cancel = self.cancel.clone();
        let mut was_cancelled = false;
        let mut acquiring: Option<Acquire> = None;

        info!("Campaign started");

        while !queue.is_empty() || !running.is_empty() {
            let next = queue.peek().map(|p: &Pending| p.not_before);
            let armed_for = acquiring.as_ref().map(|a| a.at);
            match (next, armed_for) {
                (None, _) => acquiring = None,
                (Some(at), None) => acquiring = Some(Acquire::new(&self.permits, at)),
                // An earlier head replaces a claim that is still sleeping.
                (Some(at), Some(armed)) if at < armed && Instant::now() < armed => {
                    acquiring = Some(Acquire::new(&self.permits, at));
                }
                _ => {}
            }

            tokio::select! {
                biased;

                _ = cancelled(&mut cancel), if !was_cancelled => {
                    was_cancelled = true;
                    info!(running = handles.len(), queued = queue.len(), "Cancelling campaign");
                    for handle in handles.values() {
                        handle.cancel();
                    }
                    acquiring = None;
                    let abandoned: Vec<usize> = queue.drain().map(|p| p.index).collect();
                    self.status.send_modify(|status| {
                        status.cancelled = true;
                        for index in abandoned {
                            let node = &mut status.nodes[index];
                            node.state = JobState::Failed;
                            node.last_error = Some(CANCELLED.to_string());
                        }
                        status.refresh();
                    });
                }

                Some(event) = events.recv() => match event {
                    NodeEvent::Started { index, handle } => {
                        if was_cancelled {
                            handle.cancel();
                        }
                        let status = handle.status();
                        handles.insert(index, handle);
                        self.record_progress(index, status);
                    }
                    NodeEvent::Progress { index, status } => self.record_progress(index, status),
                },

                Some((index, result)) = running.next(), if !running.is_empty() => {
                    handles.remove(&index);
                    if let Some(retry) = self.finish_attempt(index, result, was_cancelled) {
                        queue.push(retry);
                    }
                }

                permit = async {
                    match acquiring.as_mut() {
                        Some(claim) => claim.permit.as_mut().await,
                        None => std::future::pending().await,
                    }
                }, if acquiring.is_some() => {
                    acquiring = None;
                    let Some(pending) = queue.pop() else { continue };
                    let (endpoint, job) = self.dispatch(pending.index);
                    running.push(attempt(pending.index, endpoint, job, permit, events_tx.clone()));
                }
            }
        }

        let status = self.status.borrow().clone();
        info!(
            state = %status.state,
            ready = status.count(JobState::Ready),
            partial = status.count(JobState::PartialFailure),
            failed = status.count(JobState::Failed),
            cancelled = status.cancelled,
            "Campaign finished"
        );
    }

    /// First attempts in priority order, spread across the stagger window.
    fn initial_queue(&self, start: Instant) -> BinaryHeap<Pending> {
        let mut order: Vec<usize> = (0..self.assignments.len()).collect();
        order.sort_by_key(|&i| std::cmp::Reverse(self.assignments[i].1.priority));

        let total = order.len();
        order
            .into_iter()
            .enumerate()
            .map(|(rank, index)| Pending {
                not_before: start + stagger_offset(self.config.stagger_window, rank, total),
                priority: self.assignments[index].1.priority,
                index,
            })
            .collect()
    }

    /// Marks a dispatch and returns the job to run. Attempts after the first
    /// run the same work order under a fresh job id.
    fn dispatch(&self, index: usize) -> (Arc<dyn NodeEndpoint>, PullJob) {
        let (endpoint, original) = &self.assignments[index];
        let mut attempt = 0;
        self.status.send_modify(|status| {
            let node = &mut status.nodes[index];
            node.attempts += 1;
            attempt = node.attempts;
            status.refresh();
        });

        let job = if attempt == 1 {
            original.clone()
        } else {
            original.rerun()
        };
        debug!(node_id = %job.node, job_id = %job.id, attempt, "Dispatching node job");
        (endpoint.clone(), job)
    }

    fn record_progress(&self, index: usize, job: JobStatus) {
        self.status.send_modify(|status| {
            let node = &mut status.nodes[index];
            if !job.is_terminal() {
                node.state = job.state;
            }
            node.job = Some(job);
            status.refresh();
        });
    }

    /// Settles a finished attempt. Returns the retry to queue, if any.
    fn finish_attempt(
        &self,
        index: usize,
        result: Result<JobStatus, EndpointError>,
        was_cancelled: bool,
    ) -> Option<Pending> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut retry = None;

        self.status.send_modify(|status| {
            let node = &mut status.nodes[index];
            let (final_state, retryable, error) = match result {
                Ok(job) => {
                    let state = job.state;
                    let retryable = job.has_retryable_failures();
                    let error = (state != JobState::Ready).then(|| summarize(&job));
                    node.job = Some(job);
                    (state, retryable, error)
                }
                Err(e) => (JobState::Failed, e.is_retryable(), Some(e.to_string())),
            };

            node.last_error = error;
            if final_state == JobState::Ready {
                node.state = JobState::Ready;
                info!(node_id = %node.node, attempts = node.attempts, "Node job ready");
            } else if retryable && !was_cancelled && node.attempts < max_attempts {
                node.state = JobState::Queued;
                warn!(
                    node_id = %node.node,
                    attempt = node.attempts,
                    max_attempts,
                    error = node.last_error.as_deref().unwrap_or_default(),
                    "Node job failed, retrying"
                );
                retry = Some(Pending {
                    not_before: Instant::now() + self.config.retry_delay,
                    priority: node.priority,
                    index,
                });
            } else {
                node.state = final_state;
                warn!(
                    node_id = %node.node,
                    state = %final_state,
                    attempts = node.attempts,
                    error = node.last_error.as_deref().unwrap_or_default(),
                    "Node job failed"
                );
            }
            status.refresh();
        });

        retry
    }
}

/// Runs one attempt on a node, holding a cluster slot until it ends.
async fn attempt(
    index: usize,
    endpoint: Arc<dyn NodeEndpoint>,
    job: PullJob,
    permit: OwnedSemaphorePermit,
    events: mpsc::UnboundedSender<NodeEvent>,
) -> AttemptResult {
    let _permit = permit;
    let handle = match endpoint.submit(job).await {
        Ok(handle) => handle,
        Err(e) => return (index, Err(e)),
    };
    let _ = events.send(NodeEvent::Started {
        index,
        handle: handle.clone(),
    });

    let mut updates = handle.updates();
    while let Some(status) = updates.next().await {
        if status.is_terminal() {
            return (index, Ok(status));
        }
        let _ = events.send(NodeEvent::Progress { index, status });
    }
    (index, Ok(handle.wait().await))
}

/// Waits for `not_before`, then for a free cluster slot.
async fn acquire_at(permits: Arc<Semaphore>, not_before: Instant) -> OwnedSemaphorePermit {
    tokio::time::sleep_until(not_before).await;
    match permits.acquire_owned().await {
        Ok(permit) => permit,
        // The semaphore is never closed.
        Err(_) => std::future::pending().await,
    }
}

fn stagger_offset(window: Duration, rank: usize, total: usize) -> Duration {
    if total <= 1 || window.is_zero() {
        return Duration::ZERO;
    }
    window.mul_f64(rank as f64 / total as f64)
}

fn summarize(job: &JobStatus) -> String {
    match (job.failed_layers.first(), job.failed_images.first()) {
        (_, Some(image)) => format!(
            "{} images and {} layers failed; {}: {}",
            job.failed_images.len(),
            job.failed_layers.len(),
            image.reference,
            image.error
        ),
        (Some(layer), None) => format!(
            "{} layers failed; {}: {}",
            job.failed_layers.len(),
            layer.layer.digest,
            layer.error
        ),
        (None, None) => format!("job ended {}", job.state),
    }
}

/// Resolves once cancellation is requested. Never resolves if the sender is
/// gone without having asked.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}

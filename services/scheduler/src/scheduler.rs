//! Cluster prefetch scheduler.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use layercast_id::{CampaignId, NodeId};
use layercast_node_agent::PullJob;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tracing::{info, instrument};

use crate::campaign::{CampaignHandle, CampaignStatus};
use crate::endpoint::NodeEndpoint;
use crate::runner::CampaignRunner;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Node jobs allowed to run at once across all campaigns. Independent of
    /// each node's own download concurrency.
    pub max_concurrent_jobs: usize,

    /// First attempts are spread evenly across this window. Zero starts
    /// them as soon as slots allow.
    pub stagger_window: Duration,

    /// Attempts per node job before it is reported failed.
    pub max_attempts: u32,

    /// Delay before a failed node job is dispatched again.
    pub retry_delay: Duration,

    /// Finished campaigns kept for status queries.
    pub campaign_history: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 16,
            stagger_window: Duration::ZERO,
            max_attempts: 3,
            retry_delay: Duration::from_secs(5),
            campaign_history: 64,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("node {0} is already registered")]
    DuplicateNode(NodeId),

    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    #[error("campaign has no jobs")]
    EmptyCampaign,

    #[error("unknown campaign {0}")]
    UnknownCampaign(CampaignId),
}

#[derive(Default)]
struct Campaigns {
    by_id: HashMap<CampaignId, CampaignHandle>,
    /// Submission order, oldest first.
    order: VecDeque<CampaignId>,
}

impl Campaigns {
    fn insert(&mut self, handle: CampaignHandle, history: usize) {
        self.order.push_back(handle.campaign_id());
        self.by_id.insert(handle.campaign_id(), handle);

        // Forget the oldest finished campaigns beyond the history limit.
        let mut excess = self.order.len().saturating_sub(history);
        let by_id = &mut self.by_id;
        self.order.retain(|id| {
            if excess == 0 {
                return true;
            }
            let finished = by_id.get(id).is_none_or(|h| h.status().is_terminal());
            if finished {
                by_id.remove(id);
                excess -= 1;
            }
            !finished
        });
    }
}

struct Inner {
    config: SchedulerConfig,
    permits: Arc<Semaphore>,
    nodes: RwLock<HashMap<NodeId, Arc<dyn NodeEndpoint>>>,
    campaigns: Mutex<Campaigns>,
}

/// Assigns pull campaigns to nodes under a cluster-wide concurrency ceiling.
#[derive(Clone)]
pub struct ClusterScheduler {
    inner: Arc<Inner>,
}

impl ClusterScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1)));
        Self {
            inner: Arc::new(Inner {
                config,
                permits,
                nodes: RwLock::new(HashMap::new()),
                campaigns: Mutex::new(Campaigns::default()),
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Makes a node available to campaigns.
    pub fn register(&self, endpoint: Arc<dyn NodeEndpoint>) -> Result<(), SchedulerError> {
        let node = endpoint.node_id();
        let mut nodes = self.inner.nodes.write();
        if nodes.contains_key(&node) {
            return Err(SchedulerError::DuplicateNode(node));
        }
        nodes.insert(node, endpoint);
        info!(node_id = %node, "Node registered");
        Ok(())
    }

    /// Removes a node. Campaigns already running keep using it.
    pub fn deregister(&self, node: NodeId) -> bool {
        self.inner.nodes.write().remove(&node).is_some()
    }

    pub fn nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.inner.nodes.read().keys().copied().collect();
        nodes.sort();
        nodes
    }

    /// Starts a campaign. Every job must target a registered node.
    #[instrument(skip(self, jobs), fields(jobs = jobs.len()))]
    pub fn submit(&self, jobs: Vec<PullJob>) -> Result<CampaignHandle, SchedulerError> {
        if jobs.is_empty() {
            return Err(SchedulerError::EmptyCampaign);
        }

        let assignments = {
            let nodes = self.inner.nodes.read();
            jobs.iter()
                .map(|job| {
                    nodes
                        .get(&job.node)
                        .cloned()
                        .map(|endpoint| (endpoint, job.clone()))
                        .ok_or(SchedulerError::UnknownNode(job.node))
                })
                .collect::<Result<Vec<_>, _>>()?
        };

        let id = CampaignId::new();
        let (status_tx, status_rx) = watch::channel(CampaignStatus::new(id, &jobs));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let handle = CampaignHandle::new(id, status_rx, Arc::new(cancel_tx));

        let runner = CampaignRunner {
            id,
            config: self.inner.config.clone(),
            permits: self.inner.permits.clone(),
            assignments,
            status: status_tx,
            cancel: cancel_rx,
        };
        tokio::spawn(runner.run());

        self.inner
            .campaigns
            .lock()
            .insert(handle.clone(), self.inner.config.campaign_history);
        info!(campaign_id = %id, "Campaign submitted");
        Ok(handle)
    }

    pub fn campaign(&self, id: CampaignId) -> Result<CampaignHandle, SchedulerError> {
        self.inner
            .campaigns
            .lock()
            .by_id
            .get(&id)
            .cloned()
            .ok_or(SchedulerError::UnknownCampaign(id))
    }

    /// Current aggregate of a campaign.
    pub fn status(&self, id: CampaignId) -> Result<CampaignStatus, SchedulerError> {
        Ok(self.campaign(id)?.status())
    }

    /// Cancels a campaign. Returns false if it had already finished.
    pub fn cancel(&self, id: CampaignId) -> Result<bool, SchedulerError> {
        let handle = self.campaign(id)?;
        if handle.status().is_terminal() {
            return Ok(false);
        }
        handle.cancel();
        Ok(true)
    }

    /// Statuses of known campaigns, oldest first.
    pub fn campaigns(&self) -> Vec<CampaignStatus> {
        let campaigns = self.inner.campaigns.lock();
        campaigns
            .order
            .iter()
            .filter_map(|id| campaigns.by_id.get(id))
            .map(CampaignHandle::status)
            .collect()
    }

    /// Cluster slots not currently held by a running node job.
    pub fn available_slots(&self) -> usize {
        self.inner.permits.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use layercast_reconcile::JobState;

    fn finished_handle(jobs: &[PullJob]) -> CampaignHandle {
        let id = CampaignId::new();
        let mut status = CampaignStatus::new(id, jobs);
        for node in &mut status.nodes {
            node.state = JobState::Ready;
        }
        status.refresh();
        let (_tx, rx) = watch::channel(status);
        let (cancel, _) = watch::channel(false);
        CampaignHandle::new(id, rx, Arc::new(cancel))
    }

    fn running_handle(jobs: &[PullJob]) -> CampaignHandle {
        let id = CampaignId::new();
        let (_tx, rx) = watch::channel(CampaignStatus::new(id, jobs));
        let (cancel, _) = watch::channel(false);
        CampaignHandle::new(id, rx, Arc::new(cancel))
    }

    #[test]
    fn test_history_drops_oldest_finished() {
        let jobs = vec![PullJob::new(NodeId::new(), Vec::new())];
        let mut campaigns = Campaigns::default();

        let running = running_handle(&jobs);
        let old = finished_handle(&jobs);
        let recent = finished_handle(&jobs);
        campaigns.insert(running.clone(), 2);
        campaigns.insert(old.clone(), 2);
        campaigns.insert(recent.clone(), 2);

        assert!(campaigns.by_id.contains_key(&running.campaign_id()));
        assert!(!campaigns.by_id.contains_key(&old.campaign_id()));
        assert!(campaigns.by_id.contains_key(&recent.campaign_id()));
        assert_eq!(
            campaigns.order,
            VecDeque::from([running.campaign_id(), recent.campaign_id()])
        );
    }

    #[test]
    fn test_empty_campaign_rejected() {
        let scheduler = ClusterScheduler::new(SchedulerConfig::default());
        assert_eq!(
            scheduler.submit(Vec::new()).unwrap_err(),
            SchedulerError::EmptyCampaign
        );
    }
}

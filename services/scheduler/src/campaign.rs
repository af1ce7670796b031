//! Campaign status and handles.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use layercast_id::{CampaignId, JobId, NodeId};
use layercast_node_agent::fetcher::Priority;
use layercast_node_agent::{JobStatus, PullJob};
use layercast_reconcile::{aggregate, JobState};
use serde::Serialize;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

/// One node job within a campaign.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeJobStatus {
    pub node: NodeId,
    pub priority: Priority,
    /// Campaign-level state of this node's work. A failed attempt that will
    /// be retried shows as `Queued`, not failed.
    pub state: JobState,
    /// Attempts dispatched so far.
    pub attempts: u32,
    /// Latest status reported for the current attempt.
    pub job: Option<JobStatus>,
    /// Why the last attempt did not succeed.
    pub last_error: Option<String>,
}

impl NodeJobStatus {
    pub(crate) fn new(job: &PullJob) -> Self {
        Self {
            node: job.node,
            priority: job.priority,
            state: JobState::Queued,
            attempts: 0,
            job: None,
            last_error: None,
        }
    }

    /// Id of the node job for the current attempt.
    pub fn job_id(&self) -> Option<JobId> {
        self.job.as_ref().map(|j| j.job_id)
    }
}

/// Aggregate view of a campaign.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CampaignStatus {
    pub campaign_id: CampaignId,
    /// Worst-case aggregate of the node states.
    pub state: JobState,
    /// One entry per submitted job, in submission order.
    pub nodes: Vec<NodeJobStatus>,
    pub cancelled: bool,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl CampaignStatus {
    pub(crate) fn new(campaign_id: CampaignId, jobs: &[PullJob]) -> Self {
        let mut status = Self {
            campaign_id,
            state: JobState::Queued,
            nodes: jobs.iter().map(NodeJobStatus::new).collect(),
            cancelled: false,
            submitted_at: Utc::now(),
            finished_at: None,
        };
        status.refresh();
        status
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Number of node jobs in `state`.
    pub fn count(&self, state: JobState) -> usize {
        self.nodes.iter().filter(|n| n.state == state).count()
    }

    /// Node jobs that ended with failures.
    pub fn failed_nodes(&self) -> impl Iterator<Item = &NodeJobStatus> {
        self.nodes.iter().filter(|n| n.state.has_failures())
    }

    pub(crate) fn refresh(&mut self) {
        self.state = aggregate(self.nodes.iter().map(|n| n.state));
        if self.state.is_terminal() && self.finished_at.is_none() {
            self.finished_at = Some(Utc::now());
        }
    }
}

/// Handle to a submitted campaign.
///
/// Dropping the handle does not cancel the campaign.
#[derive(Debug, Clone)]
pub struct CampaignHandle {
    campaign_id: CampaignId,
    status: watch::Receiver<CampaignStatus>,
    cancel: Arc<watch::Sender<bool>>,
}

impl CampaignHandle {
    pub(crate) fn new(
        campaign_id: CampaignId,
        status: watch::Receiver<CampaignStatus>,
        cancel: Arc<watch::Sender<bool>>,
    ) -> Self {
        Self {
            campaign_id,
            status,
            cancel,
        }
    }

    pub fn campaign_id(&self) -> CampaignId {
        self.campaign_id
    }

    /// Latest aggregate.
    pub fn status(&self) -> CampaignStatus {
        self.status.borrow().clone()
    }

    /// Stream of aggregate updates, starting with the current one.
    pub fn updates(&self) -> WatchStream<CampaignStatus> {
        WatchStream::new(self.status.clone())
    }

    /// Waits until every node job has reached a final state.
    pub async fn wait(&self) -> CampaignStatus {
        let mut rx = self.status.clone();
        if let Ok(status) = rx.wait_for(CampaignStatus::is_terminal).await {
            return status.clone();
        }
        let last = rx.borrow().clone();
        last
    }

    /// Stops dispatching and cancels the node jobs still running. Node jobs
    /// not yet started are reported failed.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }
}

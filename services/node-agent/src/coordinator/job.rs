//! Pull jobs and their observable status.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use layercast_id::{JobId, NodeId};
use layercast_reconcile::{JobState, LayerProgress};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use crate::fetcher::Priority;
use crate::image::{Digest, ImageReference, LayerDescriptor};

/// A layer requested on its own, outside any manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerRequest {
    /// Image the layer belongs to; selects the repository.
    pub source: ImageReference,
    pub layer: LayerDescriptor,
}

/// Work order for one node: make these images' layers resident.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullJob {
    pub id: JobId,
    pub node: NodeId,
    pub images: Vec<ImageReference>,
    /// Extra layers to fetch directly. Used when retrying a failed subset.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub layers: Vec<LayerRequest>,
    #[serde(default)]
    pub priority: Priority,
}

impl PullJob {
    pub fn new(node: NodeId, images: Vec<ImageReference>) -> Self {
        Self {
            id: JobId::new(),
            node,
            images,
            layers: Vec::new(),
            priority: Priority::Normal,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_layers(mut self, layers: Vec<LayerRequest>) -> Self {
        self.layers = layers;
        self
    }

    /// The same work order under a fresh id, for running it again.
    pub fn rerun(&self) -> Self {
        Self {
            id: JobId::new(),
            ..self.clone()
        }
    }
}

/// A layer that reached Failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerFailure {
    pub source: ImageReference,
    pub layer: LayerDescriptor,
    pub error: String,
    /// Whether asking again later may succeed.
    pub retryable: bool,
}

/// An image whose manifest could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageFailure {
    pub reference: ImageReference,
    pub error: String,
    pub retryable: bool,
}

/// Snapshot of a job's progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: JobId,
    pub node: NodeId,
    pub state: JobState,
    pub progress: LayerProgress,
    /// Layers satisfied from the cache without a download.
    pub cache_hits: u32,
    /// Failed attempts that were retried.
    pub retries: u32,
    pub failed_layers: Vec<LayerFailure>,
    pub failed_images: Vec<ImageFailure>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobStatus {
    pub fn new(job: &PullJob) -> Self {
        Self {
            job_id: job.id,
            node: job.node,
            state: JobState::Queued,
            progress: LayerProgress::default(),
            cache_hits: 0,
            retries: 0,
            failed_layers: Vec::new(),
            failed_images: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Returns true if some failure may clear up on a later attempt.
    pub fn has_retryable_failures(&self) -> bool {
        self.failed_layers.iter().any(|f| f.retryable)
            || self.failed_images.iter().any(|f| f.retryable)
    }

    /// Digests that failed.
    pub fn failed_digests(&self) -> impl Iterator<Item = &Digest> {
        self.failed_layers.iter().map(|f| &f.layer.digest)
    }

    /// Recomputes `state` from the counts and failed images.
    pub(crate) fn refresh(&mut self) {
        self.state = self.progress.state(self.failed_images.len() as u32);
        if self.state.is_terminal() && self.finished_at.is_none() {
            self.finished_at = Some(Utc::now());
        }
    }
}

/// Handle to a submitted job.
///
/// Dropping the handle does not cancel the job.
#[derive(Debug, Clone)]
pub struct JobHandle {
    job_id: JobId,
    status: watch::Receiver<JobStatus>,
    cancel: Arc<watch::Sender<bool>>,
}

impl JobHandle {
    /// Wraps a status channel. Endpoints that relay a remote node's status
    /// build handles this way.
    pub fn new(
        job_id: JobId,
        status: watch::Receiver<JobStatus>,
        cancel: Arc<watch::Sender<bool>>,
    ) -> Self {
        Self {
            job_id,
            status,
            cancel,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Latest published status.
    pub fn status(&self) -> JobStatus {
        self.status.borrow().clone()
    }

    /// Stream of status updates, starting with the current one.
    pub fn updates(&self) -> WatchStream<JobStatus> {
        WatchStream::new(self.status.clone())
    }

    /// Waits for the terminal status.
    pub async fn wait(&self) -> JobStatus {
        let mut rx = self.status.clone();
        if let Ok(status) = rx.wait_for(JobStatus::is_terminal).await {
            return status.clone();
        }
        // The runner is gone; report the last thing it said.
        let last = rx.borrow().clone();
        last
    }

    /// Asks the job to stop. Outstanding layers end up failed; downloads
    /// shared with other jobs keep running.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }
}

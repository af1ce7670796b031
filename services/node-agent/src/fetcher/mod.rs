//! Layer fetcher pool.
//!
//! Downloads missing layers into the cache with bounded concurrency.
//!
//! - at most one download per digest: concurrent requests for the same
//!   digest attach to the running task
//! - excess work queues by priority, then arrival order
//! - streams resume from the last confirmed byte after transient failures
//! - a digest mismatch discards everything and restarts from byte 0
//! - attempts are bounded, and so is the total time per task
//! - admission waits (boundedly) for eviction when the cache is full

mod backoff;
mod download;
mod pool;
mod task;

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::actors::ActorHandle;
use crate::cache::CacheHandle;
use crate::image::{Digest, ImageReference, LayerDescriptor};

pub use backoff::BackoffPolicy;
pub use pool::{FetcherPool, PoolStats};
pub use task::{DownloadTask, InvalidTransition, Priority, TaskState};

use pool::PoolMessage;

/// Fetcher pool configuration.
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Maximum simultaneous downloads.
    pub concurrency: usize,
    /// Attempts per task before it fails.
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    /// Bound on a single network call: the blob request, or the wait for
    /// the next chunk of its body.
    pub attempt_timeout: Duration,
    /// Bound on a task from its first attempt to its outcome, retries
    /// included.
    pub task_timeout: Duration,
    /// How long admission waits for cache space before giving up.
    pub admission_wait: Duration,
    pub mailbox_size: usize,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_attempts: 5,
            backoff: BackoffPolicy::default(),
            attempt_timeout: Duration::from_secs(300),
            task_timeout: Duration::from_secs(1800),
            admission_wait: Duration::from_secs(60),
            mailbox_size: 1024,
        }
    }
}

/// Terminal failure of a fetch.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("blob {0} not found in registry")]
    NotFound(Digest),

    #[error("registry rejected credentials: {0}")]
    AuthFailure(String),

    /// The registry refused the request for a reason retrying cannot fix.
    #[error("registry rejected blob request: {0}")]
    Rejected(String),

    #[error("giving up on {digest} after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        digest: Digest,
        attempts: u32,
        last_error: String,
    },

    #[error("insufficient cache space for {digest}: {required} bytes needed, budget is {budget}")]
    InsufficientCacheSpace {
        digest: Digest,
        required: u64,
        budget: u64,
    },

    #[error("fetch of {0} timed out")]
    Timeout(Digest),

    #[error("fetch of {0} was cancelled")]
    Cancelled(Digest),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("fetcher pool is not running")]
    PoolStopped,
}

impl FetchError {
    /// Returns true if asking again later may succeed without outside
    /// intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::RetriesExhausted { .. }
                | FetchError::InsufficientCacheSpace { .. }
                | FetchError::Timeout(_)
        )
    }
}

/// How a fetch was satisfied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchSource {
    /// Already Ready in the cache; no network I/O.
    CacheHit,
    /// Downloaded by this request.
    Downloaded {
        attempts: u32,
        bytes_transferred: u64,
        duration: Duration,
    },
    /// Attached to a download another request started.
    Joined,
}

/// Successful fetch. The handle pins the blob until dropped.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub handle: CacheHandle,
    pub source: FetchSource,
}

impl FetchOutcome {
    pub fn digest(&self) -> &Digest {
        self.handle.digest()
    }

    pub fn size(&self) -> u64 {
        self.handle.size()
    }
}

/// Progress notifications for a fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchEvent {
    /// A worker picked the task up.
    Started { digest: Digest },
    /// An attempt failed and another will follow after a backoff.
    Retrying {
        digest: Digest,
        attempt: u32,
        error: String,
    },
}

/// A layer to fetch.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// Image the layer belongs to; selects the repository to fetch from.
    pub source: ImageReference,
    pub layer: LayerDescriptor,
    pub priority: Priority,
    pub events: Option<mpsc::UnboundedSender<FetchEvent>>,
}

impl FetchRequest {
    pub fn new(source: ImageReference, layer: LayerDescriptor) -> Self {
        Self {
            source,
            layer,
            priority: Priority::Normal,
            events: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<FetchEvent>) -> Self {
        self.events = Some(events);
        self
    }
}

type FetchResult = Result<FetchOutcome, FetchError>;

/// Future of a scheduled fetch.
///
/// Dropping the handle before it resolves withdraws interest. When the last
/// interested handle for a digest goes away, the download is cancelled.
pub struct FetchHandle {
    digest: Digest,
    state: HandleState,
}

enum HandleState {
    Resolved(Option<FetchResult>),
    Waiting {
        rx: oneshot::Receiver<FetchResult>,
        pool: ActorHandle<PoolMessage>,
        waiter: u64,
    },
    Done,
}

impl FetchHandle {
    pub(crate) fn resolved(digest: Digest, result: FetchResult) -> Self {
        Self {
            digest,
            state: HandleState::Resolved(Some(result)),
        }
    }

    pub(crate) fn waiting(
        digest: Digest,
        rx: oneshot::Receiver<FetchResult>,
        pool: ActorHandle<PoolMessage>,
        waiter: u64,
    ) -> Self {
        Self {
            digest,
            state: HandleState::Waiting { rx, pool, waiter },
        }
    }

    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    /// Returns true if the result was available without queueing.
    pub fn is_immediate(&self) -> bool {
        matches!(self.state, HandleState::Resolved(_))
    }
}

impl Future for FetchHandle {
    type Output = FetchResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let result = match &mut this.state {
            HandleState::Resolved(result) => result.take().unwrap_or(Err(FetchError::PoolStopped)),
            HandleState::Waiting { rx, .. } => match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(result)) => result,
                Poll::Ready(Err(_)) => Err(FetchError::PoolStopped),
                Poll::Pending => return Poll::Pending,
            },
            HandleState::Done => Err(FetchError::PoolStopped),
        };
        this.state = HandleState::Done;
        Poll::Ready(result)
    }
}

impl Drop for FetchHandle {
    fn drop(&mut self) {
        if let HandleState::Waiting { pool, waiter, .. } = &self.state {
            pool.send_detached(PoolMessage::Detach {
                digest: self.digest.clone(),
                waiter: *waiter,
            });
        }
    }
}

impl std::fmt::Debug for FetchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchHandle")
            .field("digest", &self.digest)
            .field("immediate", &self.is_immediate())
            .finish()
    }
}

//! Fetcher pool actor.
//!
//! The actor owns every in-flight [`DownloadTask`]. Requests for a digest
//! that already has a task attach to it as extra waiters; a worker is only
//! ever started for the first request. Workers run as plain tasks and report
//! back to the actor's own mailbox.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, instrument};

use super::download::Download;
use super::task::{DownloadTask, Priority};
use super::{
    FetchError, FetchEvent, FetchHandle, FetchOutcome, FetchRequest, FetchResult, FetchSource,
    FetcherConfig,
};
use crate::actors::{Actor, ActorContext, ActorError, ActorHandle, Supervisor};
use crate::cache::CacheStore;
use crate::image::{Digest, ImageReference, LayerDescriptor};
use crate::metrics::PrefetchMetrics;
use crate::registry::SharedRegistry;

// =============================================================================
// Messages
// =============================================================================

#[derive(Debug)]
pub(crate) enum PoolMessage {
    /// Fetch a layer; the result goes to `reply`.
    Schedule {
        waiter: u64,
        request: FetchRequest,
        reply: oneshot::Sender<FetchResult>,
    },

    /// A waiter lost interest.
    Detach { digest: Digest, waiter: u64 },

    /// Forwarded to the task's waiters.
    Retrying(FetchEvent),

    /// A worker reached a terminal result.
    Finished {
        digest: Digest,
        epoch: u64,
        result: FetchResult,
    },

    Stats { reply: oneshot::Sender<PoolStats> },
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Tasks waiting for a worker.
    pub queued: usize,
    /// Tasks a worker is driving.
    pub running: usize,
    /// Distinct digests with a task.
    pub in_flight: usize,
    /// Requests waiting on those tasks.
    pub waiters: usize,
}

// =============================================================================
// Actor State
// =============================================================================

/// Queue entry. Entries go stale when their task starts, is requeued or is
/// withdrawn; stale entries are skipped when popped.
#[derive(Debug, PartialEq, Eq)]
struct QueuedItem {
    priority: Priority,
    seq: u64,
    digest: Digest,
    epoch: u64,
}

impl Ord for QueuedItem {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedItem {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

struct Waiter {
    reply: oneshot::Sender<FetchResult>,
    events: Option<mpsc::UnboundedSender<FetchEvent>>,
    /// Attached to a task another request created.
    joined: bool,
}

impl Waiter {
    fn notify(&self, event: &FetchEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event.clone());
        }
    }
}

struct InFlight {
    epoch: u64,
    task: DownloadTask,
    waiters: HashMap<u64, Waiter>,
    cancel: Option<watch::Sender<bool>>,
    running: bool,
    cancelled: bool,
}

impl InFlight {
    fn notify_all(&self, event: &FetchEvent) {
        for waiter in self.waiters.values() {
            waiter.notify(event);
        }
    }
}

struct PoolActor {
    cache: CacheStore,
    registry: SharedRegistry,
    config: FetcherConfig,
    metrics: Arc<PrefetchMetrics>,
    me: ActorHandle<PoolMessage>,
    queue: BinaryHeap<QueuedItem>,
    in_flight: HashMap<Digest, InFlight>,
    running: usize,
    next_seq: u64,
    next_epoch: u64,
}

impl PoolActor {
    fn new(
        cache: CacheStore,
        registry: SharedRegistry,
        config: FetcherConfig,
        metrics: Arc<PrefetchMetrics>,
        me: ActorHandle<PoolMessage>,
    ) -> Self {
        Self {
            cache,
            registry,
            config,
            metrics,
            me,
            queue: BinaryHeap::new(),
            in_flight: HashMap::new(),
            running: 0,
            next_seq: 0,
            next_epoch: 0,
        }
    }

    fn enqueue(&mut self, digest: Digest, priority: Priority, epoch: u64) {
        self.next_seq += 1;
        self.queue.push(QueuedItem {
            priority,
            seq: self.next_seq,
            digest,
            epoch,
        });
    }

    fn schedule(&mut self, waiter: u64, request: FetchRequest, reply: oneshot::Sender<FetchResult>) {
        let digest = request.layer.digest.clone();

        if let Some(entry) = self.in_flight.get_mut(&digest) {
            let waiter_entry = Waiter {
                reply,
                events: request.events,
                joined: true,
            };
            let bump = !entry.running && request.priority > entry.task.priority;
            if entry.running {
                waiter_entry.notify(&FetchEvent::Started {
                    digest: digest.clone(),
                });
            } else if bump {
                entry.task.priority = request.priority;
            }
            entry.waiters.insert(waiter, waiter_entry);
            let epoch = entry.epoch;
            self.metrics.record_join();
            debug!(digest = %digest.short(), waiters = entry.waiters.len(), "Joined in-flight fetch");

            if bump {
                self.enqueue(digest, request.priority, epoch);
            }
            return;
        }

        // The layer may have landed since the caller checked.
        if let Some(handle) = self.cache.acquire(&digest) {
            let _ = reply.send(Ok(FetchOutcome {
                handle,
                source: FetchSource::CacheHit,
            }));
            return;
        }

        self.next_epoch += 1;
        let epoch = self.next_epoch;
        let priority = request.priority;
        let mut waiters = HashMap::new();
        waiters.insert(
            waiter,
            Waiter {
                reply,
                events: request.events,
                joined: false,
            },
        );
        self.in_flight.insert(
            digest.clone(),
            InFlight {
                epoch,
                task: DownloadTask::new(request.source, request.layer, priority),
                waiters,
                cancel: None,
                running: false,
                cancelled: false,
            },
        );
        self.enqueue(digest, priority, epoch);
        self.dispatch();
    }

    fn detach(&mut self, digest: &Digest, waiter: u64) {
        let Some(entry) = self.in_flight.get_mut(digest) else {
            return;
        };
        if entry.waiters.remove(&waiter).is_none() || !entry.waiters.is_empty() {
            return;
        }

        if entry.running {
            entry.cancelled = true;
            if let Some(cancel) = &entry.cancel {
                let _ = cancel.send(true);
            }
            debug!(digest = %digest.short(), "Cancelling unwanted download");
        } else {
            self.in_flight.remove(digest);
            debug!(digest = %digest.short(), "Withdrew queued download");
        }
    }

    fn finished(&mut self, digest: Digest, epoch: u64, result: FetchResult) {
        let Some(entry) = self.in_flight.get(&digest) else {
            return;
        };
        if entry.epoch != epoch {
            return;
        }
        self.running = self.running.saturating_sub(1);

        // Someone attached after the cancel went out; start over for them.
        if matches!(result, Err(FetchError::Cancelled(_))) && !entry.waiters.is_empty() {
            self.next_epoch += 1;
            let new_epoch = self.next_epoch;
            let priority = entry.task.priority;
            if let Some(entry) = self.in_flight.get_mut(&digest) {
                entry.epoch = new_epoch;
                entry.running = false;
                entry.cancelled = false;
                entry.cancel = None;
                // The earliest remaining waiter now owns the fresh download.
                if let Some(owner) = entry.waiters.keys().min().copied() {
                    if let Some(waiter) = entry.waiters.get_mut(&owner) {
                        waiter.joined = false;
                    }
                }
                entry.task = DownloadTask::new(
                    entry.task.source.clone(),
                    entry.task.layer.clone(),
                    priority,
                );
            }
            self.enqueue(digest, priority, new_epoch);
            return;
        }

        let Some(entry) = self.in_flight.remove(&digest) else {
            return;
        };
        if entry.cancelled && entry.waiters.is_empty() {
            return;
        }
        for (_, waiter) in entry.waiters {
            let delivered = match &result {
                Ok(outcome) if waiter.joined => Ok(FetchOutcome {
                    handle: outcome.handle.clone(),
                    source: FetchSource::Joined,
                }),
                other => other.clone(),
            };
            let _ = waiter.reply.send(delivered);
        }
    }

    fn dispatch(&mut self) {
        let limit = self.config.concurrency.max(1);
        while self.running < limit {
            let Some(item) = self.queue.pop() else {
                break;
            };
            let Some(entry) = self.in_flight.get_mut(&item.digest) else {
                continue;
            };
            if entry.epoch != item.epoch || entry.running {
                continue;
            }

            let (cancel_tx, cancel_rx) = watch::channel(false);
            entry.cancel = Some(cancel_tx);
            entry.running = true;
            entry.notify_all(&FetchEvent::Started {
                digest: item.digest.clone(),
            });
            self.running += 1;

            let download = Download {
                cache: self.cache.clone(),
                registry: self.registry.clone(),
                config: self.config.clone(),
                metrics: self.metrics.clone(),
                task: entry.task.clone(),
                pool: self.me.clone(),
            };
            let me = self.me.clone();
            let QueuedItem { digest, epoch, .. } = item;
            tokio::spawn(async move {
                let result = download.run(cancel_rx).await;
                if me
                    .send(PoolMessage::Finished {
                        digest,
                        epoch,
                        result,
                    })
                    .await
                    .is_err()
                {
                    debug!("Fetcher pool stopped before download finished");
                }
            });
        }
    }

    fn stats(&self) -> PoolStats {
        let running = self.in_flight.values().filter(|e| e.running).count();
        PoolStats {
            queued: self.in_flight.len() - running,
            running,
            in_flight: self.in_flight.len(),
            waiters: self.in_flight.values().map(|e| e.waiters.len()).sum(),
        }
    }
}

#[async_trait]
impl Actor for PoolActor {
    type Message = PoolMessage;

    fn name(&self) -> &str {
        "fetcher_pool"
    }

    async fn handle(
        &mut self,
        msg: Self::Message,
        _ctx: &mut ActorContext,
    ) -> Result<bool, ActorError> {
        match msg {
            PoolMessage::Schedule {
                waiter,
                request,
                reply,
            } => self.schedule(waiter, request, reply),
            PoolMessage::Detach { digest, waiter } => self.detach(&digest, waiter),
            PoolMessage::Retrying(event) => {
                if let FetchEvent::Retrying { digest, .. } = &event {
                    if let Some(entry) = self.in_flight.get(digest) {
                        entry.notify_all(&event);
                    }
                }
            }
            PoolMessage::Finished {
                digest,
                epoch,
                result,
            } => self.finished(digest, epoch, result),
            PoolMessage::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
        }
        self.dispatch();
        Ok(true)
    }

    async fn on_stop(&mut self, _ctx: &mut ActorContext) {
        for entry in self.in_flight.values() {
            if let Some(cancel) = &entry.cancel {
                let _ = cancel.send(true);
            }
        }
        info!(
            in_flight = self.in_flight.len(),
            "Fetcher pool stopping"
        );
    }
}

// =============================================================================
// Public Handle
// =============================================================================

/// Bounded-concurrency layer downloader.
///
/// Cloning is cheap; all clones talk to the same pool actor.
#[derive(Clone)]
pub struct FetcherPool {
    handle: ActorHandle<PoolMessage>,
    cache: CacheStore,
    next_waiter: Arc<AtomicU64>,
    concurrency: usize,
}

impl FetcherPool {
    /// Spawns the pool actor under `supervisor`.
    pub fn spawn(
        supervisor: &mut Supervisor,
        cache: CacheStore,
        registry: SharedRegistry,
        config: FetcherConfig,
        metrics: Arc<PrefetchMetrics>,
    ) -> Self {
        let concurrency = config.concurrency.max(1);
        let mailbox = config.mailbox_size.max(1);
        let actor_cache = cache.clone();
        let handle = supervisor.spawn_with(mailbox, move |me| {
            PoolActor::new(actor_cache, registry, config, metrics, me)
        });
        info!(concurrency, "Fetcher pool started");
        Self {
            handle,
            cache,
            next_waiter: Arc::new(AtomicU64::new(0)),
            concurrency,
        }
    }

    /// Schedules a fetch.
    ///
    /// A layer that is already Ready resolves immediately without touching
    /// the pool. Otherwise the request is queued, or attached to the task
    /// already fetching the same digest.
    #[instrument(skip_all, fields(digest = %request.layer.digest.short()))]
    pub async fn schedule(&self, request: FetchRequest) -> FetchHandle {
        let digest = request.layer.digest.clone();
        if let Some(handle) = self.cache.acquire(&digest) {
            return FetchHandle::resolved(
                digest,
                Ok(FetchOutcome {
                    handle,
                    source: FetchSource::CacheHit,
                }),
            );
        }

        let waiter = self.next_waiter.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();
        let msg = PoolMessage::Schedule {
            waiter,
            request,
            reply,
        };
        if self.handle.send(msg).await.is_err() {
            return FetchHandle::resolved(digest, Err(FetchError::PoolStopped));
        }
        FetchHandle::waiting(digest, rx, self.handle.clone(), waiter)
    }

    /// Fetches one layer at normal priority and waits for it.
    pub async fn fetch(
        &self,
        source: ImageReference,
        layer: LayerDescriptor,
    ) -> Result<FetchOutcome, FetchError> {
        self.schedule(FetchRequest::new(source, layer)).await.await
    }

    pub async fn stats(&self) -> Result<PoolStats, FetchError> {
        let (reply, rx) = oneshot::channel();
        self.handle
            .send(PoolMessage::Stats { reply })
            .await
            .map_err(|_| FetchError::PoolStopped)?;
        rx.await.map_err(|_| FetchError::PoolStopped)
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }
}

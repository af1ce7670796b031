//! Executes one pull job.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use layercast_reconcile::JobState;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument, warn};

use super::job::{ImageFailure, JobStatus, LayerFailure, LayerRequest, PullJob};
use crate::cache::CacheHandle;
use crate::fetcher::{FetchEvent, FetchRequest, FetchSource, FetcherPool};
use crate::image::Digest;
use crate::metrics::{JobRecord, PrefetchMetrics};
use crate::resolver::ManifestResolver;

const CANCELLED: &str = "job cancelled";

pub(super) struct JobRunner {
    pub job: PullJob,
    pub resolver: Arc<ManifestResolver>,
    pub pool: FetcherPool,
    pub metrics: Arc<PrefetchMetrics>,
    pub status: watch::Sender<JobStatus>,
    pub cancel: watch::Receiver<bool>,
}

impl JobRunner {
    /// Runs the job to a terminal state and returns the final status.
    ///
    /// Every layer is pinned in the cache from the moment it is Ready until
    /// the job finishes, so the job cannot evict its own earlier layers.
    #[instrument(skip_all, fields(job_id = %self.job.id, images = self.job.images.len()))]
    pub async fn run(mut self) -> JobStatus {
        let mut status = self.status.borrow().clone();
        let started = std::time::Instant::now();

        let mut cancel = self.cancel.clone();
        let resolved = tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => None,
            layers = self.resolve_all(&mut status) => Some(layers),
        };

        let mut held: Vec<CacheHandle> = Vec::new();
        match resolved {
            None => {
                for reference in &self.job.images {
                    status.failed_images.push(ImageFailure {
                        reference: reference.clone(),
                        error: CANCELLED.to_string(),
                        retryable: true,
                    });
                }
                for request in &self.job.layers {
                    status.progress.pending += 1;
                    status.progress.fail();
                    status.failed_layers.push(cancelled_layer(request.clone()));
                }
            }
            Some(layers) => self.fetch_all(layers, &mut status, &mut held).await,
        }

        status.refresh();
        self.status.send_replace(status.clone());
        self.metrics.record_job(JobRecord {
            job_id: self.job.id,
            state: status.state,
            layers_ready: status.progress.ready,
            layers_failed: status.progress.failed,
            finished_at: status.finished_at.unwrap_or_else(Utc::now),
        });

        let fields = (status.progress.ready, status.progress.failed, status.cache_hits);
        let duration_ms = started.elapsed().as_millis() as u64;
        match status.state {
            JobState::Ready => info!(
                layers = fields.0,
                cache_hits = fields.2,
                duration_ms,
                "Pull job ready"
            ),
            state => warn!(
                state = %state,
                ready = fields.0,
                failed = fields.1,
                failed_images = status.failed_images.len(),
                duration_ms,
                "Pull job finished with failures"
            ),
        }
        drop(held);
        status
    }

    /// Resolves every image and returns the deduplicated layer set, images
    /// first in the order given, then any explicitly requested layers.
    async fn resolve_all(&self, status: &mut JobStatus) -> Vec<LayerRequest> {
        let lookups = self
            .job
            .images
            .iter()
            .map(|reference| async move { (reference, self.resolver.resolve(reference).await) });
        let results = futures_util::future::join_all(lookups).await;

        let mut seen = HashSet::new();
        let mut layers = Vec::new();
        for (reference, result) in results {
            match result {
                Ok(manifest) => {
                    for layer in manifest.layers {
                        if seen.insert(layer.digest.clone()) {
                            layers.push(LayerRequest {
                                source: reference.clone(),
                                layer,
                            });
                        }
                    }
                }
                Err(e) => {
                    warn!(image = %reference, error = %e, "Failed to resolve image");
                    status.failed_images.push(ImageFailure {
                        reference: reference.clone(),
                        error: e.to_string(),
                        retryable: e.is_retryable(),
                    });
                }
            }
        }
        for request in &self.job.layers {
            if seen.insert(request.layer.digest.clone()) {
                layers.push(request.clone());
            }
        }
        debug!(layers = layers.len(), "Resolved job layers");
        layers
    }

    async fn fetch_all(
        &mut self,
        layers: Vec<LayerRequest>,
        status: &mut JobStatus,
        held: &mut Vec<CacheHandle>,
    ) {
        let cache = self.pool.cache().clone();
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let mut outstanding: HashMap<Digest, LayerRequest> = HashMap::new();
        let mut started: HashSet<Digest> = HashSet::new();
        let mut fetches = FuturesUnordered::new();

        status.progress.pending = layers.len() as u32;
        for request in layers {
            let digest = request.layer.digest.clone();
            if let Some(handle) = cache.acquire(&digest) {
                status.progress.complete();
                status.cache_hits += 1;
                held.push(handle);
                continue;
            }

            let fetch = self
                .pool
                .schedule(
                    FetchRequest::new(request.source.clone(), request.layer.clone())
                        .with_priority(self.job.priority)
                        .with_events(events_tx.clone()),
                )
                .await;
            outstanding.insert(digest.clone(), request);
            fetches.push(async move { (digest, fetch.await) });
        }
        drop(events_tx);
        self.publish(status);

        let mut was_cancelled = false;
        while !fetches.is_empty() {
            tokio::select! {
                biased;
                _ = cancelled(&mut self.cancel) => {
                    was_cancelled = true;
                    break;
                }
                Some(event) = events.recv() => {
                    match event {
                        FetchEvent::Started { digest } => {
                            if outstanding.contains_key(&digest) && started.insert(digest) {
                                status.progress.start();
                            }
                        }
                        FetchEvent::Retrying { .. } => status.retries += 1,
                    }
                    self.publish(status);
                }
                Some((digest, result)) = fetches.next() => {
                    let Some(request) = outstanding.remove(&digest) else {
                        continue;
                    };
                    if started.insert(digest) {
                        status.progress.start();
                    }
                    match result {
                        Ok(outcome) => {
                            if outcome.source == FetchSource::CacheHit {
                                status.cache_hits += 1;
                            }
                            status.progress.complete();
                            held.push(outcome.handle);
                        }
                        Err(e) => {
                            status.progress.fail();
                            status.failed_layers.push(LayerFailure {
                                source: request.source,
                                layer: request.layer,
                                error: e.to_string(),
                                retryable: e.is_retryable(),
                            });
                        }
                    }
                    self.publish(status);
                }
            }
        }

        if was_cancelled {
            // Detaches from every download; ones nobody else wants stop.
            drop(fetches);
            let mut remaining: Vec<LayerRequest> = outstanding.into_values().collect();
            remaining.sort_by(|a, b| a.layer.digest.cmp(&b.layer.digest));
            info!(outstanding = remaining.len(), "Pull job cancelled");
            for request in remaining {
                status.progress.fail();
                status.failed_layers.push(cancelled_layer(request));
            }
        }
    }

    fn publish(&self, status: &mut JobStatus) {
        status.refresh();
        self.status.send_replace(status.clone());
    }
}

fn cancelled_layer(request: LayerRequest) -> LayerFailure {
    LayerFailure {
        source: request.source,
        layer: request.layer,
        error: CANCELLED.to_string(),
        retryable: true,
    }
}

/// Resolves once cancellation is requested. Never resolves if the sender is
/// gone without having asked.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}

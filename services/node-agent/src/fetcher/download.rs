//! The download routine run by a pool worker for one task.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, instrument, warn};

use super::pool::PoolMessage;
use super::task::{DownloadTask, TaskState};
use super::{FetchError, FetchEvent, FetchOutcome, FetchSource, FetcherConfig};
use crate::actors::ActorHandle;
use crate::cache::{AbortReason, BlobWriter, CacheError, CacheHandle, CacheStore};
use crate::image::Digest;
use crate::metrics::PrefetchMetrics;
use crate::registry::{RegistryError, SharedRegistry};

/// Why an attempt did not produce a committed blob.
enum Failure {
    /// Retry, resuming from the bytes already staged.
    Transient(String),
    /// Retry from byte 0; the staged bytes are bad.
    Integrity(String),
    /// Stop.
    Permanent(FetchError),
}

enum Admission {
    Hit(CacheHandle),
    Writer(BlobWriter),
}

pub(super) struct Download {
    pub cache: CacheStore,
    pub registry: SharedRegistry,
    pub config: FetcherConfig,
    pub metrics: Arc<PrefetchMetrics>,
    pub task: DownloadTask,
    pub pool: ActorHandle<PoolMessage>,
}

impl Download {
    /// Drives the task to a terminal state.
    ///
    /// Whatever happens, the staged write is settled before returning:
    /// aborted as `Cancelled` if the pool withdrew the task, `Failed`
    /// otherwise.
    #[instrument(skip_all, fields(digest = %self.task.digest().short(), source = %self.task.source))]
    pub async fn run(mut self, mut cancel: watch::Receiver<bool>) -> Result<FetchOutcome, FetchError> {
        let digest = self.task.digest().clone();
        let deadline = Instant::now() + self.config.task_timeout;
        let mut writer: Option<BlobWriter> = None;

        let result = tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => Err(FetchError::Cancelled(digest.clone())),
            res = timeout_at(deadline, self.drive(&mut writer)) => {
                res.unwrap_or_else(|_| Err(FetchError::Timeout(digest.clone())))
            }
        };

        let Err(err) = &result else {
            return result;
        };

        let was_cancelled = matches!(err, FetchError::Cancelled(_));
        if let Some(w) = writer.take() {
            let reason = if was_cancelled {
                AbortReason::Cancelled
            } else {
                AbortReason::Failed
            };
            if let Err(e) = self.cache.abort(w, reason).await {
                warn!(error = %e, "Failed to abort staged write");
            }
        } else if !was_cancelled {
            if let Err(e) = self.cache.mark_failed(&digest, self.task.layer.size).await {
                warn!(error = %e, "Failed to record failed entry");
            }
        }

        if was_cancelled {
            debug!("Layer fetch cancelled");
        } else {
            self.advance(TaskState::Failed);
            self.metrics.record_failure();
            self.metrics.record_wasted_bytes(self.task.bytes_transferred);
            warn!(error = %err, attempts = self.task.attempts, "Layer fetch failed");
        }
        result
    }

    async fn drive(&mut self, writer: &mut Option<BlobWriter>) -> Result<FetchOutcome, FetchError> {
        let started = Instant::now();
        let max_attempts = self.config.max_attempts.max(1);

        loop {
            let attempt = self.begin_attempt();

            if writer.is_none() {
                match self.admit().await? {
                    Admission::Hit(handle) => {
                        self.advance(TaskState::Verifying);
                        self.advance(TaskState::Ready);
                        debug!("Layer became ready while queued");
                        return Ok(FetchOutcome {
                            handle,
                            source: FetchSource::CacheHit,
                        });
                    }
                    Admission::Writer(w) => *writer = Some(w),
                }
            }
            let Some(staged) = writer.as_mut() else {
                return Err(FetchError::Cache("staged write vanished".to_string()));
            };

            let failure = match self.stream_attempt(staged).await {
                Ok(()) => {
                    self.advance(TaskState::Verifying);
                    let Some(w) = writer.take() else {
                        return Err(FetchError::Cache("staged write vanished".to_string()));
                    };
                    match self.cache.commit(w).await {
                        Ok(handle) => {
                            self.advance(TaskState::Ready);
                            let duration = started.elapsed();
                            let bytes = self.task.bytes_transferred;
                            self.metrics
                                .record_download(handle.digest(), bytes, attempt, duration);
                            info!(
                                size = handle.size(),
                                bytes_transferred = bytes,
                                attempts = attempt,
                                duration_ms = duration.as_millis() as u64,
                                "Layer fetched"
                            );
                            return Ok(FetchOutcome {
                                handle,
                                source: FetchSource::Downloaded {
                                    attempts: attempt,
                                    bytes_transferred: bytes,
                                    duration,
                                },
                            });
                        }
                        // The store already discarded the staged bytes.
                        Err(e) if e.is_integrity() => Failure::Integrity(e.to_string()),
                        Err(e) => return Err(FetchError::Cache(e.to_string())),
                    }
                }
                Err(failure) => failure,
            };

            let last_error = match failure {
                Failure::Permanent(err) => return Err(err),
                Failure::Integrity(msg) => {
                    if let Some(w) = writer.take() {
                        self.cache
                            .abort(w, AbortReason::Retry)
                            .await
                            .map_err(|e| FetchError::Cache(e.to_string()))?;
                    }
                    msg
                }
                Failure::Transient(msg) => msg,
            };

            if attempt >= max_attempts {
                return Err(FetchError::RetriesExhausted {
                    digest: self.task.digest().clone(),
                    attempts: attempt,
                    last_error,
                });
            }

            let delay = self.config.backoff.delay(attempt - 1);
            if let Err(e) = self
                .task
                .schedule_retry(std::time::Instant::now() + delay)
            {
                warn!(error = %e, "Unexpected task state");
            }
            self.metrics.record_retry();
            self.pool.send_detached(PoolMessage::Retrying(FetchEvent::Retrying {
                digest: self.task.digest().clone(),
                attempt,
                error: last_error.clone(),
            }));
            warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %last_error,
                "Layer fetch attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Claims the digest in the cache, waiting up to `admission_wait` for
    /// eviction or another writer to make progress.
    async fn admit(&self) -> Result<Admission, FetchError> {
        let digest = self.task.digest();
        let size = self.task.layer.size;
        let deadline = Instant::now() + self.config.admission_wait;
        let mut waited = false;

        loop {
            let changed = self.cache.changed();
            tokio::pin!(changed);
            changed.as_mut().enable();

            if let Some(handle) = self.cache.acquire(digest) {
                return Ok(Admission::Hit(handle));
            }

            let blocked = match self.cache.begin_write(digest, size).await {
                Ok(writer) => return Ok(Admission::Writer(writer)),
                Err(CacheError::AlreadyCached(_)) => continue,
                Err(CacheError::AlreadyInProgress(_)) => FetchError::Timeout(digest.clone()),
                Err(CacheError::BudgetExceeded { budget, .. }) => {
                    let no_space = FetchError::InsufficientCacheSpace {
                        digest: digest.clone(),
                        required: size,
                        budget,
                    };
                    if size > budget {
                        return Err(no_space);
                    }
                    match self.cache.make_room(size).await {
                        Ok(report) => {
                            debug!(freed = report.freed_bytes, "Evicted to admit layer");
                            continue;
                        }
                        Err(CacheError::BudgetExceeded { .. }) => no_space,
                        Err(e) => return Err(FetchError::Cache(e.to_string())),
                    }
                }
                Err(e) => return Err(FetchError::Cache(e.to_string())),
            };

            if !waited {
                waited = true;
                self.metrics.record_admission_wait();
                debug!(reason = %blocked, "Waiting for cache admission");
            }
            if timeout_at(deadline, changed).await.is_err() {
                return Err(blocked);
            }
        }
    }

    /// Streams the rest of the blob into `writer`.
    async fn stream_attempt(&mut self, writer: &mut BlobWriter) -> Result<(), Failure> {
        let digest = self.task.digest().clone();
        let offset = writer.written();
        let attempt_timeout = self.config.attempt_timeout;

        let request = self
            .registry
            .fetch_blob_range(&self.task.source, &digest, offset);
        let stream = match timeout(attempt_timeout, request).await {
            Err(_) => return Err(Failure::Transient("blob request timed out".to_string())),
            Ok(Err(RegistryError::RangeNotSatisfiable { offset })) => {
                writer.reset().await.map_err(cache_failure)?;
                return Err(Failure::Transient(format!(
                    "range not satisfiable at {offset}, restarting from zero"
                )));
            }
            Ok(Err(e)) => return Err(classify(&digest, e)),
            Ok(Ok(stream)) => stream,
        };

        if stream.offset != offset {
            writer.reset().await.map_err(cache_failure)?;
            if stream.offset != 0 {
                return Err(Failure::Transient(format!(
                    "registry resumed at {} instead of {offset}",
                    stream.offset
                )));
            }
            debug!(offset, "Registry ignored range request, restarting from zero");
        } else if offset > 0 {
            debug!(offset, "Resuming layer download");
        }

        let mut body = stream.body;
        loop {
            match timeout(attempt_timeout, body.next()).await {
                Err(_) => return Err(Failure::Transient("blob stream stalled".to_string())),
                Ok(None) => break,
                Ok(Some(Err(e))) => return Err(classify(&digest, e)),
                Ok(Some(Ok(chunk))) => {
                    self.task.bytes_transferred += chunk.len() as u64;
                    writer.write_chunk(&chunk).await.map_err(|e| {
                        if e.is_integrity() {
                            Failure::Integrity(e.to_string())
                        } else {
                            cache_failure(e)
                        }
                    })?;
                }
            }
        }

        if writer.written() < writer.expected_size() {
            return Err(Failure::Transient(format!(
                "stream ended at {} of {} bytes",
                writer.written(),
                writer.expected_size()
            )));
        }
        Ok(())
    }

    fn begin_attempt(&mut self) -> u32 {
        match self.task.begin_attempt() {
            Ok(attempt) => attempt,
            Err(e) => {
                warn!(error = %e, "Unexpected task state");
                self.task.attempts += 1;
                self.task.attempts
            }
        }
    }

    fn advance(&mut self, to: TaskState) {
        if let Err(e) = self.task.transition(to) {
            debug!(error = %e, "Ignoring task transition");
        }
    }
}

fn classify(digest: &Digest, err: RegistryError) -> Failure {
    match err {
        RegistryError::NotFound(_) => Failure::Permanent(FetchError::NotFound(digest.clone())),
        RegistryError::AuthFailure(msg) => Failure::Permanent(FetchError::AuthFailure(msg)),
        e if e.is_retryable() => Failure::Transient(e.to_string()),
        e => Failure::Permanent(FetchError::Rejected(e.to_string())),
    }
}

fn cache_failure(err: CacheError) -> Failure {
    Failure::Permanent(FetchError::Cache(err.to_string()))
}

/// Resolves once cancellation is requested or the pool goes away.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

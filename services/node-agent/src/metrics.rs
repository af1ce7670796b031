//! Prefetch metrics.
//!
//! Counters are plain atomics updated on the hot path. [`MetricsSnapshot`]
//! is the serializable view handed to whatever scrapes the agent.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use layercast_id::JobId;
use layercast_reconcile::JobState;
use parking_lot::Mutex;
use serde::Serialize;

use crate::cache::{CacheStatsSnapshot, CacheStore, CacheUsage};
use crate::image::Digest;

const RECENT_CAPACITY: usize = 256;

/// One completed layer download.
#[derive(Debug, Clone, Serialize)]
pub struct LayerFetchRecord {
    pub digest: Digest,
    pub bytes: u64,
    pub attempts: u32,
    pub duration_ms: u64,
    pub finished_at: DateTime<Utc>,
}

/// Terminal status of one pull job.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub state: JobState,
    pub layers_ready: u32,
    pub layers_failed: u32,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct PrefetchMetrics {
    layers_downloaded: AtomicU64,
    layers_failed: AtomicU64,
    fan_in_joins: AtomicU64,
    retries: AtomicU64,
    bytes_transferred: AtomicU64,
    fetch_ms_total: AtomicU64,
    fetch_ms_max: AtomicU64,
    admission_waits: AtomicU64,
    jobs_ready: AtomicU64,
    jobs_partial: AtomicU64,
    jobs_failed: AtomicU64,
    recent_fetches: Mutex<VecDeque<LayerFetchRecord>>,
    recent_jobs: Mutex<VecDeque<JobRecord>>,
}

impl PrefetchMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_download(&self, digest: &Digest, bytes: u64, attempts: u32, duration: Duration) {
        let ms = duration.as_millis() as u64;
        self.layers_downloaded.fetch_add(1, Ordering::Relaxed);
        self.bytes_transferred.fetch_add(bytes, Ordering::Relaxed);
        self.fetch_ms_total.fetch_add(ms, Ordering::Relaxed);
        self.fetch_ms_max.fetch_max(ms, Ordering::Relaxed);
        push_bounded(
            &self.recent_fetches,
            LayerFetchRecord {
                digest: digest.clone(),
                bytes,
                attempts,
                duration_ms: ms,
                finished_at: Utc::now(),
            },
        );
    }

    /// Bytes received by an attempt that did not end in a download.
    pub fn record_wasted_bytes(&self, bytes: u64) {
        self.bytes_transferred.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.layers_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_join(&self) {
        self.fan_in_joins.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_admission_wait(&self) {
        self.admission_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job(&self, record: JobRecord) {
        let counter = match record.state {
            JobState::Ready => &self.jobs_ready,
            JobState::PartialFailure => &self.jobs_partial,
            JobState::Failed => &self.jobs_failed,
            JobState::Queued | JobState::InProgress => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        push_bounded(&self.recent_jobs, record);
    }

    pub fn snapshot(&self, cache: &CacheStore) -> MetricsSnapshot {
        MetricsSnapshot {
            taken_at: Utc::now(),
            layers_downloaded: self.layers_downloaded.load(Ordering::Relaxed),
            layers_failed: self.layers_failed.load(Ordering::Relaxed),
            fan_in_joins: self.fan_in_joins.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            bytes_transferred: self.bytes_transferred.load(Ordering::Relaxed),
            fetch_ms_total: self.fetch_ms_total.load(Ordering::Relaxed),
            fetch_ms_max: self.fetch_ms_max.load(Ordering::Relaxed),
            admission_waits: self.admission_waits.load(Ordering::Relaxed),
            jobs_ready: self.jobs_ready.load(Ordering::Relaxed),
            jobs_partial: self.jobs_partial.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            cache: cache.stats(),
            usage: cache.usage(),
            recent_fetches: self.recent_fetches.lock().iter().cloned().collect(),
            recent_jobs: self.recent_jobs.lock().iter().cloned().collect(),
        }
    }
}

fn push_bounded<T>(queue: &Mutex<VecDeque<T>>, item: T) {
    let mut queue = queue.lock();
    if queue.len() == RECENT_CAPACITY {
        queue.pop_front();
    }
    queue.push_back(item);
}

/// Point-in-time metrics for the monitoring collaborator.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub taken_at: DateTime<Utc>,
    pub layers_downloaded: u64,
    pub layers_failed: u64,
    pub fan_in_joins: u64,
    pub retries: u64,
    pub bytes_transferred: u64,
    pub fetch_ms_total: u64,
    pub fetch_ms_max: u64,
    pub admission_waits: u64,
    pub jobs_ready: u64,
    pub jobs_partial: u64,
    pub jobs_failed: u64,
    pub cache: CacheStatsSnapshot,
    pub usage: CacheUsage,
    /// Most recent downloads, oldest first.
    pub recent_fetches: Vec<LayerFetchRecord>,
    /// Most recent terminal jobs, oldest first.
    pub recent_jobs: Vec<JobRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recent_fetches_are_bounded() {
        let metrics = PrefetchMetrics::new();
        let digest = Digest::sha256_of(b"x");
        for i in 0..(RECENT_CAPACITY as u64 + 10) {
            metrics.record_download(&digest, i, 1, Duration::from_millis(i));
        }
        let recent = metrics.recent_fetches.lock();
        assert_eq!(recent.len(), RECENT_CAPACITY);
        assert_eq!(recent.front().map(|r| r.bytes), Some(10));
        assert_eq!(
            metrics.fetch_ms_max.load(Ordering::Relaxed),
            RECENT_CAPACITY as u64 + 9
        );
    }

    #[test]
    fn test_only_terminal_jobs_are_recorded() {
        let metrics = PrefetchMetrics::new();
        for state in [JobState::InProgress, JobState::Ready, JobState::PartialFailure] {
            metrics.record_job(JobRecord {
                job_id: JobId::new(),
                state,
                layers_ready: 1,
                layers_failed: 0,
                finished_at: Utc::now(),
            });
        }
        assert_eq!(metrics.jobs_ready.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.jobs_partial.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.recent_jobs.lock().len(), 2);
    }
}

//! The cache store.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::{debug, info, instrument, warn};

use super::entry::{CacheEntry, EntryState, Slot};
use super::index::{self, IndexRecord, Layout};
use super::writer::BlobWriter;
use super::{CacheConfig, CacheError, EvictionMode};
use crate::image::Digest;

/// Why a write is being abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// The attempt failed and the caller will try again.
    Retry,
    /// The caller no longer wants the blob.
    Cancelled,
    /// The caller gave up; leave the entry Failed.
    Failed,
}

/// Result of an eviction pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    /// Evicted digests, least recently used first.
    pub evicted: Vec<Digest>,
    pub freed_bytes: u64,
    /// Stored bytes after the pass.
    pub remaining_bytes: u64,
}

/// Space accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheUsage {
    /// Bytes of published blobs.
    pub stored_bytes: u64,
    /// Bytes promised to in-progress writers.
    pub reserved_bytes: u64,
    pub budget_bytes: u64,
    pub entries: usize,
}

/// Counters since open.
#[derive(Debug, Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    commits: AtomicU64,
    aborts: AtomicU64,
    integrity_failures: AtomicU64,
    evictions: AtomicU64,
    evicted_bytes: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStatsSnapshot {
    /// Acquires that found a Ready entry.
    pub hits: u64,
    /// Writes admitted because the blob was not cached.
    pub misses: u64,
    pub commits: u64,
    pub aborts: u64,
    pub integrity_failures: u64,
    pub evictions: u64,
    pub evicted_bytes: u64,
}

#[derive(Debug, Default)]
struct Index {
    slots: HashMap<Digest, Slot>,
    /// Consecutive aborts per digest, kept while the entry is absent.
    aborts: HashMap<Digest, u32>,
    /// Bytes on disk, including entries being evicted.
    stored_bytes: u64,
    /// Bytes of entries marked Evicted whose files are not yet removed.
    evicting_bytes: u64,
    reserved_bytes: u64,
    next_seq: u64,
    next_writer: u64,
}

impl Index {
    fn from_records(records: Vec<IndexRecord>) -> Self {
        let mut records = records;
        records.sort_by_key(|r| r.last_access);

        let mut index = Index::default();
        for record in records {
            let seq = index.bump_seq();
            if record.state == EntryState::Ready {
                index.stored_bytes += record.size;
            }
            index.slots.insert(
                record.digest,
                Slot {
                    size: record.size,
                    state: record.state,
                    refcount: 0,
                    last_access: record.last_access,
                    access_seq: seq,
                    writer: None,
                },
            );
        }
        index
    }

    fn bump_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn live_bytes(&self) -> u64 {
        self.stored_bytes - self.evicting_bytes
    }

    /// Drops idle Failed entries, other than `keep`, that were last touched
    /// `ttl` or more ago.
    fn prune_failed(&mut self, ttl: Duration, now: DateTime<Utc>, keep: &Digest) -> usize {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let before = self.slots.len();
        self.slots.retain(|digest, s| {
            digest == keep
                || !(s.state == EntryState::Failed
                    && s.writer.is_none()
                    && s.refcount == 0
                    && now.signed_duration_since(s.last_access) >= ttl)
        });
        before - self.slots.len()
    }

    /// Entries worth persisting. Failed entries are not carried across restarts.
    fn records(&self) -> Vec<IndexRecord> {
        let mut records: Vec<_> = self
            .slots
            .iter()
            .filter(|(_, s)| s.state == EntryState::Ready)
            .map(|(digest, s)| IndexRecord {
                digest: digest.clone(),
                size: s.size,
                state: s.state,
                last_access: s.last_access,
            })
            .collect();
        records.sort_by(|a, b| a.digest.cmp(&b.digest));
        records
    }
}

/// State shared by the store, its handles and its writers.
pub(crate) struct StoreInner {
    config: CacheConfig,
    layout: Layout,
    index: Mutex<Index>,
    /// Serializes index file writes; held across the blocking write.
    persist: tokio::sync::Mutex<()>,
    changed: Notify,
    stats: CacheStats,
}

impl StoreInner {
    fn retain(&self, digest: &Digest) {
        if let Some(slot) = self.index.lock().slots.get_mut(digest) {
            slot.refcount += 1;
        }
    }

    fn release_ref(&self, digest: &Digest) {
        let idle = {
            let mut index = self.index.lock();
            match index.slots.get_mut(digest) {
                Some(slot) => {
                    slot.refcount = slot.refcount.saturating_sub(1);
                    slot.refcount == 0
                }
                None => false,
            }
        };
        if idle {
            self.changed.notify_waiters();
        }
    }

    pub(super) fn mark_downloading(&self, writer: u64, digest: &Digest) {
        if let Some(slot) = self.index.lock().slots.get_mut(digest) {
            if slot.writer == Some(writer) {
                slot.state = EntryState::Downloading;
            }
        }
    }

    /// Releases a writer's claim. Returns the resulting state, if any entry
    /// remains.
    pub(super) fn abandon(
        &self,
        writer: u64,
        digest: &Digest,
        expected_size: u64,
        reason: AbortReason,
    ) -> Option<EntryState> {
        let state = {
            let mut guard = self.index.lock();
            let index = &mut *guard;
            let slot = index.slots.get_mut(digest)?;
            if slot.writer != Some(writer) {
                return Some(slot.state);
            }
            slot.writer = None;
            index.reserved_bytes = index.reserved_bytes.saturating_sub(expected_size);

            let aborts = match reason {
                AbortReason::Cancelled => index.aborts.get(digest).copied().unwrap_or(0),
                _ => {
                    let count = index.aborts.entry(digest.clone()).or_insert(0);
                    *count += 1;
                    *count
                }
            };
            if reason == AbortReason::Failed || aborts >= self.config.max_aborts {
                let now = Utc::now();
                slot.state = EntryState::Failed;
                slot.last_access = now;
                index.aborts.remove(digest);
                index.prune_failed(self.config.failed_ttl, now, digest);
                Some(EntryState::Failed)
            } else {
                index.slots.remove(digest);
                None
            }
        };
        self.stats.aborts.fetch_add(1, Ordering::Relaxed);
        self.changed.notify_waiters();
        debug!(digest = %digest, ?reason, state = ?state, "Abandoned write");
        state
    }
}

/// Handle to a pinned, Ready blob.
///
/// While any handle for a digest is alive the entry cannot be evicted.
/// Cloning takes another reference; dropping releases one.
pub struct CacheHandle {
    inner: Arc<StoreInner>,
    digest: Digest,
    size: u64,
}

impl CacheHandle {
    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Path of the published blob.
    pub fn path(&self) -> PathBuf {
        self.inner.layout.blob_path(&self.digest)
    }
}

impl Clone for CacheHandle {
    fn clone(&self) -> Self {
        self.inner.retain(&self.digest);
        Self {
            inner: self.inner.clone(),
            digest: self.digest.clone(),
            size: self.size,
        }
    }
}

impl Drop for CacheHandle {
    fn drop(&mut self) {
        self.inner.release_ref(&self.digest);
    }
}

impl std::fmt::Debug for CacheHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheHandle")
            .field("digest", &self.digest)
            .field("size", &self.size)
            .finish()
    }
}

/// Content-addressable blob store with reference counting and a size
/// budget.
///
/// The entry index sits behind one mutex that is never held across I/O.
/// Blob bytes are written, renamed and deleted outside it; a digest is
/// claimed by at most one [`BlobWriter`] at a time.
#[derive(Clone)]
pub struct CacheStore {
    inner: Arc<StoreInner>,
}

impl CacheStore {
    /// Opens (or creates) a store, recovering the index from disk.
    #[instrument(skip_all, fields(root = %config.root.display()))]
    pub async fn open(config: CacheConfig) -> Result<Self, CacheError> {
        let layout = Layout::new(&config.root);
        let verify = config.verify_on_open;
        let recovered = {
            let layout = layout.clone();
            tokio::task::spawn_blocking(move || index::recover(&layout, verify))
                .await
                .map_err(|e| io::Error::other(e.to_string()))??
        };

        let index = Index::from_records(recovered.records);
        info!(
            entries = index.slots.len(),
            stored_bytes = index.stored_bytes,
            budget_bytes = config.budget_bytes,
            eviction = %config.eviction,
            "Opened cache store"
        );

        let store = Self {
            inner: Arc::new(StoreInner {
                config,
                layout,
                index: Mutex::new(index),
                persist: tokio::sync::Mutex::new(()),
                changed: Notify::new(),
                stats: CacheStats::default(),
            }),
        };
        store.persist().await?;
        Ok(store)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn budget(&self) -> u64 {
        self.inner.config.budget_bytes
    }

    /// Path a digest is (or would be) published at.
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.inner.layout.blob_path(digest)
    }

    /// Current state of an entry, if one exists. Does not touch LRU order.
    pub fn lookup(&self, digest: &Digest) -> Option<CacheEntry> {
        self.inner
            .index
            .lock()
            .slots
            .get(digest)
            .map(|slot| slot.snapshot(digest))
    }

    /// Pins a Ready entry. Returns `None` on a miss.
    pub fn acquire(&self, digest: &Digest) -> Option<CacheHandle> {
        let size = {
            let mut guard = self.inner.index.lock();
            let index = &mut *guard;
            let seq = index.bump_seq();
            let slot = index
                .slots
                .get_mut(digest)
                .filter(|s| s.state == EntryState::Ready)?;
            slot.refcount += 1;
            slot.last_access = Utc::now();
            slot.access_seq = seq;
            slot.size
        };
        self.inner.stats.hits.fetch_add(1, Ordering::Relaxed);
        Some(CacheHandle {
            inner: self.inner.clone(),
            digest: digest.clone(),
            size,
        })
    }

    /// Releases a handle. Equivalent to dropping it.
    pub fn release(&self, handle: CacheHandle) {
        drop(handle);
    }

    /// Claims `digest` for writing.
    ///
    /// Fails with `AlreadyInProgress` if another writer holds it (or it is
    /// mid-eviction), `AlreadyCached` if it is Ready, and `BudgetExceeded`
    /// if the reservation does not fit. Failed entries may be rewritten.
    pub async fn begin_write(
        &self,
        digest: &Digest,
        expected_size: u64,
    ) -> Result<BlobWriter, CacheError> {
        let id = self.admit(digest, expected_size)?;
        let staging = self.inner.layout.staging_path(digest);
        let file = match tokio::fs::File::create(&staging).await {
            Ok(file) => file,
            Err(e) => {
                self.inner
                    .abandon(id, digest, expected_size, AbortReason::Cancelled);
                return Err(e.into());
            }
        };
        debug!(digest = %digest, expected_size, "Began write");
        Ok(BlobWriter::new(
            self.inner.clone(),
            id,
            digest.clone(),
            expected_size,
            staging,
            file,
        ))
    }

    fn admit(&self, digest: &Digest, expected_size: u64) -> Result<u64, CacheError> {
        let mut guard = self.inner.index.lock();
        let index = &mut *guard;

        if let Some(slot) = index.slots.get(digest) {
            if slot.writer.is_some() || slot.state == EntryState::Evicted {
                return Err(CacheError::AlreadyInProgress(digest.clone()));
            }
            if slot.state == EntryState::Ready {
                return Err(CacheError::AlreadyCached(digest.clone()));
            }
        }

        let required = index.stored_bytes + index.reserved_bytes + expected_size;
        let budget = self.inner.config.budget_bytes;
        if required > budget {
            return Err(CacheError::BudgetExceeded { required, budget });
        }

        index.next_writer += 1;
        let id = index.next_writer;
        let seq = index.bump_seq();
        index.reserved_bytes += expected_size;
        index.slots.insert(
            digest.clone(),
            Slot {
                size: expected_size,
                state: EntryState::Pending,
                refcount: 0,
                last_access: Utc::now(),
                access_seq: seq,
                writer: Some(id),
            },
        );
        self.inner.stats.misses.fetch_add(1, Ordering::Relaxed);
        Ok(id)
    }

    /// Verifies and publishes a finished write.
    ///
    /// On a size or digest mismatch the write is aborted (counted as a retry)
    /// and the error returned; the caller must start over from offset 0.
    /// On success the entry is Ready and the returned handle pins it.
    pub async fn commit(&self, mut writer: BlobWriter) -> Result<CacheHandle, CacheError> {
        writer.close().await?;
        let digest = writer.digest().clone();

        if writer.written() != writer.expected_size() {
            let err = CacheError::SizeMismatch {
                digest,
                expected: writer.expected_size(),
                actual: writer.written(),
            };
            self.inner
                .stats
                .integrity_failures
                .fetch_add(1, Ordering::Relaxed);
            self.abort(writer, AbortReason::Retry).await?;
            return Err(err);
        }

        let actual = writer.finish_hash();
        if actual != digest {
            warn!(expected = %digest, actual = %actual, "Digest mismatch, discarding download");
            self.inner
                .stats
                .integrity_failures
                .fetch_add(1, Ordering::Relaxed);
            self.abort(writer, AbortReason::Retry).await?;
            return Err(CacheError::DigestMismatch {
                expected: digest,
                actual,
            });
        }

        // Once the blob is moved into place the index must learn about it, so
        // the rest runs on its own task and survives this future being dropped.
        let store = self.clone();
        tokio::spawn(async move { store.publish(writer).await })
            .await
            .map_err(io::Error::other)?
    }

    async fn publish(&self, mut writer: BlobWriter) -> Result<CacheHandle, CacheError> {
        let digest = writer.digest().clone();
        let target = self.inner.layout.blob_path(&digest);
        tokio::fs::rename(writer.staging_path(), &target).await?;

        let size = writer.written();
        let published = {
            let mut guard = self.inner.index.lock();
            let index = &mut *guard;
            let seq = index.bump_seq();
            match index.slots.get_mut(&digest) {
                Some(slot) if slot.writer == Some(writer.id()) => {
                    slot.writer = None;
                    slot.state = EntryState::Ready;
                    slot.size = size;
                    slot.refcount += 1;
                    slot.last_access = Utc::now();
                    slot.access_seq = seq;
                    index.reserved_bytes =
                        index.reserved_bytes.saturating_sub(writer.expected_size());
                    index.stored_bytes += size;
                    index.aborts.remove(&digest);
                    true
                }
                _ => false,
            }
        };
        writer.settle();
        if !published {
            return Err(CacheError::StaleWriter(digest));
        }

        self.inner.stats.commits.fetch_add(1, Ordering::Relaxed);
        self.inner.changed.notify_waiters();
        info!(digest = %digest, size, "Committed blob");

        let handle = CacheHandle {
            inner: self.inner.clone(),
            digest,
            size,
        };

        if let Err(e) = self.persist().await {
            // The blob is on disk and verifiable, so recovery will adopt it.
            warn!(error = %e, "Failed to persist cache index after commit");
        }
        self.evict_eagerly().await;
        Ok(handle)
    }

    /// Discards a write and releases its claim.
    ///
    /// The entry becomes absent again, or Failed if `reason` is `Failed` or
    /// the digest has now been aborted `max_aborts` times.
    pub async fn abort(
        &self,
        mut writer: BlobWriter,
        reason: AbortReason,
    ) -> Result<(), CacheError> {
        writer.settle();
        match tokio::fs::remove_file(writer.staging_path()).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(digest = %writer.digest(), error = %e, "Failed to remove staging file"),
        }
        self.inner.abandon(
            writer.id(),
            writer.digest(),
            writer.expected_size(),
            reason,
        );
        Ok(())
    }

    /// Records that `digest` could not be fetched. No-op if any entry exists.
    ///
    /// The Failed entry is kept in memory for `failed_ttl` and then dropped
    /// the next time another entry fails.
    pub async fn mark_failed(&self, digest: &Digest, size: u64) -> Result<(), CacheError> {
        let mut guard = self.inner.index.lock();
        let index = &mut *guard;
        if index.slots.contains_key(digest) {
            return Ok(());
        }
        let now = Utc::now();
        let pruned = index.prune_failed(self.inner.config.failed_ttl, now, digest);
        let seq = index.bump_seq();
        index.aborts.remove(digest);
        index.slots.insert(
            digest.clone(),
            Slot {
                size,
                state: EntryState::Failed,
                refcount: 0,
                last_access: now,
                access_seq: seq,
                writer: None,
            },
        );
        if pruned > 0 {
            debug!(pruned, "Dropped expired failed entries");
        }
        Ok(())
    }

    /// Evicts idle Ready entries, least recently used first, until stored
    /// bytes are within `budget`.
    ///
    /// Entries that are pinned or being written are never touched. If the
    /// target cannot be met with what is evictable, whatever could be freed
    /// is freed and `BudgetExceeded` is returned.
    #[instrument(skip(self))]
    pub async fn evict(&self, budget: u64) -> Result<EvictionReport, CacheError> {
        let victims = self.select_victims(budget);

        for (digest, _) in &victims {
            let path = self.inner.layout.blob_path(digest);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(digest = %digest, error = %e, "Failed to remove evicted blob"),
            }
        }

        let remaining = {
            let mut guard = self.inner.index.lock();
            let index = &mut *guard;
            for (digest, size) in &victims {
                if index
                    .slots
                    .get(digest)
                    .is_some_and(|s| s.state == EntryState::Evicted)
                {
                    index.slots.remove(digest);
                }
                index.stored_bytes -= size;
                index.evicting_bytes -= size;
            }
            index.live_bytes()
        };

        let freed_bytes: u64 = victims.iter().map(|(_, size)| size).sum();
        let report = EvictionReport {
            evicted: victims.into_iter().map(|(digest, _)| digest).collect(),
            freed_bytes,
            remaining_bytes: remaining,
        };

        if !report.evicted.is_empty() {
            self.inner
                .stats
                .evictions
                .fetch_add(report.evicted.len() as u64, Ordering::Relaxed);
            self.inner
                .stats
                .evicted_bytes
                .fetch_add(freed_bytes, Ordering::Relaxed);
            info!(
                count = report.evicted.len(),
                freed_bytes, remaining, "Evicted cache entries"
            );
            self.persist().await?;
            self.inner.changed.notify_waiters();
        }

        if remaining > budget {
            return Err(CacheError::BudgetExceeded {
                required: remaining,
                budget,
            });
        }
        Ok(report)
    }

    /// Marks victims Evicted under the lock and reserves their bytes as
    /// outgoing.
    fn select_victims(&self, budget: u64) -> Vec<(Digest, u64)> {
        let mut guard = self.inner.index.lock();
        let index = &mut *guard;

        let mut live = index.live_bytes();
        if live <= budget {
            return Vec::new();
        }

        let mut candidates: Vec<(u64, Digest)> = index
            .slots
            .iter()
            .filter(|(_, s)| s.is_evictable())
            .map(|(d, s)| (s.access_seq, d.clone()))
            .collect();
        candidates.sort_unstable_by_key(|(seq, _)| *seq);

        let mut victims = Vec::new();
        for (_, digest) in candidates {
            if live <= budget {
                break;
            }
            if let Some(slot) = index.slots.get_mut(&digest) {
                slot.state = EntryState::Evicted;
                index.evicting_bytes += slot.size;
                live -= slot.size;
                victims.push((digest, slot.size));
            }
        }
        victims
    }

    /// Evicts enough to admit a write of `expected_size` alongside current
    /// reservations.
    pub async fn make_room(&self, expected_size: u64) -> Result<EvictionReport, CacheError> {
        let budget = self.budget();
        let reserved = self.inner.index.lock().reserved_bytes;
        let required = reserved + expected_size;
        if required > budget {
            return Err(CacheError::BudgetExceeded { required, budget });
        }
        self.evict(budget - required).await
    }

    async fn evict_eagerly(&self) {
        let EvictionMode::Eager {
            high_water,
            low_water,
        } = self.inner.config.eviction
        else {
            return;
        };
        let budget = self.budget() as f64;
        let stored = self.inner.index.lock().live_bytes();
        if (stored as f64) <= budget * high_water {
            return;
        }
        let target = (budget * low_water) as u64;
        if let Err(e) = self.evict(target).await {
            debug!(error = %e, target, "Eager eviction fell short of low water mark");
        }
    }

    /// Writes the index to disk.
    pub async fn flush(&self) -> Result<(), CacheError> {
        self.persist().await
    }

    async fn persist(&self) -> Result<(), CacheError> {
        let _guard = self.inner.persist.lock().await;
        let records = self.inner.index.lock().records();
        let layout = self.inner.layout.clone();
        tokio::task::spawn_blocking(move || index::save(&layout, records))
            .await
            .map_err(|e| io::Error::other(e.to_string()))?
    }

    /// Resolves the next time an entry is released, published, aborted or
    /// evicted. Call `enable` on the returned future before re-checking
    /// state to avoid missing a wakeup.
    pub fn changed(&self) -> Notified<'_> {
        self.inner.changed.notified()
    }

    pub fn usage(&self) -> CacheUsage {
        let index = self.inner.index.lock();
        CacheUsage {
            stored_bytes: index.stored_bytes,
            reserved_bytes: index.reserved_bytes,
            budget_bytes: self.inner.config.budget_bytes,
            entries: index.slots.len(),
        }
    }

    /// Snapshot of every entry, least recently used first.
    pub fn entries(&self) -> Vec<CacheEntry> {
        let index = self.inner.index.lock();
        let mut slots: Vec<_> = index.slots.iter().collect();
        slots.sort_by_key(|(_, s)| s.access_seq);
        slots.into_iter().map(|(d, s)| s.snapshot(d)).collect()
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        let s = &self.inner.stats;
        CacheStatsSnapshot {
            hits: s.hits.load(Ordering::Relaxed),
            misses: s.misses.load(Ordering::Relaxed),
            commits: s.commits.load(Ordering::Relaxed),
            aborts: s.aborts.load(Ordering::Relaxed),
            integrity_failures: s.integrity_failures.load(Ordering::Relaxed),
            evictions: s.evictions.load(Ordering::Relaxed),
            evicted_bytes: s.evicted_bytes.load(Ordering::Relaxed),
        }
    }
}

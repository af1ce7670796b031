//! Cache entries and their lifecycle states.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::image::Digest;

/// Lifecycle state of a cached blob.
///
/// ```text
/// Pending -> Downloading -> Ready -> Evicted -> (reclaimed)
///    \            \
///     +------------+--> Failed / (absent)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    /// A writer was admitted but no bytes have landed yet.
    Pending,
    /// Bytes are streaming into the staging area.
    Downloading,
    /// Verified and published.
    Ready,
    /// Given up on after repeated aborts.
    Failed,
    /// Selected for eviction; the file is being removed.
    Evicted,
}

impl EntryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryState::Pending => "pending",
            EntryState::Downloading => "downloading",
            EntryState::Ready => "ready",
            EntryState::Failed => "failed",
            EntryState::Evicted => "evicted",
        }
    }

    /// Returns true while a writer owns the entry.
    pub fn is_in_progress(&self) -> bool {
        matches!(self, EntryState::Pending | EntryState::Downloading)
    }
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of one entry, as returned by `CacheStore::lookup`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheEntry {
    pub digest: Digest,
    pub size: u64,
    pub state: EntryState,
    pub refcount: u32,
    pub last_access: DateTime<Utc>,
}

/// Index-internal record. Only the store mutates these.
#[derive(Debug, Clone)]
pub(crate) struct Slot {
    pub size: u64,
    pub state: EntryState,
    pub refcount: u32,
    pub last_access: DateTime<Utc>,
    /// Monotonic access order; the eviction key.
    pub access_seq: u64,
    /// Id of the writer holding this digest, if any.
    pub writer: Option<u64>,
}

impl Slot {
    pub fn snapshot(&self, digest: &Digest) -> CacheEntry {
        CacheEntry {
            digest: digest.clone(),
            size: self.size,
            state: self.state,
            refcount: self.refcount,
            last_access: self.last_access,
        }
    }

    pub fn is_evictable(&self) -> bool {
        self.state == EntryState::Ready && self.refcount == 0 && self.writer.is_none()
    }
}

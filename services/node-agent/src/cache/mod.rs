//! Content-addressable layer cache.
//!
//! Blobs are stored under a path derived from their digest and tracked by an
//! in-memory index that is persisted to `index.json`. All mutation goes
//! through [`CacheStore`]: writers stage bytes, the store verifies and
//! publishes them, and readers pin entries with [`CacheHandle`]s so that
//! eviction never removes anything in use.

mod entry;
mod index;
mod store;
mod writer;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::image::Digest;

pub use entry::{CacheEntry, EntryState};
pub use store::{
    AbortReason, CacheHandle, CacheStatsSnapshot, CacheStore, CacheUsage, EvictionReport,
};
pub use writer::BlobWriter;

/// When eviction runs.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum EvictionMode {
    /// Only when an admission would exceed the budget.
    #[default]
    Lazy,
    /// Also after each commit once usage passes `high_water` (a fraction of
    /// the budget), down to `low_water`.
    Eager { high_water: f64, low_water: f64 },
}

impl fmt::Display for EvictionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvictionMode::Lazy => f.write_str("lazy"),
            EvictionMode::Eager {
                high_water,
                low_water,
            } => write!(f, "eager:{high_water}:{low_water}"),
        }
    }
}

impl FromStr for EvictionMode {
    type Err = String;

    /// Parses `lazy` or `eager:<high>:<low>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("lazy") {
            return Ok(EvictionMode::Lazy);
        }
        let mut parts = s.split(':');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(mode), Some(high), Some(low), None) if mode.eq_ignore_ascii_case("eager") => {
                let high_water: f64 = high
                    .parse()
                    .map_err(|_| format!("invalid high water mark {high:?}"))?;
                let low_water: f64 = low
                    .parse()
                    .map_err(|_| format!("invalid low water mark {low:?}"))?;
                if !(0.0 < low_water && low_water <= high_water && high_water <= 1.0) {
                    return Err(format!(
                        "water marks must satisfy 0 < low <= high <= 1, got {low_water} and {high_water}"
                    ));
                }
                Ok(EvictionMode::Eager {
                    high_water,
                    low_water,
                })
            }
            _ => Err(format!("unknown eviction mode {s:?}")),
        }
    }
}

/// Configuration for the cache store.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Root directory of the on-disk layout.
    pub root: PathBuf,
    /// Maximum bytes of stored plus reserved blobs.
    pub budget_bytes: u64,
    pub eviction: EvictionMode,
    /// Aborts of the same digest before its entry is left Failed.
    pub max_aborts: u32,
    /// How long an idle Failed entry is kept before it may be dropped.
    /// Failed entries live in memory only.
    pub failed_ttl: Duration,
    /// Rehash every indexed blob on open instead of only checking sizes.
    pub verify_on_open: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/lib/layercast/cache"),
            budget_bytes: 20 * 1024 * 1024 * 1024, // 20 GiB
            eviction: EvictionMode::Lazy,
            max_aborts: 3,
            failed_ttl: Duration::from_secs(300),
            verify_on_open: false,
        }
    }
}

/// Errors from the cache store.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Another writer holds this digest.
    #[error("write already in progress for {0}")]
    AlreadyInProgress(Digest),

    /// The blob is already published; acquire it instead.
    #[error("{0} is already cached")]
    AlreadyCached(Digest),

    /// Admitting the write (or meeting an eviction target) would exceed the
    /// budget and nothing else can be evicted.
    #[error("cache budget exceeded: {required} bytes required, budget is {budget}")]
    BudgetExceeded { required: u64, budget: u64 },

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: Digest, actual: Digest },

    #[error("size mismatch for {digest}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        digest: Digest,
        expected: u64,
        actual: u64,
    },

    /// The writer's claim on the digest is gone.
    #[error("writer for {0} no longer owns the entry")]
    StaleWriter(Digest),

    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache index error: {0}")]
    Index(#[from] serde_json::Error),
}

impl CacheError {
    /// Returns true for failures that invalidate the downloaded bytes.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            CacheError::DigestMismatch { .. } | CacheError::SizeMismatch { .. }
        )
    }
}

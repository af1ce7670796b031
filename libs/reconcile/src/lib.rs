//! Convergence primitives shared by the node coordinator and the cluster
//! scheduler.
//!
//! A pull job converges when every layer it needs is resident in the node's
//! cache. A campaign converges when every job assigned to it has converged.
//! Both levels use the same [`JobState`] vocabulary and the same worst-case
//! aggregation rule:
//!
//! - Anything still moving keeps the aggregate non-terminal.
//! - `Ready` requires every member to be `Ready`.
//! - A mix of `Ready` and failed members is a `PartialFailure`.
//! - Nothing `Ready` and something failed is `Failed`.
//!
//! # Invariants
//!
//! - Aggregation never reports `Ready` while any member is not `Ready`.
//! - Failed members are never dropped from the counts.

use serde::{Deserialize, Serialize};

/// Overall state of a pull job (or of a campaign, by aggregation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Accepted but no work started.
    Queued,
    /// Work is underway.
    InProgress,
    /// Terminal: some members failed, others are ready.
    PartialFailure,
    /// Terminal: every member is ready.
    Ready,
    /// Terminal: nothing is ready and at least one member failed.
    Failed,
}

impl JobState {
    /// Returns true for `Ready`, `PartialFailure` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready | Self::PartialFailure | Self::Failed)
    }

    /// Returns true if some member failed.
    pub fn has_failures(&self) -> bool {
        matches!(self, Self::PartialFailure | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::PartialFailure => "partial_failure",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-layer progress counts for one pull job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerProgress {
    /// Submitted, waiting for a fetch slot.
    pub pending: u32,
    /// Currently downloading or verifying.
    pub in_flight: u32,
    /// Resident and verified.
    pub ready: u32,
    /// Terminally failed.
    pub failed: u32,
}

impl LayerProgress {
    /// Total layers tracked.
    pub fn total(&self) -> u32 {
        self.pending + self.in_flight + self.ready + self.failed
    }

    /// Layers that have not reached a terminal state.
    pub fn outstanding(&self) -> u32 {
        self.pending + self.in_flight
    }

    /// Moves one layer from pending to in-flight.
    pub fn start(&mut self) {
        if self.pending > 0 {
            self.pending -= 1;
            self.in_flight += 1;
        }
    }

    /// Moves one outstanding layer to ready.
    pub fn complete(&mut self) {
        self.take_outstanding();
        self.ready += 1;
    }

    /// Moves one outstanding layer to failed.
    pub fn fail(&mut self) {
        self.take_outstanding();
        self.failed += 1;
    }

    fn take_outstanding(&mut self) {
        if self.in_flight > 0 {
            self.in_flight -= 1;
        } else {
            self.pending = self.pending.saturating_sub(1);
        }
    }

    /// Derives the job state from the counts.
    ///
    /// `extra_failures` counts failures that are not layers, such as an image
    /// whose manifest could not be resolved.
    pub fn state(&self, extra_failures: u32) -> JobState {
        if self.outstanding() > 0 {
            return if self.in_flight == 0 && self.ready == 0 && self.failed == 0 {
                JobState::Queued
            } else {
                JobState::InProgress
            };
        }
        let failed = self.failed + extra_failures;
        match (self.ready, failed) {
            (_, 0) => JobState::Ready,
            (0, _) => JobState::Failed,
            _ => JobState::PartialFailure,
        }
    }
}

/// Aggregates member states into a worst-case state.
///
/// An empty set is `Ready`: there is nothing left to converge.
pub fn aggregate<I>(states: I) -> JobState
where
    I: IntoIterator<Item = JobState>,
{
    let mut seen_any = false;
    let mut all_queued = true;
    let mut any_open = false;
    let mut ready = 0usize;
    let mut failed = 0usize;
    let mut partial = 0usize;

    for state in states {
        seen_any = true;
        if state != JobState::Queued {
            all_queued = false;
        }
        match state {
            JobState::Queued | JobState::InProgress => any_open = true,
            JobState::Ready => ready += 1,
            JobState::Failed => failed += 1,
            JobState::PartialFailure => partial += 1,
        }
    }

    if !seen_any {
        return JobState::Ready;
    }
    if any_open {
        return if all_queued {
            JobState::Queued
        } else {
            JobState::InProgress
        };
    }
    if failed == 0 && partial == 0 {
        JobState::Ready
    } else if ready == 0 && partial == 0 {
        JobState::Failed
    } else {
        JobState::PartialFailure
    }
}

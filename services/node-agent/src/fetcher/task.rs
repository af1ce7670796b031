//! Download tasks and their state machine.
//!
//! ```text
//! Queued -> Downloading -> Verifying -> Ready
//!   ^            |             |
//!   +-- retry ---+-------------+
//!                |             |
//!                +--> Failed <-+
//! ```
//!
//! `Queued` is initial; `Ready` and `Failed` are terminal. A task may also
//! fail straight from `Queued` when its deadline passes while it waits.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::image::{Digest, ImageReference, LayerDescriptor};

/// Scheduling priority. Higher runs first; ties run in arrival order.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
        })
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            other => Err(format!("unknown priority {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Downloading,
    Verifying,
    Ready,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Ready | TaskState::Failed)
    }

    /// Whether `self -> to` is an edge of the state machine.
    pub fn can_transition_to(&self, to: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, to),
            (Queued, Downloading)
                | (Queued, Failed)
                | (Downloading, Verifying)
                | (Downloading, Queued)
                | (Downloading, Failed)
                | (Verifying, Ready)
                | (Verifying, Queued)
                | (Verifying, Failed)
        )
    }
}

/// Error for an edge that is not in the state machine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid download task transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: TaskState,
    pub to: TaskState,
}

/// One layer download, owned by the fetcher pool until it is terminal.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    /// Image the layer was requested for; decides the repository to fetch from.
    pub source: ImageReference,
    pub layer: LayerDescriptor,
    pub priority: Priority,
    state: TaskState,
    /// Attempts started so far.
    pub attempts: u32,
    /// When the next attempt may start, while waiting out a backoff.
    pub next_retry_at: Option<Instant>,
    /// Bytes received from the network across all attempts.
    pub bytes_transferred: u64,
    pub created_at: Instant,
}

impl DownloadTask {
    pub fn new(source: ImageReference, layer: LayerDescriptor, priority: Priority) -> Self {
        Self {
            source,
            layer,
            priority,
            state: TaskState::Queued,
            attempts: 0,
            next_retry_at: None,
            bytes_transferred: 0,
            created_at: Instant::now(),
        }
    }

    pub fn digest(&self) -> &Digest {
        &self.layer.digest
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn transition(&mut self, to: TaskState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(to) {
            return Err(InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        if to != TaskState::Queued {
            self.next_retry_at = None;
        }
        Ok(())
    }

    /// Starts a new attempt.
    pub fn begin_attempt(&mut self) -> Result<u32, InvalidTransition> {
        self.transition(TaskState::Downloading)?;
        self.attempts += 1;
        Ok(self.attempts)
    }

    /// Requeues after a failed attempt, to run again at `at`.
    pub fn schedule_retry(&mut self, at: Instant) -> Result<(), InvalidTransition> {
        self.transition(TaskState::Queued)?;
        self.next_retry_at = Some(at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn task() -> DownloadTask {
        let digest = Digest::sha256_of(b"layer");
        DownloadTask::new(
            ImageReference::parse("app:v1").unwrap(),
            LayerDescriptor::new(digest, 5, "application/octet-stream"),
            Priority::Normal,
        )
    }

    #[test]
    fn test_happy_path() {
        let mut task = task();
        assert_eq!(task.state(), TaskState::Queued);
        assert_eq!(task.begin_attempt().unwrap(), 1);
        task.transition(TaskState::Verifying).unwrap();
        task.transition(TaskState::Ready).unwrap();
        assert!(task.state().is_terminal());
    }

    #[test]
    fn test_retry_loop_counts_attempts() {
        let mut task = task();
        task.begin_attempt().unwrap();
        task.schedule_retry(Instant::now()).unwrap();
        assert!(task.next_retry_at.is_some());
        assert_eq!(task.begin_attempt().unwrap(), 2);
        assert!(task.next_retry_at.is_none());
        task.transition(TaskState::Verifying).unwrap();
        task.schedule_retry(Instant::now()).unwrap();
        assert_eq!(task.begin_attempt().unwrap(), 3);
        task.transition(TaskState::Failed).unwrap();
    }

    #[rstest]
    #[case(TaskState::Queued, TaskState::Ready)]
    #[case(TaskState::Queued, TaskState::Verifying)]
    #[case(TaskState::Ready, TaskState::Queued)]
    #[case(TaskState::Failed, TaskState::Downloading)]
    #[case(TaskState::Downloading, TaskState::Ready)]
    fn test_rejects_invalid_edges(#[case] from: TaskState, #[case] to: TaskState) {
        assert!(!from.can_transition_to(to));
    }

    #[test]
    fn test_priority_orders_high_first() {
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert!("urgent".parse::<Priority>().is_err());
    }
}

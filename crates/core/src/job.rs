//! Job type and status vocabulary, including the status state machine.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// Kind of work a job represents. Each type has its own worker pool.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    /// List recent items of a community and enqueue mirror jobs for new ones.
    Discovery,
    /// Mirror (or re-sync) one source item.
    MirrorItem,
    /// Mirror the reply thread of an already-mirrored item.
    MirrorReplies,
}

impl JobType {
    pub const ALL: [JobType; 3] = [JobType::Discovery, JobType::MirrorItem, JobType::MirrorReplies];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Discovery => "discovery",
            JobType::MirrorItem => "mirror-item",
            JobType::MirrorReplies => "mirror-replies",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().replace('_', "-");
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(&normalized))
            .ok_or_else(|| ParseError::new("job type", s))
    }
}

/// Persisted status of a job.
///
/// ```text
/// queued ──┐
///          ├─> in_progress ──> done | failed | skipped
/// retrying ┘        │
///                   └──> retrying (backoff) | queued (released / reclaimed)
/// ```
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    InProgress,
    Done,
    Failed,
    Skipped,
    Retrying,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Queued,
        JobStatus::InProgress,
        JobStatus::Done,
        JobStatus::Failed,
        JobStatus::Skipped,
        JobStatus::Retrying,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::InProgress => "in_progress",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
            JobStatus::Skipped => "skipped",
            JobStatus::Retrying => "retrying",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed | JobStatus::Skipped)
    }

    /// Statuses the dispatcher may claim.
    pub fn is_dispatchable(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Retrying)
    }

    /// Whether the pipeline may move a job from `self` to `next`.
    ///
    /// Operator requeue of failed jobs bypasses this table.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match self {
            Queued | Retrying => next == InProgress,
            InProgress => matches!(next, Done | Failed | Skipped | Retrying | Queued),
            Done | Failed | Skipped => false,
        }
    }

    /// All statuses from which `next` is reachable in one step.
    pub fn predecessors(next: JobStatus) -> Vec<JobStatus> {
        JobStatus::ALL
            .into_iter()
            .filter(|from| from.can_transition_to(next))
            .collect()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().replace('-', "_");
        JobStatus::ALL
            .into_iter()
            .find(|st| st.as_str().eq_ignore_ascii_case(&normalized))
            .ok_or_else(|| ParseError::new("job status", s))
    }
}

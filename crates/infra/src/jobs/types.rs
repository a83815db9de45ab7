//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use mirrorline_core::{DestinationId, MirrorError, PlatformPair, SourceId};

pub use mirrorline_core::{JobId, JobStatus, JobType};

/// Retry budget applied when the enqueuer does not choose one.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// A persisted unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: JobType,
    /// Opaque JSON payload, interpreted by the handler for `job_type`.
    pub payload: serde_json::Value,
    pub status: JobStatus,
    /// Number of times the job has been rescheduled after a failure.
    pub retries: u32,
    pub max_retries: u32,
    /// Earliest time the job may run.
    pub next_run: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Most recent failure or skip reason.
    pub last_error: Option<String>,
    pub dedup_key: Option<String>,
    /// Dispatcher instance that last claimed the job.
    pub claimed_by: Option<String>,
}

impl Job {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_run <= now
    }

    pub fn retries_exhausted(&self) -> bool {
        self.retries >= self.max_retries
    }

    /// Deserialize the payload into the handler's typed shape.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// A job that has not been persisted yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub job_type: JobType,
    pub payload: serde_json::Value,
    pub max_retries: u32,
    /// `None` means "due immediately".
    pub next_run: Option<DateTime<Utc>>,
}

impl NewJob {
    pub fn new(job_type: JobType, payload: serde_json::Value) -> Self {
        Self {
            job_type,
            payload,
            max_retries: DEFAULT_MAX_RETRIES,
            next_run: None,
        }
    }

    /// Build a job from a typed payload.
    pub fn typed<P: Serialize>(job_type: JobType, payload: &P) -> Result<Self, serde_json::Error> {
        Ok(Self::new(job_type, serde_json::to_value(payload)?))
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_run = Some(at);
        self
    }
}

/// Exponential backoff with a cap and proportional jitter.
///
/// The deterministic delay for the n-th retry is `unit * base^n`, capped at
/// `max_delay`. Jitter adds up to `jitter * delay` on top, capped again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base: u32,
    pub unit: Duration,
    pub max_delay: Duration,
    /// Jitter factor (0.0-1.0).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: 2,
            unit: Duration::from_secs(1),
            max_delay: Duration::from_secs(30 * 60),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Policy without randomness, for tests and deterministic tooling.
    pub fn deterministic(base: u32, unit: Duration, max_delay: Duration) -> Self {
        Self {
            base,
            unit,
            max_delay,
            jitter: 0.0,
        }
    }

    /// Deterministic delay before the `retries`-th retry.
    pub fn delay_for(&self, retries: u32) -> Duration {
        let factor = u128::from(self.base.max(1)).saturating_pow(retries);
        let ms = self
            .unit
            .as_millis()
            .saturating_mul(factor)
            .min(self.max_delay.as_millis());
        Duration::from_millis(u64::try_from(ms).unwrap_or(u64::MAX))
    }

    /// Add jitter to `delay` using the supplied random source.
    pub fn jittered<R: Rng + ?Sized>(&self, delay: Duration, rng: &mut R) -> Duration {
        let factor = self.jitter.clamp(0.0, 1.0);
        if factor == 0.0 || delay.is_zero() {
            return delay;
        }
        let extra = delay.mul_f64(rng.gen_range(0.0..=factor));
        delay.saturating_add(extra).min(self.max_delay.max(delay))
    }

    /// Delay before the `retries`-th retry, jittered and raised to at least
    /// the collaborator's `retry_after` hint. The hint is capped at
    /// `max_delay` like the computed delay.
    pub fn backoff(&self, retries: u32, retry_after: Option<Duration>) -> Duration {
        let delay = self.jittered(self.delay_for(retries), &mut rand::thread_rng());
        match retry_after {
            Some(hint) => delay.max(hint.min(self.max_delay)),
            None => delay,
        }
    }
}

/// Structured result of running a job handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Done,
    /// Transient failure; reschedule with backoff unless retries are exhausted.
    Retry {
        error: String,
        retry_after: Option<Duration>,
    },
    /// Permanent failure, never retried.
    Fail(String),
    /// Expected, non-retryable condition (e.g. the source item is gone).
    Skip(String),
}

impl JobOutcome {
    pub fn retry(error: impl Into<String>) -> Self {
        Self::Retry {
            error: error.into(),
            retry_after: None,
        }
    }
}

impl From<MirrorError> for JobOutcome {
    fn from(err: MirrorError) -> Self {
        let message = err.to_string();
        match err {
            MirrorError::Transient { retry_after, .. } => JobOutcome::Retry {
                error: message,
                retry_after,
            },
            // The credential broker already refreshed and retried once.
            MirrorError::Unauthorized(_) => JobOutcome::retry(message),
            MirrorError::Permanent(_) => JobOutcome::Fail(message),
            MirrorError::Absent(_) => JobOutcome::Skip(message),
        }
    }
}

/// Result of an enqueue request that may be short-circuited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued(JobId),
    /// A non-terminal job with the same dedup key already exists.
    Existing(JobId),
    /// The source item is in the ignored set; nothing was enqueued.
    Ignored,
}

impl EnqueueOutcome {
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            EnqueueOutcome::Enqueued(id) | EnqueueOutcome::Existing(id) => Some(*id),
            EnqueueOutcome::Ignored => None,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, EnqueueOutcome::Enqueued(_))
    }
}

/// Job counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub queued: u64,
    pub in_progress: u64,
    pub done: u64,
    pub failed: u64,
    pub skipped: u64,
    pub retrying: u64,
}

impl JobStats {
    pub fn add(&mut self, status: JobStatus, count: u64) {
        let slot = match status {
            JobStatus::Queued => &mut self.queued,
            JobStatus::InProgress => &mut self.in_progress,
            JobStatus::Done => &mut self.done,
            JobStatus::Failed => &mut self.failed,
            JobStatus::Skipped => &mut self.skipped,
            JobStatus::Retrying => &mut self.retrying,
        };
        *slot += count;
    }

    pub fn get(&self, status: JobStatus) -> u64 {
        match status {
            JobStatus::Queued => self.queued,
            JobStatus::InProgress => self.in_progress,
            JobStatus::Done => self.done,
            JobStatus::Failed => self.failed,
            JobStatus::Skipped => self.skipped,
            JobStatus::Retrying => self.retrying,
        }
    }

    pub fn total(&self) -> u64 {
        JobStatus::ALL.iter().map(|s| self.get(*s)).sum()
    }
}

/// Filter for operator listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub job_type: Option<JobType>,
    pub limit: usize,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            status: None,
            job_type: None,
            limit: 100,
        }
    }
}

impl JobFilter {
    pub fn matches(&self, job: &Job) -> bool {
        self.status.is_none_or(|s| s == job.status)
            && self.job_type.is_none_or(|t| t == job.job_type)
    }
}

/// Payload of a `mirror-item` job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorItemPayload {
    #[serde(default)]
    pub pair: PlatformPair,
    pub source_id: SourceId,
    /// Update an already-mirrored item instead of skipping it.
    #[serde(default)]
    pub resync: bool,
}

impl MirrorItemPayload {
    pub fn new(pair: PlatformPair, source_id: SourceId) -> Self {
        Self {
            pair,
            source_id,
            resync: false,
        }
    }
}

/// Payload of a `mirror-replies` job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorRepliesPayload {
    #[serde(default)]
    pub pair: PlatformPair,
    pub source_id: SourceId,
    /// Destination item the replies hang off. Looked up in the mapping cache
    /// when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_id: Option<DestinationId>,
}

impl MirrorRepliesPayload {
    /// Key used to keep at most one live replies job per item.
    pub fn dedup_key(&self) -> String {
        format!("{}:{}", self.pair, self.source_id)
    }
}

fn default_discovery_limit() -> usize {
    25
}

/// Payload of a `discovery` job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryPayload {
    #[serde(default)]
    pub pair: PlatformPair,
    pub community: String,
    #[serde(default = "default_discovery_limit")]
    pub limit: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::mock::StepRng;

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = RetryPolicy::deterministic(2, Duration::from_millis(100), Duration::from_secs(10));

        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(40), Duration::from_secs(10));
    }

    #[test]
    fn retry_hint_raises_delay() {
        let policy = RetryPolicy::deterministic(2, Duration::from_millis(10), Duration::from_secs(60));
        assert_eq!(
            policy.backoff(1, Some(Duration::from_secs(30))),
            Duration::from_secs(30)
        );
        assert_eq!(policy.backoff(1, None), Duration::from_millis(20));
    }

    #[test]
    fn retry_hint_is_capped_at_max_delay() {
        let policy = RetryPolicy::deterministic(2, Duration::from_millis(10), Duration::from_secs(60));
        assert_eq!(
            policy.backoff(1, Some(Duration::from_secs(u64::MAX))),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn mirror_errors_map_to_outcomes() {
        assert!(matches!(
            JobOutcome::from(MirrorError::transient_after("429", Duration::from_secs(3))),
            JobOutcome::Retry { retry_after: Some(d), .. } if d == Duration::from_secs(3)
        ));
        assert!(matches!(
            JobOutcome::from(MirrorError::unauthorized("401")),
            JobOutcome::Retry { .. }
        ));
        assert!(matches!(
            JobOutcome::from(MirrorError::permanent("bad title")),
            JobOutcome::Fail(_)
        ));
        assert!(matches!(
            JobOutcome::from(MirrorError::absent("removed")),
            JobOutcome::Skip(_)
        ));
    }

    #[test]
    fn mirror_item_payload_defaults_pair_and_resync() {
        let payload: MirrorItemPayload =
            serde_json::from_value(serde_json::json!({"source_id": "p1"})).unwrap();
        assert_eq!(payload.pair, PlatformPair::default());
        assert_eq!(payload.source_id, SourceId::new("p1"));
        assert!(!payload.resync);
    }

    #[test]
    fn stats_total_sums_all_statuses() {
        let mut stats = JobStats::default();
        stats.add(JobStatus::Queued, 3);
        stats.add(JobStatus::Failed, 2);
        assert_eq!(stats.total(), 5);
        assert_eq!(stats.get(JobStatus::Failed), 2);
    }

    proptest! {
        #[test]
        fn backoff_is_monotonic_and_capped(
            base in 1u32..6,
            unit_ms in 1u64..5_000,
            cap_ms in 1u64..600_000,
            retries in 0u32..64,
        ) {
            let policy = RetryPolicy::deterministic(
                base,
                Duration::from_millis(unit_ms),
                Duration::from_millis(cap_ms),
            );
            let cap = Duration::from_millis(cap_ms);
            prop_assert!(policy.delay_for(retries) <= policy.delay_for(retries + 1));
            prop_assert!(policy.delay_for(retries) <= cap);
        }

        #[test]
        fn jitter_stays_within_bounds(
            delay_ms in 1u64..100_000,
            jitter in 0.0f64..1.0,
            seed in any::<u64>(),
        ) {
            let policy = RetryPolicy {
                base: 2,
                unit: Duration::from_millis(1),
                max_delay: Duration::from_secs(3_600),
                jitter,
            };
            let delay = Duration::from_millis(delay_ms);
            let mut rng = StepRng::new(seed, 0x9E37_79B9_7F4A_7C15);
            let jittered = policy.jittered(delay, &mut rng);
            prop_assert!(jittered >= delay);
            prop_assert!(jittered <= delay.mul_f64(1.0 + jitter) + Duration::from_millis(1));
        }
    }
}

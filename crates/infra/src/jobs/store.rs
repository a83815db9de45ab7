//! Job storage abstraction and the in-memory implementation.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::db::{before, now};

use super::types::{
    EnqueueOutcome, Job, JobFilter, JobId, JobStats, JobStatus, JobType, NewJob,
};

/// Field updates applied together with a status transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusChange {
    pub next_run: Option<DateTime<Utc>>,
    pub retries: Option<u32>,
    pub last_error: Option<String>,
}

/// Durable queue state. The single source of truth for every job.
///
/// Only [`JobStore::transition`] changes a job's status on behalf of the
/// pipeline; the typed helpers (`complete`, `reschedule`, ...) are thin
/// wrappers around it, so every implementation enforces the same state
/// machine.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new `queued` job. Durable once this returns.
    async fn enqueue(&self, job: NewJob) -> Result<JobId, JobStoreError>;

    /// Enqueue unless a non-terminal job of the same type already carries
    /// `dedup_key`.
    async fn enqueue_unique(
        &self,
        job: NewJob,
        dedup_key: &str,
    ) -> Result<EnqueueOutcome, JobStoreError>;

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Dispatchable jobs of `job_type` with `next_run <= now`. Read only.
    async fn fetch_due(&self, job_type: JobType, now: DateTime<Utc>)
    -> Result<Vec<Job>, JobStoreError>;

    /// Select up to `limit` dispatchable jobs due before `horizon` and flip
    /// them to `in_progress` in one atomic step. Ordered by `(next_run, id)`.
    async fn claim_due(
        &self,
        job_type: JobType,
        horizon: DateTime<Utc>,
        limit: usize,
        claimed_by: &str,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Move `id` to `to`, validated against the job state machine.
    async fn transition(
        &self,
        id: JobId,
        to: JobStatus,
        change: StatusChange,
    ) -> Result<Job, JobStoreError>;

    /// Refresh `updated_at` of an `in_progress` job. Returns `false` when the
    /// job is no longer in progress.
    async fn heartbeat(&self, id: JobId) -> Result<bool, JobStoreError>;

    /// Return `in_progress` jobs untouched for longer than `grace` to
    /// `queued`.
    async fn reclaim_stale(&self, grace: Duration) -> Result<u64, JobStoreError>;

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError>;

    async fn stats(&self) -> Result<JobStats, JobStoreError>;

    /// Operator action: move `failed` jobs back to `queued` with a fresh
    /// retry budget.
    async fn requeue_failed(&self, job_type: Option<JobType>) -> Result<u64, JobStoreError>;

    async fn set_status(
        &self,
        id: JobId,
        status: JobStatus,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<(), JobStoreError> {
        self.transition(
            id,
            status,
            StatusChange {
                next_run,
                ..StatusChange::default()
            },
        )
        .await
        .map(|_| ())
    }

    async fn complete(&self, id: JobId) -> Result<Job, JobStoreError> {
        self.transition(id, JobStatus::Done, StatusChange::default())
            .await
    }

    async fn reschedule(
        &self,
        id: JobId,
        retries: u32,
        next_run: DateTime<Utc>,
        error: &str,
    ) -> Result<Job, JobStoreError> {
        self.transition(
            id,
            JobStatus::Retrying,
            StatusChange {
                next_run: Some(next_run),
                retries: Some(retries),
                last_error: Some(error.to_owned()),
            },
        )
        .await
    }

    async fn fail(&self, id: JobId, error: &str) -> Result<Job, JobStoreError> {
        self.transition(
            id,
            JobStatus::Failed,
            StatusChange {
                last_error: Some(error.to_owned()),
                ..StatusChange::default()
            },
        )
        .await
    }

    async fn skip(&self, id: JobId, reason: &str) -> Result<Job, JobStoreError> {
        self.transition(
            id,
            JobStatus::Skipped,
            StatusChange {
                last_error: Some(reason.to_owned()),
                ..StatusChange::default()
            },
        )
        .await
    }

    /// Hand a claimed job back to the queue without counting a retry.
    async fn release(&self, id: JobId) -> Result<Job, JobStoreError> {
        self.transition(id, JobStatus::Queued, StatusChange::default())
            .await
    }
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job {id}: illegal transition {from} -> {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("corrupt job row: {0}")]
    Corrupt(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<sqlx::Error> for JobStoreError {
    fn from(err: sqlx::Error) -> Self {
        JobStoreError::Storage(err.to_string())
    }
}

impl From<JobStoreError> for mirrorline_core::MirrorError {
    fn from(err: JobStoreError) -> Self {
        mirrorline_core::MirrorError::transient(err.to_string())
    }
}

#[derive(Debug, Default)]
struct State {
    last_id: i64,
    jobs: BTreeMap<JobId, Job>,
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    state: RwLock<State>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, JobStoreError> {
        self.state
            .read()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, JobStoreError> {
        self.state
            .write()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".into()))
    }

    fn insert(state: &mut State, job: NewJob, dedup_key: Option<&str>) -> JobId {
        state.last_id += 1;
        let id = JobId::new(state.last_id);
        let at = now();
        state.jobs.insert(
            id,
            Job {
                id,
                job_type: job.job_type,
                payload: job.payload,
                status: JobStatus::Queued,
                retries: 0,
                max_retries: job.max_retries,
                next_run: job.next_run.unwrap_or(at),
                created_at: at,
                updated_at: at,
                last_error: None,
                dedup_key: dedup_key.map(str::to_owned),
                claimed_by: None,
            },
        );
        id
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, job: NewJob) -> Result<JobId, JobStoreError> {
        let mut state = self.write()?;
        Ok(Self::insert(&mut state, job, None))
    }

    async fn enqueue_unique(
        &self,
        job: NewJob,
        dedup_key: &str,
    ) -> Result<EnqueueOutcome, JobStoreError> {
        let mut state = self.write()?;
        let existing = state.jobs.values().find(|j| {
            j.job_type == job.job_type
                && !j.status.is_terminal()
                && j.dedup_key.as_deref() == Some(dedup_key)
        });
        if let Some(existing) = existing {
            return Ok(EnqueueOutcome::Existing(existing.id));
        }
        Ok(EnqueueOutcome::Enqueued(Self::insert(
            &mut state,
            job,
            Some(dedup_key),
        )))
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.read()?.jobs.get(&id).cloned())
    }

    async fn fetch_due(
        &self,
        job_type: JobType,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError> {
        let state = self.read()?;
        let mut due: Vec<_> = state
            .jobs
            .values()
            .filter(|j| j.job_type == job_type && j.status.is_dispatchable() && j.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|j| (j.next_run, j.id));
        Ok(due)
    }

    async fn claim_due(
        &self,
        job_type: JobType,
        horizon: DateTime<Utc>,
        limit: usize,
        claimed_by: &str,
    ) -> Result<Vec<Job>, JobStoreError> {
        let mut state = self.write()?;
        let mut candidates: Vec<_> = state
            .jobs
            .values()
            .filter(|j| {
                j.job_type == job_type && j.status.is_dispatchable() && j.is_due(horizon)
            })
            .map(|j| (j.next_run, j.id))
            .collect();
        candidates.sort();
        candidates.truncate(limit);

        let at = now();
        let mut claimed = Vec::with_capacity(candidates.len());
        for (_, id) in candidates {
            if let Some(job) = state.jobs.get_mut(&id) {
                job.status = JobStatus::InProgress;
                job.updated_at = at;
                job.claimed_by = Some(claimed_by.to_owned());
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn transition(
        &self,
        id: JobId,
        to: JobStatus,
        change: StatusChange,
    ) -> Result<Job, JobStoreError> {
        let mut state = self.write()?;
        let job = state.jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        if !job.status.can_transition_to(to) {
            return Err(JobStoreError::InvalidTransition {
                id,
                from: job.status,
                to,
            });
        }

        job.status = to;
        job.updated_at = now();
        if let Some(next_run) = change.next_run {
            job.next_run = next_run;
        }
        if let Some(retries) = change.retries {
            job.retries = retries;
        }
        if change.last_error.is_some() {
            job.last_error = change.last_error;
        }
        if to.is_dispatchable() {
            job.claimed_by = None;
        }
        Ok(job.clone())
    }

    async fn heartbeat(&self, id: JobId) -> Result<bool, JobStoreError> {
        let mut state = self.write()?;
        let job = state.jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        if job.status != JobStatus::InProgress {
            return Ok(false);
        }
        job.updated_at = now();
        Ok(true)
    }

    async fn reclaim_stale(&self, grace: Duration) -> Result<u64, JobStoreError> {
        let mut state = self.write()?;
        let at = now();
        let cutoff = before(at, grace);
        let mut reclaimed = 0;
        for job in state.jobs.values_mut() {
            if job.status == JobStatus::InProgress && job.updated_at <= cutoff {
                job.status = JobStatus::Queued;
                job.updated_at = at;
                job.claimed_by = None;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
        let state = self.read()?;
        Ok(state
            .jobs
            .values()
            .filter(|j| filter.matches(j))
            .take(filter.limit)
            .cloned()
            .collect())
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let state = self.read()?;
        let mut stats = JobStats::default();
        for job in state.jobs.values() {
            stats.add(job.status, 1);
        }
        Ok(stats)
    }

    async fn requeue_failed(&self, job_type: Option<JobType>) -> Result<u64, JobStoreError> {
        let mut state = self.write()?;
        let at = now();
        let mut requeued = 0;
        for job in state.jobs.values_mut() {
            if job.status == JobStatus::Failed && job_type.is_none_or(|t| t == job.job_type) {
                job.status = JobStatus::Queued;
                job.retries = 0;
                job.next_run = at;
                job.updated_at = at;
                requeued += 1;
            }
        }
        Ok(requeued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item_job(source_id: &str) -> NewJob {
        NewJob::new(JobType::MirrorItem, json!({ "source_id": source_id }))
    }

    #[tokio::test]
    async fn enqueue_and_claim() {
        let store = InMemoryJobStore::new();
        let id = store.enqueue(item_job("p1")).await.unwrap();

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.retries, 0);

        let claimed = store
            .claim_due(JobType::MirrorItem, now(), 10, "worker-a")
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, id);
        assert_eq!(claimed[0].status, JobStatus::InProgress);
        assert_eq!(claimed[0].claimed_by.as_deref(), Some("worker-a"));

        // Nothing left to claim.
        assert!(
            store
                .claim_due(JobType::MirrorItem, now(), 10, "worker-b")
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn illegal_transitions_are_rejected() {
        let store = InMemoryJobStore::new();
        let id = store.enqueue(item_job("p1")).await.unwrap();

        let err = store.complete(id).await.unwrap_err();
        assert_eq!(
            err,
            JobStoreError::InvalidTransition {
                id,
                from: JobStatus::Queued,
                to: JobStatus::Done,
            }
        );
        assert_eq!(
            store.set_status(JobId::new(999), JobStatus::Done, None).await,
            Err(JobStoreError::NotFound(JobId::new(999)))
        );
    }

    #[tokio::test]
    async fn unique_enqueue_reuses_live_job_only() {
        let store = InMemoryJobStore::new();
        let job = NewJob::new(JobType::MirrorReplies, json!({ "source_id": "p1" }));

        let first = store.enqueue_unique(job.clone(), "reddit:lemmy:p1").await.unwrap();
        let second = store.enqueue_unique(job.clone(), "reddit:lemmy:p1").await.unwrap();
        let id = first.job_id().unwrap();
        assert_eq!(first, EnqueueOutcome::Enqueued(id));
        assert_eq!(second, EnqueueOutcome::Existing(id));

        store
            .claim_due(JobType::MirrorReplies, now(), 1, "w")
            .await
            .unwrap();
        store.complete(id).await.unwrap();

        let third = store.enqueue_unique(job, "reddit:lemmy:p1").await.unwrap();
        assert!(matches!(third, EnqueueOutcome::Enqueued(other) if other != id));
    }

    #[tokio::test]
    async fn reclaim_returns_stale_jobs_to_queue() {
        let store = InMemoryJobStore::new();
        let id = store.enqueue(item_job("p1")).await.unwrap();
        store
            .claim_due(JobType::MirrorItem, now(), 1, "crashed")
            .await
            .unwrap();

        assert_eq!(store.reclaim_stale(Duration::from_secs(600)).await.unwrap(), 0);
        assert_eq!(store.reclaim_stale(Duration::MAX).await.unwrap(), 0);
        assert_eq!(store.reclaim_stale(Duration::ZERO).await.unwrap(), 1);

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.claimed_by, None);
    }

    #[tokio::test]
    async fn requeue_failed_resets_retry_budget() {
        let store = InMemoryJobStore::new();
        let id = store.enqueue(item_job("p1")).await.unwrap();
        store.claim_due(JobType::MirrorItem, now(), 1, "w").await.unwrap();
        store.reschedule(id, 1, now(), "503").await.unwrap();
        store.claim_due(JobType::MirrorItem, now(), 1, "w").await.unwrap();
        store.fail(id, "validation").await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.failed, 1);

        assert_eq!(store.requeue_failed(Some(JobType::Discovery)).await.unwrap(), 0);
        assert_eq!(store.requeue_failed(None).await.unwrap(), 1);
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.retries, 0);
        assert_eq!(job.last_error.as_deref(), Some("validation"));
    }
}

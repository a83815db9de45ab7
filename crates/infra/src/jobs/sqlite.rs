//! SQLite-backed job store.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{instrument, warn};

use crate::db::{before, from_millis, now, to_millis, Database};

use super::store::{JobStore, JobStoreError, StatusChange};
use super::types::{
    EnqueueOutcome, Job, JobFilter, JobId, JobStats, JobStatus, JobType, NewJob,
};

const JOB_COLUMNS: &str = "id, job_type, payload, status, retries, max_retries, next_run, \
                           created_at, updated_at, last_error, dedup_key, claimed_by";

/// A racing writer may finish the existing job between our insert attempt
/// and the lookup; a few rounds always settle it.
const UNIQUE_ENQUEUE_ATTEMPTS: usize = 3;

/// Durable job store on the shared pipeline database.
#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    async fn live_job_with_key(
        &self,
        job_type: JobType,
        dedup_key: &str,
    ) -> Result<Option<JobId>, JobStoreError> {
        let sql = format!(
            "SELECT id FROM jobs WHERE job_type = ?1 AND dedup_key = ?2 AND status IN ({}) \
             ORDER BY id LIMIT 1",
            status_list(live_statuses())
        );
        let id: Option<i64> = sqlx::query_scalar(&sql)
            .bind(job_type.as_str())
            .bind(dedup_key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(id.map(JobId::new))
    }

    async fn current_status(&self, id: JobId) -> Result<Option<JobStatus>, JobStoreError> {
        let status: Option<String> = sqlx::query_scalar("SELECT status FROM jobs WHERE id = ?1")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?;
        status
            .map(|s| s.parse::<JobStatus>().map_err(|e| JobStoreError::Corrupt(e.to_string())))
            .transpose()
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    #[instrument(skip(self, job), fields(job_type = %job.job_type), err)]
    async fn enqueue(&self, job: NewJob) -> Result<JobId, JobStoreError> {
        let at = to_millis(now());
        let next_run = job.next_run.map(to_millis).unwrap_or(at);
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (
                job_type, payload, status, retries, max_retries,
                next_run, created_at, updated_at
            )
            VALUES (?1, ?2, 'queued', 0, ?3, ?4, ?5, ?5)
            "#,
        )
        .bind(job.job_type.as_str())
        .bind(job.payload.to_string())
        .bind(i64::from(job.max_retries))
        .bind(next_run)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(JobId::new(result.last_insert_rowid()))
    }

    #[instrument(skip(self, job), fields(job_type = %job.job_type), err)]
    async fn enqueue_unique(
        &self,
        job: NewJob,
        dedup_key: &str,
    ) -> Result<EnqueueOutcome, JobStoreError> {
        let sql = format!(
            r#"
            INSERT INTO jobs (
                job_type, payload, status, retries, max_retries,
                next_run, created_at, updated_at, dedup_key
            )
            SELECT ?1, ?2, 'queued', 0, ?3, ?4, ?5, ?5, ?6
            WHERE NOT EXISTS (
                SELECT 1 FROM jobs
                WHERE job_type = ?1 AND dedup_key = ?6 AND status IN ({})
            )
            "#,
            status_list(live_statuses())
        );
        let payload = job.payload.to_string();

        for _ in 0..UNIQUE_ENQUEUE_ATTEMPTS {
            let at = to_millis(now());
            let result = sqlx::query(&sql)
                .bind(job.job_type.as_str())
                .bind(&payload)
                .bind(i64::from(job.max_retries))
                .bind(job.next_run.map(to_millis).unwrap_or(at))
                .bind(at)
                .bind(dedup_key)
                .execute(&self.pool)
                .await?;

            if result.rows_affected() == 1 {
                return Ok(EnqueueOutcome::Enqueued(JobId::new(result.last_insert_rowid())));
            }
            if let Some(existing) = self.live_job_with_key(job.job_type, dedup_key).await? {
                return Ok(EnqueueOutcome::Existing(existing));
            }
        }

        Err(JobStoreError::Storage(format!(
            "could not settle unique enqueue for key {dedup_key:?}"
        )))
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1");
        let row = sqlx::query(&sql)
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn fetch_due(
        &self,
        job_type: JobType,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE job_type = ?1 AND status IN ({}) AND next_run <= ?2 \
             ORDER BY next_run, id",
            status_list(dispatchable_statuses())
        );
        let rows = sqlx::query(&sql)
            .bind(job_type.as_str())
            .bind(to_millis(now))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_job).collect()
    }

    #[instrument(skip(self), err)]
    async fn claim_due(
        &self,
        job_type: JobType,
        horizon: DateTime<Utc>,
        limit: usize,
        claimed_by: &str,
    ) -> Result<Vec<Job>, JobStoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        // Select and flip in one statement so two dispatch cycles can never
        // hand out the same job.
        let sql = format!(
            r#"
            UPDATE jobs
            SET status = 'in_progress', updated_at = ?1, claimed_by = ?2
            WHERE id IN (
                SELECT id FROM jobs
                WHERE job_type = ?3 AND status IN ({}) AND next_run <= ?4
                ORDER BY next_run, id
                LIMIT ?5
            )
            RETURNING {JOB_COLUMNS}
            "#,
            status_list(dispatchable_statuses())
        );
        let rows = sqlx::query(&sql)
            .bind(to_millis(now()))
            .bind(claimed_by)
            .bind(job_type.as_str())
            .bind(to_millis(horizon))
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        let mut jobs = rows.iter().map(row_to_job).collect::<Result<Vec<_>, _>>()?;
        // RETURNING order is unspecified.
        jobs.sort_by_key(|j| (j.next_run, j.id));
        Ok(jobs)
    }

    #[instrument(skip(self, change), err)]
    async fn transition(
        &self,
        id: JobId,
        to: JobStatus,
        change: StatusChange,
    ) -> Result<Job, JobStoreError> {
        let allowed = JobStatus::predecessors(to);
        if !allowed.is_empty() {
            let sql = format!(
                r#"
                UPDATE jobs
                SET status = ?1,
                    updated_at = ?2,
                    next_run = COALESCE(?3, next_run),
                    retries = COALESCE(?4, retries),
                    last_error = COALESCE(?5, last_error),
                    claimed_by = CASE WHEN ?6 THEN NULL ELSE claimed_by END
                WHERE id = ?7 AND status IN ({})
                RETURNING {JOB_COLUMNS}
                "#,
                status_list(allowed)
            );
            let row = sqlx::query(&sql)
                .bind(to.as_str())
                .bind(to_millis(now()))
                .bind(change.next_run.map(to_millis))
                .bind(change.retries.map(i64::from))
                .bind(change.last_error.as_deref())
                .bind(to.is_dispatchable())
                .bind(id.get())
                .fetch_optional(&self.pool)
                .await?;
            if let Some(row) = row {
                return row_to_job(&row);
            }
        }

        match self.current_status(id).await? {
            None => Err(JobStoreError::NotFound(id)),
            Some(from) => Err(JobStoreError::InvalidTransition { id, from, to }),
        }
    }

    async fn heartbeat(&self, id: JobId) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET updated_at = ?1 WHERE id = ?2 AND status = 'in_progress'",
        )
        .bind(to_millis(now()))
        .bind(id.get())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.current_status(id).await? {
            None => Err(JobStoreError::NotFound(id)),
            Some(_) => Ok(false),
        }
    }

    #[instrument(skip(self), err)]
    async fn reclaim_stale(&self, grace: Duration) -> Result<u64, JobStoreError> {
        let at = now();
        let cutoff = before(at, grace);
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'queued', updated_at = ?1, claimed_by = NULL
            WHERE status = 'in_progress' AND updated_at <= ?2
            "#,
        )
        .bind(to_millis(at))
        .bind(to_millis(cutoff))
        .execute(&self.pool)
        .await?;

        let reclaimed = result.rows_affected();
        if reclaimed > 0 {
            warn!(reclaimed, grace_secs = grace.as_secs(), "reclaimed stale in-progress jobs");
        }
        Ok(reclaimed)
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR job_type = ?2) \
             ORDER BY id LIMIT ?3"
        );
        let rows = sqlx::query(&sql)
            .bind(filter.status.map(|s| s.as_str()))
            .bind(filter.job_type.map(|t| t.as_str()))
            .bind(i64::try_from(filter.limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_job).collect()
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let count: i64 = row.try_get("n")?;
            let status = status
                .parse::<JobStatus>()
                .map_err(|e| JobStoreError::Corrupt(e.to_string()))?;
            stats.add(status, u64::try_from(count).unwrap_or_default());
        }
        Ok(stats)
    }

    #[instrument(skip(self), err)]
    async fn requeue_failed(&self, job_type: Option<JobType>) -> Result<u64, JobStoreError> {
        let at = to_millis(now());
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'queued', retries = 0, next_run = ?1, updated_at = ?1, claimed_by = NULL
            WHERE status = 'failed' AND (?2 IS NULL OR job_type = ?2)
            "#,
        )
        .bind(at)
        .bind(job_type.map(|t| t.as_str()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

fn live_statuses() -> impl Iterator<Item = JobStatus> {
    JobStatus::ALL.into_iter().filter(|s| !s.is_terminal())
}

fn dispatchable_statuses() -> impl Iterator<Item = JobStatus> {
    JobStatus::ALL.into_iter().filter(JobStatus::is_dispatchable)
}

/// `'queued', 'retrying'` style SQL list of persisted status names.
fn status_list(statuses: impl IntoIterator<Item = JobStatus>) -> String {
    statuses
        .into_iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn row_to_job(row: &SqliteRow) -> Result<Job, JobStoreError> {
    let corrupt = |what: &str, detail: String| JobStoreError::Corrupt(format!("{what}: {detail}"));

    let id: i64 = row.try_get("id")?;
    let job_type: String = row.try_get("job_type")?;
    let job_type = job_type
        .parse::<JobType>()
        .map_err(|e| corrupt("job_type", e.to_string()))?;

    let payload: String = row.try_get("payload")?;
    let payload =
        serde_json::from_str(&payload).map_err(|e| corrupt("payload", e.to_string()))?;

    let status: String = row.try_get("status")?;
    let status = status
        .parse::<JobStatus>()
        .map_err(|e| corrupt("status", e.to_string()))?;

    let retries: i64 = row.try_get("retries")?;
    let max_retries: i64 = row.try_get("max_retries")?;

    Ok(Job {
        id: JobId::new(id),
        job_type,
        payload,
        status,
        retries: u32::try_from(retries).map_err(|e| corrupt("retries", e.to_string()))?,
        max_retries: u32::try_from(max_retries)
            .map_err(|e| corrupt("max_retries", e.to_string()))?,
        next_run: from_millis(row.try_get("next_run")?),
        created_at: from_millis(row.try_get("created_at")?),
        updated_at: from_millis(row.try_get("updated_at")?),
        last_error: row.try_get("last_error")?,
        dedup_key: row.try_get("dedup_key")?,
        claimed_by: row.try_get("claimed_by")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn store() -> SqliteJobStore {
        SqliteJobStore::new(&Database::in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn enqueued_job_is_queued_and_due() {
        let store = store().await;
        let id = store
            .enqueue(NewJob::new(JobType::MirrorItem, json!({"source_id": "p1"})))
            .await
            .unwrap();

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.payload, json!({"source_id": "p1"}));
        assert_eq!(job.max_retries, crate::jobs::DEFAULT_MAX_RETRIES);

        let due = store.fetch_due(JobType::MirrorItem, now()).await.unwrap();
        assert_eq!(due.len(), 1);
        assert!(store.fetch_due(JobType::Discovery, now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn claim_respects_horizon_order_and_limit() {
        let store = store().await;
        let base = now();
        let late = store
            .enqueue(
                NewJob::new(JobType::MirrorItem, json!({"source_id": "late"}))
                    .scheduled_at(base + chrono::Duration::seconds(30)),
            )
            .await
            .unwrap();
        let second = store
            .enqueue(
                NewJob::new(JobType::MirrorItem, json!({"source_id": "b"}))
                    .scheduled_at(base - chrono::Duration::seconds(1)),
            )
            .await
            .unwrap();
        let first = store
            .enqueue(
                NewJob::new(JobType::MirrorItem, json!({"source_id": "a"}))
                    .scheduled_at(base - chrono::Duration::seconds(5)),
            )
            .await
            .unwrap();

        let claimed = store
            .claim_due(JobType::MirrorItem, base, 1, "w1")
            .await
            .unwrap();
        assert_eq!(claimed.iter().map(|j| j.id).collect::<Vec<_>>(), vec![first]);

        let claimed = store
            .claim_due(JobType::MirrorItem, base, 10, "w1")
            .await
            .unwrap();
        assert_eq!(claimed.iter().map(|j| j.id).collect::<Vec<_>>(), vec![second]);

        let job = store.get(late).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn transition_distinguishes_missing_and_illegal() {
        let store = store().await;
        let id = store
            .enqueue(NewJob::new(JobType::Discovery, json!({"community": "rust"})))
            .await
            .unwrap();

        assert_eq!(
            store.skip(id, "nope").await.unwrap_err(),
            JobStoreError::InvalidTransition {
                id,
                from: JobStatus::Queued,
                to: JobStatus::Skipped,
            }
        );
        assert_eq!(
            store.complete(JobId::new(404)).await.unwrap_err(),
            JobStoreError::NotFound(JobId::new(404))
        );
    }

    #[tokio::test]
    async fn reschedule_records_error_and_clears_claim() {
        let store = store().await;
        let id = store
            .enqueue(NewJob::new(JobType::MirrorItem, json!({"source_id": "p1"})))
            .await
            .unwrap();
        store.claim_due(JobType::MirrorItem, now(), 1, "w1").await.unwrap();
        assert!(store.heartbeat(id).await.unwrap());

        let later = now() + chrono::Duration::seconds(2);
        let job = store.reschedule(id, 1, later, "503 from upstream").await.unwrap();
        assert_eq!(job.status, JobStatus::Retrying);
        assert_eq!(job.retries, 1);
        assert_eq!(job.next_run, later);
        assert_eq!(job.last_error.as_deref(), Some("503 from upstream"));
        assert_eq!(job.claimed_by, None);
        assert!(!store.heartbeat(id).await.unwrap());

        assert!(store.claim_due(JobType::MirrorItem, now(), 1, "w1").await.unwrap().is_empty());
        let claimed = store.claim_due(JobType::MirrorItem, later, 1, "w1").await.unwrap();
        assert_eq!(claimed[0].id, id);
    }

    #[tokio::test]
    async fn list_filters_and_stats_count() {
        let store = store().await;
        for n in 0..3 {
            store
                .enqueue(NewJob::new(JobType::MirrorItem, json!({"source_id": n.to_string()})))
                .await
                .unwrap();
        }
        store
            .enqueue(NewJob::new(JobType::Discovery, json!({"community": "rust"})))
            .await
            .unwrap();
        store.claim_due(JobType::MirrorItem, now(), 1, "w").await.unwrap();

        let filter = JobFilter {
            status: Some(JobStatus::Queued),
            job_type: Some(JobType::MirrorItem),
            limit: 10,
        };
        assert_eq!(store.list(&filter).await.unwrap().len(), 2);
        assert_eq!(store.list(&JobFilter::default()).await.unwrap().len(), 4);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.queued, 3);
        assert_eq!(stats.in_progress, 1);
        assert_eq!(stats.total(), 4);
    }

    #[tokio::test]
    async fn unique_enqueue_is_keyed_per_type() {
        let store = store().await;
        let job = NewJob::new(JobType::MirrorReplies, json!({"source_id": "p1"}));
        let first = store.enqueue_unique(job.clone(), "reddit:lemmy:p1").await.unwrap();
        let again = store.enqueue_unique(job, "reddit:lemmy:p1").await.unwrap();
        assert!(matches!(first, EnqueueOutcome::Enqueued(_)));
        assert_eq!(again, EnqueueOutcome::Existing(first.job_id().unwrap()));

        let other_type = store
            .enqueue_unique(
                NewJob::new(JobType::MirrorItem, json!({"source_id": "p1"})),
                "reddit:lemmy:p1",
            )
            .await
            .unwrap();
        assert!(matches!(other_type, EnqueueOutcome::Enqueued(_)));
    }

    #[tokio::test]
    async fn reclaim_only_takes_jobs_past_the_grace() {
        let store = store().await;
        let id = store
            .enqueue(NewJob::new(JobType::MirrorItem, json!({"source_id": "p1"})))
            .await
            .unwrap();
        store
            .claim_due(JobType::MirrorItem, now(), 1, "crashed")
            .await
            .unwrap();

        assert_eq!(store.reclaim_stale(Duration::MAX).await.unwrap(), 0);
        assert_eq!(store.reclaim_stale(Duration::ZERO).await.unwrap(), 1);
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.claimed_by, None);
    }
}

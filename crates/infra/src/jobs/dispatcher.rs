//! Polls the job store and feeds claimed jobs to the worker pools.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::db::{after, now};

use super::pool::PoolIntake;
use super::store::JobStore;
use super::types::JobType;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub poll_interval: Duration,
    /// Claim jobs due up to this far past the poll time.
    pub lookahead: Duration,
    pub stale_grace: Duration,
    pub sweep_interval: Duration,
    /// Written to `claimed_by` for every job this dispatcher claims.
    pub instance_id: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        let poll_interval = Duration::from_secs(5);
        Self {
            poll_interval,
            lookahead: poll_interval,
            stale_grace: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(60),
            instance_id: uuid::Uuid::now_v7().to_string(),
        }
    }
}

/// Single polling loop shared by all pools of one process.
pub struct Dispatcher {
    config: DispatcherConfig,
    store: Arc<dyn JobStore>,
    pools: BTreeMap<JobType, PoolIntake>,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig, store: Arc<dyn JobStore>) -> Self {
        Self {
            config,
            store,
            pools: BTreeMap::new(),
        }
    }

    /// Route jobs of the intake's type to it. Replaces an earlier intake for
    /// the same type.
    pub fn register(&mut self, intake: PoolIntake) {
        self.pools.insert(intake.job_type(), intake);
    }

    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    /// Run until `shutdown` fires. Dropping the dispatcher on exit closes its
    /// side of every pool intake.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            instance_id = %self.config.instance_id,
            pools = self.pools.len(),
            poll_ms = self.config.poll_interval.as_millis() as u64,
            "dispatcher starting"
        );

        // Jobs left in progress by a previous run are returned first.
        self.sweep().await;

        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut sweep = tokio::time::interval_at(
            Instant::now() + self.config.sweep_interval,
            self.config.sweep_interval,
        );
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = poll.tick() => {
                    self.dispatch_once().await;
                }
                _ = sweep.tick() => {
                    self.sweep().await;
                }
            }
        }

        info!(instance_id = %self.config.instance_id, "dispatcher stopped");
    }

    /// One poll across every registered pool. Returns how many jobs were
    /// handed over.
    pub async fn dispatch_once(&self) -> usize {
        let mut dispatched = 0;
        for (job_type, intake) in &self.pools {
            let free = intake.free_capacity();
            if free == 0 {
                continue;
            }

            let horizon = after(now(), self.config.lookahead);
            let jobs = match self
                .store
                .claim_due(*job_type, horizon, free, &self.config.instance_id)
                .await
            {
                Ok(jobs) => jobs,
                Err(err) => {
                    error!(pool = %job_type, error = %err, "failed to claim due jobs");
                    continue;
                }
            };

            for job in jobs {
                let id = job.id;
                match intake.submit(job) {
                    Ok(()) => dispatched += 1,
                    Err(job) => {
                        warn!(pool = %job_type, job_id = %id, "pool refused job, releasing");
                        if let Err(err) = self.store.release(job.id).await {
                            error!(pool = %job_type, job_id = %id, error = %err, "release failed");
                        }
                    }
                }
            }
        }

        if dispatched > 0 {
            debug!(dispatched, "dispatched jobs");
        }
        dispatched
    }

    /// Return stale `in_progress` jobs to the queue.
    pub async fn sweep(&self) -> u64 {
        match self.store.reclaim_stale(self.config.stale_grace).await {
            Ok(0) => 0,
            Ok(reclaimed) => {
                warn!(reclaimed, "reclaimed stale in-progress jobs");
                reclaimed
            }
            Err(err) => {
                error!(error = %err, "reclaim sweep failed");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::jobs::{
        InMemoryJobStore, Job, JobHandler, JobOutcome, JobStatus, NewJob, PoolConfig, WorkerPool,
    };

    struct Succeed;

    #[async_trait]
    impl JobHandler for Succeed {
        async fn handle(&self, _job: &Job) -> JobOutcome {
            JobOutcome::Done
        }
    }

    fn config() -> DispatcherConfig {
        DispatcherConfig {
            poll_interval: Duration::from_millis(10),
            lookahead: Duration::from_millis(10),
            stale_grace: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(60),
            instance_id: "dispatcher-test".into(),
        }
    }

    #[tokio::test]
    async fn claims_no_more_than_free_capacity() {
        let store = InMemoryJobStore::arc();
        for n in 0..5 {
            store
                .enqueue(NewJob::new(JobType::Discovery, json!({ "community": n.to_string() })))
                .await
                .unwrap();
        }

        let shutdown = CancellationToken::new();
        let pool = WorkerPool::spawn(
            PoolConfig::new(JobType::Discovery).with_concurrency(2),
            store.clone(),
            Arc::new(Succeed),
            shutdown.clone(),
        );
        let mut dispatcher = Dispatcher::new(config(), store.clone());
        dispatcher.register(pool.intake());

        assert_eq!(dispatcher.dispatch_once().await, 2);
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.queued, 3);

        shutdown.cancel();
        pool.join().await;
    }

    #[tokio::test]
    async fn jobs_of_unregistered_types_stay_queued() {
        let store = InMemoryJobStore::arc();
        let id = store
            .enqueue(NewJob::new(JobType::MirrorReplies, json!({ "source_id": "p1" })))
            .await
            .unwrap();
        let dispatcher = Dispatcher::new(config(), store.clone());

        assert_eq!(dispatcher.dispatch_once().await, 0);
        assert_eq!(store.get(id).await.unwrap().unwrap().status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn startup_sweep_reclaims_abandoned_jobs() {
        let store = InMemoryJobStore::arc();
        let id = store
            .enqueue(NewJob::new(JobType::MirrorItem, json!({ "source_id": "p1" })))
            .await
            .unwrap();
        store
            .claim_due(JobType::MirrorItem, now(), 1, "crashed-instance")
            .await
            .unwrap();

        let mut cfg = config();
        cfg.stale_grace = Duration::ZERO;
        let dispatcher = Dispatcher::new(cfg, store.clone());
        assert_eq!(dispatcher.sweep().await, 1);
        assert_eq!(store.get(id).await.unwrap().unwrap().status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn run_drives_jobs_to_completion_and_stops() {
        let store = InMemoryJobStore::arc();
        for n in 0..4 {
            store
                .enqueue(NewJob::new(JobType::MirrorItem, json!({ "source_id": n.to_string() })))
                .await
                .unwrap();
        }

        let shutdown = CancellationToken::new();
        let pool = WorkerPool::spawn(
            PoolConfig::new(JobType::MirrorItem).with_concurrency(2),
            store.clone(),
            Arc::new(Succeed),
            shutdown.clone(),
        );
        let mut dispatcher = Dispatcher::new(config(), store.clone());
        dispatcher.register(pool.intake());
        let running = tokio::spawn(dispatcher.run(shutdown.clone()));

        let deadline = Instant::now() + Duration::from_secs(5);
        while store.stats().await.unwrap().done < 4 {
            assert!(Instant::now() < deadline, "jobs did not complete");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        shutdown.cancel();
        running.await.unwrap();
        pool.join().await;

        let done = store
            .list(&crate::jobs::JobFilter::default())
            .await
            .unwrap();
        assert!(done.iter().all(|job| job.status == JobStatus::Done));
        assert!(done.iter().all(|job| job.claimed_by.as_deref() == Some("dispatcher-test")));
    }
}

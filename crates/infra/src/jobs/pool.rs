//! Per-job-type worker pool with bounded concurrency and uniform retry.
//!
//! A single scheduler task owns the pool's state:
//!
//! - a min-heap of claimed jobs whose `next_run` is still in the future
//!   (parked jobs never occupy a worker slot),
//! - a FIFO of due jobs waiting for a semaphore permit,
//! - a `JoinSet` of running handlers.
//!
//! Running handlers heartbeat their job so the reclaim sweep leaves them
//! alone; the scheduler heartbeats the jobs it holds but has not started.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::db::now;

use super::store::JobStore;
use super::types::{Job, JobId, JobOutcome, JobType, RetryPolicy};

/// Executes jobs of one type.
///
/// Handlers must be idempotent: a job may run again after a crash or a
/// transient failure.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> JobOutcome;
}

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub job_type: JobType,
    pub concurrency: usize,
    pub retry: RetryPolicy,
    pub heartbeat_interval: Duration,
}

impl PoolConfig {
    pub fn new(job_type: JobType) -> Self {
        Self {
            job_type,
            concurrency: 2,
            retry: RetryPolicy::default(),
            heartbeat_interval: Duration::from_secs(30),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub job_type: Option<JobType>,
    pub processed: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub failed: u64,
    pub skipped: u64,
    pub running: usize,
    /// Jobs claimed for this pool and not yet settled (parked, waiting or
    /// running).
    pub held: usize,
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    succeeded: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    running: AtomicUsize,
    held: AtomicUsize,
}

impl Counters {
    fn snapshot(&self, job_type: JobType) -> PoolStats {
        PoolStats {
            job_type: Some(job_type),
            processed: self.processed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            running: self.running.load(Ordering::Relaxed),
            held: self.held.load(Ordering::Relaxed),
        }
    }
}

/// Sending side of a pool, used by the dispatcher.
#[derive(Debug, Clone)]
pub struct PoolIntake {
    job_type: JobType,
    concurrency: usize,
    tx: mpsc::Sender<Job>,
    counters: Arc<Counters>,
}

impl PoolIntake {
    pub fn job_type(&self) -> JobType {
        self.job_type
    }

    /// How many more jobs the pool accepts right now.
    pub fn free_capacity(&self) -> usize {
        if self.tx.is_closed() {
            return 0;
        }
        self.concurrency
            .saturating_sub(self.counters.held.load(Ordering::Acquire))
    }

    /// Hand a claimed job to the pool. Gives the job back if the pool is
    /// full or shutting down.
    pub fn submit(&self, job: Job) -> Result<(), Job> {
        self.counters.held.fetch_add(1, Ordering::AcqRel);
        match self.tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(job) | mpsc::error::TrySendError::Closed(job)) => {
                self.counters.held.fetch_sub(1, Ordering::AcqRel);
                Err(job)
            }
        }
    }
}

/// Handle to a running pool.
#[derive(Debug)]
pub struct PoolHandle {
    intake: PoolIntake,
    join: JoinHandle<()>,
}

impl PoolHandle {
    pub fn intake(&self) -> PoolIntake {
        self.intake.clone()
    }

    pub fn stats(&self) -> PoolStats {
        self.intake.counters.snapshot(self.intake.job_type)
    }

    /// Wait for the pool to stop (after the shutdown signal, once in-flight
    /// handlers have finished).
    pub async fn join(self) {
        if let Err(err) = self.join.await {
            error!(error = %err, "worker pool task failed");
        }
    }
}

pub struct WorkerPool;

impl WorkerPool {
    /// Spawn the pool's scheduler task.
    pub fn spawn(
        config: PoolConfig,
        store: Arc<dyn JobStore>,
        handler: Arc<dyn JobHandler>,
        shutdown: CancellationToken,
    ) -> PoolHandle {
        let concurrency = config.concurrency.max(1);
        let (tx, rx) = mpsc::channel(concurrency);
        let counters = Arc::new(Counters::default());

        let scheduler = Scheduler {
            semaphore: Arc::new(Semaphore::new(concurrency)),
            config: PoolConfig {
                concurrency,
                ..config
            },
            store,
            handler,
            counters: counters.clone(),
            rx,
            parked: BinaryHeap::new(),
            ready: VecDeque::new(),
            running: JoinSet::new(),
        };
        let job_type = scheduler.config.job_type;

        info!(
            pool = %job_type,
            concurrency,
            "worker pool starting"
        );
        let join = tokio::spawn(scheduler.run(shutdown));

        PoolHandle {
            intake: PoolIntake {
                job_type,
                concurrency,
                tx,
                counters,
            },
            join,
        }
    }
}

/// Heap entry ordered so the earliest `(next_run, id)` is on top.
struct Parked(Job);

impl PartialEq for Parked {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Parked {}

impl PartialOrd for Parked {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Parked {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.key().cmp(&self.key())
    }
}

impl Parked {
    fn key(&self) -> (chrono::DateTime<chrono::Utc>, JobId) {
        (self.0.next_run, self.0.id)
    }
}

struct Scheduler {
    config: PoolConfig,
    store: Arc<dyn JobStore>,
    handler: Arc<dyn JobHandler>,
    counters: Arc<Counters>,
    semaphore: Arc<Semaphore>,
    rx: mpsc::Receiver<Job>,
    parked: BinaryHeap<Parked>,
    ready: VecDeque<Job>,
    running: JoinSet<()>,
}

impl Scheduler {
    async fn run(mut self, shutdown: CancellationToken) {
        let pool = self.config.job_type;
        let mut heartbeat = tokio::time::interval_at(
            Instant::now() + self.config.heartbeat_interval,
            self.config.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut intake_open = true;

        loop {
            self.promote_due();
            self.start_ready();

            if !intake_open && self.is_idle() {
                break;
            }

            let wake_at = self.next_wake();
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(result) = self.running.join_next(), if !self.running.is_empty() => {
                    if let Err(err) = result {
                        error!(pool = %pool, error = %err, "job task aborted");
                    }
                }
                received = self.rx.recv(), if intake_open => match received {
                    Some(job) => self.accept(job),
                    None => intake_open = false,
                },
                _ = tokio::time::sleep_until(wake_at.unwrap_or_else(Instant::now)), if wake_at.is_some() => {}
                _ = heartbeat.tick() => self.heartbeat_waiting(),
            }
        }

        self.drain().await;
        info!(pool = %pool, "worker pool stopped");
    }

    fn is_idle(&self) -> bool {
        self.parked.is_empty() && self.ready.is_empty() && self.running.is_empty()
    }

    fn accept(&mut self, job: Job) {
        if job.is_due(now()) {
            self.ready.push_back(job);
        } else {
            debug!(
                pool = %self.config.job_type,
                job_id = %job.id,
                next_run = %job.next_run,
                "job parked until due"
            );
            self.parked.push(Parked(job));
        }
    }

    fn promote_due(&mut self) {
        let at = now();
        while self.parked.peek().is_some_and(|p| p.0.is_due(at)) {
            if let Some(Parked(job)) = self.parked.pop() {
                self.ready.push_back(job);
            }
        }
    }

    fn next_wake(&self) -> Option<Instant> {
        let next = self.parked.peek()?;
        let delay = (next.0.next_run - now()).to_std().unwrap_or(Duration::ZERO);
        Some(Instant::now() + delay)
    }

    fn start_ready(&mut self) {
        while !self.ready.is_empty() {
            let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
                break;
            };
            let Some(job) = self.ready.pop_front() else {
                break;
            };
            let worker = Worker {
                store: self.store.clone(),
                handler: self.handler.clone(),
                retry: self.config.retry.clone(),
                heartbeat_interval: self.config.heartbeat_interval,
                counters: self.counters.clone(),
                job_type: self.config.job_type,
            };
            self.running.spawn(worker.run(job, permit));
        }
    }

    /// Keep claimed-but-not-started jobs from looking stale.
    fn heartbeat_waiting(&self) {
        let ids: Vec<JobId> = self
            .parked
            .iter()
            .map(|p| p.0.id)
            .chain(self.ready.iter().map(|j| j.id))
            .collect();
        if ids.is_empty() {
            return;
        }
        let store = self.store.clone();
        let pool = self.config.job_type;
        tokio::spawn(async move {
            for id in ids {
                if let Err(err) = store.heartbeat(id).await {
                    warn!(pool = %pool, job_id = %id, error = %err, "heartbeat failed");
                }
            }
        });
    }

    /// Stop accepting work, hand unstarted jobs back to the queue and wait
    /// for running handlers.
    async fn drain(&mut self) {
        let pool = self.config.job_type;
        self.rx.close();

        let mut unstarted: Vec<Job> = self.parked.drain().map(|p| p.0).collect();
        unstarted.extend(self.ready.drain(..));
        while let Ok(job) = self.rx.try_recv() {
            unstarted.push(job);
        }

        for job in unstarted {
            match self.store.release(job.id).await {
                Ok(_) => debug!(pool = %pool, job_id = %job.id, "unstarted job released"),
                // Left in progress; the reclaim sweep returns it.
                Err(err) => warn!(pool = %pool, job_id = %job.id, error = %err, "release failed"),
            }
            self.counters.held.fetch_sub(1, Ordering::AcqRel);
        }

        if !self.running.is_empty() {
            info!(pool = %pool, running = self.running.len(), "waiting for in-flight jobs");
        }
        while let Some(result) = self.running.join_next().await {
            if let Err(err) = result {
                error!(pool = %pool, error = %err, "job task aborted");
            }
        }
    }
}

/// Everything one running job needs, moved into its task.
struct Worker {
    store: Arc<dyn JobStore>,
    handler: Arc<dyn JobHandler>,
    retry: RetryPolicy,
    heartbeat_interval: Duration,
    counters: Arc<Counters>,
    job_type: JobType,
}

/// Releases the job's slot even if the handler panics.
struct Slot {
    counters: Arc<Counters>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.counters.running.fetch_sub(1, Ordering::AcqRel);
        self.counters.held.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Worker {
    async fn run(self, job: Job, permit: OwnedSemaphorePermit) {
        self.counters.running.fetch_add(1, Ordering::AcqRel);
        let _slot = Slot {
            counters: self.counters.clone(),
            _permit: permit,
        };

        debug!(pool = %self.job_type, job_id = %job.id, retries = job.retries, "job started");
        let outcome = self.execute(&job).await;
        self.settle(&job, outcome).await;
    }

    async fn execute(&self, job: &Job) -> JobOutcome {
        let handler = self.handler.handle(job);
        tokio::pin!(handler);

        let mut heartbeat = tokio::time::interval_at(
            Instant::now() + self.heartbeat_interval,
            self.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                outcome = &mut handler => return outcome,
                _ = heartbeat.tick() => {
                    if let Err(err) = self.store.heartbeat(job.id).await {
                        warn!(pool = %self.job_type, job_id = %job.id, error = %err, "heartbeat failed");
                    }
                }
            }
        }
    }

    async fn settle(&self, job: &Job, outcome: JobOutcome) {
        let pool = self.job_type;
        self.counters.processed.fetch_add(1, Ordering::Relaxed);

        let result = match outcome {
            JobOutcome::Done => {
                self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                info!(pool = %pool, job_id = %job.id, retries = job.retries, "job done");
                self.store.complete(job.id).await
            }
            JobOutcome::Retry { error, retry_after } if !job.retries_exhausted() => {
                let retries = job.retries + 1;
                let delay = self.retry.backoff(retries, retry_after);
                let next_run = crate::db::after(now(), delay);
                self.counters.retried.fetch_add(1, Ordering::Relaxed);
                warn!(
                    pool = %pool,
                    job_id = %job.id,
                    retries,
                    max_retries = job.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "job failed, retrying"
                );
                self.store.reschedule(job.id, retries, next_run, &error).await
            }
            JobOutcome::Retry { error, .. } => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(
                    pool = %pool,
                    job_id = %job.id,
                    retries = job.retries,
                    error = %error,
                    "job failed, retries exhausted"
                );
                self.store
                    .fail(job.id, &format!("retries exhausted: {error}"))
                    .await
            }
            JobOutcome::Fail(error) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(pool = %pool, job_id = %job.id, error = %error, "job failed permanently");
                self.store.fail(job.id, &error).await
            }
            JobOutcome::Skip(reason) => {
                self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                info!(pool = %pool, job_id = %job.id, reason = %reason, "job skipped");
                self.store.skip(job.id, &reason).await
            }
        };

        if let Err(err) = result {
            // The job stays in progress and is picked up again after the
            // stale grace period.
            error!(pool = %pool, job_id = %job.id, error = %err, "failed to record job outcome");
        }
    }
}

//! Wires a job store, mapping cache and bridge registry into a running
//! dispatcher plus one worker pool per job type.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use mirrorline_core::{BridgeRegistry, PlatformPair, SourceId};

use crate::config::PipelineConfig;
use crate::jobs::{
    DiscoveryHandler, DiscoveryPayload, Dispatcher, DispatcherConfig, EnqueueOutcome, ItemLocks,
    JobHandler, JobId, JobStore, JobStoreError, JobType, MirrorItemHandler, MirrorItemPayload,
    MirrorRepliesHandler, MirrorRepliesPayload, NewJob, PoolConfig, PoolHandle, PoolStats, WorkerPool,
};
use crate::mapping::{MappingCache, MappingError};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Jobs(#[from] JobStoreError),
    #[error(transparent)]
    Mapping(#[from] MappingError),
    #[error("invalid job payload: {0}")]
    Payload(#[from] serde_json::Error),
}

pub struct Pipeline {
    config: PipelineConfig,
    jobs: Arc<dyn JobStore>,
    mappings: Arc<dyn MappingCache>,
    handlers: BTreeMap<JobType, Arc<dyn JobHandler>>,
}

impl Pipeline {
    /// Build a pipeline with the standard handler for every job type.
    pub fn new(
        config: PipelineConfig,
        jobs: Arc<dyn JobStore>,
        mappings: Arc<dyn MappingCache>,
        registry: BridgeRegistry,
    ) -> Self {
        let locks = Arc::new(ItemLocks::new());
        let mut handlers: BTreeMap<JobType, Arc<dyn JobHandler>> = BTreeMap::new();
        handlers.insert(
            JobType::MirrorItem,
            Arc::new(
                MirrorItemHandler::new(registry.clone(), mappings.clone(), jobs.clone(), locks)
                    .with_max_retries(config.max_retries),
            ),
        );
        handlers.insert(
            JobType::MirrorReplies,
            Arc::new(MirrorRepliesHandler::new(registry.clone(), mappings.clone())),
        );
        handlers.insert(
            JobType::Discovery,
            Arc::new(
                DiscoveryHandler::new(registry, mappings.clone(), jobs.clone())
                    .with_max_retries(config.max_retries),
            ),
        );

        Self {
            config,
            jobs,
            mappings,
            handlers,
        }
    }

    /// Replace the handler for `job_type`.
    pub fn with_handler(mut self, job_type: JobType, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(job_type, handler);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn jobs(&self) -> &Arc<dyn JobStore> {
        &self.jobs
    }

    pub fn mappings(&self) -> &Arc<dyn MappingCache> {
        &self.mappings
    }

    /// Persist a job with the configured retry budget.
    pub async fn enqueue(
        &self,
        job_type: JobType,
        payload: serde_json::Value,
    ) -> Result<JobId, PipelineError> {
        let job = NewJob::new(job_type, payload).with_max_retries(self.config.max_retries);
        Ok(self.jobs.enqueue(job).await?)
    }

    /// Queue a mirror of `source_id` unless the item is ignored.
    pub async fn enqueue_mirror_item(
        &self,
        pair: PlatformPair,
        source_id: SourceId,
    ) -> Result<EnqueueOutcome, PipelineError> {
        if self.mappings.is_ignored(&source_id).await? {
            info!(pair = %pair, source_id = %source_id, "not enqueued, source item ignored");
            return Ok(EnqueueOutcome::Ignored);
        }
        let payload = serde_json::to_value(MirrorItemPayload::new(pair, source_id))?;
        let id = self.enqueue(JobType::MirrorItem, payload).await?;
        Ok(EnqueueOutcome::Enqueued(id))
    }

    /// Queue a reply pass for an item. At most one live replies job exists
    /// per item; a second request returns the one already queued.
    pub async fn enqueue_replies(
        &self,
        payload: MirrorRepliesPayload,
    ) -> Result<EnqueueOutcome, PipelineError> {
        let job = NewJob::typed(JobType::MirrorReplies, &payload)?
            .with_max_retries(self.config.max_retries);
        Ok(self.jobs.enqueue_unique(job, &payload.dedup_key()).await?)
    }

    /// Queue a discovery pass over a source community.
    pub async fn enqueue_discovery(
        &self,
        pair: PlatformPair,
        community: impl Into<String>,
        limit: usize,
    ) -> Result<JobId, PipelineError> {
        let payload = serde_json::to_value(DiscoveryPayload {
            pair,
            community: community.into(),
            limit,
        })?;
        self.enqueue(JobType::Discovery, payload).await
    }

    /// Spawn the pools and the dispatcher. Everything stops once `shutdown`
    /// is cancelled.
    pub fn start(&self, shutdown: CancellationToken) -> PipelineHandle {
        let mut dispatcher = Dispatcher::new(
            DispatcherConfig {
                poll_interval: self.config.poll_interval,
                lookahead: self.config.lookahead,
                stale_grace: self.config.stale_grace,
                sweep_interval: self.config.sweep_interval,
                ..DispatcherConfig::default()
            },
            self.jobs.clone(),
        );

        let mut pools = Vec::with_capacity(self.handlers.len());
        for (job_type, handler) in &self.handlers {
            let config = PoolConfig::new(*job_type)
                .with_concurrency(self.config.concurrency_for(*job_type))
                .with_retry_policy(self.config.retry.clone())
                .with_heartbeat_interval(self.config.heartbeat_interval);
            let pool = WorkerPool::spawn(
                config,
                self.jobs.clone(),
                handler.clone(),
                shutdown.child_token(),
            );
            dispatcher.register(pool.intake());
            pools.push(pool);
        }

        info!(
            instance_id = %dispatcher.instance_id(),
            pools = pools.len(),
            "pipeline started"
        );
        let dispatcher = tokio::spawn(dispatcher.run(shutdown));
        PipelineHandle { pools, dispatcher }
    }

    /// Run until `shutdown` is cancelled and everything has stopped.
    pub async fn run(&self, shutdown: CancellationToken) {
        self.start(shutdown).join().await;
    }
}

/// Running pipeline.
#[derive(Debug)]
pub struct PipelineHandle {
    pools: Vec<PoolHandle>,
    dispatcher: JoinHandle<()>,
}

impl PipelineHandle {
    pub fn stats(&self) -> Vec<PoolStats> {
        self.pools.iter().map(PoolHandle::stats).collect()
    }

    /// Wait for the dispatcher and every pool to stop.
    pub async fn join(self) {
        if let Err(err) = self.dispatcher.await {
            error!(error = %err, "dispatcher task failed");
        }
        for pool in self.pools {
            pool.join().await;
        }
        info!("pipeline stopped");
    }
}

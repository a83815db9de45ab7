//! Job handlers for the mirroring job types.
//!
//! Each handler resolves the [`Bridge`] for the payload's platform pair and
//! keeps the mapping cache consistent around the bridge call. Bridges report
//! failures as [`MirrorError`]; the pool turns those into retries, failures
//! or skips.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use mirrorline_core::{
    Bridge, BridgeRegistry, DestinationId, MirrorError, MirrorResult, PlatformPair, SourceId,
};

use crate::locks::KeyedLocks;
use crate::mapping::MappingCache;

use super::pool::JobHandler;
use super::store::JobStore;
use super::types::{
    DiscoveryPayload, Job, JobOutcome, JobType, MirrorItemPayload, MirrorRepliesPayload, NewJob,
    DEFAULT_MAX_RETRIES,
};

/// Serializes work on one source item within the process.
pub type ItemLocks = KeyedLocks<(PlatformPair, SourceId)>;

fn malformed(job: &Job, err: serde_json::Error) -> JobOutcome {
    JobOutcome::Fail(format!("malformed {} payload: {err}", job.job_type))
}

fn bridge_for(registry: &BridgeRegistry, pair: PlatformPair) -> MirrorResult<Arc<dyn Bridge>> {
    registry
        .get(pair)
        .ok_or_else(|| MirrorError::permanent(format!("no bridge registered for {pair}")))
}

/// Turn a bridge result into a job outcome, remembering absent items so
/// they are never enqueued again.
async fn conclude(
    mappings: &dyn MappingCache,
    source_id: &SourceId,
    result: MirrorResult<JobOutcome>,
) -> JobOutcome {
    match result {
        Ok(outcome) => outcome,
        Err(MirrorError::Absent(reason)) => {
            if let Err(err) = mappings.mark_ignored(source_id, &reason).await {
                return MirrorError::from(err).into();
            }
            info!(source_id = %source_id, reason = %reason, "source item absent, ignoring");
            JobOutcome::Skip(reason)
        }
        Err(err) => err.into(),
    }
}

/// Mirrors one source item and queues its replies.
pub struct MirrorItemHandler {
    registry: BridgeRegistry,
    mappings: Arc<dyn MappingCache>,
    jobs: Arc<dyn JobStore>,
    locks: Arc<ItemLocks>,
    max_retries: u32,
}

impl MirrorItemHandler {
    pub fn new(
        registry: BridgeRegistry,
        mappings: Arc<dyn MappingCache>,
        jobs: Arc<dyn JobStore>,
        locks: Arc<ItemLocks>,
    ) -> Self {
        Self {
            registry,
            mappings,
            jobs,
            locks,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Retry budget for the replies jobs this handler enqueues.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    async fn mirror(&self, payload: &MirrorItemPayload) -> MirrorResult<JobOutcome> {
        let pair = payload.pair;
        let source_id = &payload.source_id;
        let bridge = bridge_for(&self.registry, pair)?;

        if let Some(reason) = self.mappings.ignored_reason(source_id).await? {
            return Ok(JobOutcome::Skip(format!("source item ignored: {reason}")));
        }

        let destination_id = {
            let _guard = self.locks.lock(&(pair, source_id.clone())).await;
            self.mirror_locked(bridge.as_ref(), payload).await?
        };

        let replies = MirrorRepliesPayload {
            pair,
            source_id: source_id.clone(),
            destination_id: Some(destination_id),
        };
        let job = NewJob::typed(JobType::MirrorReplies, &replies)
            .map_err(|err| MirrorError::permanent(err.to_string()))?
            .with_max_retries(self.max_retries);
        let queued = self.jobs.enqueue_unique(job, &replies.dedup_key()).await?;
        debug!(source_id = %source_id, replies_job = ?queued.job_id(), "replies job queued");

        Ok(JobOutcome::Done)
    }

    /// Create or resync the destination item while holding the item lock.
    async fn mirror_locked(
        &self,
        bridge: &dyn Bridge,
        payload: &MirrorItemPayload,
    ) -> MirrorResult<DestinationId> {
        let pair = payload.pair;
        let source_id = &payload.source_id;

        match self.mappings.get_entry(pair, source_id).await? {
            Some(existing) if payload.resync => {
                let item = bridge
                    .resync_item(source_id, &existing.destination_id)
                    .await?;
                let context = item.context.as_deref().or(existing.context.as_deref());
                self.mappings
                    .put(pair, source_id, &item.destination_id, context)
                    .await?;
                info!(pair = %pair, source_id = %source_id, destination_id = %item.destination_id, "item resynced");
                Ok(item.destination_id)
            }
            Some(existing) => {
                info!(pair = %pair, source_id = %source_id, destination_id = %existing.destination_id, "item already mirrored");
                Ok(existing.destination_id)
            }
            None => {
                let item = bridge.mirror_item(source_id).await?;
                self.mappings
                    .put(pair, source_id, &item.destination_id, item.context.as_deref())
                    .await?;
                info!(pair = %pair, source_id = %source_id, destination_id = %item.destination_id, "item mirrored");
                Ok(item.destination_id)
            }
        }
    }
}

#[async_trait]
impl JobHandler for MirrorItemHandler {
    async fn handle(&self, job: &Job) -> JobOutcome {
        let payload: MirrorItemPayload = match job.payload_as() {
            Ok(payload) => payload,
            Err(err) => return malformed(job, err),
        };
        let result = self.mirror(&payload).await;
        conclude(self.mappings.as_ref(), &payload.source_id, result).await
    }
}

/// Mirrors the replies under an already-mirrored item.
pub struct MirrorRepliesHandler {
    registry: BridgeRegistry,
    mappings: Arc<dyn MappingCache>,
}

impl MirrorRepliesHandler {
    pub fn new(registry: BridgeRegistry, mappings: Arc<dyn MappingCache>) -> Self {
        Self { registry, mappings }
    }

    async fn mirror(&self, payload: &MirrorRepliesPayload) -> MirrorResult<JobOutcome> {
        let source_id = &payload.source_id;
        let bridge = bridge_for(&self.registry, payload.pair)?;

        if self.mappings.is_ignored(source_id).await? {
            return Ok(JobOutcome::Skip("source item ignored".into()));
        }

        let destination_id = match &payload.destination_id {
            Some(id) => id.clone(),
            None => match self.mappings.get(payload.pair, source_id).await? {
                Some(id) => id,
                None => {
                    return Err(MirrorError::transient(format!(
                        "parent item {source_id} is not mirrored yet"
                    )));
                }
            },
        };

        let report = bridge.mirror_replies(source_id, &destination_id).await?;
        info!(
            pair = %payload.pair,
            source_id = %source_id,
            created = report.created,
            already_mirrored = report.already_mirrored,
            skipped = report.skipped,
            "replies mirrored"
        );
        Ok(JobOutcome::Done)
    }
}

#[async_trait]
impl JobHandler for MirrorRepliesHandler {
    async fn handle(&self, job: &Job) -> JobOutcome {
        let payload: MirrorRepliesPayload = match job.payload_as() {
            Ok(payload) => payload,
            Err(err) => return malformed(job, err),
        };
        let result = self.mirror(&payload).await;
        conclude(self.mappings.as_ref(), &payload.source_id, result).await
    }
}

/// Lists recent items of a source community and queues the unmirrored ones.
pub struct DiscoveryHandler {
    registry: BridgeRegistry,
    mappings: Arc<dyn MappingCache>,
    jobs: Arc<dyn JobStore>,
    max_retries: u32,
}

impl DiscoveryHandler {
    pub fn new(
        registry: BridgeRegistry,
        mappings: Arc<dyn MappingCache>,
        jobs: Arc<dyn JobStore>,
    ) -> Self {
        Self {
            registry,
            mappings,
            jobs,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    async fn discover(&self, payload: &DiscoveryPayload) -> MirrorResult<JobOutcome> {
        let pair = payload.pair;
        let bridge = bridge_for(&self.registry, pair)?;
        let found = bridge.discover(&payload.community, payload.limit).await?;

        let mut enqueued = 0usize;
        for source_id in &found {
            if self.mappings.is_ignored(source_id).await?
                || self.mappings.get(pair, source_id).await?.is_some()
            {
                continue;
            }
            let item = MirrorItemPayload::new(pair, source_id.clone());
            let job = NewJob::typed(JobType::MirrorItem, &item)
                .map_err(|err| MirrorError::permanent(err.to_string()))?
                .with_max_retries(self.max_retries);
            let key = format!("{pair}:{source_id}");
            if self.jobs.enqueue_unique(job, &key).await?.is_new() {
                enqueued += 1;
            }
        }

        if found.is_empty() {
            warn!(pair = %pair, community = %payload.community, "discovery returned no items");
        }
        info!(
            pair = %pair,
            community = %payload.community,
            found = found.len(),
            enqueued,
            "discovery finished"
        );
        Ok(JobOutcome::Done)
    }
}

#[async_trait]
impl JobHandler for DiscoveryHandler {
    async fn handle(&self, job: &Job) -> JobOutcome {
        let payload: DiscoveryPayload = match job.payload_as() {
            Ok(payload) => payload,
            Err(err) => return malformed(job, err),
        };
        match self.discover(&payload).await {
            Ok(outcome) => outcome,
            // A community that disappeared is not an item to ignore.
            Err(err) => err.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use mirrorline_core::{MirroredItem, RepliesReport};
    use serde_json::json;

    use super::*;
    use crate::jobs::{InMemoryJobStore, JobFilter, JobStatus};
    use crate::mapping::InMemoryMappingCache;

    #[derive(Default)]
    struct FakeBridge {
        absent: HashSet<String>,
        creates: AtomicUsize,
        resyncs: AtomicUsize,
        replies: AtomicUsize,
        listing: Mutex<Vec<SourceId>>,
    }

    #[async_trait]
    impl Bridge for FakeBridge {
        fn pair(&self) -> PlatformPair {
            PlatformPair::default()
        }

        async fn mirror_item(&self, source_id: &SourceId) -> MirrorResult<MirroredItem> {
            if self.absent.contains(source_id.as_str()) {
                return Err(MirrorError::absent("deleted by author"));
            }
            let n = self.creates.fetch_add(1, Ordering::SeqCst);
            Ok(MirroredItem {
                destination_id: DestinationId::new(format!("dest-{n}")),
                context: Some("community".into()),
            })
        }

        async fn resync_item(
            &self,
            _source_id: &SourceId,
            destination_id: &DestinationId,
        ) -> MirrorResult<MirroredItem> {
            self.resyncs.fetch_add(1, Ordering::SeqCst);
            Ok(MirroredItem {
                destination_id: destination_id.clone(),
                context: None,
            })
        }

        async fn mirror_replies(
            &self,
            _source_id: &SourceId,
            _destination_id: &DestinationId,
        ) -> MirrorResult<RepliesReport> {
            self.replies.fetch_add(1, Ordering::SeqCst);
            Ok(RepliesReport {
                created: 2,
                ..RepliesReport::default()
            })
        }

        async fn discover(&self, _community: &str, limit: usize) -> MirrorResult<Vec<SourceId>> {
            let listing = self.listing.lock().unwrap();
            Ok(listing.iter().take(limit).cloned().collect())
        }
    }

    struct Fixture {
        bridge: Arc<FakeBridge>,
        mappings: Arc<InMemoryMappingCache>,
        jobs: Arc<InMemoryJobStore>,
        registry: BridgeRegistry,
    }

    fn fixture(bridge: FakeBridge) -> Fixture {
        let bridge = Arc::new(bridge);
        let mut registry = BridgeRegistry::new();
        registry.register(bridge.clone()).unwrap();
        Fixture {
            bridge,
            mappings: Arc::new(InMemoryMappingCache::new()),
            jobs: InMemoryJobStore::arc(),
            registry,
        }
    }

    impl Fixture {
        fn item_handler(&self) -> MirrorItemHandler {
            MirrorItemHandler::new(
                self.registry.clone(),
                self.mappings.clone(),
                self.jobs.clone(),
                Arc::new(ItemLocks::new()),
            )
        }

        async fn job(&self, job_type: JobType, payload: serde_json::Value) -> Job {
            let id = self.jobs.enqueue(NewJob::new(job_type, payload)).await.unwrap();
            self.jobs.get(id).await.unwrap().unwrap()
        }
    }

    #[tokio::test]
    async fn mirror_item_records_mapping_and_queues_replies() {
        let fx = fixture(FakeBridge::default());
        let job = fx.job(JobType::MirrorItem, json!({ "source_id": "t3_a" })).await;

        assert_eq!(fx.item_handler().handle(&job).await, JobOutcome::Done);

        let mapped = fx
            .mappings
            .get(PlatformPair::default(), &SourceId::new("t3_a"))
            .await
            .unwrap();
        assert_eq!(mapped, Some(DestinationId::new("dest-0")));

        let replies = fx
            .jobs
            .list(&JobFilter {
                job_type: Some(JobType::MirrorReplies),
                ..JobFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(replies.len(), 1);
        let payload: MirrorRepliesPayload = replies[0].payload_as().unwrap();
        assert_eq!(payload.destination_id, Some(DestinationId::new("dest-0")));
    }

    #[tokio::test]
    async fn already_mirrored_item_is_not_created_again() {
        let fx = fixture(FakeBridge::default());
        let handler = fx.item_handler();
        for _ in 0..2 {
            let job = fx.job(JobType::MirrorItem, json!({ "source_id": "t3_a" })).await;
            assert_eq!(handler.handle(&job).await, JobOutcome::Done);
        }
        assert_eq!(fx.bridge.creates.load(Ordering::SeqCst), 1);
        assert_eq!(fx.mappings.stats().await.unwrap().mappings(), 1);
    }

    #[tokio::test]
    async fn resync_updates_the_existing_item() {
        let fx = fixture(FakeBridge::default());
        let handler = fx.item_handler();
        let job = fx.job(JobType::MirrorItem, json!({ "source_id": "t3_a" })).await;
        handler.handle(&job).await;

        let job = fx
            .job(JobType::MirrorItem, json!({ "source_id": "t3_a", "resync": true }))
            .await;
        assert_eq!(handler.handle(&job).await, JobOutcome::Done);
        assert_eq!(fx.bridge.creates.load(Ordering::SeqCst), 1);
        assert_eq!(fx.bridge.resyncs.load(Ordering::SeqCst), 1);

        let entry = fx
            .mappings
            .get_entry(PlatformPair::default(), &SourceId::new("t3_a"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.context.as_deref(), Some("community"));
    }

    #[tokio::test]
    async fn absent_items_are_skipped_and_ignored() {
        let fx = fixture(FakeBridge {
            absent: HashSet::from(["t3_gone".to_string()]),
            ..FakeBridge::default()
        });
        let job = fx.job(JobType::MirrorItem, json!({ "source_id": "t3_gone" })).await;

        let outcome = fx.item_handler().handle(&job).await;
        assert!(matches!(outcome, JobOutcome::Skip(_)));
        assert!(fx.mappings.is_ignored(&SourceId::new("t3_gone")).await.unwrap());

        // Later jobs for the item skip without calling the bridge.
        let job = fx.job(JobType::MirrorItem, json!({ "source_id": "t3_gone" })).await;
        assert!(matches!(fx.item_handler().handle(&job).await, JobOutcome::Skip(_)));
        assert_eq!(fx.bridge.creates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn malformed_payload_fails_permanently() {
        let fx = fixture(FakeBridge::default());
        let job = fx.job(JobType::MirrorItem, json!({ "source": 12 })).await;
        assert!(matches!(fx.item_handler().handle(&job).await, JobOutcome::Fail(_)));
    }

    #[tokio::test]
    async fn unknown_pair_fails_permanently() {
        let fx = fixture(FakeBridge::default());
        let job = fx
            .job(JobType::MirrorItem, json!({ "pair": "lemmy:reddit", "source_id": "x" }))
            .await;
        assert!(matches!(fx.item_handler().handle(&job).await, JobOutcome::Fail(_)));
    }

    #[tokio::test]
    async fn replies_wait_for_the_parent_mapping() {
        let fx = fixture(FakeBridge::default());
        let handler = MirrorRepliesHandler::new(fx.registry.clone(), fx.mappings.clone());
        let job = fx.job(JobType::MirrorReplies, json!({ "source_id": "t3_a" })).await;

        assert!(matches!(handler.handle(&job).await, JobOutcome::Retry { .. }));
        assert_eq!(fx.bridge.replies.load(Ordering::SeqCst), 0);

        fx.mappings
            .put(
                PlatformPair::default(),
                &SourceId::new("t3_a"),
                &DestinationId::new("77"),
                None,
            )
            .await
            .unwrap();
        assert_eq!(handler.handle(&job).await, JobOutcome::Done);
        assert_eq!(fx.bridge.replies.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn discovery_queues_only_unmirrored_items() {
        let fx = fixture(FakeBridge::default());
        *fx.bridge.listing.lock().unwrap() = ["t3_a", "t3_b", "t3_c", "t3_d"]
            .into_iter()
            .map(SourceId::new)
            .collect();
        fx.mappings
            .put(
                PlatformPair::default(),
                &SourceId::new("t3_a"),
                &DestinationId::new("1"),
                None,
            )
            .await
            .unwrap();
        fx.mappings
            .mark_ignored(&SourceId::new("t3_b"), "removed")
            .await
            .unwrap();

        let handler =
            DiscoveryHandler::new(fx.registry.clone(), fx.mappings.clone(), fx.jobs.clone());
        let job = fx
            .job(JobType::Discovery, json!({ "community": "rust", "limit": 10 }))
            .await;
        assert_eq!(handler.handle(&job).await, JobOutcome::Done);
        // A second run does not duplicate live jobs.
        assert_eq!(handler.handle(&job).await, JobOutcome::Done);

        let queued = fx
            .jobs
            .list(&JobFilter {
                job_type: Some(JobType::MirrorItem),
                status: Some(JobStatus::Queued),
                ..JobFilter::default()
            })
            .await
            .unwrap();
        let ids: Vec<SourceId> = queued
            .iter()
            .map(|job| job.payload_as::<MirrorItemPayload>().unwrap().source_id)
            .collect();
        assert_eq!(ids, vec![SourceId::new("t3_c"), SourceId::new("t3_d")]);
    }
}

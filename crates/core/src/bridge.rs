//! The `Bridge` port: one implementation per platform pair.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::MirrorResult;
use crate::id::{DestinationId, SourceId};
use crate::platform::PlatformPair;

/// Result of mirroring one source item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirroredItem {
    pub destination_id: DestinationId,
    /// Destination community/channel the item lives in, if known.
    pub context: Option<String>,
}

/// Summary of one reply-mirroring pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepliesReport {
    pub created: usize,
    pub already_mirrored: usize,
    pub skipped: usize,
}

/// Mirrors content from one platform to another.
///
/// Implementations must be safe to call twice for the same `source_id`:
/// the pipeline retries on transient failures and may re-dispatch a job
/// after a crash.
#[async_trait]
pub trait Bridge: Send + Sync {
    fn pair(&self) -> PlatformPair;

    /// Create the destination counterpart of `source_id`.
    async fn mirror_item(&self, source_id: &SourceId) -> MirrorResult<MirroredItem>;

    /// Push the current source content onto an existing destination item.
    async fn resync_item(
        &self,
        source_id: &SourceId,
        destination_id: &DestinationId,
    ) -> MirrorResult<MirroredItem>;

    /// Mirror the reply thread of an item already mirrored as `destination_id`.
    async fn mirror_replies(
        &self,
        source_id: &SourceId,
        destination_id: &DestinationId,
    ) -> MirrorResult<RepliesReport>;

    /// Recent item ids of a source community, newest first.
    async fn discover(&self, community: &str, limit: usize) -> MirrorResult<Vec<SourceId>>;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("a bridge for {0} is already registered")]
    Duplicate(PlatformPair),
}

/// Bridges keyed by platform pair. Populated once at startup.
#[derive(Clone, Default)]
pub struct BridgeRegistry {
    bridges: HashMap<PlatformPair, Arc<dyn Bridge>>,
}

impl BridgeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, bridge: Arc<dyn Bridge>) -> Result<(), RegistryError> {
        let pair = bridge.pair();
        if self.bridges.contains_key(&pair) {
            return Err(RegistryError::Duplicate(pair));
        }
        tracing::debug!(pair = %pair, "bridge registered");
        self.bridges.insert(pair, bridge);
        Ok(())
    }

    pub fn get(&self, pair: PlatformPair) -> Option<Arc<dyn Bridge>> {
        self.bridges.get(&pair).cloned()
    }

    pub fn pairs(&self) -> Vec<PlatformPair> {
        let mut pairs: Vec<_> = self.bridges.keys().copied().collect();
        pairs.sort();
        pairs
    }

    pub fn is_empty(&self) -> bool {
        self.bridges.is_empty()
    }
}

impl std::fmt::Debug for BridgeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeRegistry")
            .field("pairs", &self.pairs())
            .finish()
    }
}

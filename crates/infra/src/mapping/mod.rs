//! Cross-run mapping cache: `(platform pair, source id) → destination id`,
//! plus the set of source items that are permanently excluded.
//!
//! Every mirror attempt consults [`MappingCache::is_ignored`] before doing
//! anything and [`MappingCache::get`] before creating a destination item.

mod in_memory;
mod sqlite;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use mirrorline_core::{DestinationId, MirrorError, PlatformPair, SourceId};

pub use in_memory::InMemoryMappingCache;
pub use sqlite::SqliteMappingCache;

/// One mapping row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mapping {
    pub pair: PlatformPair,
    pub source_id: SourceId,
    pub destination_id: DestinationId,
    /// Destination community/channel, when the bridge reported one.
    pub context: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_synced: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MappingStats {
    pub per_pair: BTreeMap<PlatformPair, u64>,
    pub ignored: u64,
}

impl MappingStats {
    pub fn mappings(&self) -> u64 {
        self.per_pair.values().sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MappingError {
    #[error("corrupt mapping row: {0}")]
    Corrupt(String),
    #[error("mapping storage error: {0}")]
    Storage(String),
}

impl From<sqlx::Error> for MappingError {
    fn from(err: sqlx::Error) -> Self {
        MappingError::Storage(err.to_string())
    }
}

impl From<MappingError> for MirrorError {
    fn from(err: MappingError) -> Self {
        MirrorError::transient(err.to_string())
    }
}

#[async_trait]
pub trait MappingCache: Send + Sync {
    async fn get_entry(
        &self,
        pair: PlatformPair,
        source_id: &SourceId,
    ) -> Result<Option<Mapping>, MappingError>;

    /// Idempotent upsert: one row per key, last write wins on destination
    /// id, context and `last_synced`.
    async fn put(
        &self,
        pair: PlatformPair,
        source_id: &SourceId,
        destination_id: &DestinationId,
        context: Option<&str>,
    ) -> Result<(), MappingError>;

    async fn mark_ignored(&self, source_id: &SourceId, reason: &str) -> Result<(), MappingError>;

    async fn ignored_reason(&self, source_id: &SourceId) -> Result<Option<String>, MappingError>;

    async fn stats(&self) -> Result<MappingStats, MappingError>;

    async fn get(
        &self,
        pair: PlatformPair,
        source_id: &SourceId,
    ) -> Result<Option<DestinationId>, MappingError> {
        Ok(self
            .get_entry(pair, source_id)
            .await?
            .map(|m| m.destination_id))
    }

    async fn is_ignored(&self, source_id: &SourceId) -> Result<bool, MappingError> {
        Ok(self.ignored_reason(source_id).await?.is_some())
    }
}

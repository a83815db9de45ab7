use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use mirrorline_core::{DestinationId, PlatformPair, SourceId};

use crate::db::now;

use super::{Mapping, MappingCache, MappingError, MappingStats};

#[derive(Debug, Default)]
struct State {
    mappings: HashMap<(PlatformPair, SourceId), Mapping>,
    ignored: HashMap<SourceId, String>,
}

/// In-memory mapping cache for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryMappingCache {
    state: RwLock<State>,
}

impl InMemoryMappingCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, MappingError> {
        self.state
            .read()
            .map_err(|_| MappingError::Storage("mapping cache lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, MappingError> {
        self.state
            .write()
            .map_err(|_| MappingError::Storage("mapping cache lock poisoned".into()))
    }
}

#[async_trait]
impl MappingCache for InMemoryMappingCache {
    async fn get_entry(
        &self,
        pair: PlatformPair,
        source_id: &SourceId,
    ) -> Result<Option<Mapping>, MappingError> {
        Ok(self
            .read()?
            .mappings
            .get(&(pair, source_id.clone()))
            .cloned())
    }

    async fn put(
        &self,
        pair: PlatformPair,
        source_id: &SourceId,
        destination_id: &DestinationId,
        context: Option<&str>,
    ) -> Result<(), MappingError> {
        let at = now();
        let mut state = self.write()?;
        let created_at = state
            .mappings
            .get(&(pair, source_id.clone()))
            .map_or(at, |m| m.created_at);
        state.mappings.insert(
            (pair, source_id.clone()),
            Mapping {
                pair,
                source_id: source_id.clone(),
                destination_id: destination_id.clone(),
                context: context.map(str::to_owned),
                created_at,
                last_synced: at,
            },
        );
        Ok(())
    }

    async fn mark_ignored(&self, source_id: &SourceId, reason: &str) -> Result<(), MappingError> {
        self.write()?
            .ignored
            .insert(source_id.clone(), reason.to_owned());
        Ok(())
    }

    async fn ignored_reason(&self, source_id: &SourceId) -> Result<Option<String>, MappingError> {
        Ok(self.read()?.ignored.get(source_id).cloned())
    }

    async fn stats(&self) -> Result<MappingStats, MappingError> {
        let state = self.read()?;
        let mut stats = MappingStats {
            ignored: state.ignored.len() as u64,
            ..MappingStats::default()
        };
        for (pair, _) in state.mappings.keys() {
            *stats.per_pair.entry(*pair).or_default() += 1;
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_keeps_one_row_and_first_creation_time() {
        let cache = InMemoryMappingCache::new();
        let pair = PlatformPair::default();
        let source = SourceId::new("p1");

        cache.put(pair, &source, &DestinationId::new("10"), None).await.unwrap();
        let first = cache.get_entry(pair, &source).await.unwrap().unwrap();
        cache
            .put(pair, &source, &DestinationId::new("11"), Some("rust"))
            .await
            .unwrap();
        let second = cache.get_entry(pair, &source).await.unwrap().unwrap();

        assert_eq!(second.destination_id, DestinationId::new("11"));
        assert_eq!(second.context.as_deref(), Some("rust"));
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(cache.stats().await.unwrap().mappings(), 1);
    }

    #[tokio::test]
    async fn ignored_items_are_reported() {
        let cache = InMemoryMappingCache::new();
        let source = SourceId::new("gone");
        assert!(!cache.is_ignored(&source).await.unwrap());
        cache.mark_ignored(&source, "deleted").await.unwrap();
        assert!(cache.is_ignored(&source).await.unwrap());
        assert_eq!(
            cache.ignored_reason(&source).await.unwrap().as_deref(),
            Some("deleted")
        );
    }
}

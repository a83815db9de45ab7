use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, instrument};

use mirrorline_core::{DestinationId, PlatformPair, SourceId};

use crate::db::{from_millis, now, to_millis, Database};

use super::{Mapping, MappingCache, MappingError, MappingStats};

/// Durable mapping cache on the shared pipeline database.
#[derive(Debug, Clone)]
pub struct SqliteMappingCache {
    pool: SqlitePool,
}

impl SqliteMappingCache {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }
}

#[async_trait]
impl MappingCache for SqliteMappingCache {
    async fn get_entry(
        &self,
        pair: PlatformPair,
        source_id: &SourceId,
    ) -> Result<Option<Mapping>, MappingError> {
        let row = sqlx::query(
            r#"
            SELECT platform_pair, source_id, destination_id, context, created_at, last_synced
            FROM mappings
            WHERE platform_pair = ?1 AND source_id = ?2
            "#,
        )
        .bind(pair.to_string())
        .bind(source_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_mapping).transpose()
    }

    #[instrument(skip_all, fields(pair = %pair, source_id = %source_id), err)]
    async fn put(
        &self,
        pair: PlatformPair,
        source_id: &SourceId,
        destination_id: &DestinationId,
        context: Option<&str>,
    ) -> Result<(), MappingError> {
        let at = to_millis(now());
        sqlx::query(
            r#"
            INSERT INTO mappings (
                platform_pair, source_id, destination_id, context, created_at, last_synced
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?5)
            ON CONFLICT (platform_pair, source_id) DO UPDATE SET
                destination_id = excluded.destination_id,
                context        = excluded.context,
                last_synced    = excluded.last_synced
            "#,
        )
        .bind(pair.to_string())
        .bind(source_id.as_str())
        .bind(destination_id.as_str())
        .bind(context)
        .bind(at)
        .execute(&self.pool)
        .await?;

        debug!(destination_id = %destination_id, "mapping stored");
        Ok(())
    }

    async fn mark_ignored(&self, source_id: &SourceId, reason: &str) -> Result<(), MappingError> {
        sqlx::query(
            r#"
            INSERT INTO ignored (source_id, reason, ignored_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (source_id) DO UPDATE SET
                reason     = excluded.reason,
                ignored_at = excluded.ignored_at
            "#,
        )
        .bind(source_id.as_str())
        .bind(reason)
        .bind(to_millis(now()))
        .execute(&self.pool)
        .await?;

        info!(source_id = %source_id, reason, "source item ignored");
        Ok(())
    }

    async fn ignored_reason(&self, source_id: &SourceId) -> Result<Option<String>, MappingError> {
        let reason: Option<String> = sqlx::query_scalar("SELECT reason FROM ignored WHERE source_id = ?1")
            .bind(source_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(reason)
    }

    async fn stats(&self) -> Result<MappingStats, MappingError> {
        let rows = sqlx::query(
            "SELECT platform_pair, COUNT(*) AS n FROM mappings GROUP BY platform_pair",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = MappingStats::default();
        for row in rows {
            let pair: String = row.try_get("platform_pair")?;
            let pair = pair
                .parse::<PlatformPair>()
                .map_err(|e| MappingError::Corrupt(e.to_string()))?;
            let count: i64 = row.try_get("n")?;
            stats.per_pair.insert(pair, u64::try_from(count).unwrap_or_default());
        }

        let ignored: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ignored")
            .fetch_one(&self.pool)
            .await?;
        stats.ignored = u64::try_from(ignored).unwrap_or_default();
        Ok(stats)
    }
}

fn row_to_mapping(row: &SqliteRow) -> Result<Mapping, MappingError> {
    let pair: String = row.try_get("platform_pair")?;
    let pair = pair
        .parse::<PlatformPair>()
        .map_err(|e| MappingError::Corrupt(e.to_string()))?;
    let source_id: String = row.try_get("source_id")?;
    let destination_id: String = row.try_get("destination_id")?;

    Ok(Mapping {
        pair,
        source_id: SourceId::from(source_id),
        destination_id: DestinationId::from(destination_id),
        context: row.try_get("context")?,
        created_at: from_millis(row.try_get("created_at")?),
        last_synced: from_millis(row.try_get("last_synced")?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn cache() -> SqliteMappingCache {
        SqliteMappingCache::new(&Database::in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn second_put_overwrites_destination() {
        let cache = cache().await;
        let pair = PlatformPair::default();
        let source = SourceId::new("p1");

        cache.put(pair, &source, &DestinationId::new("100"), Some("rust")).await.unwrap();
        cache.put(pair, &source, &DestinationId::new("200"), None).await.unwrap();

        let entry = cache.get_entry(pair, &source).await.unwrap().unwrap();
        assert_eq!(entry.destination_id, DestinationId::new("200"));
        assert_eq!(entry.context, None);
        assert!(entry.last_synced >= entry.created_at);

        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM mappings")
            .fetch_one(&cache.pool)
            .await
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[tokio::test]
    async fn mappings_are_scoped_by_pair() {
        use mirrorline_core::Platform;

        let cache = cache().await;
        let source = SourceId::new("p1");
        let reverse = PlatformPair::new(Platform::Lemmy, Platform::Reddit);
        cache
            .put(PlatformPair::default(), &source, &DestinationId::new("1"), None)
            .await
            .unwrap();

        assert_eq!(cache.get(reverse, &source).await.unwrap(), None);
        assert_eq!(
            cache.get(PlatformPair::default(), &source).await.unwrap(),
            Some(DestinationId::new("1"))
        );
    }

    #[tokio::test]
    async fn stats_count_pairs_and_ignored() {
        let cache = cache().await;
        let pair = PlatformPair::default();
        for id in ["a", "b"] {
            cache
                .put(pair, &SourceId::new(id), &DestinationId::new(id), None)
                .await
                .unwrap();
        }
        cache.mark_ignored(&SourceId::new("c"), "forbidden").await.unwrap();
        cache.mark_ignored(&SourceId::new("c"), "deleted").await.unwrap();

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.per_pair.get(&pair), Some(&2));
        assert_eq!(stats.ignored, 1);
        assert_eq!(
            cache.ignored_reason(&SourceId::new("c")).await.unwrap().as_deref(),
            Some("deleted")
        );
    }
}

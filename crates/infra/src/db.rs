//! SQLite database handle and schema migrations.
//!
//! One database file holds the job table, the mapping cache, the ignored set
//! and the persisted credentials. The pool runs in WAL mode with
//! `synchronous=FULL`, so a committed insert survives a crash right after the
//! call returns.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::Row;
use tracing::{debug, info};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_CONNECTIONS: u32 = 8;

/// Ordered schema migrations. Each entry runs once, inside a transaction, and
/// bumps `schema_meta.version` to its index + 1.
const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        job_type    TEXT    NOT NULL,
        payload     TEXT    NOT NULL,
        status      TEXT    NOT NULL,
        retries     INTEGER NOT NULL DEFAULT 0,
        max_retries INTEGER NOT NULL,
        next_run    INTEGER NOT NULL,
        created_at  INTEGER NOT NULL,
        updated_at  INTEGER NOT NULL,
        last_error  TEXT    NULL,
        dedup_key   TEXT    NULL,
        claimed_by  TEXT    NULL
    );
    CREATE INDEX IF NOT EXISTS idx_jobs_due ON jobs (job_type, status, next_run);
    CREATE INDEX IF NOT EXISTS idx_jobs_dedup ON jobs (job_type, dedup_key)
        WHERE dedup_key IS NOT NULL;

    CREATE TABLE IF NOT EXISTS mappings (
        platform_pair  TEXT    NOT NULL,
        source_id      TEXT    NOT NULL,
        destination_id TEXT    NOT NULL,
        context        TEXT    NULL,
        created_at     INTEGER NOT NULL,
        last_synced    INTEGER NOT NULL,
        PRIMARY KEY (platform_pair, source_id)
    );

    CREATE TABLE IF NOT EXISTS ignored (
        source_id  TEXT    PRIMARY KEY,
        reason     TEXT    NOT NULL,
        ignored_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS credentials (
        principal     TEXT    PRIMARY KEY,
        token         TEXT    NULL,
        issued_at     INTEGER NULL,
        expires_at    INTEGER NULL,
        last_login_at INTEGER NULL
    );
    "#,
];

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("sqlite error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration to version {version} failed: {source}")]
    Migration {
        version: i64,
        #[source]
        source: sqlx::Error,
    },
    #[error("failed to prepare database directory {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Shared handle to the pipeline database. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if missing) the database file at `path` and bring the
    /// schema up to date.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, DbError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| DbError::Io {
                path: parent.display().to_string(),
                source,
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        info!(path = %path.display(), "database opened");
        Ok(db)
    }

    /// Private in-memory database for tests and dry runs.
    ///
    /// Pinned to a single connection that is never recycled: every new
    /// connection to `:memory:` would see an empty database.
    pub async fn in_memory() -> Result<Self, DbError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?
            .journal_mode(SqliteJournalMode::Memory)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Current schema version (0 for a database that was never migrated).
    pub async fn schema_version(&self) -> Result<i64, DbError> {
        let row = sqlx::query("SELECT version FROM schema_meta WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(row) => row.try_get("version")?,
            None => 0,
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn migrate(&self) -> Result<(), DbError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_meta (
                id      INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        let current = self.schema_version().await?;
        for (index, sql) in MIGRATIONS.iter().enumerate() {
            let version = index as i64 + 1;
            if version <= current {
                continue;
            }

            let mut tx = self.pool.begin().await?;
            sqlx::raw_sql(sql)
                .execute(&mut *tx)
                .await
                .map_err(|source| DbError::Migration { version, source })?;
            sqlx::query(
                r#"
                INSERT INTO schema_meta (id, version) VALUES (1, ?1)
                ON CONFLICT (id) DO UPDATE SET version = excluded.version
                "#,
            )
            .bind(version)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            debug!(version, "schema migrated");
        }
        Ok(())
    }
}

/// Current wall-clock time truncated to the millisecond precision we persist.
pub fn now() -> DateTime<Utc> {
    from_millis(Utc::now().timestamp_millis())
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// `chrono::Duration` from a std one, saturating instead of failing.
pub(crate) fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

/// `at + d`, clamped to the latest representable instant.
pub(crate) fn after(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    at.checked_add_signed(chrono_duration(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `at - d`, clamped to the earliest representable instant.
pub(crate) fn before(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    at.checked_sub_signed(chrono_duration(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

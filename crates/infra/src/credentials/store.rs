use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use mirrorline_core::Principal;

use crate::db::{from_millis, to_millis, Database};

use super::{Credential, CredentialError};

/// Persisted credential row for a principal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRecord {
    pub principal: Principal,
    pub token: Option<String>,
    pub issued_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    /// When any process last started a login for this principal.
    pub last_login_at: Option<DateTime<Utc>>,
}

impl CredentialRecord {
    fn empty(principal: Principal) -> Self {
        Self {
            principal,
            token: None,
            issued_at: None,
            expires_at: None,
            last_login_at: None,
        }
    }

    pub fn credential(&self) -> Option<Credential> {
        Some(Credential {
            principal: self.principal.clone(),
            token: self.token.clone()?,
            issued_at: self.issued_at?,
            expires_at: self.expires_at?,
        })
    }
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self, principal: &Principal) -> Result<Option<CredentialRecord>, CredentialError>;

    /// Store a freshly issued credential.
    async fn save(&self, credential: &Credential) -> Result<(), CredentialError>;

    /// Stamp `last_login_at` before a login is attempted.
    async fn record_login_attempt(
        &self,
        principal: &Principal,
        at: DateTime<Utc>,
    ) -> Result<(), CredentialError>;

    /// Clear the stored token if it is still `token`. Returns whether it was.
    async fn expire_token(&self, principal: &Principal, token: &str) -> Result<bool, CredentialError>;
}

/// In-memory credential store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryCredentialStore {
    records: Mutex<HashMap<Principal, CredentialRecord>>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_records<T>(
        &self,
        f: impl FnOnce(&mut HashMap<Principal, CredentialRecord>) -> T,
    ) -> Result<T, CredentialError> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| CredentialError::Storage("credential store lock poisoned".into()))?;
        Ok(f(&mut records))
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn load(&self, principal: &Principal) -> Result<Option<CredentialRecord>, CredentialError> {
        self.with_records(|records| records.get(principal).cloned())
    }

    async fn save(&self, credential: &Credential) -> Result<(), CredentialError> {
        self.with_records(|records| {
            let record = records
                .entry(credential.principal.clone())
                .or_insert_with(|| CredentialRecord::empty(credential.principal.clone()));
            record.token = Some(credential.token.clone());
            record.issued_at = Some(credential.issued_at);
            record.expires_at = Some(credential.expires_at);
        })
    }

    async fn record_login_attempt(
        &self,
        principal: &Principal,
        at: DateTime<Utc>,
    ) -> Result<(), CredentialError> {
        self.with_records(|records| {
            records
                .entry(principal.clone())
                .or_insert_with(|| CredentialRecord::empty(principal.clone()))
                .last_login_at = Some(at);
        })
    }

    async fn expire_token(&self, principal: &Principal, token: &str) -> Result<bool, CredentialError> {
        self.with_records(|records| match records.get_mut(principal) {
            Some(record) if record.token.as_deref() == Some(token) => {
                record.token = None;
                record.issued_at = None;
                record.expires_at = None;
                true
            }
            _ => false,
        })
    }
}

/// Credential records in the `credentials` table of the pipeline database,
/// shared by every process that opens the same file.
#[derive(Debug, Clone)]
pub struct SqliteCredentialStore {
    pool: SqlitePool,
}

impl SqliteCredentialStore {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }
}

#[async_trait]
impl CredentialStore for SqliteCredentialStore {
    async fn load(&self, principal: &Principal) -> Result<Option<CredentialRecord>, CredentialError> {
        let row = sqlx::query(
            r#"
            SELECT token, issued_at, expires_at, last_login_at
            FROM credentials
            WHERE principal = ?1
            "#,
        )
        .bind(principal.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let issued_at: Option<i64> = row.try_get("issued_at")?;
        let expires_at: Option<i64> = row.try_get("expires_at")?;
        let last_login_at: Option<i64> = row.try_get("last_login_at")?;
        Ok(Some(CredentialRecord {
            principal: principal.clone(),
            token: row.try_get("token")?,
            issued_at: issued_at.map(from_millis),
            expires_at: expires_at.map(from_millis),
            last_login_at: last_login_at.map(from_millis),
        }))
    }

    async fn save(&self, credential: &Credential) -> Result<(), CredentialError> {
        sqlx::query(
            r#"
            INSERT INTO credentials (principal, token, issued_at, expires_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (principal) DO UPDATE SET
                token      = excluded.token,
                issued_at  = excluded.issued_at,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(credential.principal.as_str())
        .bind(&credential.token)
        .bind(to_millis(credential.issued_at))
        .bind(to_millis(credential.expires_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_login_attempt(
        &self,
        principal: &Principal,
        at: DateTime<Utc>,
    ) -> Result<(), CredentialError> {
        sqlx::query(
            r#"
            INSERT INTO credentials (principal, last_login_at)
            VALUES (?1, ?2)
            ON CONFLICT (principal) DO UPDATE SET last_login_at = excluded.last_login_at
            "#,
        )
        .bind(principal.as_str())
        .bind(to_millis(at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn expire_token(&self, principal: &Principal, token: &str) -> Result<bool, CredentialError> {
        let result = sqlx::query(
            r#"
            UPDATE credentials
            SET token = NULL, issued_at = NULL, expires_at = NULL
            WHERE principal = ?1 AND token = ?2
            "#,
        )
        .bind(principal.as_str())
        .bind(token)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

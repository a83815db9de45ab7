//! Destination credentials: the login port, persisted token records, the
//! cross-process refresh lock and the broker that ties them together.

mod broker;
mod lock;
mod store;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use mirrorline_core::{MirrorError, Principal};

pub use broker::{BrokerConfig, CredentialBroker};
pub use lock::{RefreshGuard, RefreshLock};
pub use store::{CredentialRecord, CredentialStore, InMemoryCredentialStore, SqliteCredentialStore};

/// A bearer token issued for `principal`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Credential {
    pub principal: Principal,
    #[serde(skip_serializing)]
    pub token: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    /// Usable at `now`, treating the token as expired `skew` early.
    pub fn is_fresh(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        crate::db::after(now, skew) < self.expires_at
    }
}

/// What a successful login returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub token: String,
    /// Server-declared expiry; the broker falls back to its TTL when absent.
    pub expires_at: Option<DateTime<Utc>>,
}

impl IssuedToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            expires_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoginError {
    #[error("login rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("login rejected: {0}")]
    Rejected(String),
    #[error("login unavailable: {0}")]
    Unavailable(String),
}

/// Performs the remote login for a principal.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn login(&self, principal: &Principal) -> Result<IssuedToken, LoginError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialError {
    #[error("login for {principal} still rate limited after {attempts} attempts")]
    RateLimited {
        principal: Principal,
        attempts: u32,
        retry_after: Option<Duration>,
    },
    #[error("login for {principal} rejected: {message}")]
    Rejected { principal: Principal, message: String },
    #[error("login for {principal} unavailable: {message}")]
    Unavailable { principal: Principal, message: String },
    #[error("timed out waiting for refresh lock {path}")]
    LockTimeout { path: String },
    #[error("refresh lock error: {0}")]
    Lock(String),
    #[error("credential storage error: {0}")]
    Storage(String),
}

impl From<sqlx::Error> for CredentialError {
    fn from(err: sqlx::Error) -> Self {
        CredentialError::Storage(err.to_string())
    }
}

/// Every credential failure is retried by the job pipeline. A rejected login
/// usually means the account is being rate limited or locked upstream.
impl From<CredentialError> for MirrorError {
    fn from(err: CredentialError) -> Self {
        match &err {
            CredentialError::RateLimited {
                retry_after: Some(hint),
                ..
            } => MirrorError::transient_after(err.to_string(), *hint),
            _ => MirrorError::transient(err.to_string()),
        }
    }
}

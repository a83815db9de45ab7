use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use mirrorline_core::{MirrorError, MirrorResult, Principal};

use crate::db::{after, chrono_duration, now};
use crate::jobs::RetryPolicy;
use crate::locks::KeyedLocks;

use super::lock::RefreshLock;
use super::store::CredentialStore;
use super::{Authenticator, Credential, CredentialError, LoginError};

/// Credential broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Lifetime assumed for tokens whose login response carries no expiry.
    pub ttl: Duration,
    /// Tokens are treated as expired this long before `expires_at`.
    pub expiry_skew: Duration,
    /// A login by any process within this window makes us wait and re-read
    /// instead of logging in again.
    pub cooldown: Duration,
    /// How long to wait before re-reading inside the cooldown window.
    pub cooldown_wait: Duration,
    /// Upper bound on waiting for the cross-process refresh lock.
    pub lock_timeout: Duration,
    /// Login attempts per refresh while the server keeps rate limiting.
    pub max_login_attempts: u32,
    pub login_backoff: RetryPolicy,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(4 * 60 * 60),
            expiry_skew: Duration::from_secs(30),
            cooldown: Duration::from_secs(90),
            cooldown_wait: Duration::from_secs(5),
            lock_timeout: Duration::from_secs(90),
            max_login_attempts: 5,
            login_backoff: RetryPolicy {
                base: 2,
                unit: Duration::from_secs(1),
                max_delay: Duration::from_secs(60),
                jitter: 0.2,
            },
        }
    }
}

impl BrokerConfig {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration, wait: Duration) -> Self {
        self.cooldown = cooldown;
        self.cooldown_wait = wait;
        self
    }

    pub fn with_login_backoff(mut self, attempts: u32, policy: RetryPolicy) -> Self {
        self.max_login_attempts = attempts.max(1);
        self.login_backoff = policy;
        self
    }
}

/// Hands out bearer tokens per principal and serializes their refresh.
///
/// Three layers keep logins to a minimum:
/// 1. an in-process cache of the current token,
/// 2. one async mutex per principal, so concurrent callers share a single
///    refresh,
/// 3. an advisory file lock plus the persisted `last_login_at`, so separate
///    processes on the same database do not log in back to back.
pub struct CredentialBroker {
    authenticator: Arc<dyn Authenticator>,
    store: Arc<dyn CredentialStore>,
    lock: RefreshLock,
    config: BrokerConfig,
    cache: Mutex<HashMap<Principal, Credential>>,
    flights: KeyedLocks<Principal>,
}

impl CredentialBroker {
    pub fn new(
        authenticator: Arc<dyn Authenticator>,
        store: Arc<dyn CredentialStore>,
        lock: RefreshLock,
        config: BrokerConfig,
    ) -> Self {
        Self {
            authenticator,
            store,
            lock,
            config,
            cache: Mutex::new(HashMap::new()),
            flights: KeyedLocks::new(),
        }
    }

    /// A token for `principal` that is valid now, refreshing if needed.
    pub async fn get_token(&self, principal: &Principal) -> Result<String, CredentialError> {
        if let Some(token) = self.cached(principal) {
            return Ok(token);
        }

        let _flight = self.flights.lock(principal).await;
        // Another caller may have finished the refresh while we waited.
        if let Some(token) = self.cached(principal) {
            return Ok(token);
        }

        let credential = self.refresh(principal).await?;
        let token = credential.token.clone();
        self.remember(credential);
        Ok(token)
    }

    /// Force the next [`get_token`](Self::get_token) to refresh.
    pub async fn invalidate(&self, principal: &Principal) -> Result<(), CredentialError> {
        match self.forget(principal) {
            Some(stale) => self.expire(principal, &stale.token).await,
            None => Ok(()),
        }
    }

    /// Invalidate only if `token` is still the current one. A token that was
    /// already replaced is left alone.
    pub async fn invalidate_token(
        &self,
        principal: &Principal,
        token: &str,
    ) -> Result<(), CredentialError> {
        {
            let mut cache = self.lock_cache();
            if cache.get(principal).is_some_and(|c| c.token == token) {
                cache.remove(principal);
            }
        }
        self.expire(principal, token).await
    }

    /// Run `call` with a valid token. On an authentication error the token is
    /// invalidated, refreshed once and the call retried once; a second
    /// rejection is reported as transient.
    pub async fn with_token<T, F, Fut>(&self, principal: &Principal, mut call: F) -> MirrorResult<T>
    where
        F: FnMut(String) -> Fut + Send,
        Fut: Future<Output = MirrorResult<T>> + Send,
        T: Send,
    {
        let token = self.get_token(principal).await?;
        match call(token.clone()).await {
            Err(MirrorError::Unauthorized(reason)) => {
                warn!(principal = %principal, reason = %reason, "token rejected, refreshing");
                self.invalidate_token(principal, &token).await?;
                let fresh = self.get_token(principal).await?;
                match call(fresh).await {
                    Err(MirrorError::Unauthorized(reason)) => Err(MirrorError::transient(format!(
                        "token rejected again after refresh: {reason}"
                    ))),
                    other => other,
                }
            }
            other => other,
        }
    }

    async fn refresh(&self, principal: &Principal) -> Result<Credential, CredentialError> {
        let _guard = self.lock.acquire(principal).await?;

        let record = self.store.load(principal).await?;
        if let Some(credential) = self.fresh_from(record.as_ref()) {
            debug!(principal = %principal, "reusing token refreshed by another process");
            return Ok(credential);
        }

        let recent_login = record
            .as_ref()
            .and_then(|r| r.last_login_at)
            .is_some_and(|at| now() - at < chrono_duration(self.config.cooldown));
        if recent_login {
            debug!(
                principal = %principal,
                wait_ms = self.config.cooldown_wait.as_millis() as u64,
                "login within cooldown, waiting before re-reading"
            );
            tokio::time::sleep(self.config.cooldown_wait).await;
            let record = self.store.load(principal).await?;
            if let Some(credential) = self.fresh_from(record.as_ref()) {
                return Ok(credential);
            }
        }

        self.store.record_login_attempt(principal, now()).await?;
        let issued = self.login(principal).await?;

        let issued_at = now();
        let credential = Credential {
            principal: principal.clone(),
            token: issued.token,
            issued_at,
            expires_at: issued
                .expires_at
                .unwrap_or_else(|| after(issued_at, self.config.ttl)),
        };
        self.store.save(&credential).await?;
        info!(principal = %principal, expires_at = %credential.expires_at, "logged in");
        Ok(credential)
    }

    async fn login(&self, principal: &Principal) -> Result<super::IssuedToken, CredentialError> {
        let attempts = self.config.max_login_attempts.max(1);
        let mut last_hint = None;

        for attempt in 1..=attempts {
            match self.authenticator.login(principal).await {
                Ok(issued) => return Ok(issued),
                Err(LoginError::RateLimited { retry_after }) => {
                    last_hint = retry_after;
                    if attempt == attempts {
                        break;
                    }
                    let delay = self.config.login_backoff.backoff(attempt - 1, retry_after);
                    warn!(
                        principal = %principal,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "login rate limited, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(LoginError::Rejected(message)) => {
                    return Err(CredentialError::Rejected {
                        principal: principal.clone(),
                        message,
                    });
                }
                Err(LoginError::Unavailable(message)) => {
                    return Err(CredentialError::Unavailable {
                        principal: principal.clone(),
                        message,
                    });
                }
            }
        }

        Err(CredentialError::RateLimited {
            principal: principal.clone(),
            attempts,
            retry_after: last_hint,
        })
    }

    async fn expire(&self, principal: &Principal, token: &str) -> Result<(), CredentialError> {
        if self.store.expire_token(principal, token).await? {
            debug!(principal = %principal, "persisted token expired");
        }
        Ok(())
    }

    fn fresh_from(&self, record: Option<&super::CredentialRecord>) -> Option<Credential> {
        record
            .and_then(|r| r.credential())
            .filter(|c| c.is_fresh(now(), self.config.expiry_skew))
    }

    fn cached(&self, principal: &Principal) -> Option<String> {
        self.lock_cache()
            .get(principal)
            .filter(|c| c.is_fresh(now(), self.config.expiry_skew))
            .map(|c| c.token.clone())
    }

    fn remember(&self, credential: Credential) {
        self.lock_cache()
            .insert(credential.principal.clone(), credential);
    }

    fn forget(&self, principal: &Principal) -> Option<Credential> {
        self.lock_cache().remove(principal)
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<Principal, Credential>> {
        match self.cache.lock() {
            Ok(cache) => cache,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl std::fmt::Debug for CredentialBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialBroker")
            .field("lock", &self.lock)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

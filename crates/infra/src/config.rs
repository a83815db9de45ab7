//! Pipeline configuration loading and representation.
//!
//! Every knob has a default; `from_env` overrides them from `MIRRORLINE_*`
//! variables and falls back to the default (with a warning) when a value
//! does not parse.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::credentials::BrokerConfig;
use crate::jobs::{JobType, RetryPolicy};

pub const ENV_PREFIX: &str = "MIRRORLINE_";

const DEFAULT_CONCURRENCY: usize = 2;

/// Upper bound for every configured duration.
pub const MAX_DURATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid configuration for {field}: {reason}")]
pub struct ConfigError {
    pub field: &'static str,
    pub reason: String,
}

impl ConfigError {
    fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// Runtime configuration for the dispatcher, worker pools and credential
/// broker.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// SQLite database file.
    pub database: PathBuf,
    /// Directory holding the cross-process credential lock files.
    pub lock_dir: PathBuf,
    pub poll_interval: Duration,
    /// Jobs due within this window after a poll are claimed early and
    /// parked by their pool.
    pub lookahead: Duration,
    pub heartbeat_interval: Duration,
    /// `in_progress` jobs without a heartbeat for this long are reclaimed.
    pub stale_grace: Duration,
    pub sweep_interval: Duration,
    pub max_retries: u32,
    pub retry: RetryPolicy,
    /// Minimum spacing between calls to the destination platform.
    pub min_call_interval: Duration,
    pub token_ttl: Duration,
    pub login_cooldown: Duration,
    pub concurrency: BTreeMap<JobType, usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let poll_interval = Duration::from_secs(5);
        Self {
            database: PathBuf::from("mirrorline.db"),
            lock_dir: PathBuf::from("locks"),
            poll_interval,
            lookahead: poll_interval,
            heartbeat_interval: Duration::from_secs(30),
            stale_grace: Duration::from_secs(10 * 60),
            sweep_interval: Duration::from_secs(60),
            max_retries: crate::jobs::DEFAULT_MAX_RETRIES,
            retry: RetryPolicy::default(),
            min_call_interval: Duration::from_secs(1),
            token_ttl: Duration::from_secs(4 * 60 * 60),
            login_cooldown: Duration::from_secs(90),
            concurrency: JobType::ALL
                .into_iter()
                .map(|t| (t, DEFAULT_CONCURRENCY))
                .collect(),
        }
    }
}

impl PipelineConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key → value source (the environment in
    /// production, a map in tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let mut config = Self::default();

        if let Some(path) = env.raw("DATABASE") {
            config.database = PathBuf::from(path);
        }
        if let Some(dir) = env.raw("LOCK_DIR") {
            config.lock_dir = PathBuf::from(dir);
        }

        config.poll_interval = env.millis("POLL_INTERVAL_MS", config.poll_interval);
        // Lookahead follows the poll interval unless set explicitly.
        config.lookahead = env.millis("LOOKAHEAD_MS", config.poll_interval);
        config.heartbeat_interval =
            env.secs("HEARTBEAT_INTERVAL_SECS", config.heartbeat_interval);
        config.stale_grace = env.secs("STALE_GRACE_SECS", config.stale_grace);
        config.sweep_interval = env.secs("SWEEP_INTERVAL_SECS", config.sweep_interval);
        config.max_retries = env.parse("MAX_RETRIES", config.max_retries);
        config.retry.base = env.parse("RETRY_BASE", config.retry.base);
        config.retry.max_delay = env.secs("RETRY_MAX_DELAY_SECS", config.retry.max_delay);
        config.min_call_interval = env.millis("MIN_CALL_INTERVAL_MS", config.min_call_interval);
        config.token_ttl = env.secs("TOKEN_TTL_SECS", config.token_ttl);
        config.login_cooldown = env.secs("LOGIN_COOLDOWN_SECS", config.login_cooldown);

        for job_type in JobType::ALL {
            let key = format!("CONCURRENCY_{}", concurrency_suffix(job_type));
            let current = config.concurrency_for(job_type);
            config.concurrency.insert(job_type, env.parse(&key, current));
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("poll_interval", self.poll_interval),
            ("heartbeat_interval", self.heartbeat_interval),
            ("sweep_interval", self.sweep_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::new(field, "must be greater than zero"));
            }
        }
        for (field, value) in [
            ("poll_interval", self.poll_interval),
            ("lookahead", self.lookahead),
            ("heartbeat_interval", self.heartbeat_interval),
            ("stale_grace", self.stale_grace),
            ("sweep_interval", self.sweep_interval),
            ("retry.unit", self.retry.unit),
            ("retry.max_delay", self.retry.max_delay),
            ("min_call_interval", self.min_call_interval),
            ("token_ttl", self.token_ttl),
            ("login_cooldown", self.login_cooldown),
        ] {
            if value > MAX_DURATION {
                return Err(ConfigError::new(
                    field,
                    format!("must not exceed {}s", MAX_DURATION.as_secs()),
                ));
            }
        }
        if self.retry.base == 0 {
            return Err(ConfigError::new("retry.base", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(ConfigError::new("retry.jitter", "must be within 0.0..=1.0"));
        }
        let minimum_grace = self
            .heartbeat_interval
            .checked_mul(2)
            .and_then(|beats| beats.checked_add(self.lookahead))
            .unwrap_or(Duration::MAX);
        if self.stale_grace <= minimum_grace {
            return Err(ConfigError::new(
                "stale_grace",
                format!(
                    "must exceed lookahead + 2 x heartbeat interval ({}s)",
                    minimum_grace.as_secs()
                ),
            ));
        }
        if let Some((job_type, _)) = self.concurrency.iter().find(|(_, n)| **n == 0) {
            return Err(ConfigError::new(
                "concurrency",
                format!("{job_type} pool needs at least one worker"),
            ));
        }
        Ok(())
    }

    pub fn concurrency_for(&self, job_type: JobType) -> usize {
        self.concurrency
            .get(&job_type)
            .copied()
            .unwrap_or(DEFAULT_CONCURRENCY)
    }

    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig::default()
            .with_ttl(self.token_ttl)
            .with_cooldown(self.login_cooldown, BrokerConfig::default().cooldown_wait)
    }

    pub fn with_database(mut self, path: impl Into<PathBuf>) -> Self {
        self.database = path.into();
        self
    }

    pub fn with_lock_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.lock_dir = dir.into();
        self
    }

    /// Set the poll interval and the lookahead together.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self.lookahead = interval;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_stale_grace(mut self, grace: Duration) -> Self {
        self.stale_grace = grace;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn with_min_call_interval(mut self, interval: Duration) -> Self {
        self.min_call_interval = interval;
        self
    }

    pub fn with_concurrency(mut self, job_type: JobType, workers: usize) -> Self {
        self.concurrency.insert(job_type, workers);
        self
    }
}

fn concurrency_suffix(job_type: JobType) -> String {
    job_type.as_str().replace('-', "_").to_ascii_uppercase()
}

struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn raw(&self, key: &str) -> Option<String> {
        (self.lookup)(&format!("{ENV_PREFIX}{key}"))
            .map(|v| v.trim().to_owned())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: FromStr + Copy + std::fmt::Debug>(&self, key: &str, default: T) -> T {
        let Some(raw) = self.raw(key) else {
            return default;
        };
        match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(
                    key = %format!("{ENV_PREFIX}{key}"),
                    value = %raw,
                    default = ?default,
                    "unparsable configuration value; using default"
                );
                default
            }
        }
    }

    fn secs(&self, key: &str, default: Duration) -> Duration {
        Duration::from_secs(self.parse(key, default.as_secs()))
    }

    fn millis(&self, key: &str, default: Duration) -> Duration {
        Duration::from_millis(self.parse(key, default.as_millis() as u64))
    }
}

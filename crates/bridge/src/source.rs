//! Source adapter port and the normalized content it produces.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use mirrorline_core::{MirrorError, SourceId};

/// A post or submission fetched from the source platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceItem {
    pub id: SourceId,
    /// Source community (subreddit, feed, tag).
    pub community: String,
    pub title: String,
    pub body: String,
    pub author: Option<String>,
    pub url: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A reply in an item's thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceReply {
    pub id: SourceId,
    /// Parent reply; `None` for a top-level reply to the item.
    pub parent_id: Option<SourceId>,
    pub author: Option<String>,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceErrorCode {
    /// The item was deleted or never existed.
    NotFound,
    /// The item exists but cannot be read (private, quarantined, banned).
    Forbidden,
    RateLimited,
    /// Timeouts, connection failures and 5xx responses.
    Unavailable,
    /// The platform answered with something that cannot be normalized.
    Malformed,
}

impl fmt::Display for SourceErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SourceErrorCode::NotFound => "not_found",
            SourceErrorCode::Forbidden => "forbidden",
            SourceErrorCode::RateLimited => "rate_limited",
            SourceErrorCode::Unavailable => "unavailable",
            SourceErrorCode::Malformed => "malformed",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("source {code}: {message}")]
pub struct SourceError {
    pub code: SourceErrorCode,
    pub message: String,
    pub retry_after: Option<Duration>,
}

impl SourceError {
    pub fn new(code: SourceErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn rate_limited(retry_after: Option<Duration>) -> Self {
        Self {
            code: SourceErrorCode::RateLimited,
            message: "rate limited".into(),
            retry_after,
        }
    }
}

impl From<SourceError> for MirrorError {
    fn from(err: SourceError) -> Self {
        let message = err.to_string();
        match err.code {
            SourceErrorCode::NotFound | SourceErrorCode::Forbidden => MirrorError::absent(message),
            SourceErrorCode::RateLimited | SourceErrorCode::Unavailable => match err.retry_after {
                Some(hint) => MirrorError::transient_after(message, hint),
                None => MirrorError::transient(message),
            },
            SourceErrorCode::Malformed => MirrorError::permanent(message),
        }
    }
}

/// Read access to the source platform.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    async fn fetch_item(&self, id: &SourceId) -> Result<SourceItem, SourceError>;

    /// Every reply under the item as a flat list, parents before children
    /// when the platform provides that order.
    async fn fetch_replies(&self, id: &SourceId) -> Result<Vec<SourceReply>, SourceError>;

    /// Newest item ids of `community`.
    async fn list_recent(&self, community: &str, limit: usize)
    -> Result<Vec<SourceId>, SourceError>;
}

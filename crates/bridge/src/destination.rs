//! Destination client port.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use mirrorline_core::{DestinationId, MirrorError};
use mirrorline_infra::credentials::Authenticator;

use crate::source::{SourceItem, SourceReply};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DestinationErrorCode {
    /// Missing, expired or revoked token.
    Unauthorized,
    RateLimited,
    /// Timeouts, connection failures and 5xx responses.
    Unavailable,
    /// The request was understood and refused (validation, banned content).
    Rejected,
    /// The target community or item does not exist on the destination.
    NotFound,
}

impl fmt::Display for DestinationErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DestinationErrorCode::Unauthorized => "unauthorized",
            DestinationErrorCode::RateLimited => "rate_limited",
            DestinationErrorCode::Unavailable => "unavailable",
            DestinationErrorCode::Rejected => "rejected",
            DestinationErrorCode::NotFound => "not_found",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("destination {code}: {message}")]
pub struct DestinationError {
    pub code: DestinationErrorCode,
    pub message: String,
    pub retry_after: Option<Duration>,
}

impl DestinationError {
    pub fn new(code: DestinationErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn rate_limited(retry_after: Option<Duration>) -> Self {
        Self {
            code: DestinationErrorCode::RateLimited,
            message: "rate limited".into(),
            retry_after,
        }
    }
}

impl From<DestinationError> for MirrorError {
    fn from(err: DestinationError) -> Self {
        let message = err.to_string();
        match err.code {
            DestinationErrorCode::Unauthorized => MirrorError::unauthorized(message),
            DestinationErrorCode::RateLimited | DestinationErrorCode::Unavailable => {
                match err.retry_after {
                    Some(hint) => MirrorError::transient_after(message, hint),
                    None => MirrorError::transient(message),
                }
            }
            DestinationErrorCode::Rejected | DestinationErrorCode::NotFound => {
                MirrorError::permanent(message)
            }
        }
    }
}

/// Write access to the destination platform. Logging in is the
/// [`Authenticator`] half; every other call takes a bearer token issued by
/// it.
#[async_trait]
pub trait DestinationClient: Authenticator {
    /// Destination id of the community named `community`.
    async fn resolve_context(&self, token: &str, community: &str)
    -> Result<String, DestinationError>;

    async fn create_item(
        &self,
        token: &str,
        item: &SourceItem,
        context: &str,
    ) -> Result<DestinationId, DestinationError>;

    async fn update_item(
        &self,
        token: &str,
        id: &DestinationId,
        item: &SourceItem,
    ) -> Result<(), DestinationError>;

    /// Reply under `item_id`, nested below `parent_reply_id` when given.
    async fn create_reply(
        &self,
        token: &str,
        item_id: &DestinationId,
        parent_reply_id: Option<&DestinationId>,
        reply: &SourceReply,
    ) -> Result<DestinationId, DestinationError>;
}

#[cfg(test)]
mod tests {
    use mirrorline_core::ErrorClass;

    use super::*;

    #[test]
    fn codes_map_onto_error_classes() {
        let class = |code| MirrorError::from(DestinationError::new(code, "x")).class();
        assert_eq!(class(DestinationErrorCode::Unauthorized), ErrorClass::Authentication);
        assert_eq!(class(DestinationErrorCode::RateLimited), ErrorClass::Transient);
        assert_eq!(class(DestinationErrorCode::Unavailable), ErrorClass::Transient);
        assert_eq!(class(DestinationErrorCode::Rejected), ErrorClass::Permanent);
        assert_eq!(class(DestinationErrorCode::NotFound), ErrorClass::Permanent);
    }
}

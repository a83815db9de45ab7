//! Mirror error taxonomy.

use std::time::Duration;

use thiserror::Error;

/// Result type used by bridges and job handlers.
pub type MirrorResult<T> = Result<T, MirrorError>;

/// Failure of a mirror operation, classified by how the pipeline must react.
///
/// Collaborators (source adapters, destination clients) translate their own
/// error codes into one of these variants; nothing downstream inspects error
/// text to decide whether to retry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MirrorError {
    /// Timeouts, 5xx responses, rate limiting. Retried with backoff.
    #[error("transient failure: {message}")]
    Transient {
        message: String,
        /// Server-supplied hint for the earliest sensible retry.
        retry_after: Option<Duration>,
    },

    /// The destination rejected the bearer token.
    #[error("authentication rejected: {0}")]
    Unauthorized(String),

    /// Validation errors, malformed payloads. Never retried.
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// The source item is gone or no longer accessible.
    #[error("source item absent: {0}")]
    Absent(String),
}

/// Coarse classification of a [`MirrorError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    Transient,
    Authentication,
    Permanent,
    Absent,
}

impl MirrorError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient {
            message: msg.into(),
            retry_after: None,
        }
    }

    pub fn transient_after(msg: impl Into<String>, retry_after: Duration) -> Self {
        Self::Transient {
            message: msg.into(),
            retry_after: Some(retry_after),
        }
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn absent(msg: impl Into<String>) -> Self {
        Self::Absent(msg.into())
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            MirrorError::Transient { .. } => ErrorClass::Transient,
            MirrorError::Unauthorized(_) => ErrorClass::Authentication,
            MirrorError::Permanent(_) => ErrorClass::Permanent,
            MirrorError::Absent(_) => ErrorClass::Absent,
        }
    }

    /// Retry hint carried by a transient error, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            MirrorError::Transient { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Failure to parse a persisted or user-supplied name.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid {kind}: {value:?}")]
pub struct ParseError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseError {
    pub fn new(kind: &'static str, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_follows_variant() {
        assert_eq!(MirrorError::transient("503").class(), ErrorClass::Transient);
        assert_eq!(
            MirrorError::unauthorized("expired").class(),
            ErrorClass::Authentication
        );
        assert_eq!(MirrorError::permanent("bad").class(), ErrorClass::Permanent);
        assert_eq!(MirrorError::absent("deleted").class(), ErrorClass::Absent);
    }

    #[test]
    fn retry_hint_only_on_transient() {
        let err = MirrorError::transient_after("rate limited", Duration::from_secs(7));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
        assert_eq!(MirrorError::permanent("x").retry_after(), None);
    }
}

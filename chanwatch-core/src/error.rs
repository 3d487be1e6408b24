//! Error types for chanwatch-core

use std::time::Duration;
use thiserror::Error;

/// Main error type for the chanwatch-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Network or upstream failure that may succeed on retry
    #[error("transport error: {0}")]
    Transport(String),

    /// Upstream asked us to wait before the next request
    #[error("rate limited: upstream requested a {}s wait", .wait.as_secs())]
    RateLimited { wait: Duration },

    /// Credentials rejected or session expired
    #[error("not authorized: {0} (check source.token or re-authenticate the collecting account)")]
    Unauthorized(String),

    /// Channel exists but the collecting identity cannot read it
    #[error("channel {0} is private: join it with the collecting account or use credentials that have access")]
    ChannelPrivate(String),

    /// Channel name does not resolve
    #[error("channel {0} does not exist or its username is invalid")]
    ChannelInvalid(String),

    /// A single raw item could not be normalized
    #[error("could not normalize {backend} item: {message}")]
    Normalize {
        backend: String,
        message: String,
        /// Upstream id, when the item carried a readable one
        message_id: Option<i64>,
    },

    /// Adapter used before `connect`
    #[error("source adapter is not connected")]
    NotConnected,

    /// Media download failure
    #[error("media error: {0}")]
    Media(String),
}

/// How the fetch loop reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// One item is bad; skip it and keep going.
    Item,
    /// Retry the same request later.
    Transient,
    /// Wait the mandated time, possibly rotate endpoints.
    RateLimit,
    /// The session cannot continue; stop the run.
    SessionFatal,
}

impl Error {
    /// Classify this error for recovery purposes.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Normalize { .. } | Error::Media(_) => ErrorClass::Item,
            Error::Transport(_) => ErrorClass::Transient,
            Error::RateLimited { .. } => ErrorClass::RateLimit,
            Error::Unauthorized(_)
            | Error::ChannelPrivate(_)
            | Error::ChannelInvalid(_)
            | Error::NotConnected
            | Error::Database(_)
            | Error::Io(_)
            | Error::Json(_)
            | Error::Config(_) => ErrorClass::SessionFatal,
        }
    }

    /// True when the error concerns a single channel rather than the session.
    pub fn is_channel_access(&self) -> bool {
        matches!(self, Error::ChannelPrivate(_) | Error::ChannelInvalid(_))
    }

    pub(crate) fn normalize(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Normalize {
            backend: backend.into(),
            message: message.into(),
            message_id: None,
        }
    }

    /// Normalization failure for an item whose id was readable.
    pub(crate) fn normalize_item(
        backend: impl Into<String>,
        message_id: i64,
        message: impl Into<String>,
    ) -> Self {
        Error::Normalize {
            backend: backend.into(),
            message: message.into(),
            message_id: Some(message_id),
        }
    }

    /// Id of the item that failed to normalize, if known.
    pub fn item_id(&self) -> Option<i64> {
        match self {
            Error::Normalize { message_id, .. } => *message_id,
            _ => None,
        }
    }
}

/// Result type alias for chanwatch-core
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(
            Error::normalize("web", "missing post id").class(),
            ErrorClass::Item
        );
        assert_eq!(
            Error::Transport("timeout".to_string()).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            Error::RateLimited {
                wait: Duration::from_secs(30)
            }
            .class(),
            ErrorClass::RateLimit
        );
        assert_eq!(
            Error::ChannelPrivate("secret".to_string()).class(),
            ErrorClass::SessionFatal
        );
    }

    #[test]
    fn test_access_errors_are_actionable() {
        let msg = Error::ChannelPrivate("secretchan".to_string()).to_string();
        assert!(msg.contains("secretchan"));
        assert!(msg.contains("join"));
        assert!(Error::ChannelInvalid("x".to_string()).is_channel_access());
        assert!(!Error::Unauthorized("x".to_string()).is_channel_access());
    }

    #[test]
    fn test_item_id_is_carried() {
        assert_eq!(Error::normalize("web", "no id").item_id(), None);
        let err = Error::normalize_item("api", 42, "message 42 has no date");
        assert_eq!(err.item_id(), Some(42));
        assert_eq!(err.class(), ErrorClass::Item);
        assert_eq!(Error::Transport("x".into()).item_id(), None);
    }
}

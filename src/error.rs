use std::time::Duration;

use thiserror::Error;

/// Failure taxonomy shared by storage, transport and dispatch code.
#[derive(Debug, Error)]
pub enum Error {
    /// Network hiccup or transient server status; safe to retry.
    #[error("transient failure: {message}")]
    Transient { message: String },

    /// The platform asked us to back off.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("{what} not found")]
    NotFound { what: String },

    #[error("missing {what}")]
    State { what: String },

    #[error("invite is expired")]
    Expired,

    #[error("{message}")]
    Fatal { message: String },

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Telegram(#[from] teloxide::RequestError),

    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    #[must_use]
    pub fn state(what: impl Into<String>) -> Self {
        Self::State { what: what.into() }
    }

    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// User input rejected by a registered validator.
///
/// `key` is a localization key; the router resolves it against the
/// sender's culture before replying.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("validation failed: {key}")]
pub struct ValidationError {
    pub key: String,
}

impl ValidationError {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

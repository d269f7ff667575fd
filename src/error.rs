//! Error types for the admission gateway
//!
//! These cover infrastructure failures only. Caller-facing outcomes live in
//! [`crate::auth::AuthError`] and [`crate::limiter::RateLimitError`].

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for the admission gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Admission gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Shared cache command failed
    #[error("Shared cache error: {0}")]
    Cache(String),

    /// Shared cache command did not complete in time
    #[error("Shared cache timed out after {0:?}")]
    CacheTimeout(Duration),

    /// Verification key set could not be fetched
    #[error("Key set fetch failed: {0}")]
    KeyFetch(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error comes from the shared cache tier
    #[must_use]
    pub fn is_cache_failure(&self) -> bool {
        matches!(self, Self::Cache(_) | Self::CacheTimeout(_))
    }
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Self::Cache(e.to_string())
    }
}

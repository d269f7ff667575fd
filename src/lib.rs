//! Admission Gateway Library
//!
//! Request admission control for HTTP services: every request is
//! authenticated against an issuer's published key set, classified into a
//! rate-limit tier, and checked against counters held in a shared cache so
//! that all instances enforce one budget.
//!
//! # Features
//!
//! - **Trust root cache**: JWKS fetched lazily, cached with a TTL, refreshed
//!   once on unknown key ids, stale keys served while the issuer is down
//! - **Token verification**: algorithm allow-list, issuer/audience/expiry checks
//! - **Policy resolution**: role tiers, endpoint and method overrides, whitelist
//!   and internal service bypass
//! - **Rate limiting**: sliding window or token bucket, hourly/daily/global caps,
//!   concurrency slots, adaptive reduction, failed-auth lockout
//! - **Annotation**: `X-RateLimit-*` headers, `Retry-After`, structured 401/429/503

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod annotate;
pub mod auth;
pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod limiter;
pub mod policy;
pub mod store;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(format!("Failed to install subscriber: {e}"))),
        Some("text") | None => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(format!("Failed to install subscriber: {e}"))),
        Some(other) => Err(Error::Config(format!(
            "Unknown log format {other:?}, expected text or json"
        ))),
    }
}

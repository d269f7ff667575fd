//! Shared cache tier holding all authoritative limiter state.
//!
//! [`SharedCache`] dispatches to one of two backends behind the same set of
//! atomic primitives:
//!
//! - [`RedisStore`]: cluster-wide state, every primitive is a single Lua script
//!   so check-and-mutate never spans two round trips.
//! - [`MemoryStore`]: single-instance fallback when no Redis URL is configured.
//!
//! Every call is bounded by the configured operation timeout; callers decide
//! whether a failure fails open or closed.

mod memory;
mod redis_store;

pub use memory::{MemoryStore, refill_tokens};
pub use redis_store::RedisStore;

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::info;

use crate::config::CacheConfig;
use crate::{Error, Result};

/// One sliding-window admission attempt
#[derive(Debug, Clone)]
pub struct WindowRequest {
    /// Fully qualified cache key
    pub key: String,
    /// Current time (epoch milliseconds)
    pub now_ms: u64,
    /// Window length in milliseconds
    pub window_ms: u64,
    /// Maximum slots inside the window
    pub limit: u64,
    /// Slots this request occupies
    pub cost: u64,
    /// Unique member id for this request
    pub member: String,
}

/// Outcome of a sliding-window attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowReply {
    /// Whether the request was admitted (and recorded)
    pub allowed: bool,
    /// Occupied slots after the attempt
    pub count: u64,
    /// Timestamp of the oldest surviving entry
    pub oldest_ms: Option<u64>,
    /// On refusal, the entry whose expiry leaves room for the request's cost;
    /// `None` when admitted or when the cost exceeds the limit
    pub room_at_ms: Option<u64>,
}

/// One token-bucket admission attempt
#[derive(Debug, Clone)]
pub struct BucketRequest {
    /// Fully qualified cache key
    pub key: String,
    /// Current time (epoch milliseconds)
    pub now_ms: u64,
    /// Refill rate in tokens per second
    pub rate_per_sec: f64,
    /// Bucket capacity
    pub burst: f64,
    /// Tokens this request spends
    pub cost: f64,
    /// Idle expiry of the bucket state
    pub ttl_ms: u64,
}

/// Outcome of a token-bucket attempt
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketReply {
    /// Whether the request was admitted (and its cost deducted)
    pub allowed: bool,
    /// Tokens left after the attempt
    pub tokens: f64,
}

#[derive(Clone)]
enum Backend {
    Redis(RedisStore),
    Memory(MemoryStore),
}

/// Handle to the shared cache tier
#[derive(Clone)]
pub struct SharedCache {
    backend: Backend,
    op_timeout: Duration,
    /// Simulated round trip of the memory backend, applied after the write
    latency: Option<Duration>,
}

impl SharedCache {
    /// In-process store with the given per-call timeout
    #[must_use]
    pub fn memory(op_timeout: Duration) -> Self {
        Self {
            backend: Backend::Memory(MemoryStore::new()),
            op_timeout,
            latency: None,
        }
    }

    /// In-process store whose replies arrive `latency` after each operation
    /// has been applied, like a slow Redis round trip
    #[cfg(test)]
    pub(crate) fn memory_with_latency(op_timeout: Duration, latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::memory(op_timeout)
        }
    }

    /// The same store without simulated latency
    #[cfg(test)]
    pub(crate) fn without_latency(&self) -> Self {
        Self {
            latency: None,
            ..self.clone()
        }
    }

    /// Redis-backed store. The connection is established lazily on first use.
    pub fn redis(url: &str, op_timeout: Duration) -> Result<Self> {
        Ok(Self {
            backend: Backend::Redis(RedisStore::new(url)?),
            op_timeout,
            latency: None,
        })
    }

    /// Build the store selected by configuration
    pub fn from_config(config: &CacheConfig) -> Result<Self> {
        if let Some(url) = config.resolve_redis_url().filter(|u| !u.is_empty()) {
            info!(timeout = ?config.op_timeout, "Using Redis shared cache");
            Self::redis(&url, config.op_timeout)
        } else {
            info!("No redis_url configured, limiter state is local to this instance");
            Ok(Self::memory(config.op_timeout))
        }
    }

    /// Backend name for logs
    #[must_use]
    pub fn backend_name(&self) -> &'static str {
        match self.backend {
            Backend::Redis(_) => "redis",
            Backend::Memory(_) => "memory",
        }
    }

    /// Per-call timeout
    #[must_use]
    pub fn op_timeout(&self) -> Duration {
        self.op_timeout
    }

    /// Prune, count, conditionally insert and refresh expiry in one step
    pub async fn sliding_window(&self, req: &WindowRequest) -> Result<WindowReply> {
        match &self.backend {
            Backend::Redis(r) => self.bounded(r.sliding_window(req)).await,
            Backend::Memory(m) => self.local(m.sliding_window(req)).await,
        }
    }

    /// Refill, conditionally spend and persist a token bucket in one step
    pub async fn token_bucket(&self, req: &BucketRequest) -> Result<BucketReply> {
        match &self.backend {
            Backend::Redis(r) => self.bounded(r.token_bucket(req)).await,
            Backend::Memory(m) => self.local(m.token_bucket(req)).await,
        }
    }

    /// Increment a counter and refresh its expiry
    pub async fn incr(&self, key: &str, ttl: Duration) -> Result<i64> {
        match &self.backend {
            Backend::Redis(r) => self.bounded(r.incr(key, ttl)).await,
            Backend::Memory(m) => self.local(m.incr(key, ttl)).await,
        }
    }

    /// Decrement a counter, never below zero
    pub async fn decr(&self, key: &str) -> Result<i64> {
        match &self.backend {
            Backend::Redis(r) => self.bounded(r.decr(key)).await,
            Backend::Memory(m) => self.local(m.decr(key)).await,
        }
    }

    /// Read a string value
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        match &self.backend {
            Backend::Redis(r) => self.bounded(r.get(key)).await,
            Backend::Memory(m) => self.local(m.get(key)).await,
        }
    }

    /// Write a string value with an expiry
    pub async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        match &self.backend {
            Backend::Redis(r) => self.bounded(r.set(key, value, ttl)).await,
            Backend::Memory(m) => {
                m.set(key, value, ttl);
                self.local(()).await
            }
        }
    }

    /// Whether a key is present
    pub async fn exists(&self, key: &str) -> Result<bool> {
        match &self.backend {
            Backend::Redis(r) => self.bounded(r.exists(key)).await,
            Backend::Memory(m) => self.local(m.exists(key)).await,
        }
    }

    async fn local<T>(&self, reply: T) -> Result<T> {
        match self.latency {
            Some(latency) => {
                self.bounded(async move {
                    tokio::time::sleep(latency).await;
                    Ok(reply)
                })
                .await
            }
            None => Ok(reply),
        }
    }

    async fn bounded<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.op_timeout, fut)
            .await
            .map_err(|_| Error::CacheTimeout(self.op_timeout))?
    }
}

/// Current wall-clock time in epoch milliseconds
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// Duration in whole milliseconds, at least one
pub(crate) fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

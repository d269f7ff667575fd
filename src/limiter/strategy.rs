//! Per-caller limiting algorithms.

use std::time::Duration;

use uuid::Uuid;

use super::QuotaSnapshot;
use crate::Result;
use crate::config::StrategyKind;
use crate::policy::LimitPolicy;
use crate::store::{BucketRequest, SharedCache, WindowRequest, ttl_millis};

/// Result of one strategy check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    /// Whether the request fits
    pub allowed: bool,
    /// Quota after the check
    pub quota: QuotaSnapshot,
    /// Wait before a retry can succeed (zero when allowed)
    pub retry_after: Duration,
}

/// Limiting algorithm. Both run as one atomic cache operation per check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Admitted-request timestamps inside a moving window
    SlidingWindow,
    /// Tokens refilled at `limit / window`, capped at burst
    TokenBucket,
}

impl From<StrategyKind> for Strategy {
    fn from(kind: StrategyKind) -> Self {
        match kind {
            StrategyKind::SlidingWindow => Self::SlidingWindow,
            StrategyKind::TokenBucket => Self::TokenBucket,
        }
    }
}

impl Strategy {
    /// Strategy segment of cache keys
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::SlidingWindow => "sw",
            Self::TokenBucket => "tb",
        }
    }

    /// Check and record one request against `key`
    pub async fn check(self, cache: &SharedCache, key: &str, policy: &LimitPolicy, now_ms: u64) -> Result<Outcome> {
        match self {
            Self::SlidingWindow => sliding_window(cache, key, policy, now_ms).await,
            Self::TokenBucket => token_bucket(cache, key, policy, now_ms).await,
        }
    }
}

async fn sliding_window(cache: &SharedCache, key: &str, policy: &LimitPolicy, now_ms: u64) -> Result<Outcome> {
    let window_ms = ttl_millis(policy.window);
    let limit = u64::from(policy.limit);
    let reply = cache
        .sliding_window(&WindowRequest {
            key: key.to_string(),
            now_ms,
            window_ms,
            limit,
            cost: u64::from(policy.cost),
            member: Uuid::new_v4().to_string(),
        })
        .await?;

    // An entry frees its slot one window after it was admitted.
    let reset_ms = reply
        .oldest_ms
        .map_or(now_ms + window_ms, |oldest| oldest + window_ms);
    let retry_after = if reply.allowed {
        Duration::ZERO
    } else {
        let room_ms = reply.room_at_ms.map_or(now_ms + window_ms, |room| room + window_ms);
        Duration::from_millis(room_ms.saturating_sub(now_ms))
    };

    Ok(Outcome {
        allowed: reply.allowed,
        quota: QuotaSnapshot {
            limit,
            remaining: limit.saturating_sub(reply.count),
            reset_at: reset_ms.div_ceil(1000),
        },
        retry_after,
    })
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
async fn token_bucket(cache: &SharedCache, key: &str, policy: &LimitPolicy, now_ms: u64) -> Result<Outcome> {
    let window_secs = policy.window.as_secs_f64().max(0.001);
    let rate_per_sec = f64::from(policy.limit) / window_secs;
    let burst = f64::from(policy.burst.max(policy.cost));
    let cost = f64::from(policy.cost);
    // Idle buckets are full again after burst / rate; keep state a little longer.
    let ttl_ms = (burst / rate_per_sec * 1000.0).ceil() as u64 + 1000;

    let reply = cache
        .token_bucket(&BucketRequest {
            key: key.to_string(),
            now_ms,
            rate_per_sec,
            burst,
            cost,
            ttl_ms,
        })
        .await?;

    let tokens = reply.tokens.clamp(0.0, burst);
    let until_full_ms = ((burst - tokens) / rate_per_sec * 1000.0).ceil() as u64;
    let retry_after = if reply.allowed {
        Duration::ZERO
    } else {
        Duration::from_secs_f64(((cost - tokens) / rate_per_sec).max(0.0))
    };

    Ok(Outcome {
        allowed: reply.allowed,
        quota: QuotaSnapshot {
            limit: burst as u64,
            remaining: tokens.floor() as u64,
            reset_at: (now_ms + until_full_ms).div_ceil(1000),
        },
        retry_after,
    })
}

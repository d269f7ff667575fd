//! Rate limit engine.
//!
//! Every check is one atomic primitive on the shared cache per limit, in this
//! order:
//!
//! 1. Global cap (`<ns>:sw:global:all`), denial means cluster overload.
//! 2. Per-caller strategy on the endpoint key, after adaptive reduction.
//! 3. Hourly and daily caller windows.
//! 4. In-flight slot, held by the returned [`Admission`].
//!
//! A cache failure at any step admits the request (fail open) and is counted;
//! the quota reported for that step assumes the request was the first.

mod adaptive;
mod concurrency;
mod lockout;
mod strategy;

pub use adaptive::{AdaptiveLimiter, adjusted_limit, load_factor_key, publish_load};
pub use concurrency::{ConcurrencyGuard, SLOT_TTL};
pub use lockout::AuthLockout;
pub use strategy::{Outcome, Strategy};

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::config::RateLimitConfig;
use crate::policy::{LimitPolicy, Resolution};
use crate::store::{SharedCache, now_ms, ttl_millis};

const DAY: Duration = Duration::from_secs(24 * 3600);

/// Retry hint for a caller at its in-flight cap
const CONCURRENCY_RETRY: Duration = Duration::from_secs(1);

/// Quota state reported to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaSnapshot {
    /// Limit of the window (or bucket capacity)
    pub limit: u64,
    /// Units left
    pub remaining: u64,
    /// When the quota is fully available again (Unix seconds)
    pub reset_at: u64,
}

impl QuotaSnapshot {
    /// Quota for a request admitted without consulting the cache
    #[must_use]
    pub fn assumed(policy: &LimitPolicy, now_ms: u64) -> Self {
        let limit = u64::from(policy.limit);
        Self {
            limit,
            remaining: limit.saturating_sub(u64::from(policy.cost)),
            reset_at: now_ms.saturating_add(ttl_millis(policy.window)).div_ceil(1000),
        }
    }

    /// Nothing left until `reset_at_ms`
    #[must_use]
    pub fn exhausted(limit: u64, reset_at_ms: u64) -> Self {
        Self {
            limit,
            remaining: 0,
            reset_at: reset_at_ms.div_ceil(1000),
        }
    }

    /// The more restrictive of two snapshots: fewer units left, then later reset
    #[must_use]
    pub fn tighter(self, other: Self) -> Self {
        if (other.remaining, std::cmp::Reverse(other.reset_at)) < (self.remaining, std::cmp::Reverse(self.reset_at)) {
            other
        } else {
            self
        }
    }
}

/// Why a request was refused by the limiter. Every refusal reports the quota
/// that caused it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RateLimitError {
    /// Caller spent its quota
    #[error("Rate limit exceeded")]
    OverQuota {
        /// Quota after the refused attempt
        quota: QuotaSnapshot,
        /// Wait before retrying
        retry_after: Duration,
    },

    /// Source address failed authentication too often
    #[error("Too many failed authentication attempts")]
    LockedOut {
        /// Failure allowance, resetting when the lockout ends
        quota: QuotaSnapshot,
        /// Remaining lockout
        retry_after: Duration,
    },

    /// Cluster-wide cap reached
    #[error("System overloaded")]
    ClusterOverloaded {
        /// Cluster-wide window
        quota: QuotaSnapshot,
        /// Wait before retrying
        retry_after: Duration,
    },

    /// Caller has too many requests in flight
    #[error("Too many concurrent requests")]
    ConcurrencyExceeded {
        /// In-flight cap, with nothing remaining
        quota: QuotaSnapshot,
    },
}

impl RateLimitError {
    /// Machine-readable error code
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::OverQuota { .. } => "rate_limited",
            Self::LockedOut { .. } => "locked_out",
            Self::ClusterOverloaded { .. } => "system_overloaded",
            Self::ConcurrencyExceeded { .. } => "too_many_concurrent_requests",
        }
    }

    /// Suggested wait before retrying
    #[must_use]
    pub const fn retry_after(&self) -> Duration {
        match self {
            Self::OverQuota { retry_after, .. }
            | Self::LockedOut { retry_after, .. }
            | Self::ClusterOverloaded { retry_after, .. } => *retry_after,
            Self::ConcurrencyExceeded { .. } => CONCURRENCY_RETRY,
        }
    }

    /// Quota to report alongside the refusal
    #[must_use]
    pub const fn quota(&self) -> QuotaSnapshot {
        match self {
            Self::OverQuota { quota, .. }
            | Self::LockedOut { quota, .. }
            | Self::ClusterOverloaded { quota, .. }
            | Self::ConcurrencyExceeded { quota } => *quota,
        }
    }
}

/// An admitted request
#[derive(Debug)]
pub struct Admission {
    /// Quota to report
    pub quota: QuotaSnapshot,
    /// In-flight slot, released on drop
    pub guard: Option<ConcurrencyGuard>,
}

/// The engine: strategies and caps over one shared cache
pub struct RateLimiter {
    cache: SharedCache,
    namespace: String,
    strategy: Strategy,
    adaptive: Option<AdaptiveLimiter>,
    daily_limit: Option<u32>,
    global: Option<LimitPolicy>,
    max_in_flight: Option<u32>,
    lockout: Option<AuthLockout>,
}

impl RateLimiter {
    /// Build the engine described by configuration
    #[must_use]
    pub fn new(cache: SharedCache, namespace: &str, config: &RateLimitConfig) -> Self {
        let lockout = config.lockout.enabled.then(|| {
            debug!(fail_mode = ?config.lockout.fail_mode, "Auth lockout enabled");
            AuthLockout::new(cache.clone(), namespace, &config.lockout)
        });
        Self {
            adaptive: config
                .adaptive
                .enabled
                .then(|| AdaptiveLimiter::new(cache.clone(), namespace, &config.adaptive)),
            daily_limit: config.daily.enabled.then_some(config.daily.limit),
            global: config.global.enabled.then_some(LimitPolicy {
                limit: config.global.limit,
                window: config.global.window,
                burst: config.global.limit,
                cost: 1,
            }),
            max_in_flight: config.concurrency.enabled.then_some(config.concurrency.max_in_flight),
            lockout,
            strategy: config.strategy.into(),
            namespace: namespace.to_string(),
            cache,
        }
    }

    /// Per-caller strategy in use
    #[must_use]
    pub const fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Shared cache backing the engine
    #[must_use]
    pub fn cache(&self) -> &SharedCache {
        &self.cache
    }

    /// Auth lockout, when enabled
    #[must_use]
    pub fn lockout(&self) -> Option<&AuthLockout> {
        self.lockout.as_ref()
    }

    /// Check and record one request
    pub async fn check(&self, resolution: &Resolution) -> Result<Admission, RateLimitError> {
        let now = now_ms();
        let ns = &self.namespace;

        if let Some(global) = &self.global {
            let key = format!("{ns}:sw:global:all");
            if let Some(outcome) = self.run(Strategy::SlidingWindow, &key, global, now, "global").await
                && !outcome.allowed
            {
                warn!(limit = global.limit, "Global request cap reached");
                return Err(RateLimitError::ClusterOverloaded {
                    quota: outcome.quota,
                    retry_after: outcome.retry_after,
                });
            }
        }

        let policy = match &self.adaptive {
            Some(adaptive) => adaptive.apply(resolution.policy).await,
            None => resolution.policy,
        };
        let key = format!("{ns}:{}:{}", self.strategy.tag(), resolution.key.scoped());
        let mut quota = self.enforce(self.strategy, &key, &policy, now, "caller").await?;

        let caller = resolution.key.caller_scope();
        if let Some(hourly) = &resolution.hourly {
            let key = format!("{ns}:sw:hourly:{caller}");
            quota = quota.tighter(self.enforce(Strategy::SlidingWindow, &key, hourly, now, "hourly").await?);
        }
        if let Some(limit) = self.daily_limit {
            let daily = LimitPolicy {
                limit,
                window: DAY,
                burst: limit,
                cost: policy.cost,
            };
            let key = format!("{ns}:sw:daily:{caller}");
            quota = quota.tighter(self.enforce(Strategy::SlidingWindow, &key, &daily, now, "daily").await?);
        }

        let guard = match self.max_in_flight {
            Some(max) => self.acquire_slot(&caller, max).await?,
            None => None,
        };

        debug!(
            key = %key,
            strategy = self.strategy.tag(),
            limit = quota.limit,
            remaining = quota.remaining,
            "Request admitted"
        );
        Ok(Admission { quota, guard })
    }

    /// Run [`check`](Self::check) on its own task and wait for it.
    ///
    /// The check completes even when the waiting request is dropped; an
    /// admission nobody collects releases its slot on drop.
    pub async fn check_detached(self: &Arc<Self>, resolution: Resolution) -> Result<Admission, RateLimitError> {
        let limiter = Arc::clone(self);
        let policy = resolution.policy;
        let task = tokio::spawn(async move { limiter.check(&resolution).await });
        match task.await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "Limiter check did not complete, admitting request");
                telemetry_metrics::counter!("admission_fail_open_total", "component" => "task").increment(1);
                Ok(Admission {
                    quota: QuotaSnapshot::assumed(&policy, now_ms()),
                    guard: None,
                })
            }
        }
    }

    async fn enforce(
        &self,
        strategy: Strategy,
        key: &str,
        policy: &LimitPolicy,
        now: u64,
        component: &'static str,
    ) -> Result<QuotaSnapshot, RateLimitError> {
        match self.run(strategy, key, policy, now, component).await {
            Some(outcome) if outcome.allowed => Ok(outcome.quota),
            Some(outcome) => {
                warn!(key = %key, limit = policy.limit, retry_after = ?outcome.retry_after, "Rate limit exceeded");
                Err(RateLimitError::OverQuota {
                    quota: outcome.quota,
                    retry_after: outcome.retry_after,
                })
            }
            None => Ok(QuotaSnapshot::assumed(policy, now)),
        }
    }

    /// Run one strategy check; `None` when the cache failed and we fail open
    async fn run(
        &self,
        strategy: Strategy,
        key: &str,
        policy: &LimitPolicy,
        now: u64,
        component: &'static str,
    ) -> Option<Outcome> {
        match strategy.check(&self.cache, key, policy, now).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                fail_open(component, &e);
                None
            }
        }
    }

    async fn acquire_slot(&self, caller: &str, max: u32) -> Result<Option<ConcurrencyGuard>, RateLimitError> {
        let key = format!("{}:conc:{caller}", self.namespace);
        match concurrency::acquire(&self.cache, key, max).await {
            Ok(Some(guard)) => Ok(Some(guard)),
            Ok(None) => {
                warn!(caller = %caller, limit = max, "Concurrency cap reached");
                let reset_ms = now_ms().saturating_add(ttl_millis(CONCURRENCY_RETRY));
                Err(RateLimitError::ConcurrencyExceeded {
                    quota: QuotaSnapshot::exhausted(u64::from(max), reset_ms),
                })
            }
            Err(e) => {
                fail_open("concurrency", &e);
                Ok(None)
            }
        }
    }
}

fn fail_open(component: &'static str, error: &crate::Error) {
    warn!(error = %error, component, "Shared cache unavailable, admitting request");
    telemetry_metrics::counter!("admission_fail_open_total", "component" => component).increment(1);
}

//! Load-based limit reduction.
//!
//! A monitoring process publishes a load factor in `[0, 1]` to the shared
//! cache; limits shrink linearly with it down to a floor.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::Result;
use crate::config::AdaptiveConfig;
use crate::policy::LimitPolicy;
use crate::store::SharedCache;

/// How long a read load factor is reused
const REFRESH_EVERY: Duration = Duration::from_secs(1);

/// `base × (1 − load × max_reduction)`, never below `floor`.
///
/// The floor is capped at `base`, so adaptation never raises a limit that was
/// configured below it.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn adjusted_limit(base: u32, load: f64, max_reduction: f64, floor: u32) -> u32 {
    let load = if load.is_finite() { load.clamp(0.0, 1.0) } else { 0.0 };
    let max_reduction = if max_reduction.is_finite() {
        max_reduction.clamp(0.0, 1.0)
    } else {
        0.0
    };
    let scaled = (f64::from(base) * (1.0 - load * max_reduction)).floor() as u32;
    scaled.max(floor.min(base))
}

/// Cache key of the published load factor
#[must_use]
pub fn load_factor_key(namespace: &str) -> String {
    format!("{namespace}:adaptive:load:factor")
}

/// Write a load factor for every instance to pick up
pub async fn publish_load(cache: &SharedCache, namespace: &str, load: f64, ttl: Duration) -> Result<()> {
    let load = if load.is_finite() { load.clamp(0.0, 1.0) } else { 0.0 };
    cache.set(&load_factor_key(namespace), &load.to_string(), ttl).await
}

struct Sample {
    value: f64,
    read_at: Option<Instant>,
}

/// Applies the current load factor to resolved policies
pub struct AdaptiveLimiter {
    cache: SharedCache,
    key: String,
    max_reduction: f64,
    min_limit: u32,
    sample: Mutex<Sample>,
}

impl AdaptiveLimiter {
    /// Create a limiter reading the load factor published under `namespace`
    #[must_use]
    pub fn new(cache: SharedCache, namespace: &str, config: &AdaptiveConfig) -> Self {
        Self {
            cache,
            key: load_factor_key(namespace),
            max_reduction: config.max_reduction,
            min_limit: config.min_limit,
            sample: Mutex::new(Sample {
                value: 0.0,
                read_at: None,
            }),
        }
    }

    /// Current load factor. Read failures keep the previous value.
    pub async fn load_factor(&self) -> f64 {
        {
            let sample = self.sample.lock();
            if sample.read_at.is_some_and(|at| at.elapsed() < REFRESH_EVERY) {
                return sample.value;
            }
        }

        let read = self.cache.get(&self.key).await;
        let mut sample = self.sample.lock();
        match read {
            Ok(Some(raw)) => match raw.trim().parse::<f64>() {
                Ok(v) if v.is_finite() => sample.value = v.clamp(0.0, 1.0),
                _ => debug!(value = %raw, "Ignoring malformed load factor"),
            },
            Ok(None) => sample.value = 0.0,
            Err(e) => debug!(error = %e, "Load factor unavailable, keeping last value"),
        }
        sample.read_at = Some(Instant::now());
        sample.value
    }

    /// Shrink a policy's limit and burst for the current load
    pub async fn apply(&self, policy: LimitPolicy) -> LimitPolicy {
        let load = self.load_factor().await;
        if load <= 0.0 {
            return policy;
        }
        let limit = adjusted_limit(policy.limit, load, self.max_reduction, self.min_limit).max(1);
        LimitPolicy {
            limit,
            burst: policy.burst.min(limit).max(policy.cost),
            ..policy
        }
    }
}

//! Failed-authentication lockout per source address.

use std::net::IpAddr;
use std::time::Duration;

use tracing::warn;
use uuid::Uuid;

use super::{QuotaSnapshot, RateLimitError};
use crate::config::{FailMode, LockoutConfig};
use crate::store::{SharedCache, WindowRequest, now_ms, ttl_millis};

/// Tracks failed authentications and locks out noisy addresses
pub struct AuthLockout {
    cache: SharedCache,
    namespace: String,
    max_failures: u32,
    window: Duration,
    duration: Duration,
    fail_mode: FailMode,
}

impl AuthLockout {
    /// Create from configuration
    #[must_use]
    pub fn new(cache: SharedCache, namespace: &str, config: &LockoutConfig) -> Self {
        Self {
            cache,
            namespace: namespace.to_string(),
            max_failures: config.max_failures,
            window: config.window,
            duration: config.duration,
            fail_mode: config.fail_mode,
        }
    }

    /// Behaviour when the lockout flag cannot be read
    #[must_use]
    pub const fn fail_mode(&self) -> FailMode {
        self.fail_mode
    }

    fn flag_key(&self, addr: IpAddr) -> String {
        format!("{}:lockout:ip:{addr}", self.namespace)
    }

    fn failures_key(&self, addr: IpAddr) -> String {
        format!("{}:sw:authfail:{addr}", self.namespace)
    }

    fn locked_out(&self, now: u64, until_ms: u64) -> RateLimitError {
        let retry_after = Duration::from_millis(until_ms.saturating_sub(now)).max(Duration::from_secs(1));
        RateLimitError::LockedOut {
            quota: QuotaSnapshot::exhausted(
                u64::from(self.max_failures),
                now.saturating_add(ttl_millis(retry_after)),
            ),
            retry_after,
        }
    }

    /// Reject the request if `addr` is locked out. One cache read.
    pub async fn check(&self, addr: IpAddr) -> Result<(), RateLimitError> {
        let now = now_ms();
        match self.cache.get(&self.flag_key(addr)).await {
            Ok(None) => Ok(()),
            Ok(Some(until)) => Err(self.locked_out(now, until.parse::<u64>().unwrap_or(0))),
            Err(e) => match self.fail_mode {
                FailMode::Open => {
                    warn!(error = %e, addr = %addr, "Lockout state unavailable, admitting");
                    telemetry_metrics::counter!("admission_fail_open_total", "component" => "lockout").increment(1);
                    Ok(())
                }
                FailMode::Closed => {
                    warn!(error = %e, addr = %addr, "Lockout state unavailable, rejecting");
                    Err(self.locked_out(now, now.saturating_add(ttl_millis(self.window))))
                }
            },
        }
    }

    /// Count a failed authentication. Returns whether `addr` is now locked out.
    pub async fn record_failure(&self, addr: IpAddr) -> bool {
        let now = now_ms();
        let request = WindowRequest {
            key: self.failures_key(addr),
            now_ms: now,
            window_ms: ttl_millis(self.window),
            limit: u64::from(self.max_failures),
            cost: 1,
            member: Uuid::new_v4().to_string(),
        };
        let reply = match self.cache.sliding_window(&request).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, addr = %addr, "Could not record failed authentication");
                return false;
            }
        };
        if reply.allowed {
            return false;
        }

        let until = now.saturating_add(ttl_millis(self.duration));
        if let Err(e) = self
            .cache
            .set(&self.flag_key(addr), &until.to_string(), self.duration)
            .await
        {
            warn!(error = %e, addr = %addr, "Could not set lockout flag");
            return false;
        }
        warn!(addr = %addr, failures = reply.count, duration = ?self.duration, "Address locked out after failed authentications");
        true
    }
}

//! Response annotation: quota headers and rejection responses.

use std::time::Duration;

use axum::{
    Json,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::auth::AuthError;
use crate::limiter::{QuotaSnapshot, RateLimitError};
use crate::policy::BypassReason;

/// `X-RateLimit-Limit`
pub const LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
/// `X-RateLimit-Remaining`
pub const REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
/// `X-RateLimit-Reset`, Unix seconds
pub const RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
/// `X-RateLimit-Bypass`, set instead of quota headers on bypassed requests
pub const BYPASS: HeaderName = HeaderName::from_static("x-ratelimit-bypass");

/// Retry-After in whole seconds, rounded up and never below one
#[must_use]
pub fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
    secs.max(1)
}

/// Write the quota headers
pub fn apply_quota(headers: &mut HeaderMap, quota: &QuotaSnapshot) {
    headers.insert(LIMIT, HeaderValue::from(quota.limit));
    headers.insert(REMAINING, HeaderValue::from(quota.remaining));
    headers.insert(RESET, HeaderValue::from(quota.reset_at));
}

/// Mark a response as having skipped limiting
pub fn apply_bypass(headers: &mut HeaderMap, reason: BypassReason) {
    headers.insert(BYPASS, HeaderValue::from_static(reason.as_str()));
}

/// Status for a limiter refusal: overload is distinguishable from a personal quota
#[must_use]
pub const fn rate_limit_status(error: &RateLimitError) -> StatusCode {
    match error {
        RateLimitError::ClusterOverloaded { .. } => StatusCode::SERVICE_UNAVAILABLE,
        RateLimitError::OverQuota { .. }
        | RateLimitError::LockedOut { .. }
        | RateLimitError::ConcurrencyExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
    }
}

/// Create the response for a limiter refusal; quota headers are always set
#[must_use]
pub fn rate_limited_response(error: &RateLimitError) -> Response {
    let retry_after = retry_after_secs(error.retry_after());
    let mut response = (
        rate_limit_status(error),
        Json(json!({
            "error": {
                "code": error.code(),
                "message": error.to_string(),
                "retry_after": retry_after,
            }
        })),
    )
        .into_response();

    let headers = response.headers_mut();
    apply_quota(headers, &error.quota());
    headers.insert(axum::http::header::RETRY_AFTER, HeaderValue::from(retry_after));
    response
}

/// Create a 401 response carrying the machine-readable reason
#[must_use]
pub fn unauthorized_response(error: &AuthError) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(axum::http::header::WWW_AUTHENTICATE, "Bearer")],
        Json(json!({
            "error": {
                "code": error.code(),
                "message": error.to_string(),
                "refresh": error.is_expired(),
            }
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn quota() -> QuotaSnapshot {
        QuotaSnapshot {
            limit: 120,
            remaining: 0,
            reset_at: 1_700_000_060,
        }
    }

    #[test]
    fn test_retry_after_floor_and_rounding() {
        assert_eq!(retry_after_secs(Duration::ZERO), 1);
        assert_eq!(retry_after_secs(Duration::from_millis(200)), 1);
        assert_eq!(retry_after_secs(Duration::from_millis(1_200)), 2);
        assert_eq!(retry_after_secs(Duration::from_secs(59)), 59);
    }

    #[test]
    fn test_quota_headers() {
        let mut headers = HeaderMap::new();
        apply_quota(&mut headers, &quota());
        assert_eq!(headers[&LIMIT], "120");
        assert_eq!(headers[&REMAINING], "0");
        assert_eq!(headers[&RESET], "1700000060");
    }

    #[tokio::test]
    async fn test_over_quota_is_429_with_headers() {
        let error = RateLimitError::OverQuota {
            quota: quota(),
            retry_after: Duration::from_millis(59_400),
        };
        let response = rate_limited_response(&error);

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["retry-after"], "60");
        assert_eq!(response.headers()[&REMAINING], "0");
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "rate_limited");
    }

    #[tokio::test]
    async fn test_overload_is_503() {
        let error = RateLimitError::ClusterOverloaded {
            quota: QuotaSnapshot {
                limit: 10_000,
                remaining: 0,
                reset_at: 1_700_000_001,
            },
            retry_after: Duration::from_millis(300),
        };
        let response = rate_limited_response(&error);

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()["retry-after"], "1");
        assert_eq!(response.headers()[&LIMIT], "10000");
        assert_eq!(response.headers()[&REMAINING], "0");
        assert_eq!(response.headers()[&RESET], "1700000001");
        let body = body_json(response).await;
        assert_eq!(body["error"]["message"], "System overloaded");
    }

    #[test]
    fn test_lockout_and_concurrency_are_429_with_headers() {
        let locked = RateLimitError::LockedOut {
            quota: QuotaSnapshot {
                limit: 5,
                remaining: 0,
                reset_at: 1_700_000_900,
            },
            retry_after: Duration::from_secs(900),
        };
        let busy = RateLimitError::ConcurrencyExceeded {
            quota: QuotaSnapshot {
                limit: 4,
                remaining: 0,
                reset_at: 1_700_000_001,
            },
        };

        for (error, limit) in [(locked, "5"), (busy, "4")] {
            let response = rate_limited_response(&error);
            assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
            assert_eq!(response.headers()[&LIMIT], limit);
            assert_eq!(response.headers()[&REMAINING], "0");
            assert!(response.headers().contains_key(&RESET));
        }
    }

    #[tokio::test]
    async fn test_unauthorized_distinguishes_expiry() {
        let response = unauthorized_response(&AuthError::Expired);
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()["www-authenticate"], "Bearer");
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "token_expired");
        assert_eq!(body["error"]["refresh"], true);

        let body = body_json(unauthorized_response(&AuthError::BadSignature)).await;
        assert_eq!(body["error"]["refresh"], false);
    }

    #[test]
    fn test_bypass_header() {
        let mut headers = HeaderMap::new();
        apply_bypass(&mut headers, BypassReason::Whitelist);
        assert_eq!(headers[&BYPASS], "whitelist");
    }
}

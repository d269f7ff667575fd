//! Admission middleware: lockout, authentication, policy, limiting.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, MatchedPath, State},
    http::{Request, header::AUTHORIZATION},
    middleware::Next,
    response::Response,
};
use tracing::{debug, info, warn};

use super::router::AppState;
use crate::annotate::{apply_bypass, apply_quota, rate_limited_response, unauthorized_response};
use crate::auth::{AuthError, Identity, bearer_token};
use crate::limiter::RateLimitError;
use crate::policy::{PolicyDecision, RequestFacts};

/// Gate every request before it reaches a handler.
///
/// Order: skip paths, lockout flag, token verification, bypass rules, limiter.
/// Bypassed sources are exempt from lockout but still authenticate. The
/// verified [`Identity`] is inserted into request extensions.
pub async fn admission_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    if state.rate_limit.is_skip_path(&path) {
        return next.run(request).await;
    }

    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| path.clone(), |m| m.as_str().to_string());
    let method = request.method().as_str().to_string();
    let source = source_addr(&request, state.trust_forwarded_for);
    let internal_key = request
        .headers()
        .get(state.rate_limit.internal_service_header.as_str())
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let exempt = state
        .resolver
        .bypass_rules()
        .check(source, internal_key.as_deref())
        .is_some();
    let lockout = state
        .limiter
        .as_ref()
        .and_then(|limiter| limiter.lockout())
        .filter(|_| !exempt);

    if let Some(lockout) = lockout
        && let Err(e) = lockout.check(source).await
    {
        warn!(source = %source, path = %path, "Request from locked out address");
        record("locked_out");
        return rate_limited_response(&e);
    }

    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
        .map(str::to_string);
    let identity = match authenticate(&state, token.as_deref(), &path).await {
        Ok(identity) => identity,
        Err(e) => {
            if e.counts_as_failed_attempt()
                && let Some(lockout) = lockout
            {
                lockout.record_failure(source).await;
            }
            warn!(source = %source, path = %path, code = e.code(), "Authentication failed");
            record("unauthorized");
            return unauthorized_response(&e);
        }
    };

    let Some(limiter) = &state.limiter else {
        insert_identity(&mut request, identity);
        record("admitted");
        return next.run(request).await;
    };

    let decision = state.resolver.resolve(&RequestFacts {
        identity: identity.as_ref(),
        source,
        route: &route,
        method: &method,
        internal_key: internal_key.as_deref(),
    });

    match decision {
        PolicyDecision::Bypass(reason) => {
            info!(source = %source, path = %path, reason = reason.as_str(), "Rate limiting bypassed");
            telemetry_metrics::counter!("admission_bypass_total", "reason" => reason.as_str()).increment(1);
            record("bypassed");
            insert_identity(&mut request, identity);
            let mut response = next.run(request).await;
            apply_bypass(response.headers_mut(), reason);
            response
        }
        PolicyDecision::Limit(resolution) => match limiter.check_detached(resolution.clone()).await {
            Ok(admission) => {
                record("admitted");
                insert_identity(&mut request, identity);
                let mut response = next.run(request).await;
                apply_quota(response.headers_mut(), &admission.quota);
                response
            }
            Err(e) => {
                debug!(key = %resolution.key.scoped(), code = e.code(), "Request refused");
                record(outcome_label(&e));
                rate_limited_response(&e)
            }
        },
    }
}

async fn authenticate(
    state: &AppState,
    token: Option<&str>,
    path: &str,
) -> Result<Option<Identity>, AuthError> {
    let Some(verifier) = &state.verifier else {
        return Ok(None);
    };
    match token {
        Some(token) => verifier.verify(token).await.map(Some),
        None if state.auth.is_public_path(path) => Ok(None),
        None => Err(AuthError::MissingHeader),
    }
}

fn insert_identity(request: &mut Request<Body>, identity: Option<Identity>) {
    if let Some(identity) = identity {
        request.extensions_mut().insert(identity);
    }
}

/// Caller address: first `X-Forwarded-For` hop when trusted, else the peer
fn source_addr(request: &Request<Body>, trust_forwarded_for: bool) -> IpAddr {
    if trust_forwarded_for
        && let Some(ip) = request
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse::<IpAddr>().ok())
    {
        return ip.to_canonical();
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED), |ConnectInfo(addr)| addr.ip().to_canonical())
}

const fn outcome_label(error: &RateLimitError) -> &'static str {
    match error {
        RateLimitError::OverQuota { .. } => "rate_limited",
        RateLimitError::LockedOut { .. } => "locked_out",
        RateLimitError::ClusterOverloaded { .. } => "overloaded",
        RateLimitError::ConcurrencyExceeded { .. } => "concurrency_exceeded",
    }
}

fn record(outcome: &'static str) {
    telemetry_metrics::counter!("admission_decisions_total", "outcome" => outcome).increment(1);
}

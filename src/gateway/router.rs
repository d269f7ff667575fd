//! HTTP router and shared state

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, State},
    middleware,
    response::IntoResponse,
    routing::get,
};
use serde_json::json;
use tower_http::{
    catch_panic::CatchPanicLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::info;

use super::admission::admission_middleware;
use super::proxy::{Upstream, forward_handler};
use crate::Result;
use crate::auth::{TokenVerifier, TrustRootCache};
use crate::config::{AuthConfig, Config, RateLimitConfig};
use crate::limiter::RateLimiter;
use crate::policy::PolicyResolver;
use crate::store::SharedCache;

/// Shared application state
pub struct AppState {
    /// Token verifier, absent when authentication is disabled
    pub verifier: Option<Arc<TokenVerifier>>,
    /// Authentication settings (public paths)
    pub auth: AuthConfig,
    /// Rate-limit settings (skip paths, internal service header)
    pub rate_limit: RateLimitConfig,
    /// Policy resolver
    pub resolver: PolicyResolver,
    /// Rate limit engine, absent when limiting is disabled
    pub limiter: Option<Arc<RateLimiter>>,
    /// Take the caller address from `X-Forwarded-For`
    pub trust_forwarded_for: bool,
    /// Where admitted requests go; `None` echoes the caller's identity
    pub upstream: Option<Upstream>,
    /// Request body cap in bytes
    pub max_body_size: usize,
    /// Shared cache (reported by `/health`)
    pub cache: SharedCache,
}

impl AppState {
    /// Assemble state around an already-built trust root.
    ///
    /// The trust root is injected so callers can choose its key source.
    pub fn build(config: &Config, cache: SharedCache, trust_root: Arc<TrustRootCache>) -> Result<Self> {
        let verifier = if config.auth.enabled {
            Some(Arc::new(TokenVerifier::new(trust_root, &config.auth, config.environment)?))
        } else {
            info!("Authentication disabled");
            None
        };

        let limiter = if config.rate_limit.enabled {
            Some(Arc::new(RateLimiter::new(cache.clone(), &config.cache.namespace, &config.rate_limit)))
        } else {
            info!("Rate limiting disabled");
            None
        };

        let upstream = config
            .server
            .upstream_url
            .as_deref()
            .map(|url| Upstream::new(url, config.server.request_timeout))
            .transpose()?;

        Ok(Self {
            verifier,
            auth: config.auth.clone(),
            rate_limit: config.rate_limit.clone(),
            resolver: PolicyResolver::from_config(&config.rate_limit)?,
            limiter,
            trust_forwarded_for: config.server.trust_forwarded_for,
            upstream,
            max_body_size: config.server.max_body_size,
            cache,
        })
    }

    /// Assemble state with the HTTP key source from configuration
    pub fn from_config(config: &Config, cache: SharedCache) -> Result<Self> {
        let trust_root = TrustRootCache::from_config(&config.auth, Some(cache.clone()), &config.cache.namespace)?;
        Self::build(config, cache, Arc::new(trust_root))
    }
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    let body_limit = state.max_body_size;

    Router::new()
        .route("/health", get(health_handler))
        .fallback(forward_handler)
        // Admission runs before any handler sees the request
        .layer(middleware::from_fn_with_state(Arc::clone(&state), admission_middleware))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CatchPanicLayer::new())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .with_state(state)
}

/// Health check handler
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let trust_root = state.verifier.as_ref().map(|v| {
        let trust_root = v.trust_root();
        json!({
            "keys": trust_root.key_ids().len(),
            "refreshes": trust_root.generation(),
        })
    });

    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "cache": state.cache.backend_name(),
        "rate_limiting": state.limiter.is_some(),
        "trust_root": trust_root,
    }))
}

//! Forwarding of admitted requests to the protected upstream.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json,
    body::Body,
    extract::{Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::{debug, warn};

use super::router::AppState;
use crate::auth::Identity;
use crate::{Error, Result};

/// Subject of the verified caller, set on forwarded requests
pub const AUTH_SUBJECT: HeaderName = HeaderName::from_static("x-auth-subject");
/// Comma-separated roles of the verified caller
pub const AUTH_ROLES: HeaderName = HeaderName::from_static("x-auth-roles");

/// Connection-scoped headers that must not be forwarded
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// The protected service
pub struct Upstream {
    client: reqwest::Client,
    base_url: String,
}

impl Upstream {
    /// Create a client for `base_url` with a per-request timeout
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let parsed = url::Url::parse(base_url)
            .map_err(|e| Error::Config(format!("Invalid upstream URL {base_url}: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::Config(format!("Upstream URL must be http(s): {base_url}")));
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Base URL requests are forwarded to
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

/// Fallback handler: forward upstream, or describe the caller when no upstream is set
pub async fn forward_handler(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let Some(upstream) = &state.upstream else {
        let identity = request.extensions().get::<Identity>().cloned();
        return Json(json!({
            "admitted": true,
            "path": request.uri().path(),
            "identity": identity,
        }))
        .into_response();
    };

    let identity = request.extensions().get::<Identity>().cloned();
    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, state.max_body_size).await {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!(error = %e, "Request body rejected");
            return error_response(StatusCode::PAYLOAD_TOO_LARGE, "payload_too_large", "Request body too large");
        }
    };

    let path_and_query = parts.uri.path_and_query().map_or("/", |p| p.as_str());
    let url = format!("{}{path_and_query}", upstream.base_url);
    let headers = outbound_headers(&parts.headers, identity.as_ref());

    let reply = match upstream
        .client
        .request(parts.method, &url)
        .headers(headers)
        .body(body)
        .send()
        .await
    {
        Ok(reply) => reply,
        Err(e) => {
            warn!(error = %e, url = %url, "Upstream request failed");
            let (status, code) = if e.is_timeout() {
                (StatusCode::GATEWAY_TIMEOUT, "upstream_timeout")
            } else {
                (StatusCode::BAD_GATEWAY, "upstream_unavailable")
            };
            return error_response(status, code, "Upstream request failed");
        }
    };

    let status = reply.status();
    let mut headers = reply.headers().clone();
    strip_hop_by_hop(&mut headers);
    let mut response = Response::new(Body::from_stream(reply.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// Headers sent upstream: the caller's, minus hop-by-hop and spoofed identity
/// headers, plus the verified identity.
fn outbound_headers(inbound: &HeaderMap, identity: Option<&Identity>) -> HeaderMap {
    let mut headers = inbound.clone();
    strip_hop_by_hop(&mut headers);
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);
    headers.remove(AUTH_SUBJECT);
    headers.remove(AUTH_ROLES);

    if let Some(identity) = identity {
        if let Ok(subject) = HeaderValue::from_str(&identity.subject) {
            headers.insert(AUTH_SUBJECT, subject);
        }
        let roles = identity
            .roles
            .iter()
            .map(|r| r.as_str())
            .collect::<Vec<_>>()
            .join(",");
        if let Ok(roles) = HeaderValue::from_str(&roles) {
            headers.insert(AUTH_ROLES, roles);
        }
    }
    headers
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    (status, Json(json!({ "error": { "code": code, "message": message } }))).into_response()
}

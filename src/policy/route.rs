//! Route patterns: which logical endpoint a concrete request path belongs to.
//!
//! Counters are keyed by endpoint, so `/api/orders/17` and `/api/orders/18`
//! must land on the same key. A path resolves to the first configured route
//! template or endpoint rule that matches it; unmatched paths have their
//! identifier-like segments replaced by `{id}`.

use uuid::Uuid;

use crate::config::EndpointRule;

/// Placeholder for identifier segments of unmatched paths
const ID_SEGMENT: &str = "{id}";

/// Minimum length of a mixed alphanumeric segment treated as an identifier
const OPAQUE_ID_MIN_LEN: usize = 16;

/// Match a configured path pattern against a request path.
///
/// - a `*` or `{name}` segment matches exactly one non-empty segment;
/// - a trailing `*` matches any suffix (`/orders*`, `/reports/*`);
/// - everything else must be equal.
#[must_use]
pub fn path_matches(pattern: &str, path: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('/').collect();
    let path: Vec<&str> = path.split('/').collect();
    let Some((last, init)) = pattern.split_last() else {
        return false;
    };

    let leading = init.iter().zip(&path).all(|(p, s)| segment_matches(p, s));
    match last.strip_suffix('*') {
        Some(stem) => leading && path.len() >= pattern.len() && path[init.len()..].join("/").starts_with(stem),
        None => leading && path.len() == pattern.len() && segment_matches(last, path[init.len()]),
    }
}

fn segment_matches(pattern: &str, segment: &str) -> bool {
    if pattern == "*" || (pattern.starts_with('{') && pattern.ends_with('}')) {
        !segment.is_empty()
    } else {
        pattern == segment
    }
}

/// Known route patterns, in resolution order
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    patterns: Vec<String>,
}

impl RouteTable {
    /// Configured templates first, then endpoint rule paths
    #[must_use]
    pub fn new(routes: &[String], endpoints: &[EndpointRule]) -> Self {
        let mut patterns: Vec<String> = Vec::with_capacity(routes.len() + endpoints.len());
        for pattern in routes.iter().chain(endpoints.iter().map(|rule| &rule.path)) {
            if !pattern.is_empty() && !patterns.contains(pattern) {
                patterns.push(pattern.clone());
            }
        }
        Self { patterns }
    }

    /// Endpoint pattern a request path is counted under
    #[must_use]
    pub fn resolve(&self, path: &str) -> String {
        self.patterns
            .iter()
            .find(|pattern| path_matches(pattern, path))
            .cloned()
            .unwrap_or_else(|| normalize(path))
    }
}

/// Collapse identifier segments and drop a trailing slash
fn normalize(path: &str) -> String {
    let trimmed = match path.trim_end_matches('/') {
        "" => return "/".to_string(),
        trimmed => trimmed,
    };
    trimmed
        .split('/')
        .map(|segment| if is_identifier(segment) { ID_SEGMENT } else { segment })
        .collect::<Vec<_>>()
        .join("/")
}

fn is_identifier(segment: &str) -> bool {
    if segment.is_empty() {
        return false;
    }
    let digits = segment.bytes().filter(u8::is_ascii_digit).count();
    digits == segment.len()
        || Uuid::try_parse(segment).is_ok()
        || (segment.len() >= OPAQUE_ID_MIN_LEN
            && digits > 0
            && segment.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_'))
}

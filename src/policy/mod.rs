//! Policy resolution: who is being limited, and by how much.
//!
//! Resolution is a pure function of configuration and request facts. It
//! never touches the shared cache, so the limiter receives one finished
//! `(key, limit, window, burst, cost)` tuple per check.

mod bypass;
mod route;

pub use bypass::{BypassReason, BypassRules};
pub use route::{RouteTable, path_matches};

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use crate::Result;
use crate::auth::{Identity, Role};
use crate::config::{EndpointRule, RateLimitConfig, TierConfig};

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

/// Tier used when neither the caller's role nor any lower role is configured
const FALLBACK_TIER: TierConfig = TierConfig::new(30, 0, 0);

/// The party a counter belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Caller {
    /// Verified subject id
    User(String),
    /// Source address of an unauthenticated request
    Ip(IpAddr),
}

impl Caller {
    /// Key kind segment
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::User(_) => "user",
            Self::Ip(_) => "ip",
        }
    }
}

impl fmt::Display for Caller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(id) => f.write_str(id),
            Self::Ip(addr) => write!(f, "{addr}"),
        }
    }
}

/// One logical counter: caller, endpoint and method
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    /// Subject or address
    pub caller: Caller,
    /// Route pattern
    pub endpoint: String,
    /// Upper-case HTTP method
    pub method: String,
}

impl RateLimitKey {
    /// Build a key; the method is normalized to upper case
    #[must_use]
    pub fn new(caller: Caller, endpoint: &str, method: &str) -> Self {
        Self {
            caller,
            endpoint: endpoint.to_string(),
            method: method.to_ascii_uppercase(),
        }
    }

    /// `<kind>:<caller>:<METHOD>:<endpoint>`, the suffix of per-endpoint cache keys
    #[must_use]
    pub fn scoped(&self) -> String {
        format!("{}:{}:{}:{}", self.caller.kind(), self.caller, self.method, self.endpoint)
    }

    /// `<kind>:<caller>`, the suffix of per-caller cache keys
    #[must_use]
    pub fn caller_scope(&self) -> String {
        format!("{}:{}", self.caller.kind(), self.caller)
    }
}

/// Effective limits for one request, fixed once resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitPolicy {
    /// Requests (cost units) per window
    pub limit: u32,
    /// Window length
    pub window: Duration,
    /// Token bucket capacity
    pub burst: u32,
    /// Units this request consumes
    pub cost: u32,
}

/// Everything the limiter needs for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Counter identity
    pub key: RateLimitKey,
    /// Role whose tier applied
    pub role: Role,
    /// Per-minute policy
    pub policy: LimitPolicy,
    /// Per-hour policy, when the tier has one
    pub hourly: Option<LimitPolicy>,
}

/// Outcome of policy resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    /// Skip limiting
    Bypass(BypassReason),
    /// Limit with this resolution
    Limit(Resolution),
}

/// Facts about one request, as seen at the boundary
#[derive(Debug, Clone, Copy)]
pub struct RequestFacts<'a> {
    /// Verified caller, if any
    pub identity: Option<&'a Identity>,
    /// Source address
    pub source: IpAddr,
    /// Request path, or the route pattern the router matched
    pub route: &'a str,
    /// HTTP method
    pub method: &'a str,
    /// Internal service credential header value
    pub internal_key: Option<&'a str>,
}

/// Computes limiting keys and tuples from configuration
#[derive(Debug, Clone)]
pub struct PolicyResolver {
    tiers: HashMap<Role, TierConfig>,
    routes: RouteTable,
    endpoints: Vec<EndpointRule>,
    methods: HashMap<String, u32>,
    bypass: BypassRules,
}

impl PolicyResolver {
    /// Build from the rate limit section
    pub fn from_config(config: &RateLimitConfig) -> Result<Self> {
        Ok(Self {
            tiers: config.roles.clone(),
            routes: RouteTable::new(&config.routes, &config.endpoints),
            endpoints: config.endpoints.clone(),
            methods: config
                .methods
                .iter()
                .map(|(m, rpm)| (m.to_ascii_uppercase(), *rpm))
                .collect(),
            bypass: BypassRules::new(config.parsed_whitelist()?, config.resolved_internal_keys()),
        })
    }

    /// Bypass rules in effect
    #[must_use]
    pub fn bypass_rules(&self) -> &BypassRules {
        &self.bypass
    }

    /// Resolve the decision for one request
    #[must_use]
    pub fn resolve(&self, facts: &RequestFacts<'_>) -> PolicyDecision {
        if let Some(reason) = self.bypass.check(facts.source, facts.internal_key) {
            return PolicyDecision::Bypass(reason);
        }

        let (caller, role) = match facts.identity {
            Some(identity) => (Caller::User(identity.subject.clone()), identity.highest_role()),
            None => (Caller::Ip(facts.source.to_canonical()), Role::Anonymous),
        };
        let tier = self.tier_for(role);
        let method = facts.method.to_ascii_uppercase();

        let matching: Vec<&EndpointRule> = self
            .endpoints
            .iter()
            .filter(|rule| rule.matches(facts.route, &method))
            .collect();

        // Overrides only ever narrow the tier.
        let limit = matching
            .iter()
            .filter_map(|rule| rule.requests_per_minute)
            .chain(self.methods.get(&method).copied())
            .fold(tier.requests_per_minute, u32::min)
            .max(1);
        let cost = matching
            .iter()
            .filter_map(|rule| rule.cost)
            .max()
            .unwrap_or(1)
            .max(1);
        let burst = if tier.burst == 0 { limit } else { tier.burst.min(limit) }.max(cost);

        let hourly = (tier.requests_per_hour > 0).then(|| LimitPolicy {
            limit: tier.requests_per_hour,
            window: HOUR,
            burst: tier.requests_per_hour,
            cost,
        });

        PolicyDecision::Limit(Resolution {
            key: RateLimitKey::new(caller, &self.routes.resolve(facts.route), &method),
            role,
            policy: LimitPolicy {
                limit,
                window: MINUTE,
                burst,
                cost,
            },
            hourly,
        })
    }

    /// Tier of `role`, else of the nearest configured role below it
    fn tier_for(&self, role: Role) -> TierConfig {
        Role::ALL
            .into_iter()
            .rev()
            .filter(|r| *r <= role)
            .find_map(|r| self.tiers.get(&r).copied())
            .unwrap_or(FALLBACK_TIER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn identity(subject: &str, roles: Vec<Role>) -> Identity {
        Identity {
            subject: subject.to_string(),
            email: None,
            roles,
            festival_id: None,
            stand_ids: Vec::new(),
            organizer_for: Vec::new(),
            permissions: Vec::new(),
            expires_at: 0,
        }
    }

    fn resolver() -> PolicyResolver {
        let config = RateLimitConfig {
            endpoints: vec![
                EndpointRule {
                    path: "/api/orders".to_string(),
                    method: Some("POST".to_string()),
                    requests_per_minute: Some(20),
                    cost: Some(5),
                },
                EndpointRule {
                    path: "/api/reports/*".to_string(),
                    method: None,
                    requests_per_minute: None,
                    cost: Some(3),
                },
            ],
            methods: HashMap::from([("delete".to_string(), 10)]),
            whitelist: vec!["10.0.0.0/8".to_string()],
            internal_service_keys: vec!["svc-key".to_string()],
            ..RateLimitConfig::default()
        };
        PolicyResolver::from_config(&config).unwrap()
    }

    fn facts<'a>(identity: Option<&'a Identity>, route: &'a str, method: &'a str) -> RequestFacts<'a> {
        RequestFacts {
            identity,
            source: "203.0.113.9".parse().unwrap(),
            route,
            method,
            internal_key: None,
        }
    }

    fn limited(decision: PolicyDecision) -> Resolution {
        match decision {
            PolicyDecision::Limit(resolution) => resolution,
            PolicyDecision::Bypass(reason) => panic!("unexpected bypass: {reason:?}"),
        }
    }

    #[test]
    fn test_subject_keys_authenticated_callers() {
        let staff = identity("user-1", vec![Role::Staff]);
        let resolution = limited(resolver().resolve(&facts(Some(&staff), "/api/items", "get")));

        assert_eq!(resolution.key.caller, Caller::User("user-1".to_string()));
        assert_eq!(resolution.key.scoped(), "user:user-1:GET:/api/items");
        assert_eq!(resolution.role, Role::Staff);
        assert_eq!(resolution.policy.limit, 120);
        assert_eq!(resolution.policy.burst, 30);
        assert_eq!(resolution.policy.cost, 1);
        assert_eq!(resolution.hourly.map(|h| h.limit), Some(3_000));
    }

    #[test]
    fn test_concrete_paths_share_their_route_key() {
        // GIVEN: one staff caller hitting many orders
        let staff = identity("user-1", vec![Role::Staff]);
        let resolver = resolver();

        // WHEN: the order id varies
        let keys: Vec<String> = ["/api/orders/17", "/api/orders/18", "/api/orders/9001/"]
            .into_iter()
            .map(|path| limited(resolver.resolve(&facts(Some(&staff), path, "GET"))).key.scoped())
            .collect();

        // THEN: every request counts against one endpoint key
        assert_eq!(keys, vec!["user:user-1:GET:/api/orders/{id}"; 3]);

        let report = limited(resolver.resolve(&facts(Some(&staff), "/api/reports/daily", "GET")));
        assert_eq!(report.key.endpoint, "/api/reports/*");
    }

    #[test]
    fn test_anonymous_callers_keyed_by_address() {
        let resolution = limited(resolver().resolve(&facts(None, "/api/items", "GET")));
        assert_eq!(resolution.key.caller_scope(), "ip:203.0.113.9");
        assert_eq!(resolution.policy.limit, 30);
    }

    #[test]
    fn test_highest_role_tier_wins() {
        let both = identity("u", vec![Role::Staff, Role::Organizer]);
        let resolution = limited(resolver().resolve(&facts(Some(&both), "/api/items", "GET")));
        assert_eq!(resolution.role, Role::Organizer);
        assert_eq!(resolution.policy.limit, 300);
    }

    #[test]
    fn test_endpoint_override_narrows_and_sets_cost() {
        let admin = identity("u", vec![Role::Admin]);
        let resolution = limited(resolver().resolve(&facts(Some(&admin), "/api/orders", "POST")));
        assert_eq!(resolution.policy.limit, 20);
        assert_eq!(resolution.policy.cost, 5);
        assert_eq!(resolution.policy.burst, 20);
    }

    #[test]
    fn test_override_never_raises_tier() {
        let config = RateLimitConfig {
            endpoints: vec![EndpointRule {
                path: "/api/items".to_string(),
                method: None,
                requests_per_minute: Some(10_000),
                cost: None,
            }],
            ..RateLimitConfig::default()
        };
        let resolver = PolicyResolver::from_config(&config).unwrap();
        let resolution = limited(resolver.resolve(&facts(None, "/api/items", "GET")));
        assert_eq!(resolution.policy.limit, 30);
    }

    #[test]
    fn test_method_override_applies_minimum() {
        let organizer = identity("u", vec![Role::Organizer]);
        let resolution = limited(resolver().resolve(&facts(Some(&organizer), "/api/items/7", "DELETE")));
        assert_eq!(resolution.policy.limit, 10);
    }

    #[test]
    fn test_prefix_rule_cost() {
        let resolution = limited(resolver().resolve(&facts(None, "/api/reports/daily", "GET")));
        assert_eq!(resolution.policy.cost, 3);
    }

    #[test]
    fn test_missing_tier_falls_back_to_lower_role() {
        let config = RateLimitConfig {
            roles: HashMap::from([(Role::Staff, TierConfig::new(120, 0, 0))]),
            ..RateLimitConfig::default()
        };
        let resolver = PolicyResolver::from_config(&config).unwrap();
        let admin = identity("u", vec![Role::Admin]);

        let resolution = limited(resolver.resolve(&facts(Some(&admin), "/x", "GET")));
        assert_eq!(resolution.policy.limit, 120);
        assert_eq!(resolution.hourly, None);

        let anonymous = limited(resolver.resolve(&facts(None, "/x", "GET")));
        assert_eq!(anonymous.policy.limit, FALLBACK_TIER.requests_per_minute);
    }

    #[test]
    fn test_whitelist_and_internal_key_bypass() {
        let resolver = resolver();
        let mut inside = facts(None, "/api/items", "GET");
        inside.source = "10.1.2.3".parse().unwrap();
        assert_eq!(resolver.resolve(&inside), PolicyDecision::Bypass(BypassReason::Whitelist));

        let mut service = facts(None, "/api/items", "GET");
        service.internal_key = Some("svc-key");
        assert_eq!(resolver.resolve(&service), PolicyDecision::Bypass(BypassReason::InternalService));
    }
}

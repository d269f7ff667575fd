//! Configuration management

use std::{collections::HashMap, env, path::Path, str::FromStr, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use ipnet::IpNet;
use jsonwebtoken::Algorithm;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::auth::Role;
use crate::policy::path_matches;
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Deployment environment
    pub environment: Environment,
    /// Server configuration
    pub server: ServerConfig,
    /// Token verification configuration
    pub auth: AuthConfig,
    /// Shared cache configuration
    pub cache: CacheConfig,
    /// Rate limiting configuration
    pub rate_limit: RateLimitConfig,
}

/// Deployment environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    /// Production (default). Unsigned development tokens are refused.
    #[default]
    Production,
    /// Local development
    Development,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Maximum request body size (bytes)
    pub max_body_size: usize,
    /// Upstream base URL admitted requests are forwarded to
    pub upstream_url: Option<String>,
    /// Use the first `X-Forwarded-For` hop as the caller address
    pub trust_forwarded_for: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 39500,
            request_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
            max_body_size: 10 * 1024 * 1024, // 10MB
            upstream_url: None,
            trust_forwarded_for: false,
        }
    }
}

/// Token verification configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Require a verified bearer token on non-public paths
    pub enabled: bool,
    /// Key set document published by the issuer
    pub jwks_url: String,
    /// Expected `iss` claim
    pub issuer: String,
    /// Accepted audiences; the token's `aud` must intersect this set
    pub audiences: Vec<String>,
    /// Accepted signing algorithms (asymmetric only)
    pub algorithms: Vec<String>,
    /// How long a fetched key set is considered fresh
    #[serde(with = "humantime_serde")]
    pub key_ttl: Duration,
    /// Upper bound on a single key set fetch
    #[serde(with = "humantime_serde")]
    pub fetch_timeout: Duration,
    /// Minimum spacing between forced refreshes caused by unknown key ids
    #[serde(with = "humantime_serde")]
    pub refresh_cooldown: Duration,
    /// Clock skew tolerance for `exp`/`nbf`
    #[serde(with = "humantime_serde")]
    pub leeway: Duration,
    /// Mirror fetched key sets into the shared cache
    pub mirror_keys: bool,
    /// Accept unsigned tokens. Refused when `environment` is production.
    pub allow_unsigned_dev_tokens: bool,
    /// Paths where a token is optional (anonymous callers are admitted)
    pub public_paths: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            jwks_url: String::new(),
            issuer: String::new(),
            audiences: Vec::new(),
            algorithms: vec!["RS256".to_string(), "ES256".to_string()],
            key_ttl: Duration::from_secs(3600),
            fetch_timeout: Duration::from_secs(5),
            refresh_cooldown: Duration::from_secs(10),
            leeway: Duration::from_secs(30),
            mirror_keys: true,
            allow_unsigned_dev_tokens: false,
            public_paths: Vec::new(),
        }
    }
}

impl AuthConfig {
    /// Parse the configured algorithm names.
    ///
    /// Symmetric (HMAC) algorithms are rejected: accepting them would let a
    /// caller sign with the public key material as an HMAC secret.
    pub fn parsed_algorithms(&self) -> Result<Vec<Algorithm>> {
        if self.algorithms.is_empty() {
            return Err(Error::Config("auth.algorithms must not be empty".into()));
        }
        self.algorithms
            .iter()
            .map(|name| {
                let alg = Algorithm::from_str(name)
                    .map_err(|_| Error::Config(format!("Unknown signing algorithm: {name}")))?;
                if matches!(alg, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512) {
                    return Err(Error::Config(format!(
                        "Symmetric algorithm {name} is not allowed for bearer tokens"
                    )));
                }
                Ok(alg)
            })
            .collect()
    }

    /// Check if a path allows anonymous access
    #[must_use]
    pub fn is_public_path(&self, path: &str) -> bool {
        self.public_paths.iter().any(|p| path_matches(p, path))
    }
}

/// Shared cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Redis URL (supports `env:VAR_NAME`). Absent means in-process memory store.
    pub redis_url: Option<String>,
    /// Prefix of every cache key
    pub namespace: String,
    /// Timeout applied to each cache command
    #[serde(with = "humantime_serde")]
    pub op_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            namespace: "gate".to_string(),
            op_timeout: Duration::from_millis(250),
        }
    }
}

impl CacheConfig {
    /// Resolve the Redis URL (expand `env:` indirection)
    #[must_use]
    pub fn resolve_redis_url(&self) -> Option<String> {
        self.redis_url.as_deref().map(resolve_secret)
    }
}

/// Limiting algorithm used for per-caller quotas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Count admitted requests inside a moving window
    #[default]
    SlidingWindow,
    /// Refill tokens at a steady rate, spend per request
    TokenBucket,
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting
    pub enabled: bool,
    /// Per-caller limiting algorithm
    pub strategy: StrategyKind,
    /// Per-role tiers
    pub roles: HashMap<Role, TierConfig>,
    /// Route templates counters are keyed by; `*` or `{name}` matches one segment
    pub routes: Vec<String>,
    /// Per-endpoint overrides
    pub endpoints: Vec<EndpointRule>,
    /// Per-method overrides (requests per minute)
    pub methods: HashMap<String, u32>,
    /// Networks that bypass limiting (CIDR or exact address)
    pub whitelist: Vec<String>,
    /// Credentials of trusted internal callers (support `env:VAR_NAME`)
    pub internal_service_keys: Vec<String>,
    /// Header carrying the internal service credential
    pub internal_service_header: String,
    /// Paths that skip admission entirely
    pub skip_paths: Vec<String>,
    /// Load-based limit reduction
    pub adaptive: AdaptiveConfig,
    /// Per-caller daily cap
    pub daily: DailyConfig,
    /// Cluster-wide cap
    pub global: GlobalConfig,
    /// Per-caller in-flight cap
    pub concurrency: ConcurrencyConfig,
    /// Failed-authentication lockout
    pub lockout: LockoutConfig,
}

fn default_roles() -> HashMap<Role, TierConfig> {
    HashMap::from([
        (Role::Anonymous, TierConfig::new(30, 300, 10)),
        (Role::Staff, TierConfig::new(120, 3_000, 30)),
        (Role::Organizer, TierConfig::new(300, 10_000, 60)),
        (Role::Admin, TierConfig::new(600, 30_000, 100)),
    ])
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: StrategyKind::default(),
            roles: default_roles(),
            routes: Vec::new(),
            endpoints: Vec::new(),
            methods: HashMap::new(),
            whitelist: Vec::new(),
            internal_service_keys: Vec::new(),
            internal_service_header: "X-Internal-Service-Key".to_string(),
            skip_paths: vec!["/health".to_string()],
            adaptive: AdaptiveConfig::default(),
            daily: DailyConfig::default(),
            global: GlobalConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            lockout: LockoutConfig::default(),
        }
    }
}

impl RateLimitConfig {
    /// Check if a path skips admission
    #[must_use]
    pub fn is_skip_path(&self, path: &str) -> bool {
        self.skip_paths.iter().any(|p| path_matches(p, path))
    }

    /// Parse the whitelist into networks; exact addresses become host routes
    pub fn parsed_whitelist(&self) -> Result<Vec<IpNet>> {
        self.whitelist
            .iter()
            .map(|entry| {
                entry
                    .parse::<IpNet>()
                    .or_else(|_| entry.parse::<std::net::IpAddr>().map(IpNet::from))
                    .map_err(|_| Error::Config(format!("Invalid whitelist entry: {entry}")))
            })
            .collect()
    }

    /// Resolve internal service keys (expand `env:` indirection)
    #[must_use]
    pub fn resolved_internal_keys(&self) -> Vec<String> {
        self.internal_service_keys
            .iter()
            .map(|k| resolve_secret(k))
            .filter(|k| !k.is_empty())
            .collect()
    }
}

/// Limits for one role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierConfig {
    /// Requests per minute
    pub requests_per_minute: u32,
    /// Requests per hour (0 = no hourly cap)
    #[serde(default)]
    pub requests_per_hour: u32,
    /// Token bucket capacity
    #[serde(default)]
    pub burst: u32,
}

impl TierConfig {
    /// Create a tier
    #[must_use]
    pub const fn new(requests_per_minute: u32, requests_per_hour: u32, burst: u32) -> Self {
        Self {
            requests_per_minute,
            requests_per_hour,
            burst,
        }
    }
}

/// Override for a route (and optionally a method)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointRule {
    /// Route pattern; `*` matches one segment, a trailing `*` any suffix
    pub path: String,
    /// HTTP method (any if absent)
    #[serde(default)]
    pub method: Option<String>,
    /// Requests per minute for this endpoint
    #[serde(default)]
    pub requests_per_minute: Option<u32>,
    /// Quota units consumed per request (default 1)
    #[serde(default)]
    pub cost: Option<u32>,
}

impl EndpointRule {
    /// Check if this rule applies to a route and method
    #[must_use]
    pub fn matches(&self, route: &str, method: &str) -> bool {
        path_matches(&self.path, route)
            && self
                .method
                .as_deref()
                .is_none_or(|m| m.eq_ignore_ascii_case(method))
    }
}

/// Adaptive limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    /// Shrink limits under load
    pub enabled: bool,
    /// Fraction of the limit removed at full load
    pub max_reduction: f64,
    /// Limits never drop below this
    pub min_limit: u32,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_reduction: 0.7,
            min_limit: 10,
        }
    }
}

/// Daily cap configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DailyConfig {
    /// Enable the daily cap
    pub enabled: bool,
    /// Requests per caller per 24h
    pub limit: u32,
}

impl Default for DailyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            limit: 50_000,
        }
    }
}

/// Cluster-wide cap configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Enable the global cap
    pub enabled: bool,
    /// Requests across all callers per window
    pub limit: u32,
    /// Window length
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            limit: 10_000,
            window: Duration::from_secs(1),
        }
    }
}

/// In-flight cap configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Enable the in-flight cap
    pub enabled: bool,
    /// Concurrent requests per caller
    pub max_in_flight: u32,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_in_flight: 20,
        }
    }
}

/// Behaviour of a check whose shared state is unreachable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailMode {
    /// Admit the request
    #[default]
    Open,
    /// Reject the request
    Closed,
}

/// Failed-authentication lockout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockoutConfig {
    /// Enable lockout
    pub enabled: bool,
    /// Failures tolerated per window before locking the address out
    pub max_failures: u32,
    /// Failure counting window
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// How long a lockout lasts
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// Behaviour when the lockout state cannot be read
    pub fail_mode: FailMode,
}

impl Default for LockoutConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_failures: 5,
            window: Duration::from_secs(60),
            duration: Duration::from_secs(15 * 60),
            fail_mode: FailMode::Open,
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("ADMISSION_GATEWAY_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.expand_env_vars()?;
        config.validate()?;

        Ok(config)
    }

    /// Validate cross-field constraints
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if let Err(e) = self.auth.parsed_algorithms() {
            problems.push(e.to_string());
        }
        if self.auth.enabled && self.auth.jwks_url.is_empty() {
            problems.push("auth.jwks_url is required when auth is enabled".to_string());
        }
        if self.auth.enabled && self.auth.issuer.is_empty() {
            problems.push("auth.issuer is required when auth is enabled".to_string());
        }
        if self.auth.enabled && self.auth.audiences.iter().all(String::is_empty) {
            problems.push("auth.audiences must name at least one audience when auth is enabled".to_string());
        }
        if !self.auth.jwks_url.is_empty() && url::Url::parse(&self.auth.jwks_url).is_err() {
            problems.push(format!("auth.jwks_url is not a URL: {}", self.auth.jwks_url));
        }
        if self.auth.allow_unsigned_dev_tokens && self.environment == Environment::Production {
            problems.push(
                "auth.allow_unsigned_dev_tokens cannot be enabled in production".to_string(),
            );
        }
        if let Some(upstream) = &self.server.upstream_url {
            if url::Url::parse(upstream).is_err() {
                problems.push(format!("server.upstream_url is not a URL: {upstream}"));
            }
        }
        if let Err(e) = self.rate_limit.parsed_whitelist() {
            problems.push(e.to_string());
        }
        let adaptive = &self.rate_limit.adaptive;
        if !(0.0..=1.0).contains(&adaptive.max_reduction) {
            problems.push(format!(
                "rate_limit.adaptive.max_reduction must be within [0, 1], got {}",
                adaptive.max_reduction
            ));
        }
        if self.rate_limit.global.enabled && self.rate_limit.global.window.is_zero() {
            problems.push("rate_limit.global.window must be positive".to_string());
        }
        if self.rate_limit.lockout.enabled && self.rate_limit.lockout.window.is_zero() {
            problems.push("rate_limit.lockout.window must be positive".to_string());
        }
        if !self.rate_limit.roles.contains_key(&Role::Anonymous) {
            problems.push("rate_limit.roles must define an anonymous tier".to_string());
        }
        if self.cache.op_timeout.is_zero() {
            problems.push("cache.op_timeout must be positive".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(problems.join("; ")))
        }
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in URL-valued settings
    fn expand_env_vars(&mut self) -> Result<()> {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
            .map_err(|e| Error::Internal(e.to_string()))?;

        self.auth.jwks_url = Self::expand_string(&re, &self.auth.jwks_url);
        self.auth.issuer = Self::expand_string(&re, &self.auth.issuer);
        if let Some(upstream) = self.server.upstream_url.as_mut() {
            *upstream = Self::expand_string(&re, upstream);
        }
        if let Some(redis_url) = self.cache.redis_url.as_mut() {
            *redis_url = Self::expand_string(&re, redis_url);
        }
        Ok(())
    }

    /// Expand environment variables in a string
    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }
}

/// Resolve `env:VAR_NAME` indirection; other values are returned as-is
#[must_use]
pub fn resolve_secret(value: &str) -> String {
    if let Some(var_name) = value.strip_prefix("env:") {
        env::var(var_name).unwrap_or_default()
    } else {
        value.to_string()
    }
}

/// Human-readable serde for `Duration` ("100ms", "30s", "5m", "2h")
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to a human-readable string
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize a human-readable duration string
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Parse "100ms", "30s", "5m", "2h" or bare seconds
    ///
    /// # Errors
    ///
    /// Returns the parse error for malformed input.
    pub fn parse(s: &str) -> Result<Duration, std::num::ParseIntError> {
        let s = s.trim();
        // "ms" must be checked before "s" and "m"
        if let Some(ms) = s.strip_suffix("ms") {
            ms.trim().parse::<u64>().map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.trim().parse::<u64>().map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.trim().parse::<u64>().map(|m| Duration::from_secs(m * 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            hours.trim().parse::<u64>().map(|h| Duration::from_secs(h * 3600))
        } else {
            s.parse::<u64>().map(Duration::from_secs)
        }
    }
}

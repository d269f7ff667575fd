//! Trust root: the issuer's verification key set, cached locally.
//!
//! # Refresh flow
//!
//! 1. A lookup on a fresh set is a read-lock map hit and never waits.
//! 2. On a cold or expired set, one caller fetches while the others queue on the
//!    refresh mutex; when they get it they see the attempt counter moved and
//!    reuse the result instead of fetching again.
//! 3. An expiry refresh first consults the shared cache mirror, so a fleet of
//!    instances fetches the document roughly once per TTL.
//! 4. An unknown `kid` forces one network refresh (key rotation), spaced by the
//!    refresh cooldown so garbage key ids cannot amplify into fetches. It only
//!    coalesces with another network fetch, never with a mirror read.
//! 5. A failed refresh keeps serving the previous keys. A fetched set with no
//!    usable signing keys counts as a failure, so the set never becomes empty
//!    once populated.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use jsonwebtoken::jwk::{AlgorithmParameters, Jwk, PublicKeyUse};
use jsonwebtoken::{Algorithm, DecodingKey};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::error::AuthError;
use crate::config::AuthConfig;
use crate::store::SharedCache;
use crate::{Error, Result};

/// Delay before retrying an expiry refresh after a failure
const FAILURE_BACKOFF: Duration = Duration::from_secs(5);

/// Key type, which bounds the algorithms a key may verify
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFamily {
    /// RSA (`RS*`, `PS*`)
    Rsa,
    /// Elliptic curve (`ES*`)
    Ec,
    /// Octet key pair (`EdDSA`)
    Okp,
}

impl KeyFamily {
    /// Whether a key of this family can verify `alg`
    #[must_use]
    pub const fn accepts(self, alg: Algorithm) -> bool {
        match self {
            Self::Rsa => matches!(
                alg,
                Algorithm::RS256
                    | Algorithm::RS384
                    | Algorithm::RS512
                    | Algorithm::PS256
                    | Algorithm::PS384
                    | Algorithm::PS512
            ),
            Self::Ec => matches!(alg, Algorithm::ES256 | Algorithm::ES384),
            Self::Okp => matches!(alg, Algorithm::EdDSA),
        }
    }
}

/// One public key from the issuer's key set. Never mutated; a rotation
/// replaces the whole entry.
#[derive(Clone)]
pub struct VerificationKey {
    /// Key id (`kid`)
    pub id: String,
    /// Key type
    pub family: KeyFamily,
    /// Algorithm pinned by the key set, if any
    pub algorithm: Option<Algorithm>,
    /// Public material ready for signature checks
    pub decoding: DecodingKey,
    /// When this key was fetched
    pub fetched_at: Instant,
}

impl VerificationKey {
    /// Whether this key may verify a token signed with `alg`
    #[must_use]
    pub fn accepts(&self, alg: Algorithm) -> bool {
        self.family.accepts(alg) && self.algorithm.is_none_or(|pinned| pinned == alg)
    }
}

impl std::fmt::Debug for VerificationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationKey")
            .field("id", &self.id)
            .field("family", &self.family)
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

/// Where key set documents come from
#[async_trait]
pub trait KeySource: Send + Sync {
    /// Fetch the raw key set document
    async fn fetch(&self) -> Result<String>;
}

/// Key set published at an HTTP(S) URL
pub struct HttpKeySource {
    client: reqwest::Client,
    url: String,
}

impl HttpKeySource {
    /// Create a source for `url`
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        if !url.starts_with("https://") {
            warn!(url = %url, "Key set URL is not HTTPS");
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl KeySource for HttpKeySource {
    async fn fetch(&self) -> Result<String> {
        debug!(url = %self.url, "Fetching key set");
        let response = self.client.get(&self.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::KeyFetch(format!("{} returned {status}", self.url)));
        }
        Ok(response.text().await?)
    }
}

/// Why a refresh was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefreshReason {
    /// Cold start or TTL elapsed
    Expired,
    /// A token named a key id we do not hold
    UnknownKey,
}

struct Mirror {
    cache: SharedCache,
    key: String,
}

/// Locally cached key set with single-flight refresh and stale fallback
pub struct TrustRootCache {
    source: Arc<dyn KeySource>,
    keys: RwLock<HashMap<String, Arc<VerificationKey>>>,
    refresh_lock: tokio::sync::Mutex<()>,
    epoch: Instant,
    /// Milliseconds since `epoch` (+1) of the last successful refresh, 0 = never
    refreshed_at_ms: AtomicU64,
    /// No expiry refresh before this point after a failure
    retry_at_ms: AtomicU64,
    attempts: AtomicU64,
    generation: AtomicU64,
    fetches: AtomicU64,
    ttl: Duration,
    fetch_timeout: Duration,
    cooldown: Option<DefaultDirectRateLimiter>,
    mirror: Option<Mirror>,
}

impl TrustRootCache {
    /// Create an empty cache. Nothing is fetched until the first lookup.
    #[must_use]
    pub fn new(source: Arc<dyn KeySource>, ttl: Duration, fetch_timeout: Duration) -> Self {
        Self {
            source,
            keys: RwLock::new(HashMap::new()),
            refresh_lock: tokio::sync::Mutex::new(()),
            epoch: Instant::now(),
            refreshed_at_ms: AtomicU64::new(0),
            retry_at_ms: AtomicU64::new(0),
            attempts: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            fetches: AtomicU64::new(0),
            ttl,
            fetch_timeout,
            cooldown: None,
            mirror: None,
        }
    }

    /// Build from configuration with an HTTP source
    pub fn from_config(config: &AuthConfig, cache: Option<SharedCache>, namespace: &str) -> Result<Self> {
        let source = HttpKeySource::new(&config.jwks_url, config.fetch_timeout)?;
        let mut trust_root = Self::new(Arc::new(source), config.key_ttl, config.fetch_timeout)
            .with_refresh_cooldown(config.refresh_cooldown);
        if let Some(cache) = cache.filter(|_| config.mirror_keys) {
            let owner = if config.issuer.is_empty() {
                &config.jwks_url
            } else {
                &config.issuer
            };
            trust_root = trust_root.with_mirror(cache, namespace, owner);
        }
        Ok(trust_root)
    }

    /// Space forced refreshes by at least `cooldown`. Zero disables spacing.
    #[must_use]
    pub fn with_refresh_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = Quota::with_period(cooldown)
            .map(|q| RateLimiter::direct(q.allow_burst(NonZeroU32::MIN)));
        self
    }

    /// Mirror fetched documents into the shared cache under a key derived from `owner`
    #[must_use]
    pub fn with_mirror(mut self, cache: SharedCache, namespace: &str, owner: &str) -> Self {
        let digest = Sha256::digest(owner.as_bytes());
        let fingerprint = hex::encode(&digest[..8]);
        self.mirror = Some(Mirror {
            cache,
            key: format!("{namespace}:jwks:issuer:{fingerprint}"),
        });
        self
    }

    /// Resolve a key id, refreshing the set when stale or when the id is unknown.
    pub async fn get_key(&self, kid: &str) -> std::result::Result<Arc<VerificationKey>, AuthError> {
        if !self.is_fresh() {
            self.refresh(RefreshReason::Expired).await;
        }
        if let Some(key) = self.lookup(kid) {
            return Ok(key);
        }

        if self.cooldown.as_ref().is_some_and(|c| c.check().is_err()) {
            debug!(kid = %kid, "Unknown key id, forced refresh cooling down");
            return Err(AuthError::UnknownKey(kid.to_string()));
        }

        debug!(kid = %kid, "Key id not in cached set, refreshing");
        self.refresh(RefreshReason::UnknownKey).await;
        self.lookup(kid).ok_or_else(|| AuthError::UnknownKey(kid.to_string()))
    }

    /// Number of network fetches performed
    #[must_use]
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    /// Number of successful refreshes
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }

    /// Key ids currently held
    #[must_use]
    pub fn key_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.keys.read().keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    /// Eagerly load the key set. Failure is logged, not fatal.
    pub async fn warm(&self) {
        self.refresh(RefreshReason::Expired).await;
    }

    fn lookup(&self, kid: &str) -> Option<Arc<VerificationKey>> {
        self.keys.read().get(kid).cloned()
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis())
            .unwrap_or(u64::MAX)
            .saturating_add(1)
    }

    fn is_fresh(&self) -> bool {
        let refreshed = self.refreshed_at_ms.load(Ordering::Acquire);
        refreshed != 0
            && u128::from(self.elapsed_ms().saturating_sub(refreshed)) < self.ttl.as_millis()
    }

    async fn refresh(&self, reason: RefreshReason) {
        let has_keys = !self.keys.read().is_empty();
        if reason == RefreshReason::Expired
            && has_keys
            && self.elapsed_ms() < self.retry_at_ms.load(Ordering::Acquire)
        {
            return;
        }

        // A rotated key is only trusted once the issuer itself was asked.
        let counter = match reason {
            RefreshReason::Expired => &self.attempts,
            RefreshReason::UnknownKey => &self.fetches,
        };
        let seen = counter.load(Ordering::Acquire);
        let _guard = self.refresh_lock.lock().await;
        if counter.load(Ordering::Acquire) != seen {
            // Someone refreshed while we queued; use their result.
            return;
        }

        let outcome = self.load_key_set(reason).await;
        match outcome {
            Ok((keys, origin)) => {
                let count = keys.len();
                *self.keys.write() = keys;
                self.refreshed_at_ms.store(self.elapsed_ms(), Ordering::Release);
                self.retry_at_ms.store(0, Ordering::Release);
                let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
                info!(keys = count, origin, generation, ?reason, "Trust root refreshed");
                telemetry_metrics::counter!("trust_root_refresh_total", "result" => origin).increment(1);
            }
            Err(e) => {
                let backoff = FAILURE_BACKOFF.min(self.ttl);
                let backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX);
                self.retry_at_ms
                    .store(self.elapsed_ms().saturating_add(backoff_ms), Ordering::Release);
                if has_keys {
                    warn!(error = %e, ?reason, "Key set refresh failed, serving cached keys");
                } else {
                    warn!(error = %e, ?reason, "Key set refresh failed and no keys are cached");
                }
                telemetry_metrics::counter!("trust_root_refresh_total", "result" => "error").increment(1);
            }
        }
        self.attempts.fetch_add(1, Ordering::AcqRel);
    }

    async fn load_key_set(
        &self,
        reason: RefreshReason,
    ) -> Result<(HashMap<String, Arc<VerificationKey>>, &'static str)> {
        if reason == RefreshReason::Expired
            && let Some(keys) = self.read_mirror().await
        {
            return Ok((keys, "mirror"));
        }

        self.fetches.fetch_add(1, Ordering::AcqRel);
        let document = tokio::time::timeout(self.fetch_timeout, self.source.fetch())
            .await
            .map_err(|_| Error::KeyFetch(format!("timed out after {:?}", self.fetch_timeout)))??;
        let keys = parse_key_set(&document)?;

        if let Some(mirror) = &self.mirror
            && let Err(e) = mirror.cache.set(&mirror.key, &document, self.ttl).await
        {
            debug!(error = %e, "Could not mirror key set");
        }
        Ok((keys, "network"))
    }

    async fn read_mirror(&self) -> Option<HashMap<String, Arc<VerificationKey>>> {
        let mirror = self.mirror.as_ref()?;
        match mirror.cache.get(&mirror.key).await {
            Ok(Some(document)) => match parse_key_set(&document) {
                Ok(keys) => Some(keys),
                Err(e) => {
                    debug!(error = %e, "Ignoring unusable mirrored key set");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                debug!(error = %e, "Key set mirror unavailable");
                None
            }
        }
    }
}

/// Parse a JSON key set document into signing keys by id.
///
/// Keys are parsed one by one so a single unsupported entry does not discard
/// the set. Encryption keys, symmetric keys and keys without an id are skipped.
pub fn parse_key_set(document: &str) -> Result<HashMap<String, Arc<VerificationKey>>> {
    let value: serde_json::Value = serde_json::from_str(document)?;
    let entries = value
        .get("keys")
        .and_then(serde_json::Value::as_array)
        .ok_or_else(|| Error::KeyFetch("document has no `keys` array".to_string()))?;

    let fetched_at = Instant::now();
    let mut keys = HashMap::with_capacity(entries.len());
    for entry in entries {
        let jwk: Jwk = match serde_json::from_value(entry.clone()) {
            Ok(jwk) => jwk,
            Err(e) => {
                debug!(error = %e, "Skipping unparseable key");
                continue;
            }
        };
        if let Some(key) = to_verification_key(&jwk, fetched_at) {
            keys.insert(key.id.clone(), Arc::new(key));
        }
    }

    if keys.is_empty() {
        return Err(Error::KeyFetch("key set contains no usable signing keys".to_string()));
    }
    Ok(keys)
}

fn to_verification_key(jwk: &Jwk, fetched_at: Instant) -> Option<VerificationKey> {
    let id = jwk.common.key_id.clone()?;
    if matches!(jwk.common.public_key_use, Some(PublicKeyUse::Encryption)) {
        return None;
    }
    let family = match &jwk.algorithm {
        AlgorithmParameters::RSA(_) => KeyFamily::Rsa,
        AlgorithmParameters::EllipticCurve(_) => KeyFamily::Ec,
        AlgorithmParameters::OctetKeyPair(_) => KeyFamily::Okp,
        AlgorithmParameters::OctetKey(_) => return None,
    };
    // The key set names algorithms with the same identifiers as token headers.
    let algorithm = match &jwk.common.key_algorithm {
        Some(declared) => Some(format!("{declared:?}").parse::<Algorithm>().ok()?),
        None => None,
    };
    let decoding = match DecodingKey::from_jwk(jwk) {
        Ok(decoding) => decoding,
        Err(e) => {
            debug!(kid = %id, error = %e, "Skipping key with unusable material");
            return None;
        }
    };
    Some(VerificationKey {
        id,
        family,
        algorithm,
        decoding,
        fetched_at,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    pub(crate) const KEY_A_X: &str = "F4gpQfwlbA3JM7mg_SQXED7_9xPz5WDVKjUdf7uFnNU";
    pub(crate) const KEY_A_Y: &str = "QzlMpVwu9PdPCP3DdkhBYMvDHstxt6Bp6V1VekwLKiA";
    pub(crate) const KEY_B_X: &str = "PWUiPptUiE14WfSmSoSEgi8xTa1Re-uekyDA92uzvHs";
    pub(crate) const KEY_B_Y: &str = "naOeknFXO9VlzA0NOgALSbyq3sOBFPUgUZWtJPqauv0";

    pub(crate) fn ec_jwk(kid: &str, x: &str, y: &str) -> serde_json::Value {
        serde_json::json!({
            "kty": "EC", "crv": "P-256", "x": x, "y": y,
            "kid": kid, "alg": "ES256", "use": "sig"
        })
    }

    pub(crate) fn key_set(keys: &[serde_json::Value]) -> String {
        serde_json::json!({ "keys": keys }).to_string()
    }

    /// Key source whose document can be swapped and which can be made to fail
    pub(crate) struct StaticSource {
        pub(crate) document: parking_lot::Mutex<String>,
        pub(crate) failing: AtomicBool,
        pub(crate) delay: Duration,
    }

    impl StaticSource {
        pub(crate) fn new(document: String) -> Arc<Self> {
            Arc::new(Self {
                document: parking_lot::Mutex::new(document),
                failing: AtomicBool::new(false),
                delay: Duration::ZERO,
            })
        }
    }

    #[async_trait]
    impl KeySource for StaticSource {
        async fn fetch(&self) -> Result<String> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(Error::KeyFetch("issuer unreachable".to_string()));
            }
            Ok(self.document.lock().clone())
        }
    }

    #[test]
    fn test_parse_skips_encryption_symmetric_and_anonymous_keys() {
        let doc = key_set(&[
            ec_jwk("sig-1", KEY_A_X, KEY_A_Y),
            serde_json::json!({"kty": "EC", "crv": "P-256", "x": KEY_B_X, "y": KEY_B_Y, "kid": "enc-1", "use": "enc"}),
            serde_json::json!({"kty": "oct", "k": "c2VjcmV0", "kid": "hmac-1"}),
            serde_json::json!({"kty": "EC", "crv": "P-256", "x": KEY_B_X, "y": KEY_B_Y}),
            serde_json::json!({"kty": "weird", "kid": "odd"}),
        ]);
        let keys = parse_key_set(&doc).unwrap();
        assert_eq!(keys.len(), 1);
        assert!(keys.contains_key("sig-1"));
    }

    #[test]
    fn test_parse_rejects_set_without_usable_keys() {
        assert!(parse_key_set(&key_set(&[])).is_err());
        assert!(parse_key_set("{}").is_err());
        assert!(parse_key_set("not json").is_err());
    }

    #[test]
    fn test_key_accepts_only_its_family_and_pinned_algorithm() {
        let keys = parse_key_set(&key_set(&[ec_jwk("a", KEY_A_X, KEY_A_Y)])).unwrap();
        let key = &keys["a"];
        assert_eq!(key.family, KeyFamily::Ec);
        assert!(key.accepts(Algorithm::ES256));
        assert!(!key.accepts(Algorithm::ES384));
        assert!(!key.accepts(Algorithm::RS256));
        assert!(!key.accepts(Algorithm::HS256));
    }

    #[tokio::test]
    async fn test_repeated_lookups_fetch_once() {
        // GIVEN: a cache over a source with one key
        let source = StaticSource::new(key_set(&[ec_jwk("a", KEY_A_X, KEY_A_Y)]));
        let cache = TrustRootCache::new(source, Duration::from_secs(3600), Duration::from_secs(1));

        // WHEN: the same key is looked up repeatedly
        let first = cache.get_key("a").await.unwrap();
        for _ in 0..10 {
            let again = cache.get_key("a").await.unwrap();
            // THEN: the same key material comes back
            assert!(Arc::ptr_eq(&first, &again));
        }

        // THEN: only one network fetch happened
        assert_eq!(cache.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_cold_lookups_coalesce() {
        // GIVEN: a slow source and a cold cache
        let source = Arc::new(StaticSource {
            document: parking_lot::Mutex::new(key_set(&[ec_jwk("a", KEY_A_X, KEY_A_Y)])),
            failing: AtomicBool::new(false),
            delay: Duration::from_millis(50),
        });
        let cache = Arc::new(TrustRootCache::new(source, Duration::from_secs(3600), Duration::from_secs(1)));

        // WHEN: many callers look up at once
        let lookups: Vec<_> = (0..16)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.get_key("a").await })
            })
            .collect();
        for lookup in lookups {
            assert!(lookup.await.unwrap().is_ok());
        }

        // THEN: they shared a single fetch
        assert_eq!(cache.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_kid_forces_exactly_one_refresh() {
        // GIVEN: a warm cache holding key a
        let source = StaticSource::new(key_set(&[ec_jwk("a", KEY_A_X, KEY_A_Y)]));
        let cache = TrustRootCache::new(source.clone(), Duration::from_secs(3600), Duration::from_secs(1));
        cache.get_key("a").await.unwrap();
        assert_eq!(cache.fetch_count(), 1);

        // WHEN: an unknown kid is requested
        let err = cache.get_key("nope").await.unwrap_err();

        // THEN: one forced refresh happened before reporting it unknown
        assert_eq!(err, AuthError::UnknownKey("nope".to_string()));
        assert_eq!(cache.fetch_count(), 2);

        // WHEN: the issuer rotates in key b
        *source.document.lock() = key_set(&[ec_jwk("a", KEY_A_X, KEY_A_Y), ec_jwk("b", KEY_B_X, KEY_B_Y)]);
        let key = cache.get_key("b").await.unwrap();

        // THEN: the forced refresh picks it up
        assert_eq!(key.id, "b");
        assert_eq!(cache.fetch_count(), 3);
    }

    #[tokio::test]
    async fn test_refresh_cooldown_limits_forced_refreshes() {
        // GIVEN: a warm cache with a long cooldown
        let source = StaticSource::new(key_set(&[ec_jwk("a", KEY_A_X, KEY_A_Y)]));
        let cache = TrustRootCache::new(source, Duration::from_secs(3600), Duration::from_secs(1))
            .with_refresh_cooldown(Duration::from_secs(60));
        cache.get_key("a").await.unwrap();

        // WHEN: a burst of garbage kids arrives
        for i in 0..20 {
            assert!(cache.get_key(&format!("junk-{i}")).await.is_err());
        }

        // THEN: only the first one reached the network
        assert_eq!(cache.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_stale_keys_served_when_refresh_fails() {
        // GIVEN: a populated cache whose TTL has elapsed and an issuer that is down
        let source = StaticSource::new(key_set(&[ec_jwk("a", KEY_A_X, KEY_A_Y)]));
        let cache = TrustRootCache::new(source.clone(), Duration::from_millis(20), Duration::from_millis(200));
        cache.get_key("a").await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        source.failing.store(true, Ordering::SeqCst);

        // WHEN: the key is looked up again
        let key = cache.get_key("a").await.unwrap();

        // THEN: the stale key is served and the set is not emptied
        assert_eq!(key.id, "a");
        assert_eq!(cache.key_ids(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_empty_fetched_set_keeps_previous_keys() {
        let source = StaticSource::new(key_set(&[ec_jwk("a", KEY_A_X, KEY_A_Y)]));
        let cache = TrustRootCache::new(source.clone(), Duration::from_millis(10), Duration::from_millis(200));
        cache.get_key("a").await.unwrap();

        *source.document.lock() = key_set(&[]);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(cache.get_key("a").await.is_ok());
        assert_eq!(cache.generation(), 1);
    }

    #[tokio::test]
    async fn test_hanging_source_bounded_by_fetch_timeout() {
        // GIVEN: a cached key, an expired TTL and an issuer that never answers in time
        let source = Arc::new(StaticSource {
            document: parking_lot::Mutex::new(key_set(&[ec_jwk("a", KEY_A_X, KEY_A_Y)])),
            failing: AtomicBool::new(false),
            delay: Duration::from_millis(0),
        });
        let cache = TrustRootCache::new(source, Duration::from_millis(10), Duration::from_millis(100));
        cache.get_key("a").await.unwrap();
        let slow = Arc::new(StaticSource {
            document: parking_lot::Mutex::new(key_set(&[ec_jwk("a", KEY_A_X, KEY_A_Y)])),
            failing: AtomicBool::new(false),
            delay: Duration::from_secs(30),
        });
        let cache = TrustRootCache {
            source: slow,
            ..cache
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // WHEN: the key is looked up
        let started = Instant::now();
        let key = cache.get_key("a").await;

        // THEN: the stale key comes back once the fetch times out
        assert!(key.is_ok());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_unreachable_mirror_falls_back_to_network() {
        // GIVEN: a mirror pointing at a refused port
        let source = StaticSource::new(key_set(&[ec_jwk("a", KEY_A_X, KEY_A_Y)]));
        let shared = SharedCache::redis("redis://127.0.0.1:1/", Duration::from_millis(200)).unwrap();
        let cache = TrustRootCache::new(source, Duration::from_secs(3600), Duration::from_secs(1))
            .with_mirror(shared, "gate", "https://issuer.example");

        // WHEN: the cold cache is used
        let started = Instant::now();
        let key = cache.get_key("a").await;

        // THEN: the network fetch still succeeds within the timeouts
        assert!(key.is_ok());
        assert_eq!(cache.fetch_count(), 1);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_forced_refresh_does_not_settle_for_a_mirrored_set() {
        // GIVEN: a slow mirror still holding the set before key b was rotated in
        let shared = SharedCache::memory_with_latency(Duration::from_secs(1), Duration::from_millis(50));
        let source = StaticSource::new(key_set(&[ec_jwk("a", KEY_A_X, KEY_A_Y)]));
        TrustRootCache::new(source.clone(), Duration::from_secs(3600), Duration::from_secs(1))
            .with_mirror(shared.clone(), "gate", "https://issuer.example")
            .warm()
            .await;
        *source.document.lock() = key_set(&[ec_jwk("a", KEY_A_X, KEY_A_Y), ec_jwk("b", KEY_B_X, KEY_B_Y)]);
        let cache = Arc::new(
            TrustRootCache::new(source, Duration::from_secs(3600), Duration::from_secs(1))
                .with_mirror(shared, "gate", "https://issuer.example"),
        );

        // WHEN: an unknown-key refresh queues behind an expiry refresh served by the mirror
        let expiry = tokio::spawn({
            let cache = Arc::clone(&cache);
            async move { cache.refresh(RefreshReason::Expired).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        cache.refresh(RefreshReason::UnknownKey).await;
        expiry.await.unwrap();

        // THEN: it still went to the issuer and picked up the rotated key
        assert_eq!(cache.fetch_count(), 1);
        assert_eq!(cache.key_ids(), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_mirror_shares_key_set_between_instances() {
        // GIVEN: two instances sharing one cache tier
        let shared = SharedCache::memory(Duration::from_millis(100));
        let source = StaticSource::new(key_set(&[ec_jwk("a", KEY_A_X, KEY_A_Y)]));
        let first = TrustRootCache::new(source.clone(), Duration::from_secs(3600), Duration::from_secs(1))
            .with_mirror(shared.clone(), "gate", "https://issuer.example");
        let second = TrustRootCache::new(source.clone(), Duration::from_secs(3600), Duration::from_secs(1))
            .with_mirror(shared, "gate", "https://issuer.example");

        // WHEN: both warm up
        first.get_key("a").await.unwrap();
        second.get_key("a").await.unwrap();

        // THEN: the second instance read the mirror instead of the network
        assert_eq!(first.fetch_count(), 1);
        assert_eq!(second.fetch_count(), 0);
    }
}

//! Bearer token verification.
//!
//! # Verification flow
//!
//! 1. Decode the header without trusting it and reject any algorithm outside
//!    the configured asymmetric set (no `HS*`, no `none` outside development).
//! 2. Resolve `kid` through the [`TrustRootCache`] and make sure the key's type
//!    and pinned algorithm agree with the header.
//! 3. Verify the signature, then check issuer and audience by hand so the
//!    error names the mismatch.
//! 4. Re-check `exp` and `nbf` against our own clock with the configured leeway.
//! 5. Return an [`Identity`] built from the claims.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::{Algorithm, TokenData, Validation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::error::AuthError;
use super::roles::{InsufficientRole, Role};
use super::trust_root::TrustRootCache;
use crate::config::{AuthConfig, Environment};
use crate::{Error, Result};

/// Verified caller, held for the lifetime of one request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// `sub` claim
    pub subject: String,
    /// Email address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Roles granted by the issuer
    pub roles: Vec<Role>,
    /// Festival the token is scoped to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub festival_id: Option<String>,
    /// Stands the caller operates
    #[serde(default)]
    pub stand_ids: Vec<String>,
    /// Festivals the caller organizes
    #[serde(default)]
    pub organizer_for: Vec<String>,
    /// Fine-grained permissions
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Token expiry (Unix seconds)
    pub expires_at: u64,
}

impl Identity {
    /// Most privileged role held
    #[must_use]
    pub fn highest_role(&self) -> Role {
        Role::highest(self.roles.iter().copied())
    }

    /// Whether the caller holds `role` exactly
    #[must_use]
    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    /// Require at least `minimum` in the role hierarchy
    pub fn require_role(&self, minimum: Role) -> std::result::Result<(), InsufficientRole> {
        let actual = self.highest_role();
        if actual.satisfies(minimum) {
            Ok(())
        } else {
            Err(InsufficientRole {
                required: minimum,
                actual,
            })
        }
    }
}

/// Raw token claims
#[derive(Debug, Clone, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    iss: Option<String>,
    /// Single string or array
    #[serde(default)]
    aud: Value,
    exp: u64,
    #[serde(default)]
    nbf: Option<u64>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    roles: Vec<String>,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    festival_id: Option<Value>,
    #[serde(default)]
    stand_ids: Vec<Value>,
    #[serde(default)]
    organizer_for: Vec<Value>,
    #[serde(default)]
    permissions: Vec<String>,
}

/// Verifies bearer tokens against the issuer's trust root
pub struct TokenVerifier {
    trust_root: Arc<TrustRootCache>,
    algorithms: Vec<Algorithm>,
    issuer: String,
    audiences: Vec<String>,
    leeway: Duration,
    allow_unsigned: bool,
}

impl TokenVerifier {
    /// Build a verifier. Unsigned development tokens are refused in production.
    pub fn new(trust_root: Arc<TrustRootCache>, config: &AuthConfig, environment: Environment) -> Result<Self> {
        if config.allow_unsigned_dev_tokens && environment == Environment::Production {
            return Err(Error::Config(
                "auth.allow_unsigned_dev_tokens cannot be enabled in production".into(),
            ));
        }
        if config.allow_unsigned_dev_tokens {
            warn!("Unsigned development tokens are accepted");
        }
        if config.issuer.is_empty() || config.audiences.is_empty() {
            warn!("No issuer or audience configured, every token will be rejected");
        }

        Ok(Self {
            trust_root,
            algorithms: config.parsed_algorithms()?,
            issuer: config.issuer.clone(),
            audiences: config.audiences.clone(),
            leeway: config.leeway,
            allow_unsigned: config.allow_unsigned_dev_tokens,
        })
    }

    /// The trust root backing this verifier
    #[must_use]
    pub fn trust_root(&self) -> &Arc<TrustRootCache> {
        &self.trust_root
    }

    /// Verify a raw bearer token and extract the caller's identity.
    pub async fn verify(&self, token: &str) -> std::result::Result<Identity, AuthError> {
        let header = match jsonwebtoken::decode_header(token) {
            Ok(header) => header,
            Err(e) => {
                if raw_header_alg(token).as_deref() == Some("none") {
                    if self.allow_unsigned {
                        return self.verify_unsigned(token);
                    }
                    return Err(AuthError::AlgorithmNotAllowed("none".to_string()));
                }
                return Err(e.into());
            }
        };

        if !self.algorithms.contains(&header.alg) {
            return Err(AuthError::AlgorithmNotAllowed(format!("{:?}", header.alg)));
        }

        let kid = header
            .kid
            .as_deref()
            .ok_or_else(|| AuthError::MalformedToken("missing kid".to_string()))?;
        let key = self.trust_root.get_key(kid).await?;
        if !key.accepts(header.alg) {
            debug!(kid = %kid, alg = ?header.alg, family = ?key.family, "Algorithm does not match key");
            return Err(AuthError::AlgorithmNotAllowed(format!("{:?}", header.alg)));
        }

        let mut validation = Validation::new(header.alg);
        validation.leeway = self.leeway.as_secs();
        validation.validate_nbf = true;
        // Issuer and audience are checked below for clearer errors.
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["exp", "sub"]);

        let data: TokenData<Claims> = jsonwebtoken::decode(token, &key.decoding, &validation)?;
        self.check_claims(data.claims)
    }

    fn verify_unsigned(&self, token: &str) -> std::result::Result<Identity, AuthError> {
        let payload = token
            .split('.')
            .nth(1)
            .ok_or_else(|| AuthError::MalformedToken("missing payload".to_string()))?;
        let bytes = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|e| AuthError::MalformedToken(e.to_string()))?;
        let claims: Claims =
            serde_json::from_slice(&bytes).map_err(|e| AuthError::MalformedToken(e.to_string()))?;
        debug!(sub = %claims.sub, "Accepted unsigned development token");
        self.check_claims(claims)
    }

    fn check_claims(&self, claims: Claims) -> std::result::Result<Identity, AuthError> {
        // An unconfigured issuer matches nothing, not everything.
        let actual = claims.iss.as_deref().unwrap_or_default();
        if self.issuer.is_empty() || actual != self.issuer {
            return Err(AuthError::BadIssuer(actual.to_string()));
        }
        check_audience(&claims.aud, &self.audiences)?;

        // Unsigned development tokens never reach the decoder.
        let now = jsonwebtoken::get_current_timestamp();
        let leeway = self.leeway.as_secs();
        if now > claims.exp.saturating_add(leeway) {
            return Err(AuthError::Expired);
        }
        if claims.nbf.is_some_and(|nbf| nbf > now.saturating_add(leeway)) {
            return Err(AuthError::NotYetValid);
        }

        Ok(into_identity(claims))
    }
}

/// Strip the `Bearer ` scheme from an `Authorization` header value
#[must_use]
pub fn bearer_token(header_value: &str) -> Option<&str> {
    let (scheme, token) = header_value.trim().split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

fn into_identity(claims: Claims) -> Identity {
    let mut roles: Vec<Role> = claims
        .roles
        .iter()
        .chain(claims.role.iter())
        .filter_map(|name| match name.parse::<Role>() {
            Ok(role) => Some(role),
            Err(e) => {
                debug!(error = %e, "Ignoring role claim");
                None
            }
        })
        .collect();
    roles.sort_unstable();
    roles.dedup();

    Identity {
        subject: claims.sub,
        email: claims.email,
        roles,
        festival_id: claims.festival_id.as_ref().and_then(id_string),
        stand_ids: claims.stand_ids.iter().filter_map(id_string).collect(),
        organizer_for: claims.organizer_for.iter().filter_map(id_string).collect(),
        permissions: claims.permissions,
        expires_at: claims.exp,
    }
}

/// Ids arrive as strings or numbers depending on the issuer
fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn raw_header_alg(token: &str) -> Option<String> {
    let segment = token.split('.').next()?;
    let bytes = URL_SAFE_NO_PAD.decode(segment).ok()?;
    let header: Value = serde_json::from_slice(&bytes).ok()?;
    header.get("alg")?.as_str().map(str::to_string)
}

/// Validate that the token's `aud` claim contains one of the expected audiences.
fn check_audience(aud_claim: &Value, expected: &[String]) -> std::result::Result<(), AuthError> {
    let matches = match aud_claim {
        Value::String(s) => expected.iter().any(|e| e == s),
        Value::Array(arr) => arr
            .iter()
            .any(|v| v.as_str().is_some_and(|s| expected.iter().any(|e| e == s))),
        _ => false,
    };

    if matches { Ok(()) } else { Err(AuthError::BadAudience) }
}

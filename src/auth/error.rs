//! Token verification failures.

use thiserror::Error;

/// Why a request could not be authenticated.
///
/// Each variant maps to a stable machine-readable [`code`](AuthError::code).
/// Only [`Expired`](AuthError::Expired) tells the client that refreshing its
/// token will help.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    /// No bearer token on a path that requires one
    #[error("Missing bearer token")]
    MissingHeader,

    /// Token cannot be decoded or lacks required fields
    #[error("Malformed token: {0}")]
    MalformedToken(String),

    /// Signing key id is not in the trust root, even after a refresh
    #[error("Unknown signing key: {0}")]
    UnknownKey(String),

    /// Signature does not verify against the resolved key
    #[error("Invalid token signature")]
    BadSignature,

    /// No token audience is accepted by this service
    #[error("Token audience not accepted")]
    BadAudience,

    /// Token issued by someone else
    #[error("Unexpected token issuer: {0}")]
    BadIssuer(String),

    /// Token is past its expiry
    #[error("Token expired")]
    Expired,

    /// Token `nbf` is in the future
    #[error("Token not yet valid")]
    NotYetValid,

    /// Header algorithm is not an accepted asymmetric algorithm for the key
    #[error("Signing algorithm not allowed: {0}")]
    AlgorithmNotAllowed(String),
}

impl AuthError {
    /// Machine-readable error code for response bodies
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::MissingHeader => "missing_token",
            Self::MalformedToken(_) => "malformed_token",
            Self::UnknownKey(_) => "unknown_key",
            Self::BadSignature => "bad_signature",
            Self::BadAudience => "bad_audience",
            Self::BadIssuer(_) => "bad_issuer",
            Self::Expired => "token_expired",
            Self::NotYetValid => "token_not_yet_valid",
            Self::AlgorithmNotAllowed(_) => "algorithm_not_allowed",
        }
    }

    /// Whether a token refresh is the right client reaction
    #[must_use]
    pub const fn is_expired(&self) -> bool {
        matches!(self, Self::Expired)
    }

    /// Whether this failure counts towards the caller's lockout budget.
    ///
    /// A missing token is not an attempt; expiry is normal token lifecycle.
    #[must_use]
    pub const fn counts_as_failed_attempt(&self) -> bool {
        !matches!(self, Self::MissingHeader | Self::Expired)
    }
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(e: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;

        match e.kind() {
            ErrorKind::ExpiredSignature => Self::Expired,
            ErrorKind::ImmatureSignature => Self::NotYetValid,
            ErrorKind::InvalidSignature => Self::BadSignature,
            ErrorKind::InvalidAudience => Self::BadAudience,
            ErrorKind::InvalidIssuer => Self::BadIssuer("issuer mismatch".to_string()),
            ErrorKind::InvalidAlgorithm => Self::AlgorithmNotAllowed("algorithm mismatch".to_string()),
            _ => Self::MalformedToken(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::errors::{Error as JwtError, ErrorKind};

    #[test]
    fn codes_are_distinct() {
        let all = [
            AuthError::MissingHeader,
            AuthError::MalformedToken(String::new()),
            AuthError::UnknownKey(String::new()),
            AuthError::BadSignature,
            AuthError::BadAudience,
            AuthError::BadIssuer(String::new()),
            AuthError::Expired,
            AuthError::NotYetValid,
            AuthError::AlgorithmNotAllowed(String::new()),
        ];
        let mut codes: Vec<_> = all.iter().map(AuthError::code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), all.len());
    }

    #[test]
    fn only_expired_suggests_refresh() {
        assert!(AuthError::Expired.is_expired());
        assert!(!AuthError::BadSignature.is_expired());
        assert!(!AuthError::UnknownKey("k".into()).is_expired());
    }

    #[test]
    fn jwt_error_kinds_map_to_auth_errors() {
        let expired: AuthError = JwtError::from(ErrorKind::ExpiredSignature).into();
        assert_eq!(expired, AuthError::Expired);

        let sig: AuthError = JwtError::from(ErrorKind::InvalidSignature).into();
        assert_eq!(sig, AuthError::BadSignature);

        let nbf: AuthError = JwtError::from(ErrorKind::ImmatureSignature).into();
        assert_eq!(nbf, AuthError::NotYetValid);

        let garbage: AuthError = JwtError::from(ErrorKind::InvalidToken).into();
        assert_eq!(garbage.code(), "malformed_token");
    }

    #[test]
    fn lockout_budget_ignores_missing_and_expired() {
        assert!(!AuthError::MissingHeader.counts_as_failed_attempt());
        assert!(!AuthError::Expired.counts_as_failed_attempt());
        assert!(AuthError::BadSignature.counts_as_failed_attempt());
    }
}

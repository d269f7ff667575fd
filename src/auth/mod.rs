//! Caller authentication: trust root, token verification and roles.

mod error;
mod roles;
pub mod trust_root;
mod verifier;

pub use error::AuthError;
pub use roles::{InsufficientRole, Role, UnknownRole};
pub use trust_root::{HttpKeySource, KeyFamily, KeySource, TrustRootCache, VerificationKey, parse_key_set};
pub use verifier::{Identity, TokenVerifier, bearer_token};

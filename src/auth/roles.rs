//! Role hierarchy shared by tier selection and authorization checks.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Caller role, ordered from least to most privileged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// No verified identity
    #[default]
    Anonymous,
    /// Festival staff (bar, gate, stand operators)
    Staff,
    /// Festival organizer
    Organizer,
    /// Platform administrator
    Admin,
}

impl Role {
    /// All roles, least privileged first
    pub const ALL: [Self; 4] = [Self::Anonymous, Self::Staff, Self::Organizer, Self::Admin];

    /// Whether this role meets `required`. Admin satisfies every check.
    #[must_use]
    pub fn satisfies(self, required: Self) -> bool {
        self == Self::Admin || self >= required
    }

    /// Highest role in a collection (anonymous when empty)
    pub fn highest<I>(roles: I) -> Self
    where
        I: IntoIterator<Item = Self>,
    {
        roles.into_iter().max().unwrap_or_default()
    }

    /// Lowercase name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Anonymous => "anonymous",
            Self::Staff => "staff",
            Self::Organizer => "organizer",
            Self::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|r| r.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownRole(s.to_string()))
    }
}

/// A role name that is not part of the hierarchy
#[derive(Debug, Clone, thiserror::Error)]
#[error("Unknown role: {0}")]
pub struct UnknownRole(pub String);

/// The caller's role is below the one an operation needs
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("Role {required} required, caller has {actual}")]
pub struct InsufficientRole {
    /// Minimum role the operation needs
    pub required: Role,
    /// Caller's highest role
    pub actual: Role,
}

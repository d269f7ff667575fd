//! Callers that skip limiting entirely.

use std::net::IpAddr;

use ipnet::IpNet;
use subtle::ConstantTimeEq;

/// Why a request skipped limiting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassReason {
    /// Source address is on an allow-listed network
    Whitelist,
    /// Caller presented a recognized internal service credential
    InternalService,
}

impl BypassReason {
    /// Value for the bypass header and metric label
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Whitelist => "whitelist",
            Self::InternalService => "internal_service",
        }
    }
}

/// Static allow-lists evaluated before any limiter state is touched
#[derive(Debug, Clone, Default)]
pub struct BypassRules {
    networks: Vec<IpNet>,
    internal_keys: Vec<String>,
}

impl BypassRules {
    /// Create from parsed networks and resolved credentials
    #[must_use]
    pub fn new(networks: Vec<IpNet>, internal_keys: Vec<String>) -> Self {
        Self {
            networks,
            internal_keys,
        }
    }

    /// Whether `addr` falls inside an allow-listed network.
    /// IPv4-mapped IPv6 addresses match their IPv4 networks.
    #[must_use]
    pub fn is_whitelisted(&self, addr: IpAddr) -> bool {
        let addr = addr.to_canonical();
        self.networks.iter().any(|net| net.contains(&addr))
    }

    /// Whether `presented` equals one of the internal service keys.
    ///
    /// Every configured key is compared so timing does not reveal which one
    /// (or how much of one) matched.
    #[must_use]
    pub fn is_internal_key(&self, presented: &str) -> bool {
        if presented.is_empty() {
            return false;
        }
        self.internal_keys
            .iter()
            .fold(false, |found, key| found | bool::from(key.as_bytes().ct_eq(presented.as_bytes())))
    }

    /// First bypass rule that applies
    #[must_use]
    pub fn check(&self, source: IpAddr, internal_key: Option<&str>) -> Option<BypassReason> {
        if internal_key.is_some_and(|k| self.is_internal_key(k)) {
            Some(BypassReason::InternalService)
        } else if self.is_whitelisted(source) {
            Some(BypassReason::Whitelist)
        } else {
            None
        }
    }
}

//! Request classes and their rate limit policies.
//!
//! The registry is compiled in. Adding a class or changing a quota is a code
//! change and a deploy, never a runtime mutation.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from policy construction and lookup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("Unknown request class: {0}")]
    UnknownClass(String),

    #[error("Policy window must be non-zero")]
    ZeroWindow,

    #[error("Policy must allow at least one request")]
    ZeroLimit,

    #[error("Request class {0} does not issue state tokens")]
    NoStateTtl(RequestClass),
}

/// An immutable sliding-window quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    window: Duration,
    max_requests: u32,
}

impl Policy {
    /// Create a policy, rejecting a zero window or zero quota.
    pub fn new(window: Duration, max_requests: u32) -> Result<Self, PolicyError> {
        if window.is_zero() {
            return Err(PolicyError::ZeroWindow);
        }
        if max_requests == 0 {
            return Err(PolicyError::ZeroLimit);
        }
        Ok(Self {
            window,
            max_requests,
        })
    }

    const fn fixed(window_secs: u64, max_requests: u32) -> Self {
        Self {
            window: Duration::from_secs(window_secs),
            max_requests,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn window_ms(&self) -> u64 {
        self.window.as_millis() as u64
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }
}

/// A class of inbound request sharing one policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestClass {
    /// OAuth login and callback
    Auth,
    /// Wallet signature / link session
    WalletLink,
    /// Discord role assignment
    RoleAssignment,
    /// Blockchain balance lookups
    Balance,
    /// Everything else behind the API
    Api,
}

struct RegistryEntry {
    class: RequestClass,
    name: &'static str,
    policy: Policy,
    state_ttl: Option<Duration>,
}

static REGISTRY: [RegistryEntry; 5] = [
    RegistryEntry {
        class: RequestClass::Auth,
        name: "auth",
        policy: Policy::fixed(15 * 60, 10),
        state_ttl: Some(Duration::from_secs(10 * 60)),
    },
    RegistryEntry {
        class: RequestClass::WalletLink,
        name: "wallet-link",
        policy: Policy::fixed(15 * 60, 5),
        state_ttl: Some(Duration::from_secs(15 * 60)),
    },
    RegistryEntry {
        class: RequestClass::RoleAssignment,
        name: "role-assignment",
        policy: Policy::fixed(60, 5),
        state_ttl: None,
    },
    RegistryEntry {
        class: RequestClass::Balance,
        name: "balance",
        policy: Policy::fixed(60, 30),
        state_ttl: None,
    },
    RegistryEntry {
        class: RequestClass::Api,
        name: "api",
        policy: Policy::fixed(60, 100),
        state_ttl: None,
    },
];

impl RequestClass {
    /// Every registered class.
    pub const ALL: [RequestClass; 5] = [
        RequestClass::Auth,
        RequestClass::WalletLink,
        RequestClass::RoleAssignment,
        RequestClass::Balance,
        RequestClass::Api,
    ];

    fn entry(self) -> &'static RegistryEntry {
        // Registry rows are in declaration order.
        &REGISTRY[self as usize]
    }

    pub fn as_str(self) -> &'static str {
        self.entry().name
    }

    /// The rate limit policy for this class.
    pub fn policy(self) -> Policy {
        self.entry().policy
    }

    /// Lifetime of state tokens issued for this class, if it issues any.
    pub fn state_ttl(self) -> Option<Duration> {
        self.entry().state_ttl
    }
}

impl FromStr for RequestClass {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        REGISTRY
            .iter()
            .find(|e| e.name == s)
            .map(|e| e.class)
            .ok_or_else(|| PolicyError::UnknownClass(s.to_string()))
    }
}

impl fmt::Display for RequestClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

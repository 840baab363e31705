//! Rate key derivation.

use std::fmt;
use std::net::IpAddr;

use super::policy::RequestClass;

/// How much of the user agent participates in the key.
pub const USER_AGENT_PREFIX_CHARS: usize = 50;

const UNKNOWN: &str = "unknown";

/// Identifies the subject being rate limited.
///
/// Built from the client address and a truncated user agent, optionally
/// suffixed with the authenticated user. Two requests from the same subject
/// always produce the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateKey(String);

impl RateKey {
    pub fn new(ip: Option<IpAddr>, user_agent: Option<&str>, user_id: Option<&str>) -> Self {
        let ip = ip.map(|ip| ip.to_string());
        let agent = user_agent
            .map(str::trim)
            .filter(|ua| !ua.is_empty())
            .map(truncate_chars)
            .unwrap_or(UNKNOWN);

        let mut key = format!("{}:{}", ip.as_deref().unwrap_or(UNKNOWN), agent);
        if let Some(user) = user_id.filter(|u| !u.is_empty()) {
            key.push(':');
            key.push_str(user);
        }
        Self(key)
    }

    /// The key namespaced by request class, so classes never share counts.
    pub fn scoped(&self, class: RequestClass) -> String {
        format!("{}:{}", class.as_str(), self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn truncate_chars(s: &str) -> &str {
    match s.char_indices().nth(USER_AGENT_PREFIX_CHARS) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

//! Sliding-window rate limiter over the durable counter store.

use std::sync::Arc;

use tracing::{debug, trace};

use super::policy::Policy;
use crate::store::{CounterStore, StoreError};

/// The outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    /// The policy's quota
    pub limit: u32,
    pub remaining: u32,
    /// Epoch milliseconds at which the window is considered reset
    pub reset_at_ms: u64,
}

impl Decision {
    /// Whole seconds until `reset_at_ms`, never less than one.
    pub fn retry_after_secs(&self, now_ms: u64) -> u64 {
        self.reset_at_ms.saturating_sub(now_ms).div_ceil(1000).max(1)
    }
}

/// Counts requests in a trailing window using sorted-set markers.
pub struct SlidingWindowLimiter {
    store: Arc<dyn CounterStore>,
}

impl SlidingWindowLimiter {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }

    /// Record one request for `key` and decide whether it is within `policy`.
    ///
    /// Store failures are returned as-is; choosing what to do about them is
    /// the caller's job.
    pub async fn check(
        &self,
        key: &str,
        policy: &Policy,
        now_ms: u64,
    ) -> Result<Decision, StoreError> {
        let member = marker(now_ms);
        let before = self
            .store
            .record_hit(key, now_ms, policy.window(), &member)
            .await?;

        let limit = policy.max_requests();
        let allowed = before < u64::from(limit);
        let remaining = u64::from(limit).saturating_sub(before + 1) as u32;

        trace!(key, count = before, limit, "Sliding window checked");
        if !allowed {
            debug!(key, count = before, limit, "Rate limit exceeded");
        }

        Ok(Decision {
            allowed,
            limit,
            remaining,
            reset_at_ms: now_ms + policy.window_ms(),
        })
    }
}

/// A unique marker for one request. Requests sharing a millisecond are told
/// apart by a 128-bit random suffix.
fn marker(now_ms: u64) -> String {
    format!("{}-{:032x}", now_ms, rand::random::<u128>())
}

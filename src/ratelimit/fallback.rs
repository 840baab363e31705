//! In-process fallback counter.
//!
//! Approximates the sliding-window policy with a fixed window per key while
//! the durable store is unavailable. Counts live in this process only, so
//! with several instances each one enforces the quota separately.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;
use tracing::{debug, trace};

use super::limiter::Decision;
use super::policy::Policy;

/// Share of checks that also sweep expired entries.
const SWEEP_PROBABILITY: f64 = 0.01;

/// Per-key state of the fallback counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallbackEntry {
    pub count: u32,
    /// Epoch milliseconds after which the entry starts over
    pub reset_at_ms: u64,
}

impl FallbackEntry {
    fn fresh(policy: &Policy, now_ms: u64) -> Self {
        Self {
            count: 1,
            reset_at_ms: now_ms + policy.window_ms(),
        }
    }

    fn is_expired(&self, now_ms: u64) -> bool {
        now_ms > self.reset_at_ms
    }
}

/// Local rate limit counters keyed by scoped rate key.
///
/// Updates for a key happen under its shard lock, so concurrent increments
/// are never lost.
#[derive(Debug)]
pub struct FallbackCounter {
    entries: DashMap<String, FallbackEntry>,
    sweep_probability: f64,
}

impl FallbackCounter {
    pub fn new() -> Self {
        Self::with_sweep_probability(SWEEP_PROBABILITY)
    }

    /// Override how often a check triggers a sweep. Mostly for tests.
    pub fn with_sweep_probability(probability: f64) -> Self {
        Self {
            entries: DashMap::new(),
            sweep_probability: probability.clamp(0.0, 1.0),
        }
    }

    /// Count one request for `key` and decide whether it fits `policy`.
    pub fn check(&self, key: &str, policy: &Policy, now_ms: u64) -> Decision {
        let limit = policy.max_requests();

        let decision = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) if !occupied.get().is_expired(now_ms) => {
                let entry = occupied.get_mut();
                if entry.count >= limit {
                    debug!(key, count = entry.count, limit, "Fallback rate limit exceeded");
                    Decision {
                        allowed: false,
                        limit,
                        remaining: 0,
                        reset_at_ms: entry.reset_at_ms,
                    }
                } else {
                    entry.count += 1;
                    Decision {
                        allowed: true,
                        limit,
                        remaining: limit - entry.count,
                        reset_at_ms: entry.reset_at_ms,
                    }
                }
            }
            Entry::Occupied(mut occupied) => {
                let entry = FallbackEntry::fresh(policy, now_ms);
                occupied.insert(entry);
                Self::first_hit(limit, entry)
            }
            Entry::Vacant(vacant) => {
                let entry = FallbackEntry::fresh(policy, now_ms);
                vacant.insert(entry);
                Self::first_hit(limit, entry)
            }
        };

        // The entry guard is released above; sweeping locks every shard.
        if self.sweep_probability > 0.0 && rand::thread_rng().gen_bool(self.sweep_probability) {
            self.sweep(now_ms);
        }

        decision
    }

    fn first_hit(limit: u32, entry: FallbackEntry) -> Decision {
        Decision {
            allowed: true,
            limit,
            remaining: limit - entry.count,
            reset_at_ms: entry.reset_at_ms,
        }
    }

    /// Drop entries whose window has passed. Returns how many were removed.
    pub fn sweep(&self, now_ms: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now_ms));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            trace!(removed, "Swept expired fallback entries");
        }
        removed
    }

    /// Current entry for a key, if any.
    pub fn entry(&self, key: &str) -> Option<FallbackEntry> {
        self.entries.get(key).map(|e| *e)
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for FallbackCounter {
    fn default() -> Self {
        Self::new()
    }
}

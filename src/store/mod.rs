//! Access to the durable counter store.
//!
//! The rate limiter and the state-token store talk to their backends through
//! the [`CounterStore`] and [`StateBackend`] traits, so the degradation logic
//! can be exercised against in-process doubles as well as Redis.

mod memory;
mod redis_store;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use self::memory::MemoryStateBackend;
pub use self::redis_store::{RedisStore, RedisStoreConfig};

/// Errors raised while talking to a backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("Timed out during {op}")]
    Timeout { op: &'static str },

    /// A connect attempt this caller was waiting on failed.
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    /// The atomic block returned no result (e.g. an aborted transaction).
    #[error("Backend returned no result")]
    EmptyResponse,

    #[error("Malformed backend data: {0}")]
    Malformed(String),

    #[error("No durable backend configured")]
    Unconfigured,
}

/// A shared store supporting the sliding-window operation.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically purge markers older than `now_ms - window`, read the
    /// remaining cardinality, insert `member` at `now_ms` and refresh the
    /// key's expiry.
    ///
    /// Returns the cardinality observed *before* the insert.
    async fn record_hit(
        &self,
        key: &str,
        now_ms: u64,
        window: Duration,
        member: &str,
    ) -> Result<u64, StoreError>;

    /// Verify the backend is reachable.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Backend representation of an issued state token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateRecord {
    pub token: String,
    pub subject: String,
    pub session_id: String,
    pub created_at_ms: u64,
    pub expires_at_ms: u64,
    pub used: bool,
}

/// Storage for one-time state tokens.
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Persist a freshly issued record. The backend may drop it once `ttl`
    /// has elapsed.
    async fn insert(&self, record: StateRecord, ttl: Duration) -> Result<(), StoreError>;

    /// Find the record for `token` whose `used` flag is still false and set
    /// the flag in the same atomic step.
    ///
    /// Returns the record as it was before the flag was set, or `None` when
    /// the token is unknown, gone, or already used.
    async fn take_unused(&self, token: &str) -> Result<Option<StateRecord>, StoreError>;

    /// Remove records with `expires_at_ms < now_ms`. Returns how many were removed.
    async fn purge_expired(&self, now_ms: u64) -> Result<usize, StoreError>;
}

/// A counter store for deployments with no backend URL.
///
/// Every call fails, which keeps the degradation controller on its
/// fallback path.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredStore;

#[async_trait]
impl CounterStore for UnconfiguredStore {
    async fn record_hit(
        &self,
        _key: &str,
        _now_ms: u64,
        _window: Duration,
        _member: &str,
    ) -> Result<u64, StoreError> {
        Err(StoreError::Unconfigured)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Err(StoreError::Unconfigured)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-process stand-in for the Redis sorted-set operations.

    use super::*;
    use parking_lot::Mutex;
    use std::collections::{BTreeSet, HashMap};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Mirrors `ZREMRANGEBYSCORE / ZCARD / ZADD` under a single lock and can
    /// be flipped into an unreachable state.
    #[derive(Default)]
    pub struct FakeCounterStore {
        sets: Mutex<HashMap<String, BTreeSet<(u64, String)>>>,
        unreachable: AtomicBool,
        calls: AtomicUsize,
    }

    impl FakeCounterStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn unreachable() -> Self {
            let store = Self::default();
            store.set_unreachable(true);
            store
        }

        pub fn set_unreachable(&self, down: bool) {
            self.unreachable.store(down, Ordering::SeqCst);
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn cardinality(&self, key: &str) -> usize {
            self.sets.lock().get(key).map(|s| s.len()).unwrap_or(0)
        }

        fn check_reachable(&self) -> Result<(), StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.unreachable.load(Ordering::SeqCst) {
                Err(StoreError::Timeout { op: "connect" })
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl CounterStore for FakeCounterStore {
        async fn record_hit(
            &self,
            key: &str,
            now_ms: u64,
            window: Duration,
            member: &str,
        ) -> Result<u64, StoreError> {
            self.check_reachable()?;
            let cutoff = now_ms.saturating_sub(window.as_millis() as u64);

            let mut sets = self.sets.lock();
            let set = sets.entry(key.to_string()).or_default();
            set.retain(|(score, _)| *score >= cutoff);
            let before = set.len() as u64;
            set.insert((now_ms, member.to_string()));
            Ok(before)
        }

        async fn ping(&self) -> Result<(), StoreError> {
            self.check_reachable()
        }
    }
}

//! Backend health tracking and the fail-open / fail-closed decision.
//!
//! [`BackendConnection`] owns the counter store handle together with its
//! observable [`BackendHealth`]. [`DegradationController`] routes each check
//! to the sliding-window limiter while the backend is healthy, and applies
//! the configured [`DegradationPolicy`] when it is not.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::fallback::FallbackCounter;
use super::key::RateKey;
use super::limiter::{Decision, SlidingWindowLimiter};
use super::policy::{Policy, RequestClass};
use crate::clock::Clock;
use crate::error::{LinkguardError, Result};
use crate::store::{CounterStore, StoreError};

/// Deployment environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Production,
    #[default]
    Development,
}

impl Environment {
    pub fn as_str(self) -> &'static str {
        match self {
            Environment::Production => "production",
            Environment::Development => "development",
        }
    }
}

impl FromStr for Environment {
    type Err = LinkguardError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Environment::Production),
            "development" | "dev" => Ok(Environment::Development),
            other => Err(LinkguardError::Config(format!("unknown environment: {}", other))),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do with a request when the durable store cannot be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailMode {
    /// Reject the request as service-unavailable
    Closed,
    /// Answer from the in-process fallback counter
    OpenWithFallback,
}

/// Exponential reconnect backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    /// Consecutive failures after which the cycle is abandoned and the
    /// policy's cool-down applies instead.
    pub max_attempts: u32,
}

impl Backoff {
    /// Delay before the next attempt after `failures` consecutive failures.
    pub fn delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.initial
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

/// How a process degrades when its backend fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DegradationPolicy {
    pub environment: Environment,
    pub fail_mode: FailMode,
    pub backoff: Backoff,
    /// Wait after an abandoned backoff cycle before probing again
    pub cooldown: Duration,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
}

impl DegradationPolicy {
    /// Fail closed, retry quickly.
    pub fn production() -> Self {
        Self {
            environment: Environment::Production,
            fail_mode: FailMode::Closed,
            backoff: Backoff {
                initial: Duration::from_millis(200),
                max: Duration::from_secs(5),
                max_attempts: 10,
            },
            cooldown: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(2),
        }
    }

    /// Fall back to local counting, probe the backend once a minute.
    pub fn development() -> Self {
        Self {
            environment: Environment::Development,
            fail_mode: FailMode::OpenWithFallback,
            backoff: Backoff {
                initial: Duration::from_secs(1),
                max: Duration::from_secs(5),
                max_attempts: 1,
            },
            cooldown: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(1),
            command_timeout: Duration::from_millis(500),
        }
    }

    pub fn for_environment(environment: Environment) -> Self {
        match environment {
            Environment::Production => Self::production(),
            Environment::Development => Self::development(),
        }
    }

    fn retry_delay(&self, failures: u32) -> Duration {
        if failures >= self.backoff.max_attempts {
            self.cooldown
        } else {
            self.backoff.delay(failures)
        }
    }
}

/// Process-local view of backend health.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendHealth {
    pub failed: bool,
    /// Epoch milliseconds of the last attempt made while degraded
    pub last_attempt_ms: u64,
    /// Consecutive failures in the current backoff cycle
    pub failures: u32,
}

/// The counter store handle and its health.
///
/// One instance per process, shared by reference with whatever needs to
/// reach the backend. Health is never synchronised across instances.
pub struct BackendConnection {
    store: Arc<dyn CounterStore>,
    policy: DegradationPolicy,
    health: Mutex<HealthState>,
}

#[derive(Debug, Default)]
struct HealthState {
    health: BackendHealth,
    /// A caller holds the current retry slot and its outcome is pending
    retry_claimed: bool,
}

impl fmt::Debug for BackendConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendConnection")
            .field("policy", &self.policy)
            .field("health", &self.health.lock().health)
            .finish()
    }
}

impl BackendConnection {
    pub fn new(store: Arc<dyn CounterStore>, policy: DegradationPolicy) -> Self {
        Self {
            store,
            policy,
            health: Mutex::new(HealthState::default()),
        }
    }

    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    pub fn policy(&self) -> &DegradationPolicy {
        &self.policy
    }

    /// Snapshot of the current health.
    pub fn health(&self) -> BackendHealth {
        self.health.lock().health
    }

    pub fn is_healthy(&self) -> bool {
        !self.health.lock().health.failed
    }

    /// Decide whether a backend round trip may be made at `now_ms`.
    ///
    /// While degraded, at most one caller per retry interval gets `true`:
    /// claiming the attempt moves `last_attempt_ms` forward.
    pub fn try_begin_attempt(&self, now_ms: u64) -> bool {
        let mut state = self.health.lock();
        let health = &mut state.health;
        if !health.failed {
            return true;
        }

        let delay = self.policy.retry_delay(health.failures).as_millis() as u64;
        if now_ms >= health.last_attempt_ms.saturating_add(delay) {
            health.last_attempt_ms = now_ms;
            debug!(failures = health.failures, "Retrying degraded backend");
            state.retry_claimed = true;
            true
        } else {
            false
        }
    }

    pub fn record_success(&self) {
        let mut state = self.health.lock();
        if state.health.failed {
            info!(
                failures = state.health.failures,
                environment = %self.policy.environment,
                "Counter store recovered"
            );
        }
        *state = HealthState::default();
    }

    /// Count a failed attempt.
    ///
    /// While degraded only the holder of the retry slot advances the
    /// backoff; failures of attempts that started while the backend still
    /// looked healthy are absorbed into the first one.
    pub fn record_failure(&self, now_ms: u64, error: &StoreError) {
        let mut state = self.health.lock();
        if state.health.failed && !state.retry_claimed {
            debug!(error = %error, "Ignoring failure of an attempt already accounted for");
            return;
        }

        let failures = if state.health.failures >= self.policy.backoff.max_attempts {
            1
        } else {
            state.health.failures + 1
        };
        *state = HealthState {
            health: BackendHealth {
                failed: true,
                last_attempt_ms: now_ms,
                failures,
            },
            retry_claimed: false,
        };

        let retry_in = self.policy.retry_delay(failures);
        warn!(
            error = %error,
            failures,
            retry_in_ms = retry_in.as_millis() as u64,
            environment = %self.policy.environment,
            "Counter store unavailable"
        );
    }

    /// Ping the backend if the retry gate allows it, updating health.
    ///
    /// Returns whether the backend is healthy afterwards.
    pub async fn probe(&self, now_ms: u64) -> bool {
        if !self.try_begin_attempt(now_ms) {
            return false;
        }
        match self.store.ping().await {
            Ok(()) => {
                self.record_success();
                true
            }
            Err(e) => {
                self.record_failure(now_ms, &e);
                false
            }
        }
    }
}

/// Routes rate limit checks according to backend health.
pub struct DegradationController {
    connection: Arc<BackendConnection>,
    limiter: SlidingWindowLimiter,
    fallback: FallbackCounter,
    clock: Arc<dyn Clock>,
}

impl DegradationController {
    pub fn new(connection: Arc<BackendConnection>, clock: Arc<dyn Clock>) -> Self {
        Self::with_fallback(connection, clock, FallbackCounter::new())
    }

    pub fn with_fallback(
        connection: Arc<BackendConnection>,
        clock: Arc<dyn Clock>,
        fallback: FallbackCounter,
    ) -> Self {
        let limiter = SlidingWindowLimiter::new(connection.store().clone());
        Self {
            connection,
            limiter,
            fallback,
            clock,
        }
    }

    /// Check `key` against the policy registered for `class`.
    pub async fn check(&self, key: &RateKey, class: RequestClass) -> Result<Decision> {
        let policy = class.policy();
        self.check_policy(&key.scoped(class), &policy).await
    }

    /// Check an already-scoped key against an explicit policy.
    ///
    /// Fails with [`LinkguardError::BackendUnavailable`] only when the store
    /// cannot be used and the policy fails closed.
    pub async fn check_policy(&self, key: &str, policy: &Policy) -> Result<Decision> {
        let now_ms = self.clock.now_ms();

        if self.connection.try_begin_attempt(now_ms) {
            match self.limiter.check(key, policy, now_ms).await {
                Ok(decision) => {
                    self.connection.record_success();
                    return Ok(decision);
                }
                Err(e) => self.connection.record_failure(self.clock.now_ms(), &e),
            }
        }

        match self.connection.policy().fail_mode {
            FailMode::Closed => Err(LinkguardError::BackendUnavailable(
                "durable counter store unreachable".to_string(),
            )),
            FailMode::OpenWithFallback => {
                debug!(key, "Answering from fallback counter");
                Ok(self.fallback.check(key, policy, now_ms))
            }
        }
    }

    pub fn connection(&self) -> &Arc<BackendConnection> {
        &self.connection
    }

    pub fn fallback(&self) -> &FallbackCounter {
        &self.fallback
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::testing::FakeCounterStore;

    const START: u64 = 1_700_000_000_000;

    struct Harness {
        store: Arc<FakeCounterStore>,
        clock: Arc<ManualClock>,
        controller: DegradationController,
    }

    fn harness(store: FakeCounterStore, policy: DegradationPolicy) -> Harness {
        let store = Arc::new(store);
        let clock = Arc::new(ManualClock::new(START));
        let connection = Arc::new(BackendConnection::new(store.clone(), policy));
        let controller = DegradationController::with_fallback(
            connection,
            clock.clone(),
            FallbackCounter::with_sweep_probability(0.0),
        );
        Harness {
            store,
            clock,
            controller,
        }
    }

    fn key() -> RateKey {
        RateKey::new(Some("203.0.113.9".parse().unwrap()), Some("test-agent"), None)
    }

    #[test]
    fn test_backoff_doubles_to_cap() {
        let backoff = DegradationPolicy::production().backoff;
        let delays: Vec<u128> = (1..=7).map(|n| backoff.delay(n).as_millis()).collect();
        assert_eq!(delays, vec![200, 400, 800, 1600, 3200, 5000, 5000]);
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn test_environment_parsing() {
        assert_eq!("production".parse::<Environment>().unwrap(), Environment::Production);
        assert_eq!("DEV".parse::<Environment>().unwrap(), Environment::Development);
        assert!("staging".parse::<Environment>().is_err());
    }

    #[test]
    fn test_development_times_out_faster() {
        let prod = DegradationPolicy::production();
        let dev = DegradationPolicy::development();
        assert!(dev.connect_timeout < prod.connect_timeout);
        assert!(dev.command_timeout < prod.command_timeout);
    }

    #[tokio::test]
    async fn test_healthy_backend_enforces_policy() {
        let h = harness(FakeCounterStore::new(), DegradationPolicy::production());

        for expected in (0..10).rev() {
            let decision = h.controller.check(&key(), RequestClass::Auth).await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected);
        }

        let denied = h.controller.check(&key(), RequestClass::Auth).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.reset_at_ms, START + 900_000);
        assert!(h.controller.connection().is_healthy());
    }

    #[tokio::test]
    async fn test_production_fails_closed() {
        let h = harness(FakeCounterStore::unreachable(), DegradationPolicy::production());

        for _ in 0..25 {
            let result = h.controller.check(&key(), RequestClass::Auth).await;
            assert!(matches!(result, Err(LinkguardError::BackendUnavailable(_))));
        }
        assert!(h.controller.fallback().is_empty());
        assert!(!h.controller.connection().is_healthy());
    }

    #[tokio::test]
    async fn test_production_retries_only_after_backoff() {
        let h = harness(FakeCounterStore::unreachable(), DegradationPolicy::production());

        let _ = h.controller.check(&key(), RequestClass::Api).await;
        assert_eq!(h.store.calls(), 1);

        // Inside the 200ms backoff the backend is left alone.
        for _ in 0..5 {
            let _ = h.controller.check(&key(), RequestClass::Api).await;
        }
        assert_eq!(h.store.calls(), 1);

        h.clock.advance(Duration::from_millis(200));
        let _ = h.controller.check(&key(), RequestClass::Api).await;
        assert_eq!(h.store.calls(), 2);
        assert_eq!(h.controller.connection().health().failures, 2);

        // Second failure doubles the wait.
        h.clock.advance(Duration::from_millis(399));
        let _ = h.controller.check(&key(), RequestClass::Api).await;
        assert_eq!(h.store.calls(), 2);
    }

    #[tokio::test]
    async fn test_production_recovers_when_backend_returns() {
        let h = harness(FakeCounterStore::unreachable(), DegradationPolicy::production());

        assert!(h.controller.check(&key(), RequestClass::Api).await.is_err());

        h.store.set_unreachable(false);
        h.clock.advance(Duration::from_millis(200));

        let decision = h.controller.check(&key(), RequestClass::Api).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(h.controller.connection().health(), BackendHealth::default());
    }

    #[tokio::test]
    async fn test_development_falls_back_with_same_policy() {
        let h = harness(FakeCounterStore::unreachable(), DegradationPolicy::development());

        for expected in (0..10).rev() {
            let decision = h.controller.check(&key(), RequestClass::Auth).await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected);
        }

        let denied = h.controller.check(&key(), RequestClass::Auth).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.reset_at_ms, START + 900_000);
        assert_eq!(h.controller.fallback().len(), 1);
    }

    #[tokio::test]
    async fn test_development_cools_down_for_a_minute() {
        let h = harness(FakeCounterStore::unreachable(), DegradationPolicy::development());

        h.controller.check(&key(), RequestClass::Api).await.unwrap();
        assert_eq!(h.store.calls(), 1);

        h.clock.advance(Duration::from_secs(59));
        h.controller.check(&key(), RequestClass::Api).await.unwrap();
        assert_eq!(h.store.calls(), 1);

        h.store.set_unreachable(false);
        h.clock.advance(Duration::from_secs(1));
        h.controller.check(&key(), RequestClass::Api).await.unwrap();
        assert_eq!(h.store.calls(), 2);
        assert!(h.controller.connection().is_healthy());
    }

    #[tokio::test]
    async fn test_abandoned_cycle_waits_for_cooldown() {
        let mut policy = DegradationPolicy::production();
        policy.backoff.max_attempts = 2;
        policy.cooldown = Duration::from_secs(30);
        let h = harness(FakeCounterStore::unreachable(), policy);

        let _ = h.controller.check(&key(), RequestClass::Api).await;
        h.clock.advance(Duration::from_millis(200));
        let _ = h.controller.check(&key(), RequestClass::Api).await;
        assert_eq!(h.store.calls(), 2);

        h.clock.advance(Duration::from_secs(29));
        let _ = h.controller.check(&key(), RequestClass::Api).await;
        assert_eq!(h.store.calls(), 2);

        h.clock.advance(Duration::from_secs(1));
        let _ = h.controller.check(&key(), RequestClass::Api).await;
        assert_eq!(h.store.calls(), 3);
        // A new cycle starts from the first backoff step.
        assert_eq!(h.controller.connection().health().failures, 1);
    }

    /// Fails every call after a short delay so concurrent attempts overlap.
    struct SlowFailingStore {
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl CounterStore for SlowFailingStore {
        async fn record_hit(
            &self,
            _key: &str,
            _now_ms: u64,
            _window: Duration,
            _member: &str,
        ) -> std::result::Result<u64, StoreError> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Err(StoreError::Timeout { op: "connect" })
        }

        async fn ping(&self) -> std::result::Result<(), StoreError> {
            Err(StoreError::Timeout { op: "ping" })
        }
    }

    #[tokio::test]
    async fn test_concurrent_failures_count_once() {
        let store = Arc::new(SlowFailingStore {
            calls: Default::default(),
        });
        let clock = Arc::new(ManualClock::new(START));
        let connection = Arc::new(BackendConnection::new(
            store.clone(),
            DegradationPolicy::production(),
        ));
        let controller = DegradationController::new(connection.clone(), clock.clone());

        let key = key();
        let checks = (0..8).map(|_| controller.check(&key, RequestClass::Api));
        let results = futures::future::join_all(checks).await;
        assert!(results.iter().all(|r| r.is_err()));
        assert_eq!(store.calls.load(std::sync::atomic::Ordering::SeqCst), 8);
        assert_eq!(connection.health().failures, 1);

        // The first backoff step still applies.
        clock.advance(Duration::from_millis(200));
        assert!(connection.try_begin_attempt(clock.now_ms()));
    }

    #[test]
    fn test_unclaimed_failures_do_not_advance_backoff() {
        let connection = BackendConnection::new(
            Arc::new(FakeCounterStore::new()),
            DegradationPolicy::production(),
        );
        let error = StoreError::Timeout { op: "connect" };

        connection.record_failure(START, &error);
        connection.record_failure(START + 10, &error);
        assert_eq!(connection.health().failures, 1);
        assert_eq!(connection.health().last_attempt_ms, START);

        assert!(connection.try_begin_attempt(START + 200));
        connection.record_failure(START + 250, &error);
        assert_eq!(connection.health().failures, 2);
    }

    #[tokio::test]
    async fn test_probe_updates_health() {
        let store = Arc::new(FakeCounterStore::unreachable());
        let connection = BackendConnection::new(store.clone(), DegradationPolicy::production());

        assert!(!connection.probe(START).await);
        assert!(!connection.is_healthy());

        store.set_unreachable(false);
        assert!(!connection.probe(START + 100).await);
        assert!(connection.probe(START + 200).await);
        assert!(connection.is_healthy());
    }
}

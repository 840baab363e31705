//! Wiring of configuration into the running components.

use std::sync::Arc;

use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::LinkguardConfig;
use crate::error::{LinkguardError, Result};
use crate::http::{AppState, RateGuard};
use crate::ratelimit::{BackendConnection, DegradationController, DegradationPolicy};
use crate::state::EphemeralStateStore;
use crate::store::{
    CounterStore, MemoryStateBackend, RedisStore, RedisStoreConfig, StateBackend,
    UnconfiguredStore,
};

/// Validate `config` and build the shared application state.
///
/// Without a backend URL (development only) counters go straight to the
/// fallback and state tokens live in this process. With one, state tokens
/// stay in Redis in every environment and a Redis outage fails issuance.
pub fn build_state(config: &LinkguardConfig) -> Result<AppState> {
    config.validate()?;

    let policy = DegradationPolicy::for_environment(config.environment);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let (counters, states): (Arc<dyn CounterStore>, Arc<dyn StateBackend>) =
        match &config.backend.url {
            Some(url) => {
                let store = Arc::new(
                    RedisStore::open(RedisStoreConfig {
                        url: url.clone(),
                        key_prefix: config.backend.key_prefix.clone(),
                        connect_timeout: policy.connect_timeout,
                        command_timeout: policy.command_timeout,
                    })
                    .map_err(|e| LinkguardError::Config(format!("backend: {}", e)))?,
                );
                (store.clone(), store)
            }
            None => {
                warn!(
                    environment = %config.environment,
                    "No backend URL configured, rate limits are process-local"
                );
                (
                    Arc::new(UnconfiguredStore),
                    Arc::new(MemoryStateBackend::new()),
                )
            }
        };

    info!(
        environment = %config.environment,
        fail_mode = ?policy.fail_mode,
        "Degradation policy selected"
    );

    let connection = Arc::new(BackendConnection::new(counters, policy));
    let controller = Arc::new(DegradationController::new(connection, clock.clone()));

    Ok(AppState {
        guard: RateGuard::new(controller, config.server.trust_forwarded_for),
        states: EphemeralStateStore::new(states, clock),
        api_key: config.server.api_key.as_deref().map(Arc::from),
        environment: config.environment,
    })
}

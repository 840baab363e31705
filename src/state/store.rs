//! Ephemeral state store.
//!
//! A token is bound to a subject (wallet address) and a session at issue
//! time and can be exchanged for them exactly once before it expires. The
//! first consumption attempt burns the token whatever its outcome.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::ratelimit::{PolicyError, RequestClass};
use crate::store::{StateBackend, StateRecord, StoreError};

/// Random bytes per token (256 bits).
pub const TOKEN_BYTES: usize = 32;

/// Anything longer cannot be a token we issued.
const MAX_TOKEN_LEN: usize = 128;

/// Errors from issuing or consuming state tokens.
#[derive(Debug, Error)]
pub enum StateError {
    /// Unknown, expired or already used. Deliberately carries no detail.
    #[error("Invalid or expired state")]
    Invalid,

    #[error("Invalid state request: {0}")]
    BadRequest(&'static str),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error("State store unavailable: {0}")]
    Backend(#[from] StoreError),
}

/// A freshly issued token and what it is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateToken {
    pub token: String,
    pub subject: String,
    pub session_id: String,
    pub created_at_ms: u64,
    pub expires_at_ms: u64,
}

/// What a successful consumption hands back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateClaim {
    pub subject: String,
    pub session_id: String,
}

/// Issues and consumes single-use state tokens.
#[derive(Clone)]
pub struct EphemeralStateStore {
    backend: Arc<dyn StateBackend>,
    clock: Arc<dyn Clock>,
}

impl EphemeralStateStore {
    pub fn new(backend: Arc<dyn StateBackend>, clock: Arc<dyn Clock>) -> Self {
        Self { backend, clock }
    }

    /// Issue a token for `subject` that stays valid for `ttl`.
    ///
    /// Expired records are purged first on a best-effort basis.
    pub async fn issue(
        &self,
        subject: &str,
        session_id: &str,
        ttl: Duration,
    ) -> Result<StateToken, StateError> {
        let subject = subject.trim();
        if subject.is_empty() {
            return Err(StateError::BadRequest("subject is required"));
        }
        if ttl.is_zero() {
            return Err(StateError::BadRequest("ttl must be non-zero"));
        }

        let now_ms = self.clock.now_ms();
        match self.backend.purge_expired(now_ms).await {
            Ok(0) => {}
            Ok(removed) => debug!(removed, "Purged expired state tokens"),
            Err(e) => warn!(error = %e, "Failed to purge expired state tokens"),
        }

        let record = StateRecord {
            token: generate_token(),
            subject: subject.to_string(),
            session_id: session_id.to_string(),
            created_at_ms: now_ms,
            expires_at_ms: now_ms + ttl.as_millis() as u64,
            used: false,
        };
        self.backend.insert(record.clone(), ttl).await?;

        debug!(
            subject = %record.subject,
            expires_at_ms = record.expires_at_ms,
            "Issued state token"
        );

        Ok(StateToken {
            token: record.token,
            subject: record.subject,
            session_id: record.session_id,
            created_at_ms: record.created_at_ms,
            expires_at_ms: record.expires_at_ms,
        })
    }

    /// Issue a token with the TTL registered for `class`.
    pub async fn issue_for(
        &self,
        class: RequestClass,
        subject: &str,
        session_id: &str,
    ) -> Result<StateToken, StateError> {
        let ttl = class.state_ttl().ok_or(PolicyError::NoStateTtl(class))?;
        self.issue(subject, session_id, ttl).await
    }

    /// Exchange a token for its subject and session, burning it.
    ///
    /// Every failure to validate comes back as [`StateError::Invalid`]; the
    /// caller should restart the flow rather than retry.
    pub async fn consume(&self, token: &str) -> Result<StateClaim, StateError> {
        if token.is_empty() || token.len() > MAX_TOKEN_LEN {
            return Err(StateError::Invalid);
        }

        let Some(record) = self.backend.take_unused(token).await? else {
            debug!("Rejected unknown or reused state token");
            return Err(StateError::Invalid);
        };

        if self.clock.now_ms() >= record.expires_at_ms {
            debug!(subject = %record.subject, "Rejected expired state token");
            return Err(StateError::Invalid);
        }

        Ok(StateClaim {
            subject: record.subject,
            session_id: record.session_id,
        })
    }
}

fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

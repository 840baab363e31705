//! Error types for the Linkguard service.

use thiserror::Error;

use crate::ratelimit::PolicyError;
use crate::store::StoreError;

/// Main error type for Linkguard operations.
#[derive(Error, Debug)]
pub enum LinkguardError {
    /// Configuration faults. Fatal at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The durable counter store could not be used and the active
    /// degradation policy does not allow a local fallback.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Unknown request class or malformed policy
    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),

    /// Counter store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Linkguard operations.
pub type Result<T> = std::result::Result<T, LinkguardError>;

//! One-time state tokens for OAuth redirects and wallet-link sessions.

mod store;

pub use store::{EphemeralStateStore, StateClaim, StateError, StateToken, TOKEN_BYTES};

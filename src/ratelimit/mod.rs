//! Rate limiting logic and backend degradation.

mod degrade;
mod fallback;
mod key;
mod limiter;
mod policy;

pub use degrade::{
    Backoff, BackendConnection, BackendHealth, DegradationController, DegradationPolicy,
    Environment, FailMode,
};
pub use fallback::{FallbackCounter, FallbackEntry};
pub use key::{RateKey, USER_AGENT_PREFIX_CHARS};
pub use limiter::{Decision, SlidingWindowLimiter};
pub use policy::{Policy, PolicyError, RequestClass};

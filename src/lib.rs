//! Linkguard - Distributed Rate Limiting and One-Time State Tokens
//!
//! This crate guards the wallet linking flow. Request quotas are enforced with
//! a sliding window kept in Redis so every instance sees the same counts, and
//! OAuth/wallet-link flows are protected by single-use state tokens.
//!
//! When Redis is unreachable, behaviour depends on the environment: production
//! rejects traffic with 503, development keeps serving from an in-process
//! fallback counter.

pub mod app;
pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod state;
pub mod store;

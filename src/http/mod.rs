//! HTTP surface: rate limiting middleware, routes and the server.

mod middleware;
mod routes;
mod server;

pub use middleware::{
    client_ip, with_rate_limit, AuthenticatedUser, RateGuard, RateLimitLayer, RateLimitService,
    X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET,
};
pub use routes::{
    router, ApiError, AppState, ConsumeStateRequest, ConsumeStateResponse, IssueStateRequest,
    IssueStateResponse,
};
pub use server::HttpServer;

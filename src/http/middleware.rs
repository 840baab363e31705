//! Rate limiting for axum routes.
//!
//! [`RateLimitLayer`] wraps any route with a request class. Allowed requests
//! carry `X-RateLimit-*` headers on their response; denied ones get a 429,
//! and a backend outage under a fail-closed policy gets a 503.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::header::{HeaderName, RETRY_AFTER, USER_AGENT};
use axum::http::{HeaderMap, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::MethodRouter;
use axum::Json;
use futures::future::BoxFuture;
use serde_json::json;
use tower::{Layer, Service};
use tracing::{debug, warn};

use crate::ratelimit::{Decision, DegradationController, RateKey, RequestClass};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Identity of the caller, inserted as a request extension by whatever
/// authenticates the request. Narrows the rate key to that user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser(pub String);

/// Shared handle used by every rate limited route.
#[derive(Clone)]
pub struct RateGuard {
    controller: Arc<DegradationController>,
    trust_forwarded_for: bool,
}

impl RateGuard {
    pub fn new(controller: Arc<DegradationController>, trust_forwarded_for: bool) -> Self {
        Self {
            controller,
            trust_forwarded_for,
        }
    }

    pub fn controller(&self) -> &Arc<DegradationController> {
        &self.controller
    }

    /// Derive the rate key for a request.
    pub fn rate_key<B>(&self, request: &Request<B>) -> RateKey {
        let remote = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ci| ci.0);
        let ip = client_ip(request.headers(), remote, self.trust_forwarded_for);
        let user_agent = request
            .headers()
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok());
        let user = request
            .extensions()
            .get::<AuthenticatedUser>()
            .map(|u| u.0.as_str());

        RateKey::new(ip, user_agent, user)
    }
}

/// Wrap a route with the policy registered for `class`.
pub fn with_rate_limit<S>(
    route: MethodRouter<S>,
    class: RequestClass,
    guard: &RateGuard,
) -> MethodRouter<S>
where
    S: Clone + Send + Sync + 'static,
{
    route.layer(RateLimitLayer::new(guard.clone(), class))
}

/// Tower layer applying one request class.
#[derive(Clone)]
pub struct RateLimitLayer {
    guard: RateGuard,
    class: RequestClass,
}

impl RateLimitLayer {
    pub fn new(guard: RateGuard, class: RequestClass) -> Self {
        Self { guard, class }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            guard: self.guard.clone(),
            class: self.class,
        }
    }
}

/// Service produced by [`RateLimitLayer`].
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    guard: RateGuard,
    class: RequestClass,
}

impl<S> Service<Request<Body>> for RateLimitService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        // Keep the service that was polled ready.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let guard = self.guard.clone();
        let class = self.class;

        Box::pin(async move {
            let key = guard.rate_key(&request);

            match guard.controller.check(&key, class).await {
                Ok(decision) if decision.allowed => {
                    let mut response = inner.call(request).await?;
                    insert_limit_headers(response.headers_mut(), &decision);
                    Ok(response)
                }
                Ok(decision) => {
                    let now_ms = guard.controller.clock().now_ms();
                    debug!(key = %key, class = %class, "Request rate limited");
                    Ok(too_many_requests(&decision, now_ms))
                }
                Err(e) => {
                    warn!(key = %key, class = %class, error = %e, "Rejecting request, rate limiter unavailable");
                    Ok(service_unavailable())
                }
            }
        })
    }
}

/// Client address, from the first forwarded hop when trusted.
pub fn client_ip(
    headers: &HeaderMap,
    remote: Option<SocketAddr>,
    trust_forwarded_for: bool,
) -> Option<IpAddr> {
    if trust_forwarded_for {
        let forwarded = headers
            .get(X_FORWARDED_FOR)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse().ok());
        if forwarded.is_some() {
            return forwarded;
        }
    }
    remote.map(|addr| addr.ip())
}

fn insert_limit_headers(headers: &mut HeaderMap, decision: &Decision) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(decision.reset_at_ms));
}

fn too_many_requests(decision: &Decision, now_ms: u64) -> Response {
    let retry_after = decision.retry_after_secs(now_ms);
    let body = json!({
        "error": format!("Too many requests. Please try again in {} seconds.", retry_after),
        "retry_after": retry_after,
    });

    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    let headers = response.headers_mut();
    insert_limit_headers(headers, decision);
    headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));
    response
}

fn service_unavailable() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({ "error": "Service temporarily unavailable" })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn test_client_ip_prefers_socket_when_untrusted() {
        let remote: SocketAddr = "10.1.1.1:5555".parse().unwrap();
        let h = headers(&[("x-forwarded-for", "198.51.100.7")]);

        assert_eq!(
            client_ip(&h, Some(remote), false),
            Some("10.1.1.1".parse().unwrap())
        );
    }

    #[test]
    fn test_client_ip_uses_first_forwarded_hop() {
        let remote: SocketAddr = "10.1.1.1:5555".parse().unwrap();
        let h = headers(&[("x-forwarded-for", "198.51.100.7, 10.0.0.2")]);

        assert_eq!(
            client_ip(&h, Some(remote), true),
            Some("198.51.100.7".parse().unwrap())
        );
    }

    #[test]
    fn test_client_ip_ignores_garbage_forwarded_header() {
        let remote: SocketAddr = "[::1]:80".parse().unwrap();
        let h = headers(&[("x-forwarded-for", "not-an-ip")]);

        assert_eq!(client_ip(&h, Some(remote), true), Some("::1".parse().unwrap()));
        assert_eq!(client_ip(&HeaderMap::new(), None, true), None);
    }

    #[test]
    fn test_too_many_requests_response() {
        let decision = Decision {
            allowed: false,
            limit: 10,
            remaining: 0,
            reset_at_ms: 1_000_000,
        };
        let response = too_many_requests(&decision, 990_500);

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let h = response.headers();
        assert_eq!(h[RETRY_AFTER], "10");
        assert_eq!(h[X_RATELIMIT_LIMIT], "10");
        assert_eq!(h[X_RATELIMIT_REMAINING], "0");
        assert_eq!(h[X_RATELIMIT_RESET], "1000000");
    }

    #[test]
    fn test_service_unavailable_response() {
        assert_eq!(service_unavailable().status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}

//! axum middleware that puts a [`RateLimiter`] in front of a route.
//!
//! Use with `axum::middleware::from_fn_with_state(RateLimitGuard::new(limiter), rate_limit)`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::{
    HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, RETRY_AFTER, USER_AGENT,
};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::{trace, warn};

use crate::ratelimit::{ClientRequest, Decision, RateLimiter, RejectionBody};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Identity attached to the request by an authentication layer.
///
/// Limiters using the `user` key strategy count per subject when this is
/// present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser(pub String);

/// Middleware state: the limiter plus how client addresses are resolved.
#[derive(Debug, Clone)]
pub struct RateLimitGuard {
    limiter: Arc<RateLimiter>,
    trust_forwarded_for: bool,
}

impl RateLimitGuard {
    /// Guard keyed on the connection's peer address.
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self {
            limiter,
            trust_forwarded_for: false,
        }
    }

    /// Take the client address from `X-Forwarded-For`. Only enable this
    /// behind a proxy that overwrites the header.
    pub fn trust_forwarded_for(mut self, trust: bool) -> Self {
        self.trust_forwarded_for = trust;
        self
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }
}

/// Admit or reject the request, then settle skip options once the response
/// status is known.
pub async fn rate_limit(
    State(guard): State<RateLimitGuard>,
    request: Request,
    next: Next,
) -> Response {
    let limiter = &guard.limiter;
    let client = client_request(&request, guard.trust_forwarded_for);
    let decision = limiter.check(&client);

    if decision.is_rejected() {
        warn!(
            limiter = %limiter.name(),
            key = %decision.key,
            path = %request.uri().path(),
            retry_after = decision.retry_after_secs.unwrap_or_default(),
            "Request rejected by rate limiter"
        );
        return rejection_response(&decision, limiter.policy().window_ms());
    }

    let mut response = next.run(request).await;
    apply_quota_headers(response.headers_mut(), &decision);

    let status = response.status().as_u16();
    if limiter.adjust_for_outcome(&decision, status) {
        trace!(limiter = %limiter.name(), key = %decision.key, status, "Request not counted");
    }

    response
}

/// Collect the request attributes key functions look at.
///
/// `X-Forwarded-For` is dropped unless `trust_forwarded_for` is set, so an
/// untrusted client cannot pick its own key.
pub fn client_request(request: &Request, trust_forwarded_for: bool) -> ClientRequest {
    let headers = request.headers();
    ClientRequest {
        remote_addr: request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip()),
        forwarded_for: if trust_forwarded_for {
            header_string(headers, &X_FORWARDED_FOR)
        } else {
            None
        },
        user_agent: header_string(headers, &USER_AGENT),
        user_id: request
            .extensions()
            .get::<AuthenticatedUser>()
            .map(|user| user.0.clone()),
    }
}

fn header_string(headers: &HeaderMap, name: &HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

/// Set `X-RateLimit-Limit`, `X-RateLimit-Remaining` and `X-RateLimit-Reset`.
///
/// With nested limiters the innermost one answers first; outer layers leave
/// its headers in place so clients see the route-specific quota.
pub fn apply_quota_headers(headers: &mut HeaderMap, decision: &Decision) {
    if headers.contains_key(X_RATELIMIT_LIMIT) {
        return;
    }
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(
        X_RATELIMIT_RESET,
        HeaderValue::from(decision.reset_at_epoch_secs),
    );
}

/// The 429 response for a rejected decision.
pub fn rejection_response(decision: &Decision, window_ms: u64) -> Response {
    let body = RejectionBody::new(decision, window_ms);
    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    if let Some(retry_after) = decision.retry_after_secs {
        response
            .headers_mut()
            .insert(RETRY_AFTER, HeaderValue::from(retry_after));
    }
    response
}

/// Reject requests lacking `Authorization: Bearer <token>`.
///
/// Use with `from_fn_with_state(token, require_admin)`.
pub async fn require_admin(
    State(token): State<Arc<str>>,
    request: Request,
    next: Next,
) -> Response {
    let authorized = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .is_some_and(|presented| presented == &*token);

    if authorized {
        return next.run(request).await;
    }

    warn!(path = %request.uri().path(), "Administrative request without valid credentials");
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "success": false, "error": "Unauthorized" })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{ManualClock, RateLimitPolicy};
    use axum::body::Body;
    use axum::middleware::from_fn_with_state;
    use axum::routing::get;
    use axum::Router;
    use std::time::Duration;
    use tower::ServiceExt;

    fn limiter(window: Duration, max_requests: u32) -> Arc<RateLimiter> {
        let clock = ManualClock::new(1_700_000_000_000);
        let policy = RateLimitPolicy::new(window, max_requests).with_message("Too many requests");
        Arc::new(RateLimiter::with_clock(policy, Arc::new(clock)).unwrap())
    }

    fn limited_router(max_requests: u32) -> Router {
        let guard = RateLimitGuard::new(limiter(Duration::from_secs(60), max_requests));
        Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(from_fn_with_state(guard, rate_limit))
    }

    fn request_from(ip: [u8; 4]) -> Request {
        Request::builder()
            .uri("/")
            .extension(ConnectInfo(SocketAddr::from((ip, 40000))))
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn test_client_request_extraction() {
        let mut request = Request::builder()
            .uri("/")
            .header(USER_AGENT, "curl/8.0")
            .header(X_FORWARDED_FOR, "198.51.100.4, 10.0.0.1")
            .extension(ConnectInfo(SocketAddr::from(([10, 0, 0, 1], 1234))))
            .body(Body::empty())
            .unwrap();
        request
            .extensions_mut()
            .insert(AuthenticatedUser("u-1".to_string()));

        let client = client_request(&request, true);
        assert_eq!(client.remote_addr, Some("10.0.0.1".parse().unwrap()));
        assert_eq!(client.client_ip(), "198.51.100.4");
        assert_eq!(client.user_agent.as_deref(), Some("curl/8.0"));
        assert_eq!(client.user_id.as_deref(), Some("u-1"));

        let client = client_request(&request, false);
        assert_eq!(client.forwarded_for, None);
        assert_eq!(client.client_ip(), "10.0.0.1");
    }

    #[tokio::test]
    async fn test_untrusted_forwarded_for_cannot_rotate_keys() {
        let app = limited_router(3);

        let mut admitted = 0;
        for i in 0..20 {
            let request = Request::builder()
                .uri("/")
                .header(X_FORWARDED_FOR, format!("1.2.3.{}", i))
                .extension(ConnectInfo(SocketAddr::from(([10, 0, 0, 1], 40000))))
                .body(Body::empty())
                .unwrap();
            if app.clone().oneshot(request).await.unwrap().status() == StatusCode::OK {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 3);
    }

    #[tokio::test]
    async fn test_inner_limiter_headers_survive_outer_layer() {
        let outer = RateLimitGuard::new(limiter(Duration::from_secs(900), 100));
        let inner = RateLimitGuard::new(limiter(Duration::from_secs(60), 3));

        let app = Router::new()
            .route("/", get(|| async { "ok" }))
            .route_layer(from_fn_with_state(inner, rate_limit))
            .route_layer(from_fn_with_state(outer.clone(), rate_limit));

        let response = app.oneshot(request_from([10, 0, 0, 1])).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[X_RATELIMIT_LIMIT], "3");
        assert_eq!(response.headers()[X_RATELIMIT_REMAINING], "2");
        assert_eq!(response.headers()[X_RATELIMIT_RESET], "1700000060");
        assert_eq!(outer.limiter().get_remaining("ip:10.0.0.1"), 99);
    }

    #[tokio::test]
    async fn test_require_admin() {
        let token: Arc<str> = Arc::from("s3cret");
        let app = Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(from_fn_with_state(token, require_admin));

        let anonymous = app.clone().oneshot(request_from([10, 0, 0, 1])).await.unwrap();
        assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);

        let wrong = Request::builder()
            .uri("/")
            .header(AUTHORIZATION, "Bearer guess")
            .body(Body::empty())
            .unwrap();
        assert_eq!(
            app.clone().oneshot(wrong).await.unwrap().status(),
            StatusCode::UNAUTHORIZED
        );

        let authorized = Request::builder()
            .uri("/")
            .header(AUTHORIZATION, "Bearer s3cret")
            .body(Body::empty())
            .unwrap();
        assert_eq!(app.oneshot(authorized).await.unwrap().status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_admitted_response_carries_quota_headers() {
        let app = limited_router(2);

        let response = app.oneshot(request_from([10, 0, 0, 1])).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[X_RATELIMIT_LIMIT], "2");
        assert_eq!(response.headers()[X_RATELIMIT_REMAINING], "1");
        assert_eq!(response.headers()[X_RATELIMIT_RESET], "1700000060");
    }

    #[tokio::test]
    async fn test_rejected_response() {
        let app = limited_router(1);

        let first = app.clone().oneshot(request_from([10, 0, 0, 1])).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app.oneshot(request_from([10, 0, 0, 1])).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(second.headers()[RETRY_AFTER], "60");
        assert!(second.headers().get(X_RATELIMIT_REMAINING).is_none());

        let bytes = axum::body::to_bytes(second.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "success": false,
                "error": "Too many requests",
                "retryAfter": 60,
                "limit": 1,
                "windowMs": 60000
            })
        );
    }

    #[tokio::test]
    async fn test_rejection_skips_downstream() {
        let clock = ManualClock::new(0);
        let policy = RateLimitPolicy::new(Duration::from_secs(60), 1);
        let limiter = Arc::new(RateLimiter::with_clock(policy, Arc::new(clock)).unwrap());
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let counter = Arc::clone(&hits);
        let app = Router::new()
            .route(
                "/",
                get(move || {
                    counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    async { "ok" }
                }),
            )
            .layer(from_fn_with_state(RateLimitGuard::new(limiter), rate_limit));

        for _ in 0..3 {
            app.clone().oneshot(request_from([10, 0, 0, 9])).await.unwrap();
        }
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}

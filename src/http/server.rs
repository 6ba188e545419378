//! HTTP server exposing rate-limited demo routes and limiter administration.

use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{OriginalUri, Path, Query, State};
use axum::http::StatusCode;
use axum::middleware::from_fn_with_state;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use super::middleware::{rate_limit, require_admin, RateLimitGuard};
use crate::error::{RatewardenError, Result};
use crate::ratelimit::policy::{API, AUTH, EXPORT, GENERAL, UPLOAD};
use crate::config::ServerConfig;
use crate::ratelimit::{LimiterRegistry, LimiterStats};

/// HTTP server wiring named limiters onto routes.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The limiters routes are guarded by
    registry: LimiterRegistry,
    /// Key clients by `X-Forwarded-For` instead of the peer address
    trust_forwarded_for: bool,
    /// Bearer token for `/admin`; without one the admin routes are not served
    admin_token: Option<Arc<str>>,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, registry: LimiterRegistry) -> Self {
        Self {
            addr,
            registry,
            trust_forwarded_for: false,
            admin_token: None,
        }
    }

    /// Build a server from the `server` configuration section.
    pub fn from_config(config: &ServerConfig, registry: LimiterRegistry) -> Self {
        Self::new(config.http_addr, registry)
            .trust_forwarded_for(config.trust_forwarded_for)
            .with_admin_token(config.admin_token.clone())
    }

    pub fn trust_forwarded_for(mut self, trust: bool) -> Self {
        self.trust_forwarded_for = trust;
        self
    }

    pub fn with_admin_token(mut self, token: Option<String>) -> Self {
        self.admin_token = token.filter(|t| !t.is_empty()).map(Arc::from);
        self
    }

    fn guard(&self, name: &str) -> Result<RateLimitGuard> {
        Ok(RateLimitGuard::new(self.registry.require(name)?)
            .trust_forwarded_for(self.trust_forwarded_for))
    }

    /// Build the router.
    ///
    /// Everything under `/api` passes the `general` limiter first, then the
    /// route-specific one. `/health` is never limited. `/admin` is only
    /// mounted when an admin token is configured, and requires it as a
    /// bearer token. Fails when a required limiter is missing from the
    /// registry.
    pub fn router(&self) -> Result<Router> {
        let general = self.guard(GENERAL)?;
        let auth = self.guard(AUTH)?;
        let api = self.guard(API)?;
        let upload = self.guard(UPLOAD)?;
        let export = self.guard(EXPORT)?;

        let auth_routes = Router::new()
            .route("/auth/login", post(login))
            .route("/auth/register", post(acknowledge))
            .route_layer(from_fn_with_state(auth, rate_limit));

        let task_routes = Router::new()
            .route("/tasks", get(acknowledge).post(acknowledge))
            .route(
                "/tasks/:id",
                get(acknowledge).put(acknowledge).delete(acknowledge),
            )
            .route_layer(from_fn_with_state(api, rate_limit));

        let upload_routes = Router::new()
            .route("/upload", post(acknowledge))
            .route_layer(from_fn_with_state(upload, rate_limit));

        let export_routes = Router::new()
            .route("/export", get(acknowledge))
            .route_layer(from_fn_with_state(export, rate_limit));

        let api_routes = Router::new()
            .merge(auth_routes)
            .merge(task_routes)
            .merge(upload_routes)
            .merge(export_routes)
            .route_layer(from_fn_with_state(general, rate_limit));

        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        let mut router = Router::new()
            .route("/health", get(health))
            .nest("/api", api_routes);

        match &self.admin_token {
            Some(token) => {
                let admin_routes = Router::new()
                    .route("/ratelimit", get(limiter_stats))
                    .route("/ratelimit/:limiter/remaining", get(limiter_remaining))
                    .route("/ratelimit/:limiter", delete(limiter_reset))
                    .route_layer(from_fn_with_state(Arc::clone(token), require_admin))
                    .with_state(self.registry.clone());
                router = router.nest("/admin", admin_routes);
            }
            None => info!("No admin token configured, admin routes disabled"),
        }

        Ok(router.layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        ))
    }

    /// Serve until the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let router = self.router()?;
        let listener = tokio::net::TcpListener::bind(self.addr).await?;

        info!(
            addr = %listener.local_addr()?,
            limiters = self.registry.len(),
            trust_forwarded_for = self.trust_forwarded_for,
            admin = self.admin_token.is_some(),
            "Starting HTTP server"
        );

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            RatewardenError::Io(e)
        })
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Stand-in for application handlers behind the limiters.
async fn acknowledge(OriginalUri(uri): OriginalUri) -> impl IntoResponse {
    Json(json!({ "success": true, "path": uri.path() }))
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    #[serde(default)]
    email: String,
    #[serde(default)]
    password: String,
}

/// Accepts any non-empty credentials. With the stock `auth` policy only the
/// failed attempts count against the caller.
async fn login(Json(body): Json<LoginRequest>) -> impl IntoResponse {
    if body.email.is_empty() || body.password.is_empty() {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "success": false, "error": "Invalid credentials" })),
        );
    }
    (
        StatusCode::OK,
        Json(json!({ "success": true, "user": body.email })),
    )
}

#[derive(Debug, Serialize)]
struct LimiterSummary {
    limit: u32,
    window_ms: u64,
    #[serde(flatten)]
    stats: LimiterStats,
}

async fn limiter_stats(State(registry): State<LimiterRegistry>) -> impl IntoResponse {
    let summary: BTreeMap<&str, LimiterSummary> = registry
        .iter()
        .map(|(name, limiter)| {
            (
                name,
                LimiterSummary {
                    limit: limiter.limit(),
                    window_ms: limiter.policy().window_ms(),
                    stats: limiter.stats(),
                },
            )
        })
        .collect();
    Json(summary).into_response()
}

#[derive(Debug, Deserialize)]
struct KeyQuery {
    key: String,
}

async fn limiter_remaining(
    State(registry): State<LimiterRegistry>,
    Path(name): Path<String>,
    Query(query): Query<KeyQuery>,
) -> impl IntoResponse {
    match registry.get(&name) {
        Some(limiter) => {
            let remaining = limiter.get_remaining(&query.key);
            (
                StatusCode::OK,
                Json(json!({
                    "key": query.key,
                    "remaining": remaining,
                    "limit": limiter.limit(),
                })),
            )
        }
        None => unknown_limiter(&name),
    }
}

async fn limiter_reset(
    State(registry): State<LimiterRegistry>,
    Path(name): Path<String>,
    Query(query): Query<KeyQuery>,
) -> impl IntoResponse {
    match registry.get(&name) {
        Some(limiter) => {
            limiter.reset(&query.key);
            info!(limiter = %name, key = %query.key, "Rate limit reset by administrator");
            (
                StatusCode::OK,
                Json(json!({ "success": true, "key": query.key })),
            )
        }
        None => unknown_limiter(&name),
    }
}

fn unknown_limiter(name: &str) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "success": false,
            "error": RatewardenError::UnknownLimiter(name.to_string()).to_string(),
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::policy::default_policies;

    #[test]
    fn test_router_requires_all_limiters() {
        let addr: SocketAddr = "127.0.0.1:3000".parse().unwrap();

        let server = HttpServer::new(addr, LimiterRegistry::from_config(&default_policies()).unwrap());
        assert!(server.router().is_ok());

        let server = HttpServer::new(addr, LimiterRegistry::new());
        assert!(matches!(
            server.router(),
            Err(RatewardenError::UnknownLimiter(_))
        ));
    }

    #[test]
    fn test_from_config() {
        let config = ServerConfig {
            trust_forwarded_for: true,
            admin_token: Some(String::new()),
            ..ServerConfig::default()
        };
        let server = HttpServer::from_config(&config, LimiterRegistry::new());
        assert!(server.trust_forwarded_for);
        assert!(server.admin_token.is_none());
    }
}

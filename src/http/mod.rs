//! HTTP surface: the rate limiting middleware and the demo server.

pub mod middleware;
mod server;

pub use middleware::{rate_limit, require_admin, AuthenticatedUser, RateLimitGuard};
pub use server::HttpServer;

//! Ratewarden - per-key fixed-window rate limiting
//!
//! This crate implements an in-memory admission controller that counts
//! requests per key (client IP, IP plus user agent, or authenticated user)
//! over fixed windows, and the axum middleware that puts it in front of HTTP
//! routes with `X-RateLimit-*` headers and JSON 429 rejections.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;

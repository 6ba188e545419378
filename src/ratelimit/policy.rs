//! Rate limit policies and key derivation.
//!
//! A policy fixes the window length, the admission threshold, the rejection
//! message and the function that turns a request into a tracking key. Policies
//! are usually built from [`PolicyConfig`] entries in the service
//! configuration, one per named limiter.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use super::window::duration_ms;
use crate::error::{RatewardenError, Result};

/// Derives the tracking key for a request.
pub type KeyFn = Arc<dyn Fn(&ClientRequest) -> String + Send + Sync>;

const DEFAULT_MESSAGE: &str = "Too many requests, please try again later.";

/// The parts of an incoming request that key functions may look at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientRequest {
    /// Peer address of the connection
    pub remote_addr: Option<IpAddr>,
    /// Raw `X-Forwarded-For` header value, set only when the proxy is trusted
    pub forwarded_for: Option<String>,
    /// Raw `User-Agent` header value
    pub user_agent: Option<String>,
    /// Authenticated subject attached by an earlier layer
    pub user_id: Option<String>,
}

impl ClientRequest {
    /// A request seen only by its peer address.
    pub fn from_ip(ip: IpAddr) -> Self {
        Self {
            remote_addr: Some(ip),
            ..Self::default()
        }
    }

    /// Attach a user agent.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Attach an authenticated subject.
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// The client address: the first `X-Forwarded-For` hop if present,
    /// otherwise the peer address.
    pub fn client_ip(&self) -> String {
        self.forwarded_for
            .as_deref()
            .and_then(|xff| xff.split(',').next())
            .map(str::trim)
            .filter(|hop| !hop.is_empty())
            .map(str::to_string)
            .or_else(|| self.remote_addr.map(|ip| ip.to_string()))
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// Built-in key derivation strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    /// `ip:<client-ip>`
    #[default]
    Ip,
    /// `ip:<client-ip>:ua:<user-agent>`
    IpUserAgent,
    /// `user:<id>`, falling back to the IP key for anonymous requests
    User,
}

impl KeyStrategy {
    /// Derive the key for a request.
    pub fn key_for(&self, request: &ClientRequest) -> String {
        match self {
            KeyStrategy::Ip => format!("ip:{}", request.client_ip()),
            KeyStrategy::IpUserAgent => format!(
                "ip:{}:ua:{}",
                request.client_ip(),
                request.user_agent.as_deref().unwrap_or_default()
            ),
            KeyStrategy::User => match &request.user_id {
                Some(id) => format!("user:{}", id),
                None => KeyStrategy::Ip.key_for(request),
            },
        }
    }

    /// Wrap this strategy as a [`KeyFn`].
    pub fn into_key_fn(self) -> KeyFn {
        Arc::new(move |request: &ClientRequest| self.key_for(request))
    }
}

/// Immutable configuration of one limiter.
#[derive(Clone)]
pub struct RateLimitPolicy {
    /// Length of each fixed window
    pub window: Duration,
    /// Requests admitted per key per window
    pub max_requests: u32,
    /// User-facing rejection message
    pub message: String,
    /// Don't count requests whose response status is below 400
    pub skip_successful_requests: bool,
    /// Don't count requests whose response status is 400 or above
    pub skip_failed_requests: bool,
    key_fn: KeyFn,
}

impl RateLimitPolicy {
    /// A per-IP policy with the default message.
    pub fn new(window: Duration, max_requests: u32) -> Self {
        Self {
            window,
            max_requests,
            message: DEFAULT_MESSAGE.to_string(),
            skip_successful_requests: false,
            skip_failed_requests: false,
            key_fn: KeyStrategy::Ip.into_key_fn(),
        }
    }

    /// Replace the rejection message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Use one of the built-in key strategies.
    pub fn with_key_strategy(mut self, strategy: KeyStrategy) -> Self {
        self.key_fn = strategy.into_key_fn();
        self
    }

    /// Use a custom key function.
    pub fn with_key_fn<F>(mut self, key_fn: F) -> Self
    where
        F: Fn(&ClientRequest) -> String + Send + Sync + 'static,
    {
        self.key_fn = Arc::new(key_fn);
        self
    }

    /// Refund requests that end in a successful response.
    pub fn skip_successful(mut self, skip: bool) -> Self {
        self.skip_successful_requests = skip;
        self
    }

    /// Refund requests that end in a failed response.
    pub fn skip_failed(mut self, skip: bool) -> Self {
        self.skip_failed_requests = skip;
        self
    }

    /// Window length in milliseconds, saturating for oversized windows.
    pub fn window_ms(&self) -> u64 {
        duration_ms(self.window)
    }

    /// Derive the tracking key for a request.
    pub fn key_for(&self, request: &ClientRequest) -> String {
        (self.key_fn)(request)
    }

    /// Whether a response with `status` should not count against quota.
    pub fn skips_status(&self, status: u16) -> bool {
        if status < 400 {
            self.skip_successful_requests
        } else {
            self.skip_failed_requests
        }
    }

    /// Check that the window and threshold are both positive.
    pub fn validate(&self) -> Result<()> {
        if self.window.is_zero() {
            return Err(RatewardenError::Configuration(
                "window duration must be greater than zero".to_string(),
            ));
        }
        if self.max_requests == 0 {
            return Err(RatewardenError::Configuration(
                "max_requests must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for RateLimitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitPolicy")
            .field("window", &self.window)
            .field("max_requests", &self.max_requests)
            .field("message", &self.message)
            .field("skip_successful_requests", &self.skip_successful_requests)
            .field("skip_failed_requests", &self.skip_failed_requests)
            .finish_non_exhaustive()
    }
}

/// A policy as it appears in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Window length in milliseconds
    pub window_ms: u64,
    /// Requests admitted per key per window
    pub max_requests: u32,
    /// Rejection message
    #[serde(default = "default_message")]
    pub message: String,
    /// Key derivation strategy
    #[serde(default)]
    pub key: KeyStrategy,
    #[serde(default)]
    pub skip_successful_requests: bool,
    #[serde(default)]
    pub skip_failed_requests: bool,
}

fn default_message() -> String {
    DEFAULT_MESSAGE.to_string()
}

impl PolicyConfig {
    fn named(window: Duration, max_requests: u32, key: KeyStrategy, message: &str) -> Self {
        Self {
            window_ms: duration_ms(window),
            max_requests,
            message: message.to_string(),
            key,
            skip_successful_requests: false,
            skip_failed_requests: false,
        }
    }

    /// Build and validate the runtime policy.
    pub fn into_policy(self) -> Result<RateLimitPolicy> {
        let policy = RateLimitPolicy::new(Duration::from_millis(self.window_ms), self.max_requests)
            .with_message(self.message)
            .with_key_strategy(self.key)
            .skip_successful(self.skip_successful_requests)
            .skip_failed(self.skip_failed_requests);
        policy.validate()?;
        Ok(policy)
    }
}

/// Name of the limiter applied to all API traffic.
pub const GENERAL: &str = "general";
/// Name of the limiter on authentication endpoints.
pub const AUTH: &str = "auth";
/// Name of the per-minute API limiter.
pub const API: &str = "api";
/// Name of the upload limiter.
pub const UPLOAD: &str = "upload";
/// Name of the export limiter.
pub const EXPORT: &str = "export";

/// The stock set of named policies.
pub fn default_policies() -> BTreeMap<String, PolicyConfig> {
    const MINUTE: u64 = 60;

    let mut auth = PolicyConfig::named(
        Duration::from_secs(15 * MINUTE),
        5,
        KeyStrategy::IpUserAgent,
        "Too many authentication attempts, please try again later.",
    );
    // Successful logins don't burn attempts.
    auth.skip_successful_requests = true;

    BTreeMap::from([
        (
            GENERAL.to_string(),
            PolicyConfig::named(
                Duration::from_secs(15 * MINUTE),
                100,
                KeyStrategy::Ip,
                "Too many requests from this IP, please try again later.",
            ),
        ),
        (AUTH.to_string(), auth),
        (
            API.to_string(),
            PolicyConfig::named(
                Duration::from_secs(MINUTE),
                60,
                KeyStrategy::Ip,
                "API rate limit exceeded, please slow down.",
            ),
        ),
        (
            UPLOAD.to_string(),
            PolicyConfig::named(
                Duration::from_secs(60 * MINUTE),
                10,
                KeyStrategy::Ip,
                "Upload limit exceeded, please try again later.",
            ),
        ),
        (
            EXPORT.to_string(),
            PolicyConfig::named(
                Duration::from_secs(5 * MINUTE),
                3,
                KeyStrategy::Ip,
                "Export limit exceeded, please try again later.",
            ),
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ClientRequest {
        ClientRequest::from_ip("10.0.0.1".parse().unwrap()).with_user_agent("curl/8.0")
    }

    #[test]
    fn test_client_ip_prefers_forwarded_for() {
        let mut req = request();
        assert_eq!(req.client_ip(), "10.0.0.1");

        req.forwarded_for = Some("203.0.113.7, 10.0.0.254".to_string());
        assert_eq!(req.client_ip(), "203.0.113.7");

        assert_eq!(ClientRequest::default().client_ip(), "unknown");
    }

    #[test]
    fn test_key_strategies() {
        let req = request();
        assert_eq!(KeyStrategy::Ip.key_for(&req), "ip:10.0.0.1");
        assert_eq!(KeyStrategy::IpUserAgent.key_for(&req), "ip:10.0.0.1:ua:curl/8.0");
        assert_eq!(KeyStrategy::User.key_for(&req), "ip:10.0.0.1");
        assert_eq!(
            KeyStrategy::User.key_for(&req.clone().with_user("u-42")),
            "user:u-42"
        );
    }

    #[test]
    fn test_custom_key_fn() {
        let policy = RateLimitPolicy::new(Duration::from_secs(1), 1)
            .with_key_fn(|req| format!("tenant:{}", req.user_id.as_deref().unwrap_or("none")));
        assert_eq!(policy.key_for(&request()), "tenant:none");
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        assert!(RateLimitPolicy::new(Duration::ZERO, 10).validate().is_err());
        assert!(RateLimitPolicy::new(Duration::from_secs(1), 0).validate().is_err());
        assert!(RateLimitPolicy::new(Duration::from_secs(1), 1).validate().is_ok());
    }

    #[test]
    fn test_window_ms_saturates() {
        assert_eq!(RateLimitPolicy::new(Duration::from_secs(60), 1).window_ms(), 60_000);
        assert_eq!(RateLimitPolicy::new(Duration::MAX, 1).window_ms(), u64::MAX);
    }

    #[test]
    fn test_skips_status() {
        let policy = RateLimitPolicy::new(Duration::from_secs(1), 1).skip_successful(true);
        assert!(policy.skips_status(200));
        assert!(policy.skips_status(302));
        assert!(!policy.skips_status(401));

        let policy = RateLimitPolicy::new(Duration::from_secs(1), 1).skip_failed(true);
        assert!(!policy.skips_status(204));
        assert!(policy.skips_status(500));
    }

    #[test]
    fn test_parse_policy_config() {
        let yaml = r#"
window_ms: 60000
max_requests: 5
key: ip_user_agent
"#;
        let config: PolicyConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.key, KeyStrategy::IpUserAgent);
        assert_eq!(config.message, DEFAULT_MESSAGE);
        assert!(!config.skip_successful_requests);

        let policy = config.into_policy().unwrap();
        assert_eq!(policy.window, Duration::from_secs(60));
        assert_eq!(policy.max_requests, 5);
    }

    #[test]
    fn test_invalid_policy_config() {
        let config = PolicyConfig {
            window_ms: 0,
            max_requests: 5,
            message: default_message(),
            key: KeyStrategy::Ip,
            skip_successful_requests: false,
            skip_failed_requests: false,
        };
        assert!(matches!(
            config.into_policy(),
            Err(RatewardenError::Configuration(_))
        ));
    }

    #[test]
    fn test_default_policies() {
        let policies = default_policies();
        assert_eq!(policies.len(), 5);

        assert_eq!(policies[GENERAL].window_ms, 900_000);
        assert_eq!(policies[GENERAL].max_requests, 100);

        assert_eq!(policies[AUTH].max_requests, 5);
        assert_eq!(policies[AUTH].key, KeyStrategy::IpUserAgent);
        assert!(policies[AUTH].skip_successful_requests);

        assert_eq!(policies[API].window_ms, 60_000);
        assert_eq!(policies[API].max_requests, 60);
        assert_eq!(policies[UPLOAD].window_ms, 3_600_000);
        assert_eq!(policies[UPLOAD].max_requests, 10);
        assert_eq!(policies[EXPORT].window_ms, 300_000);
        assert_eq!(policies[EXPORT].max_requests, 3);
    }
}

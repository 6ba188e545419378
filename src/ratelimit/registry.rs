//! Named limiter instances.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::limiter::RateLimiter;
use super::policy::PolicyConfig;
use crate::error::{RatewardenError, Result};

/// A set of independent limiters, one per named policy.
///
/// Every limiter owns its own store; traffic counted by one never shows up in
/// another.
#[derive(Debug, Default, Clone)]
pub struct LimiterRegistry {
    limiters: BTreeMap<String, Arc<RateLimiter>>,
}

impl LimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build one limiter per configured policy.
    pub fn from_config(policies: &BTreeMap<String, PolicyConfig>) -> Result<Self> {
        let mut registry = Self::new();
        for (name, config) in policies {
            let policy = config.clone().into_policy().map_err(|e| {
                RatewardenError::Configuration(format!("policy '{}': {}", name, e))
            })?;

            info!(
                limiter = %name,
                window_ms = config.window_ms,
                max_requests = config.max_requests,
                key = ?config.key,
                "Rate limiter configured"
            );

            registry.insert(RateLimiter::new(policy)?.with_name(name.clone()));
        }
        Ok(registry)
    }

    /// Add a limiter under its own name, replacing any previous one.
    pub fn insert(&mut self, limiter: RateLimiter) -> Arc<RateLimiter> {
        let limiter = Arc::new(limiter);
        self.limiters
            .insert(limiter.name().to_string(), Arc::clone(&limiter));
        limiter
    }

    pub fn get(&self, name: &str) -> Option<Arc<RateLimiter>> {
        self.limiters.get(name).cloned()
    }

    /// Like [`get`](Self::get), but a missing limiter is an error.
    pub fn require(&self, name: &str) -> Result<Arc<RateLimiter>> {
        self.get(name)
            .ok_or_else(|| RatewardenError::UnknownLimiter(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.limiters.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<RateLimiter>)> {
        self.limiters.iter().map(|(name, limiter)| (name.as_str(), limiter))
    }

    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }

    /// Start the periodic sweep for every limiter.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_sweepers(&self, every: Duration) {
        for limiter in self.limiters.values() {
            limiter.spawn_sweeper(every);
        }
        info!(
            limiters = self.limiters.len(),
            interval_secs = every.as_secs(),
            "Rate limit sweepers started"
        );
    }
}

//! Core rate limiter implementation.
//!
//! This is a fixed-window counter, not a token bucket or sliding log: each key
//! gets a window that opens on its first request and closes `window` later.
//! A client can therefore land up to twice the threshold across a window
//! boundary.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use super::clock::{Clock, SystemClock};
use super::decision::Decision;
use super::policy::{ClientRequest, RateLimitPolicy};
use super::window::WindowEntry;
use crate::error::{RatewardenError, Result};

/// How often expired windows are purged by default.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Point-in-time view of a limiter's store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LimiterStats {
    /// Keys with an entry, expired or not
    pub tracked_keys: usize,
    /// Sum of admitted counts across all entries
    pub total_admitted_in_store: u64,
}

/// Per-key admission controller.
///
/// The store is sharded; each check holds the write lock of the key's shard
/// for its whole read-check-increment, so concurrent checks for one key can
/// never admit more than the threshold.
pub struct RateLimiter {
    name: String,
    policy: RateLimitPolicy,
    max_requests: AtomicU32,
    store: DashMap<String, WindowEntry>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a limiter on the system clock.
    pub fn new(policy: RateLimitPolicy) -> Result<Self> {
        Self::with_clock(policy, Arc::new(SystemClock))
    }

    /// Create a limiter on the given clock.
    pub fn with_clock(policy: RateLimitPolicy, clock: Arc<dyn Clock>) -> Result<Self> {
        policy.validate()?;
        Ok(Self {
            name: "default".to_string(),
            max_requests: AtomicU32::new(policy.max_requests),
            policy,
            store: DashMap::new(),
            clock,
        })
    }

    /// Create a limiter and start its periodic sweep.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(policy: RateLimitPolicy, sweep_interval: Duration) -> Result<Arc<Self>> {
        let limiter = Arc::new(Self::new(policy)?);
        limiter.spawn_sweeper(sweep_interval);
        Ok(limiter)
    }

    /// Label used in log output.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    /// The threshold currently in force.
    pub fn limit(&self) -> u32 {
        self.max_requests.load(Ordering::Acquire)
    }

    /// Override the threshold for subsequent checks.
    ///
    /// Counts already recorded are kept as they are.
    pub fn set_max_requests(&self, max_requests: u32) -> Result<()> {
        if max_requests == 0 {
            return Err(RatewardenError::Configuration(
                "max_requests must be greater than zero".to_string(),
            ));
        }
        self.max_requests.store(max_requests, Ordering::Release);
        debug!(limiter = %self.name, max_requests, "Rate limit threshold overridden");
        Ok(())
    }

    /// Check a request, deriving its key from the policy.
    pub fn check(&self, request: &ClientRequest) -> Decision {
        let key = self.policy.key_for(request);
        self.check_key(&key)
    }

    /// Check and count one request for `key`.
    pub fn check_key(&self, key: &str) -> Decision {
        let now = self.clock.now_millis();
        let limit = self.limit();
        let window = self.policy.window;

        trace!(limiter = %self.name, key, "Checking rate limit");

        let mut entry = self.store.entry(key.to_string()).or_insert_with(|| {
            debug!(limiter = %self.name, key, "Opening rate limit window");
            WindowEntry::new(now, window)
        });

        if entry.is_expired(now) {
            debug!(limiter = %self.name, key, "Rate limit window expired, opening a new one");
            *entry = WindowEntry::new(now, window);
        }

        if entry.count >= limit {
            let retry_after = entry.retry_after_secs(now);
            debug!(
                limiter = %self.name,
                key,
                count = entry.count,
                limit,
                retry_after,
                "Rate limit exceeded"
            );
            return Decision {
                key: key.to_string(),
                admitted: false,
                limit,
                remaining: entry.remaining(limit),
                reset_at_epoch_secs: entry.reset_at_epoch_secs(),
                window_reset_at_ms: entry.reset_at_ms,
                retry_after_secs: Some(retry_after),
                message: Some(self.policy.message.clone()),
            };
        }

        entry.count += 1;

        Decision {
            key: key.to_string(),
            admitted: true,
            limit,
            remaining: entry.remaining(limit),
            reset_at_epoch_secs: entry.reset_at_epoch_secs(),
            window_reset_at_ms: entry.reset_at_ms,
            retry_after_secs: None,
            message: None,
        }
    }

    /// Quota left for `key` without counting anything.
    ///
    /// Absent and expired keys report the full threshold.
    pub fn get_remaining(&self, key: &str) -> u32 {
        let now = self.clock.now_millis();
        let limit = self.limit();
        match self.store.get(key) {
            Some(entry) if !entry.is_expired(now) => entry.remaining(limit),
            _ => limit,
        }
    }

    /// Forget `key` entirely. Resetting an unknown key does nothing.
    pub fn reset(&self, key: &str) {
        if self.store.remove(key).is_some() {
            debug!(limiter = %self.name, key, "Rate limit entry reset");
        }
    }

    /// Remove every entry whose window has ended. Returns how many went.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_millis();
        let mut removed = 0;
        self.store.retain(|_, entry| {
            if entry.is_expired(now) {
                removed += 1;
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn stats(&self) -> LimiterStats {
        let mut stats = LimiterStats {
            tracked_keys: 0,
            total_admitted_in_store: 0,
        };
        for entry in self.store.iter() {
            stats.tracked_keys += 1;
            stats.total_admitted_in_store += u64::from(entry.count);
        }
        stats
    }

    /// Post-response hook for the skip-successful / skip-failed options.
    ///
    /// Gives back the admission recorded by `decision` when the policy says
    /// responses with `status` don't count. Rejected decisions were never
    /// counted, and a refund only applies within the window the decision was
    /// made in. Returns whether a refund happened.
    pub fn adjust_for_outcome(&self, decision: &Decision, status: u16) -> bool {
        if !decision.admitted || !self.policy.skips_status(status) {
            return false;
        }

        match self.store.get_mut(&decision.key) {
            Some(mut entry)
                if entry.reset_at_ms == decision.window_reset_at_ms && entry.count > 0 =>
            {
                entry.count -= 1;
                trace!(limiter = %self.name, key = %decision.key, status, "Refunded admission");
                true
            }
            _ => false,
        }
    }

    /// Spawn the periodic sweep on the current tokio runtime.
    ///
    /// The task only holds a weak reference and stops once the limiter is
    /// dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let every = if every.is_zero() {
            DEFAULT_SWEEP_INTERVAL
        } else {
            every
        };
        let weak = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(limiter) = weak.upgrade() else {
                    break;
                };
                let removed = limiter.sweep();
                if removed > 0 {
                    debug!(
                        limiter = %limiter.name,
                        removed,
                        tracked = limiter.store.len(),
                        "Swept expired rate limit entries"
                    );
                }
            }
        })
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .field("limit", &self.limit())
            .field("tracked_keys", &self.store.len())
            .finish()
    }
}

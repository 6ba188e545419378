//! The outcome of a single admission check.

use serde::Serialize;

/// Result of [`RateLimiter::check`](super::RateLimiter::check).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// The key the request was counted under
    pub key: String,
    /// Whether the request may proceed
    pub admitted: bool,
    /// The threshold in force when the check ran
    pub limit: u32,
    /// Admissions left in the current window
    pub remaining: u32,
    /// Window end, epoch seconds rounded up
    pub reset_at_epoch_secs: u64,
    /// Window end in epoch milliseconds; identifies the window for refunds
    pub window_reset_at_ms: u64,
    /// Seconds to wait before retrying, set on rejection
    pub retry_after_secs: Option<u64>,
    /// Rejection message, set on rejection
    pub message: Option<String>,
}

impl Decision {
    /// Whether the request was turned away.
    pub fn is_rejected(&self) -> bool {
        !self.admitted
    }
}

/// JSON body sent with a 429 response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionBody {
    pub success: bool,
    pub error: String,
    pub retry_after: u64,
    pub limit: u32,
    pub window_ms: u64,
}

impl RejectionBody {
    pub fn new(decision: &Decision, window_ms: u64) -> Self {
        Self {
            success: false,
            error: decision.message.clone().unwrap_or_default(),
            retry_after: decision.retry_after_secs.unwrap_or_default(),
            limit: decision.limit,
            window_ms,
        }
    }
}

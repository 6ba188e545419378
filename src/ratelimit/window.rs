//! Per-key fixed window accounting.

use std::time::Duration;

/// Request count for one key within its current fixed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowEntry {
    /// Requests admitted so far in this window
    pub count: u32,
    /// Epoch milliseconds at which the window ends
    pub reset_at_ms: u64,
}

impl WindowEntry {
    /// Open a fresh window starting at `now_ms`.
    pub fn new(now_ms: u64, window: Duration) -> Self {
        Self {
            count: 0,
            reset_at_ms: now_ms.saturating_add(duration_ms(window)),
        }
    }

    /// Whether the window has ended. The reset instant itself belongs to the
    /// next window.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.reset_at_ms <= now_ms
    }

    /// Quota left under `limit`.
    pub fn remaining(&self, limit: u32) -> u32 {
        limit.saturating_sub(self.count)
    }

    /// Whole seconds until the window resets, rounded up.
    pub fn retry_after_secs(&self, now_ms: u64) -> u64 {
        ceil_div_1000(self.reset_at_ms.saturating_sub(now_ms))
    }

    /// The reset instant in epoch seconds, rounded up.
    pub fn reset_at_epoch_secs(&self) -> u64 {
        ceil_div_1000(self.reset_at_ms)
    }
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
pub fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn ceil_div_1000(ms: u64) -> u64 {
    ms.div_ceil(1000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_window() {
        let entry = WindowEntry::new(10_000, Duration::from_secs(1));
        assert_eq!(entry.count, 0);
        assert_eq!(entry.reset_at_ms, 11_000);
        assert_eq!(entry.remaining(3), 3);
    }

    #[test]
    fn test_expiry_boundary_is_inclusive() {
        let entry = WindowEntry::new(0, Duration::from_millis(1000));
        assert!(!entry.is_expired(999));
        assert!(entry.is_expired(1000));
        assert!(entry.is_expired(1001));
    }

    #[test]
    fn test_rounding_up_to_seconds() {
        let entry = WindowEntry::new(10_500, Duration::from_millis(1000));
        assert_eq!(entry.reset_at_epoch_secs(), 12);
        assert_eq!(entry.retry_after_secs(10_500), 1);
        assert_eq!(entry.retry_after_secs(11_499), 1);
        assert_eq!(entry.retry_after_secs(11_500), 0);
    }

    #[test]
    fn test_oversized_window_saturates() {
        assert_eq!(duration_ms(Duration::from_millis(1500)), 1500);
        assert_eq!(duration_ms(Duration::MAX), u64::MAX);

        let entry = WindowEntry::new(1_000, Duration::MAX);
        assert_eq!(entry.reset_at_ms, u64::MAX);
        assert!(!entry.is_expired(1_000_000));
    }

    #[test]
    fn test_remaining_saturates() {
        let entry = WindowEntry {
            count: 7,
            reset_at_ms: 0,
        };
        assert_eq!(entry.remaining(5), 0);
    }
}

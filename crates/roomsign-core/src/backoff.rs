//! # Sync Scheduling
//!
//! Computes `next_sync_at` after a run.
//!
//! ## Failure Backoff
//! ```text
//! consecutive_errors:   1     2     3     4     5     6     7+
//! delay:               1m    2m    4m    8m   16m   32m   60m (cap)
//! ```

use chrono::{DateTime, Duration, Utc};

/// Refresh interval for calendars that do not configure one.
pub const DEFAULT_SYNC_INTERVAL_SECS: i64 = 300;

/// Shortest delay between two syncs of the same calendar.
pub const MIN_SYNC_DELAY_SECS: i64 = 60;

/// Longest failure backoff.
pub const MAX_BACKOFF_SECS: i64 = 60 * 60;

/// Backoff after `consecutive_errors` failures in a row.
///
/// Values below 1 are treated as 1.
pub fn retry_delay(consecutive_errors: i64) -> Duration {
    let exponent = (consecutive_errors.max(1) - 1).min(32) as u32;
    let secs = MIN_SYNC_DELAY_SECS.saturating_mul(1i64 << exponent);
    Duration::seconds(secs.min(MAX_BACKOFF_SECS))
}

/// `next_sync_at` after a failed run.
pub fn next_sync_after_failure(now: DateTime<Utc>, consecutive_errors: i64) -> DateTime<Utc> {
    now + retry_delay(consecutive_errors)
}

/// `next_sync_at` after a successful run.
///
/// Non-positive or tiny intervals are clamped to [`MIN_SYNC_DELAY_SECS`].
pub fn next_sync_after_success(now: DateTime<Utc>, sync_interval_secs: i64) -> DateTime<Utc> {
    now + Duration::seconds(sync_interval_secs.max(MIN_SYNC_DELAY_SECS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_doubles_then_caps() {
        let secs: Vec<i64> = (1..=8).map(|n| retry_delay(n).num_seconds()).collect();
        assert_eq!(secs, vec![60, 120, 240, 480, 960, 1920, 3600, 3600]);
    }

    #[test]
    fn test_retry_delay_never_below_minimum() {
        assert_eq!(retry_delay(0).num_seconds(), 60);
        assert_eq!(retry_delay(-3).num_seconds(), 60);
    }

    #[test]
    fn test_retry_delay_huge_counts_do_not_overflow() {
        assert_eq!(retry_delay(i64::MAX).num_seconds(), MAX_BACKOFF_SECS);
    }

    #[test]
    fn test_next_sync_after_success_uses_interval() {
        let now = Utc::now();
        assert_eq!(next_sync_after_success(now, 900) - now, Duration::seconds(900));
        assert_eq!(next_sync_after_success(now, 5) - now, Duration::seconds(60));
    }

    #[test]
    fn test_next_sync_after_failure_grows() {
        let now = Utc::now();
        assert!(next_sync_after_failure(now, 3) > next_sync_after_failure(now, 2));
    }
}

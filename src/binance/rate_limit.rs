// =============================================================================
// Request-weight tracker — keeps REST usage under the Binance weight budget
// =============================================================================
//
// Every Binance REST response reports the weight used in the current minute
// through `X-MBX-USED-WEIGHT-1M`. The tracker keeps the last reported value
// together with the UTC minute it was reported in, and refuses requests that
// would push it past a hard cap kept below the exchange's own limit. Binance
// resets the counter on each minute boundary, so a value from an earlier
// minute counts as zero.
// =============================================================================

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

use tracing::{debug, warn};

const WINDOW_MS: i64 = 60_000;

fn current_window() -> i64 {
    chrono::Utc::now().timestamp_millis().div_euclid(WINDOW_MS)
}

pub struct RateLimitTracker {
    used_weight_1m: AtomicU32,
    /// Minute index (`epoch_ms / 60_000`) of the last header update.
    window: AtomicI64,
    hard_limit: u32,
}

impl RateLimitTracker {
    /// `hard_limit` is the weight ceiling at which requests are refused.
    pub fn new(hard_limit: u32) -> Self {
        Self {
            used_weight_1m: AtomicU32::new(0),
            window: AtomicI64::new(i64::MIN),
            hard_limit,
        }
    }

    fn warn_threshold(&self) -> u32 {
        self.hard_limit / 5 * 4
    }

    pub fn update_from_headers(&self, headers: &reqwest::header::HeaderMap) {
        self.update_in_window(headers, current_window());
    }

    fn update_in_window(&self, headers: &reqwest::header::HeaderMap, window: i64) {
        let Some(w) = headers
            .get("X-MBX-USED-WEIGHT-1M")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u32>().ok())
        else {
            return;
        };

        let prev = self.weight_in_window(window);
        self.window.store(window, Ordering::Relaxed);
        self.used_weight_1m.store(w, Ordering::Relaxed);
        let threshold = self.warn_threshold();
        if w >= threshold && prev < threshold {
            warn!(
                used_weight = w,
                hard_limit = self.hard_limit,
                "request weight crossed warning threshold"
            );
        }
        debug!(used_weight_1m = w, "request weight updated from header");
    }

    /// Whether `weight` more can be spent without exceeding the hard limit.
    pub fn can_send_request(&self, weight: u32) -> bool {
        self.can_send_in_window(weight, current_window())
    }

    fn can_send_in_window(&self, weight: u32, window: i64) -> bool {
        let current = self.weight_in_window(window);
        let allowed = current + weight <= self.hard_limit;
        if !allowed {
            warn!(
                current_weight = current,
                requested_weight = weight,
                hard_limit = self.hard_limit,
                "request blocked: would exceed weight limit"
            );
        }
        allowed
    }

    pub fn used_weight(&self) -> u32 {
        self.weight_in_window(current_window())
    }

    /// Reported weight, or zero once its minute has rolled over.
    fn weight_in_window(&self, window: i64) -> u32 {
        if self.window.load(Ordering::Relaxed) == window {
            self.used_weight_1m.load(Ordering::Relaxed)
        } else {
            0
        }
    }
}

impl std::fmt::Debug for RateLimitTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitTracker")
            .field("used_weight_1m", &self.used_weight())
            .field("hard_limit", &self.hard_limit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue};

    fn headers(weight: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert("X-MBX-USED-WEIGHT-1M", HeaderValue::from_str(weight).unwrap());
        h
    }

    const MINUTE: i64 = 28_333_333;

    #[test]
    fn tracks_reported_weight() {
        let tracker = RateLimitTracker::new(1000);
        assert!(tracker.can_send_in_window(20, MINUTE));

        tracker.update_in_window(&headers("990"), MINUTE);
        assert_eq!(tracker.weight_in_window(MINUTE), 990);
        assert!(tracker.can_send_in_window(10, MINUTE));
        assert!(!tracker.can_send_in_window(11, MINUTE));
    }

    #[test]
    fn ignores_missing_or_garbled_header() {
        let tracker = RateLimitTracker::new(1000);
        tracker.update_in_window(&headers("500"), MINUTE);
        tracker.update_in_window(&HeaderMap::new(), MINUTE);
        tracker.update_in_window(&headers("lots"), MINUTE);
        assert_eq!(tracker.weight_in_window(MINUTE), 500);
    }

    #[test]
    fn refusal_clears_when_minute_rolls_over() {
        let tracker = RateLimitTracker::new(2000);
        tracker.update_in_window(&headers("1999"), MINUTE);
        for _ in 0..1000 {
            assert!(!tracker.can_send_in_window(2, MINUTE));
        }

        // No response arrived in between; the new minute alone frees the budget.
        assert!(tracker.can_send_in_window(2, MINUTE + 1));
        assert_eq!(tracker.weight_in_window(MINUTE + 1), 0);

        tracker.update_in_window(&headers("40"), MINUTE + 1);
        assert_eq!(tracker.weight_in_window(MINUTE + 1), 40);
    }

    #[test]
    fn live_clock_starts_with_empty_budget() {
        let tracker = RateLimitTracker::new(2000);
        assert_eq!(tracker.used_weight(), 0);
        assert!(tracker.can_send_request(2000));
        tracker.update_from_headers(&headers("10"));
        assert!(tracker.used_weight() <= 10);
    }
}

// =============================================================================
// Rate-Limit Guard — tracks REST usage to stay clear of 429s
// =============================================================================
//
// The exchange enforces a request-weight budget per minute and an order
// budget per 10 seconds.  The guard reads the used-weight response header
// after every request and keeps atomic counters that any task may query
// lock-free.  Windows self-roll; no external reset timers are required.
// =============================================================================

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};

/// Weight ceiling we impose on ourselves (exchange limit is higher).
const WEIGHT_CEILING_1M: u32 = 2000;
/// Orders allowed per 10-second window.
const ORDER_CEILING_10S: u32 = 50;

/// Response header carrying the exchange's own used-weight accounting.
const USED_WEIGHT_HEADER: &str = "X-MBX-USED-WEIGHT-1M";

/// Thread-safe usage tracker backed by atomics.
pub struct RateLimitGuard {
    used_weight_1m: AtomicU32,
    weight_window_start_ms: AtomicI64,
    orders_10s: AtomicU32,
    order_window_start_ms: AtomicI64,
}

/// Serialisable view of current usage for the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitSnapshot {
    pub used_weight_1m: u32,
    pub orders_10s: u32,
}

impl RateLimitGuard {
    pub fn new() -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            used_weight_1m: AtomicU32::new(0),
            weight_window_start_ms: AtomicI64::new(now),
            orders_10s: AtomicU32::new(0),
            order_window_start_ms: AtomicI64::new(now),
        }
    }

    /// Roll a window if `width_ms` has elapsed since its start.
    fn roll_window(start: &AtomicI64, counter: &AtomicU32, width_ms: i64, now_ms: i64) {
        let started = start.load(Ordering::Relaxed);
        if now_ms - started >= width_ms {
            start.store(now_ms, Ordering::Relaxed);
            counter.store(0, Ordering::Relaxed);
        }
    }

    /// Whether `weight` more units fit in the current minute. Also charges
    /// the weight when allowed, so callers invoke this once per request.
    pub fn try_spend(&self, weight: u32) -> bool {
        let now = Utc::now().timestamp_millis();
        Self::roll_window(
            &self.weight_window_start_ms,
            &self.used_weight_1m,
            60_000,
            now,
        );

        let current = self.used_weight_1m.load(Ordering::Relaxed);
        if current + weight > WEIGHT_CEILING_1M {
            warn!(
                current,
                requested = weight,
                ceiling = WEIGHT_CEILING_1M,
                "request deferred: weight ceiling"
            );
            return false;
        }
        self.used_weight_1m.fetch_add(weight, Ordering::Relaxed);
        true
    }

    /// Whether another order fits in the current 10-second window; charges
    /// the slot when allowed.
    pub fn try_place_order(&self) -> bool {
        let now = Utc::now().timestamp_millis();
        Self::roll_window(&self.order_window_start_ms, &self.orders_10s, 10_000, now);

        let current = self.orders_10s.load(Ordering::Relaxed);
        if current >= ORDER_CEILING_10S {
            warn!(current, ceiling = ORDER_CEILING_10S, "order deferred: order ceiling");
            return false;
        }
        self.orders_10s.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Adopt the exchange's own accounting from response headers; it is
    /// authoritative over our local estimate.
    pub fn note_response_headers(&self, headers: &reqwest::header::HeaderMap) {
        if let Some(weight) = headers
            .get(USED_WEIGHT_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u32>().ok())
        {
            self.used_weight_1m.store(weight, Ordering::Relaxed);
            debug!(used_weight_1m = weight, "rate-limit weight adopted from header");
        }
    }

    pub fn snapshot(&self) -> RateLimitSnapshot {
        RateLimitSnapshot {
            used_weight_1m: self.used_weight_1m.load(Ordering::Relaxed),
            orders_10s: self.orders_10s.load(Ordering::Relaxed),
        }
    }
}

impl Default for RateLimitGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RateLimitGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snap = self.snapshot();
        f.debug_struct("RateLimitGuard")
            .field("used_weight_1m", &snap.used_weight_1m)
            .field("orders_10s", &snap.orders_10s)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spending_accumulates_until_ceiling() {
        let guard = RateLimitGuard::new();
        assert!(guard.try_spend(1500));
        assert!(guard.try_spend(400));
        // 1900 + 200 would exceed 2000.
        assert!(!guard.try_spend(200));
        assert!(guard.try_spend(100));
        assert_eq!(guard.snapshot().used_weight_1m, 2000);
    }

    #[test]
    fn order_window_caps_at_ceiling() {
        let guard = RateLimitGuard::new();
        for _ in 0..ORDER_CEILING_10S {
            assert!(guard.try_place_order());
        }
        assert!(!guard.try_place_order());
    }

    #[test]
    fn headers_override_local_estimate() {
        let guard = RateLimitGuard::new();
        assert!(guard.try_spend(500));

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(USED_WEIGHT_HEADER, "42".parse().unwrap());
        guard.note_response_headers(&headers);

        assert_eq!(guard.snapshot().used_weight_1m, 42);
    }
}

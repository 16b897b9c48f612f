//! Token Bucket
//!
//! Permits refill continuously at `permits_per_second` and are stored up to
//! `max_permits`, so idle time accumulates into a burst allowance. Stored
//! permits are fractional: a rate below one per second still stores a full
//! burst.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

use crate::rules::RateLimit;

/// Tolerance for float accumulation when comparing stored permits
const PERMIT_EPSILON: f64 = 1e-9;

/// Token bucket with fractional refill and grace permits
#[derive(Debug)]
pub struct TokenBucket {
    /// Refill rate (permits per second)
    permits_per_second: f64,

    /// Maximum stored permits (burst capacity)
    max_permits: f64,

    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    stored: f64,
    last_refill: Instant,
    grace_remaining: u32,
}

impl TokenBucket {
    /// Create a full bucket refilling at `permits_per_second` that stores at
    /// most `max_burst_seconds` worth of permits.
    pub fn new(permits_per_second: f64, max_burst_seconds: f64, grace_permits: u32) -> Self {
        let permits_per_second = permits_per_second.max(0.0);
        Self::with_capacity(
            permits_per_second,
            permits_per_second * max_burst_seconds.max(0.0),
            grace_permits,
        )
    }

    /// Create a bucket for a configured rate: refills at `N / unit`, stores
    /// at most `burst` permits. A zero rate stores nothing.
    pub fn from_limit(limit: &RateLimit, grace_permits: u32) -> Self {
        let rate = limit.permits_per_second();
        let capacity = if rate > 0.0 { limit.burst as f64 } else { 0.0 };
        Self::with_capacity(rate, capacity, grace_permits)
    }

    fn with_capacity(permits_per_second: f64, max_permits: f64, grace_permits: u32) -> Self {
        Self {
            permits_per_second,
            max_permits,
            state: Mutex::new(BucketState {
                stored: max_permits,
                last_refill: Instant::now(),
                grace_remaining: grace_permits,
            }),
        }
    }

    /// Take one permit without blocking
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    /// Take one permit as of `now`
    pub fn try_acquire_at(&self, now: Instant) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state, now);

        if state.grace_remaining > 0 {
            state.grace_remaining -= 1;
            return true;
        }

        if state.stored + PERMIT_EPSILON >= 1.0 {
            state.stored = (state.stored - 1.0).max(0.0);
            true
        } else {
            false
        }
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill);
        if elapsed.is_zero() {
            return;
        }
        state.stored =
            (state.stored + elapsed.as_secs_f64() * self.permits_per_second).min(self.max_permits);
        state.last_refill = now;
    }

    /// Permits currently stored (refilled as of now)
    pub fn available(&self) -> f64 {
        self.available_at(Instant::now())
    }

    pub fn available_at(&self, now: Instant) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state, now);
        state.stored
    }

    /// Time until one permit is available; `None` if the bucket never refills
    pub fn time_until_available(&self) -> Option<Duration> {
        let stored = self.available();
        if stored + PERMIT_EPSILON >= 1.0 {
            return Some(Duration::ZERO);
        }
        if self.permits_per_second <= 0.0 || self.max_permits + PERMIT_EPSILON < 1.0 {
            return None;
        }
        Some(Duration::from_secs_f64(
            (1.0 - stored) / self.permits_per_second,
        ))
    }

    /// Whether the bucket has refilled to capacity as of `now`, at which
    /// point it behaves like a freshly built one
    pub fn is_full_at(&self, now: Instant) -> bool {
        self.available_at(now) + PERMIT_EPSILON >= self.max_permits
    }

    pub fn permits_per_second(&self) -> f64 {
        self.permits_per_second
    }

    pub fn max_permits(&self) -> f64 {
        self.max_permits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::parse::parse_rate;

    fn drain(bucket: &TokenBucket, now: Instant) -> usize {
        let mut granted = 0;
        while bucket.try_acquire_at(now) {
            granted += 1;
            assert!(granted <= 10_000, "bucket never drained");
        }
        granted
    }

    #[test]
    fn test_bucket_starts_full() {
        let bucket = TokenBucket::from_limit(&parse_rate("t", "10 / min burst 5").unwrap(), 0);
        let now = Instant::now();
        assert_eq!(drain(&bucket, now), 5);
    }

    #[test]
    fn test_burst_cap_after_idle() {
        let limit = parse_rate("t", "12 / min burst 4").unwrap();
        let bucket = TokenBucket::from_limit(&limit, 0);
        let t0 = Instant::now();
        drain(&bucket, t0);

        // 4 permits at 0.2/s need 20 seconds; idling longer does not add more
        let later = t0 + Duration::from_secs_f64(limit.max_burst_seconds() * 3.0);
        assert_eq!(drain(&bucket, later), 4);
    }

    #[test]
    fn test_sub_one_per_second_rate_stores_burst() {
        let bucket = TokenBucket::new(0.2, 20.0, 0);
        let t0 = Instant::now();
        drain(&bucket, t0);

        let t1 = t0 + Duration::from_secs(20);
        for _ in 0..4 {
            assert!(bucket.try_acquire_at(t1));
        }
        assert!(!bucket.try_acquire_at(t1));
    }

    #[test]
    fn test_partial_refill() {
        let bucket = TokenBucket::new(1.0, 10.0, 0);
        let t0 = Instant::now();
        drain(&bucket, t0);

        assert!(!bucket.try_acquire_at(t0 + Duration::from_millis(500)));
        assert!(bucket.try_acquire_at(t0 + Duration::from_millis(1000)));
        assert!(!bucket.try_acquire_at(t0 + Duration::from_millis(1000)));
    }

    #[test]
    fn test_grace_permits_do_not_consume() {
        let bucket = TokenBucket::new(1.0, 2.0, 3);
        let now = Instant::now();
        for _ in 0..3 {
            assert!(bucket.try_acquire_at(now));
        }
        assert!((bucket.available_at(now) - 2.0).abs() < 1e-9);
        assert_eq!(drain(&bucket, now), 2);
    }

    #[test]
    fn test_full_after_refill() {
        let bucket = TokenBucket::new(1.0, 4.0, 0);
        let t0 = Instant::now();
        assert!(bucket.is_full_at(t0));

        assert!(bucket.try_acquire_at(t0));
        assert!(!bucket.is_full_at(t0));
        assert!(!bucket.is_full_at(t0 + Duration::from_millis(500)));
        assert!(bucket.is_full_at(t0 + Duration::from_secs(1)));
    }

    #[test]
    fn test_zero_rate_denies() {
        let bucket = TokenBucket::from_limit(&parse_rate("t", "0 / hour burst 5").unwrap(), 0);
        assert!(!bucket.try_acquire());
        assert_eq!(bucket.time_until_available(), None);
    }

    #[test]
    fn test_time_until_available() {
        let bucket = TokenBucket::new(10.0, 10.0, 0);
        assert_eq!(bucket.time_until_available(), Some(Duration::ZERO));

        let now = Instant::now();
        drain(&bucket, now);
        let wait = bucket.time_until_available().unwrap();
        assert!(wait <= Duration::from_millis(100));
    }
}

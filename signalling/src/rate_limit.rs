//! Rate-limiting collaborator boundary: per-IP and per-authenticated-user
//! caps applied at WS upgrade and on select mutating events. Only the trait
//! boundary and an in-memory default are owned here; production
//! rate-limiting *internals* are an external collaborator's concern.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

pub trait ConnectionRateLimiter: Send + Sync {
    /// Returns `true` if the caller identified by `key` is within its cap.
    fn check(&self, key: &str) -> bool;
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Fixed-capacity token bucket per key, refilled continuously at
/// `capacity / window`. Used as the dev/test default; a production
/// deployment is expected to swap in a distributed limiter.
pub struct TokenBucketRateLimiter {
    capacity: f64,
    refill_per_second: f64,
    buckets: DashMap<String, Mutex<Bucket>>,
}

impl TokenBucketRateLimiter {
    pub fn new(capacity_per_minute: u32) -> Self {
        Self {
            capacity: capacity_per_minute as f64,
            refill_per_second: capacity_per_minute as f64 / 60.0,
            buckets: DashMap::new(),
        }
    }
}

impl ConnectionRateLimiter for TokenBucketRateLimiter {
    fn check(&self, key: &str) -> bool {
        let entry = self
            .buckets
            .entry(key.to_owned())
            .or_insert_with(|| Mutex::new(Bucket { tokens: self.capacity, last_refill: Instant::now() }));
        let mut bucket = entry.lock();

        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_second).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_once_capacity_is_exhausted() {
        let limiter = TokenBucketRateLimiter::new(2);
        assert!(limiter.check("ip-1"));
        assert!(limiter.check("ip-1"));
        assert!(!limiter.check("ip-1"));
    }

    #[test]
    fn buckets_are_independent_per_key() {
        let limiter = TokenBucketRateLimiter::new(1);
        assert!(limiter.check("ip-1"));
        assert!(limiter.check("ip-2"));
    }

    #[test]
    fn refills_over_time() {
        let limiter = TokenBucketRateLimiter::new(60);
        assert!(limiter.check("ip-1"));
        std::thread::sleep(Duration::from_millis(50));
        assert!(limiter.check("ip-1"));
    }
}

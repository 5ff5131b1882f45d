use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use std::time::Instant;

/// Token bucket per merchant. Process-local: replicas each hold their own
/// buckets, so the effective fleet-wide limit is approximate. Exactness is
/// reserved for the nonce store.
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    buckets: Mutex<HashMap<String, Bucket>>,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(capacity: u32, window: Duration) -> Self {
        Self {
            capacity: f64::from(capacity),
            refill_per_sec: f64::from(capacity) / window.as_secs_f64(),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Take one token for `key`, or report how long until one is available.
    pub fn check(&self, key: &str) -> Result<(), Duration> {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &str, now: Instant) -> Result<(), Duration> {
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: self.capacity,
            last_refill: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last_refill);
        bucket.tokens =
            (bucket.tokens + elapsed.as_secs_f64() * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            let wait = (1.0 - bucket.tokens) / self.refill_per_sec;
            Err(Duration::from_secs_f64(wait))
        }
    }

    /// Drop buckets that have refilled completely; they carry no state.
    pub fn prune(&self) {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        buckets.retain(|_, bucket| {
            let elapsed = now.saturating_duration_since(bucket.last_refill);
            bucket.tokens + elapsed.as_secs_f64() * self.refill_per_sec < self.capacity
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_up_to_capacity_then_reject() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        let now = Instant::now();

        for _ in 0..3 {
            limiter.check_at("m1", now).unwrap();
        }
        let retry_after = limiter.check_at("m1", now).unwrap_err();
        assert!(retry_after > Duration::ZERO);
    }

    #[test]
    fn tokens_refill_over_the_window() {
        let limiter = RateLimiter::new(60, Duration::from_secs(60));
        let now = Instant::now();

        for _ in 0..60 {
            limiter.check_at("m1", now).unwrap();
        }
        limiter.check_at("m1", now).unwrap_err();

        // One token per second at this rate.
        limiter.check_at("m1", now + Duration::from_secs(2)).unwrap();
    }

    #[test]
    fn merchants_do_not_share_buckets() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        let now = Instant::now();

        limiter.check_at("m1", now).unwrap();
        limiter.check_at("m1", now).unwrap_err();
        limiter.check_at("m2", now).unwrap();
    }
}

//! Per-key token bucket rate limiting.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use tokio::time::Instant;

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn full(capacity: f64) -> Self {
        Self {
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, capacity: f64, refill_per_sec: f64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * refill_per_sec).min(capacity);
        self.last_refill = now;
    }
}

/// Token buckets keyed by API key id.
///
/// Each key starts with `capacity` tokens and regains `refill_per_sec` per
/// second. A rejected request consumes nothing.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

impl RateLimiter {
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity: f64::from(capacity.max(1)),
            refill_per_sec: if refill_per_sec > 0.0 { refill_per_sec } else { 1.0 },
            buckets: Mutex::new(HashMap::new()),
        }
    }

    fn buckets(&self) -> MutexGuard<'_, HashMap<String, TokenBucket>> {
        self.buckets.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take one token for `key`, or return how long until one is available.
    pub fn check(&self, key: &str) -> Result<(), Duration> {
        let mut buckets = self.buckets();
        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::full(self.capacity));
        bucket.refill(self.capacity, self.refill_per_sec);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            let needed = 1.0 - bucket.tokens;
            Err(Duration::from_secs_f64(needed / self.refill_per_sec))
        }
    }

    /// Drop buckets that have refilled completely. Returns how many were removed.
    pub fn prune_idle(&self) -> usize {
        let mut buckets = self.buckets();
        let before = buckets.len();
        buckets.retain(|_, bucket| {
            bucket.refill(self.capacity, self.refill_per_sec);
            bucket.tokens < self.capacity
        });
        before - buckets.len()
    }

    pub fn tracked_keys(&self) -> usize {
        self.buckets().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn exhausts_then_refills() {
        let limiter = RateLimiter::new(2, 1.0);
        assert!(limiter.check("k").is_ok());
        assert!(limiter.check("k").is_ok());

        let retry_after = limiter.check("k").unwrap_err();
        assert!(retry_after <= Duration::from_secs(1));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.check("k").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn rejection_does_not_consume_capacity() {
        let limiter = RateLimiter::new(1, 2.0);
        limiter.check("k").unwrap();
        for _ in 0..5 {
            assert!(limiter.check("k").is_err());
        }
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(limiter.check("k").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_independent_and_full_buckets_are_pruned() {
        let limiter = RateLimiter::new(1, 1.0);
        limiter.check("a").unwrap();
        assert!(limiter.check("b").is_ok());
        assert_eq!(limiter.tracked_keys(), 2);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(limiter.prune_idle(), 2);
        assert_eq!(limiter.tracked_keys(), 0);
    }
}

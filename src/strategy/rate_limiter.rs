//! Token bucket for signed trading requests.
//!
//! Tokens refill continuously at `per_second`; a caller that finds the bucket
//! empty sleeps exactly until the next token is due instead of polling.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Clone)]
pub struct RateLimiter {
    bucket: Arc<Mutex<Bucket>>,
    per_second: f64,
    capacity: f64,
}

struct Bucket {
    tokens: f64,
    refilled_at: Instant,
    granted: u64,
    throttled: u64,
}

impl Bucket {
    fn refill(&mut self, now: Instant, per_second: f64, capacity: f64) {
        let earned = now.duration_since(self.refilled_at).as_secs_f64() * per_second;
        self.tokens = (self.tokens + earned).min(capacity);
        self.refilled_at = now;
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimiterStats {
    pub available: f64,
    pub granted: u64,
    /// Acquisitions that had to wait at least once.
    pub throttled: u64,
}

impl RateLimiter {
    /// `per_second` sustained requests with bursts up to `burst`. Both are
    /// raised to at least one.
    pub fn new(per_second: u32, burst: u32) -> Self {
        let capacity = f64::from(burst.max(1));
        Self {
            bucket: Arc::new(Mutex::new(Bucket {
                tokens: capacity,
                refilled_at: Instant::now(),
                granted: 0,
                throttled: 0,
            })),
            per_second: f64::from(per_second.max(1)),
            capacity,
        }
    }

    pub async fn acquire(&self) {
        let mut waited = false;
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                bucket.refill(Instant::now(), self.per_second, self.capacity);
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    bucket.granted += 1;
                    if waited {
                        bucket.throttled += 1;
                    }
                    return;
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / self.per_second)
            };
            waited = true;
            debug!(wait_ms = wait.as_millis() as u64, per_second = self.per_second, "order rate limit reached");
            tokio::time::sleep(wait).await;
        }
    }

    pub async fn stats(&self) -> RateLimiterStats {
        let mut bucket = self.bucket.lock().await;
        bucket.refill(Instant::now(), self.per_second, self.capacity);
        RateLimiterStats {
            available: bucket.tokens,
            granted: bucket.granted,
            throttled: bucket.throttled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_burst_then_throttle() {
        let limiter = RateLimiter::new(20, 3);
        for _ in 0..3 {
            limiter.acquire().await;
        }
        let stats = limiter.stats().await;
        assert!(stats.available < 1.0);
        assert_eq!(stats.granted, 3);
        assert_eq!(stats.throttled, 0);

        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert_eq!(limiter.stats().await.throttled, 1);
    }
}

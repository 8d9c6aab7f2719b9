//! Token bucket rate limiter with sub-second granularity
//!
//! Paces the publish call rate to a configured messages/second ceiling.
//! Acquiring a token blocks the publishing worker until one is available;
//! messages are never dropped for rate-limiting reasons.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::trace;

/// Token bucket state
#[derive(Debug)]
struct TokenBucket {
    /// Current number of tokens available
    tokens: f64,
    /// Maximum capacity (burst limit)
    capacity: f64,
    /// Tokens added per second
    refill_rate: f64,
    /// Last time tokens were updated
    last_update: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_rate,
            last_update: Instant::now(),
        }
    }

    /// Try to consume one token, returning true if successful
    fn try_consume(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Time until one token will be available at the current refill rate
    fn time_to_token(&self) -> Duration {
        let deficit = 1.0 - self.tokens;
        Duration::from_secs_f64(deficit / self.refill_rate)
    }

    /// Refill tokens based on elapsed time (sub-second precision)
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update);
        self.last_update = now;
        let tokens_to_add = self.refill_rate * elapsed.as_secs_f64();
        self.tokens = (self.tokens + tokens_to_add).min(self.capacity);
    }
}

/// Rate limiter pacing publish throughput
pub struct RateLimiter {
    bucket: Mutex<TokenBucket>,
}

impl RateLimiter {
    /// Create a rate limiter allowing `messages_per_second` sustained
    /// throughput with a one-second burst capacity
    pub fn new(messages_per_second: f64) -> Self {
        let capacity = messages_per_second.max(1.0);
        Self {
            bucket: Mutex::new(TokenBucket::new(capacity, messages_per_second)),
        }
    }

    /// Wait until a token is available and consume it
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                if bucket.try_consume() {
                    return;
                }
                bucket.time_to_token()
            };
            trace!("rate limited, waiting {:?} for a token", wait);
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bucket_consumes_down_to_zero() {
        let mut bucket = TokenBucket::new(2.0, 1.0);
        assert!(bucket.try_consume());
        assert!(bucket.try_consume());
        assert!(!bucket.try_consume());
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_refills_over_time() {
        let mut bucket = TokenBucket::new(10.0, 10.0);
        for _ in 0..10 {
            assert!(bucket.try_consume());
        }
        assert!(!bucket.try_consume());

        tokio::time::sleep(Duration::from_millis(500)).await;
        bucket.refill();
        assert!(bucket.tokens > 4.0 && bucket.tokens < 6.0);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_paces_to_configured_rate() {
        let limiter = RateLimiter::new(10.0);
        let start = Instant::now();
        // Burst capacity covers the first 10; the next 5 must wait ~100ms each.
        for _ in 0..15 {
            limiter.acquire().await;
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(450), "elapsed {:?}", elapsed);
    }
}

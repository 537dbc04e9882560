//! Token-bucket limiter for byte streams.

use tokio::time::{Duration, Instant};

/// Byte-rate token bucket.
///
/// Capacity equals one second of traffic and the bucket starts empty, so a
/// consumer that waits out every returned delay never gets ahead of
/// `rate × elapsed + burst()` bytes.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    /// `rate_per_sec` is clamped to at least one byte per second.
    pub fn new(rate_per_sec: u64) -> Self {
        let rate = rate_per_sec.max(1) as f64;
        Self {
            rate,
            capacity: rate,
            tokens: 0.0,
            last: Instant::now(),
        }
    }

    pub fn rate(&self) -> u64 {
        self.rate as u64
    }

    /// Largest single read the caller should issue.
    pub fn burst(&self) -> usize {
        self.capacity as usize
    }

    /// Account for `n` consumed bytes and return how long the caller must
    /// wait before consuming more.
    pub fn take(&mut self, n: u64) -> Duration {
        self.refill();
        self.tokens -= n as f64;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.rate)
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_first_take_waits_for_its_bytes() {
        let mut bucket = TokenBucket::new(1024);
        assert_eq!(bucket.take(1024), Duration::from_secs(1));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(bucket.take(512), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_time_refills_up_to_capacity_only() {
        let mut bucket = TokenBucket::new(100);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(bucket.take(100), Duration::ZERO);
        assert_eq!(bucket.take(50), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_throughput_never_exceeds_rate_plus_burst() {
        let rate = 64 * 1024;
        let mut bucket = TokenBucket::new(rate);
        let start = Instant::now();
        let mut delivered: u64 = 0;
        for _ in 0..200 {
            let chunk = bucket.burst() as u64 / 3;
            delivered += chunk;
            let elapsed = start.elapsed().as_secs_f64();
            assert!(delivered as f64 <= rate as f64 * elapsed + bucket.burst() as f64);
            let wait = bucket.take(chunk);
            tokio::time::advance(wait).await;
        }
        let elapsed = start.elapsed().as_secs_f64();
        let observed = delivered as f64 / elapsed;
        assert!((observed - rate as f64).abs() / (rate as f64) < 0.05);
    }

    #[test]
    fn test_zero_rate_is_clamped() {
        let bucket = TokenBucket::new(0);
        assert_eq!(bucket.rate(), 1);
        assert_eq!(bucket.burst(), 1);
    }
}

//! Rate limiting and retry pacing.
//!
//! Both helpers take explicit time arguments so the callers that own a
//! clock (the reactor loop, tests) stay in control of it.

use std::time::{Duration, Instant};

/// Token bucket with whole-window refills.
///
/// `rate` tokens are granted per one-second window, accumulating up to
/// `burst`. When exhausted, [`TokenBucket::try_acquire`] reports the start
/// of the next window so the caller can schedule a backoff timer.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    rate: usize,
    burst: usize,
    interval: Duration,
    tokens: usize,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a bucket granting `rate` tokens per second, starting full.
    #[must_use]
    pub fn new(rate: usize, burst: Option<usize>, now: Instant) -> Self {
        let rate = rate.max(1);
        let burst = burst.unwrap_or(rate).max(1);
        Self {
            rate,
            burst,
            interval: Duration::from_secs(1),
            tokens: burst,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let windows = (elapsed.as_nanos() / self.interval.as_nanos()) as u32;
        if windows > 0 {
            self.tokens = self
                .tokens
                .saturating_add(self.rate.saturating_mul(windows as usize))
                .min(self.burst);
            self.last_refill += self.interval * windows;
        }
    }

    /// Take one token, or report when the next refill window opens.
    pub fn try_acquire(&mut self, now: Instant) -> Result<(), Instant> {
        self.refill(now);
        if self.tokens > 0 {
            self.tokens -= 1;
            Ok(())
        } else {
            Err(self.last_refill + self.interval)
        }
    }

    #[inline]
    #[must_use]
    pub const fn tokens(&self) -> usize {
        self.tokens
    }
}

/// Exponential backoff tracker for connection retries.
///
/// The delay doubles with each attempt until it reaches the maximum
/// interval, and resets after a successful connection.
#[derive(Debug, Clone)]
pub struct Backoff {
    base_interval: Duration,
    max_interval: Duration,
    attempt: u32,
    current_interval: Duration,
}

impl Backoff {
    #[must_use]
    pub const fn new(base_interval: Duration, max_interval: Duration) -> Self {
        Self {
            base_interval,
            max_interval,
            attempt: 0,
            current_interval: base_interval,
        }
    }

    /// Get the delay for the next attempt and advance the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_interval;

        self.attempt += 1;
        self.current_interval = self
            .base_interval
            .saturating_mul(1_u32 << self.attempt.min(10));

        if self.current_interval > self.max_interval {
            self.current_interval = self.max_interval;
        }

        delay
    }

    /// Reset after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.current_interval = self.base_interval;
    }

    #[inline]
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_starts_full_and_refills_per_window() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(2, None, start);

        assert!(bucket.try_acquire(start).is_ok());
        assert!(bucket.try_acquire(start).is_ok());
        let earliest = bucket.try_acquire(start).unwrap_err();
        assert_eq!(earliest, start + Duration::from_secs(1));

        // a partial window grants nothing
        assert!(bucket.try_acquire(start + Duration::from_millis(900)).is_err());

        // the next window grants the full rate again
        let later = start + Duration::from_secs(1);
        assert!(bucket.try_acquire(later).is_ok());
        assert!(bucket.try_acquire(later).is_ok());
        assert!(bucket.try_acquire(later).is_err());
    }

    #[test]
    fn bucket_accumulates_up_to_burst() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(1, Some(3), start);

        assert!(bucket.try_acquire(start).is_ok());
        assert!(bucket.try_acquire(start).is_ok());
        assert!(bucket.try_acquire(start).is_ok());
        assert!(bucket.try_acquire(start).is_err());

        // five idle windows accumulate only up to the burst
        let later = start + Duration::from_secs(5);
        let mut granted = 0;
        while bucket.try_acquire(later).is_ok() {
            granted += 1;
        }
        assert_eq!(granted, 3);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(500));

        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(400));
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
        assert_eq!(backoff.attempt(), 5);
    }

    #[test]
    fn backoff_reset() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(10));
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempt(), 2);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }
}

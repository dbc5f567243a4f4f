//! Pure token-bucket state machine.
//!
//! The bucket never reads the clock itself: every operation takes the current
//! monotonic `Instant`, which keeps it deterministic under test and lets the
//! owner decide where time comes from.

use std::time::Duration;
use tokio::time::Instant;

/// Capped, lazily refilled pool of permits.
///
/// Invariant: `0 <= tokens_available <= capacity` after every public call.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    tokens_available: f64,
    refill_rate: f64,
    last_refill_at: Instant,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(capacity: f64, refill_rate: f64, now: Instant) -> Self {
        let capacity = capacity.max(0.0);
        Self {
            capacity,
            tokens_available: capacity,
            refill_rate: refill_rate.max(0.0),
            last_refill_at: now,
        }
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn tokens_available(&self) -> f64 {
        self.tokens_available
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    pub fn last_refill_at(&self) -> Instant {
        self.last_refill_at
    }

    /// Add `floor(elapsed_secs) * refill_rate` tokens, capped at capacity.
    ///
    /// Only whole elapsed seconds are consumed from the refill clock; the
    /// sub-second remainder carries over to the next refill.
    pub fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill_at);
        let whole_secs = elapsed.as_secs();
        if whole_secs == 0 {
            return;
        }
        let added = whole_secs as f64 * self.refill_rate;
        self.tokens_available = (self.tokens_available + added).min(self.capacity);
        self.last_refill_at += Duration::from_secs(whole_secs);
    }

    /// Refill, then deduct `cost` if enough tokens are available.
    ///
    /// Returns `false` without touching the token count otherwise.
    pub fn try_consume(&mut self, cost: f64, now: Instant) -> bool {
        self.refill(now);
        if self.tokens_available >= cost {
            self.tokens_available -= cost;
            true
        } else {
            false
        }
    }

    /// Whether `cost` could be consumed at `now`, without mutating the bucket.
    pub fn can_consume(&self, cost: f64, now: Instant) -> bool {
        self.projected_tokens(now) >= cost
    }

    /// Milliseconds until `cost` tokens are expected to be available.
    ///
    /// `ceil((cost - tokens) / refill_rate * 1000)`, or zero when the tokens are
    /// already there. Returns `None` when the bucket can never refill.
    pub fn estimated_wait_ms(&self, cost: f64, now: Instant) -> Option<u64> {
        let tokens = self.projected_tokens(now);
        if tokens >= cost {
            return Some(0);
        }
        if self.refill_rate <= 0.0 {
            return None;
        }
        let missing = cost - tokens;
        Some((missing / self.refill_rate * 1000.0).ceil() as u64)
    }

    /// Replace capacity and refill rate, clamping the current tokens.
    pub fn reconfigure(&mut self, capacity: f64, refill_rate: f64) {
        self.capacity = capacity.max(0.0);
        self.refill_rate = refill_rate.max(0.0);
        self.tokens_available = self.tokens_available.min(self.capacity);
    }

    /// Drop all tokens and restart the refill clock.
    pub fn drain(&mut self, now: Instant) {
        self.tokens_available = 0.0;
        self.last_refill_at = now;
    }

    /// Fill to capacity and restart the refill clock.
    pub fn reset(&mut self, now: Instant) {
        self.tokens_available = self.capacity;
        self.last_refill_at = now;
    }

    fn projected_tokens(&self, now: Instant) -> f64 {
        let whole_secs = now.saturating_duration_since(self.last_refill_at).as_secs();
        (self.tokens_available + whole_secs as f64 * self.refill_rate).min(self.capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket(capacity: f64, rate: f64) -> (TokenBucket, Instant) {
        let now = Instant::now();
        (TokenBucket::new(capacity, rate, now), now)
    }

    #[test]
    fn test_starts_full() {
        let (b, _) = bucket(50.0, 1.0);
        assert_eq!(b.tokens_available(), 50.0);
        assert_eq!(b.capacity(), 50.0);
    }

    #[test]
    fn test_exact_deduction() {
        let (mut b, now) = bucket(10.0, 1.0);
        assert!(b.try_consume(3.0, now));
        assert_eq!(b.tokens_available(), 7.0);
        assert!(b.try_consume(7.0, now));
        assert_eq!(b.tokens_available(), 0.0);
    }

    #[test]
    fn test_failed_consume_leaves_state() {
        let (mut b, now) = bucket(5.0, 1.0);
        assert!(b.try_consume(4.0, now));
        let before = b.clone();
        assert!(!b.try_consume(2.0, now));
        assert_eq!(b.tokens_available(), before.tokens_available());
        assert_eq!(b.last_refill_at(), before.last_refill_at());
    }

    #[test]
    fn test_refill_whole_seconds_only() {
        let (mut b, now) = bucket(50.0, 1.0);
        assert!(b.try_consume(50.0, now));
        assert!(!b.can_consume(1.0, now + Duration::from_millis(999)));
        assert!(b.can_consume(1.0, now + Duration::from_millis(1000)));

        // 1.5s elapsed: one token, half a second carried over
        b.refill(now + Duration::from_millis(1500));
        assert_eq!(b.tokens_available(), 1.0);
        b.refill(now + Duration::from_millis(2000));
        assert_eq!(b.tokens_available(), 2.0);
    }

    #[test]
    fn test_refill_capped() {
        let (mut b, now) = bucket(5.0, 2.0);
        assert!(b.try_consume(1.0, now));
        b.refill(now + Duration::from_secs(3600));
        assert_eq!(b.tokens_available(), 5.0);
    }

    #[test]
    fn test_estimated_wait() {
        let (mut b, now) = bucket(10.0, 0.5);
        assert_eq!(b.estimated_wait_ms(1.0, now), Some(0));
        assert!(b.try_consume(10.0, now));
        assert_eq!(b.estimated_wait_ms(1.0, now), Some(2000));
        assert_eq!(b.estimated_wait_ms(3.0, now), Some(6000));

        let (mut frozen, now) = bucket(1.0, 0.0);
        assert!(frozen.try_consume(1.0, now));
        assert_eq!(frozen.estimated_wait_ms(1.0, now), None);
    }

    #[test]
    fn test_reconfigure_clamps_tokens() {
        let (mut b, _) = bucket(50.0, 1.0);
        b.reconfigure(20.0, 0.5);
        assert_eq!(b.tokens_available(), 20.0);
        assert_eq!(b.refill_rate(), 0.5);
    }

    #[test]
    fn test_bounds_hold_over_mixed_sequence() {
        let (mut b, start) = bucket(7.0, 1.5);
        let mut now = start;
        for i in 0..200u64 {
            now += Duration::from_millis((i * 37) % 2300);
            let _ = b.try_consume(((i % 4) + 1) as f64, now);
            if i % 17 == 0 {
                b.reconfigure(3.0 + (i % 9) as f64, 1.0);
            }
            assert!(b.tokens_available() >= 0.0);
            assert!(b.tokens_available() <= b.capacity());
        }
    }
}

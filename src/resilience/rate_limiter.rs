use crate::resilience::token_bucket::TokenBucket;
use crate::{Error, Result};
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Utilization above which the limiter shrinks itself.
pub const HIGH_UTILIZATION: f64 = 0.8;
/// Utilization below which the limiter grows itself.
pub const LOW_UTILIZATION: f64 = 0.3;

const SHRINK_FACTOR: f64 = 0.8;
const GROW_FACTOR: f64 = 1.1;
const THROTTLE_FACTOR: f64 = 0.5;

const MIN_CAPACITY: f64 = 10.0;
const MIN_REFILL_RATE: f64 = 0.5;
const MAX_CAPACITY: f64 = 100.0;
const MAX_REFILL_RATE: f64 = 2.0;
const THROTTLED_MIN_CAPACITY: f64 = 5.0;
const THROTTLED_MIN_REFILL_RATE: f64 = 0.2;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// Maximum tokens (burst size).
    pub capacity: f64,
    /// Tokens added per second.
    pub refill_rate: f64,
    /// Upper bound on a single sleep inside `wait_for_tokens`, in ms.
    pub max_wait_slice_ms: u64,
}

impl RateLimiterConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self {
            capacity: 50.0,
            refill_rate: 1.0,
            max_wait_slice_ms: 5_000,
        }
    }

    /// Set the maximum tokens (burst size)
    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.capacity = capacity as f64;
        self
    }

    /// Set the refill rate (tokens per second)
    pub fn with_refill_rate(mut self, rate: f64) -> Self {
        self.refill_rate = rate;
        self
    }

    pub fn with_max_wait_slice(mut self, slice: Duration) -> Self {
        self.max_wait_slice_ms = slice.as_millis() as u64;
        self
    }
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Response facts fed back into [`RateLimiter::adapt_rate_limit`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateLimitSignal {
    pub status_code: u16,
    pub remaining_quota: Option<u64>,
    pub total_quota: Option<u64>,
    /// Provider hint for when the quota window resets.
    pub reset_after: Option<Duration>,
}

impl RateLimitSignal {
    pub fn from_status(status_code: u16) -> Self {
        Self {
            status_code,
            ..Default::default()
        }
    }

    pub fn with_quota(mut self, remaining: u64, total: u64) -> Self {
        self.remaining_quota = Some(remaining);
        self.total_quota = Some(total);
        self
    }

    /// Build a signal from response headers.
    ///
    /// Understands the common `x-ratelimit-*` family (with or without the
    /// `-requests` suffix) and `retry-after` in its seconds form.
    pub fn from_headers(status_code: u16, headers: &HeaderMap) -> Self {
        let remaining = header_first(
            headers,
            &[
                "x-ratelimit-remaining",
                "x-ratelimit-remaining-requests",
                "ratelimit-remaining",
            ],
        )
        .and_then(|v| v.parse::<u64>().ok());
        let total = header_first(
            headers,
            &[
                "x-ratelimit-limit",
                "x-ratelimit-limit-requests",
                "ratelimit-limit",
            ],
        )
        .and_then(|v| v.parse::<u64>().ok());
        let reset_after = header_first(
            headers,
            &[
                "x-ratelimit-reset",
                "x-ratelimit-reset-requests",
                "ratelimit-reset",
                "retry-after",
            ],
        )
        .and_then(|v| parse_seconds(&v));

        Self {
            status_code,
            remaining_quota: remaining,
            total_quota: total,
            reset_after,
        }
    }

    /// Fraction of the upstream quota already consumed, if both headers are present.
    pub fn utilization(&self) -> Option<f64> {
        let total = self.total_quota?;
        let remaining = self.remaining_quota?;
        if total == 0 {
            return None;
        }
        let used = total.saturating_sub(remaining);
        Some(used as f64 / total as f64)
    }
}

fn header_first(headers: &HeaderMap, names: &[&str]) -> Option<String> {
    for name in names {
        if let Some(v) = headers.get(*name) {
            if let Ok(s) = v.to_str() {
                let s = s.trim();
                if !s.is_empty() {
                    return Some(s.to_string());
                }
            }
        }
    }
    None
}

// Accepts "60", "1.5" and "30s". Values a `Duration` cannot hold are ignored.
fn parse_seconds(raw: &str) -> Option<Duration> {
    let trimmed = raw.trim_end_matches('s');
    let secs: f64 = trimmed.parse().ok()?;
    Duration::try_from_secs_f64(secs).ok()
}

/// Point-in-time limiter figures for dashboards and orchestration.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterMetrics {
    pub capacity: f64,
    pub refill_rate: f64,
    pub tokens_available: f64,
    /// Wait until a single token is available; 0 when one is available now.
    pub estimated_wait_ms: Option<u64>,
    pub granted: u64,
    pub rejected: u64,
    pub adaptations: u64,
    pub throttled_responses: u64,
}

#[derive(Debug)]
struct State {
    bucket: TokenBucket,
    granted: u64,
    rejected: u64,
    adaptations: u64,
    throttled_responses: u64,
}

/// Adaptive token-bucket limiter for a quota-constrained upstream.
///
/// - Never fails for throttling; callers choose to wait, skip or warn
/// - Shrinks on high quota utilization and brakes hard on 429
/// - No fairness between concurrent waiters
pub struct RateLimiter {
    cfg: RateLimiterConfig,
    state: Mutex<State>,
}

impl RateLimiter {
    pub fn new(cfg: RateLimiterConfig) -> Self {
        let bucket = TokenBucket::new(cfg.capacity, cfg.refill_rate, Instant::now());
        Self {
            cfg,
            state: Mutex::new(State {
                bucket,
                granted: 0,
                rejected: 0,
                adaptations: 0,
                throttled_responses: 0,
            }),
        }
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.cfg
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // The bucket is always left consistent, so a poisoned lock is still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Try to take `cost` tokens without waiting.
    pub fn consume_token(&self, cost: u32) -> bool {
        let mut st = self.state();
        if st.bucket.try_consume(cost as f64, Instant::now()) {
            st.granted += 1;
            true
        } else {
            st.rejected += 1;
            false
        }
    }

    /// Wait until `cost` tokens could be taken, then take them.
    pub async fn wait_for_tokens(&self, cost: u32) -> Result<()> {
        self.wait_for_tokens_with_cancel(cost, &CancellationToken::new())
            .await
    }

    /// Like [`wait_for_tokens`](Self::wait_for_tokens), abandoning the wait when
    /// `cancel` fires. A cancelled wait takes no tokens.
    ///
    /// Each sleep is bounded by `max_wait_slice_ms`, so capacity changes made
    /// by [`adapt_rate_limit`](Self::adapt_rate_limit) are observed mid-wait.
    pub async fn wait_for_tokens_with_cancel(
        &self,
        cost: u32,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let max_slice = self.cfg.max_wait_slice_ms.max(1);
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let wait_ms = {
                let mut st = self.state();
                let capacity = st.bucket.capacity();
                if cost as f64 > capacity {
                    return Err(Error::CostExceedsCapacity { cost, capacity });
                }
                let now = Instant::now();
                if st.bucket.try_consume(cost as f64, now) {
                    st.granted += 1;
                    return Ok(());
                }
                st.bucket.estimated_wait_ms(cost as f64, now).unwrap_or(max_slice)
            };

            let slice = Duration::from_millis(wait_ms.clamp(1, max_slice));
            debug!(cost, wait_ms = slice.as_millis() as u64, "waiting for rate limit tokens");
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(slice) => {}
            }
        }
    }

    /// Whether `cost` tokens are available right now. Does not consume.
    pub fn can_make_request(&self, cost: u32) -> bool {
        self.state().bucket.can_consume(cost as f64, Instant::now())
    }

    /// Expected wait for `cost` tokens, or `None` if they can never arrive
    /// (cost above capacity or a zero refill rate).
    pub fn estimated_wait_time(&self, cost: u32) -> Option<Duration> {
        let st = self.state();
        if cost as f64 > st.bucket.capacity() {
            return None;
        }
        st.bucket
            .estimated_wait_ms(cost as f64, Instant::now())
            .map(Duration::from_millis)
    }

    /// Feed an upstream response back into the limiter.
    ///
    /// Quota utilization above 0.8 shrinks capacity and refill rate by 20%,
    /// below 0.3 grows them by 10%; the band in between is left alone.
    /// A 429 halves both from their current values, ignoring utilization, and
    /// drains the bucket.
    pub fn adapt_rate_limit(&self, signal: &RateLimitSignal) {
        let mut st = self.state();
        let now = Instant::now();
        st.bucket.refill(now);

        let capacity = st.bucket.capacity();
        let rate = st.bucket.refill_rate();

        // A 429 halves from the pre-signal values; quota headers on the same
        // response do not shrink on top of it.
        if signal.status_code == 429 {
            let next = (
                shrink(capacity, THROTTLE_FACTOR, THROTTLED_MIN_CAPACITY),
                shrink(rate, THROTTLE_FACTOR, THROTTLED_MIN_REFILL_RATE),
            );
            st.bucket.reconfigure(next.0, next.1);
            st.bucket.drain(now);
            st.throttled_responses += 1;
            st.adaptations += 1;
            warn!(
                capacity = next.0,
                refill_rate = next.1,
                reset_after_ms = signal.reset_after.map(|d| d.as_millis() as u64),
                "upstream returned 429, braking rate limit"
            );
            return;
        }

        let mut next = (capacity, rate);
        if let Some(utilization) = signal.utilization() {
            if utilization > HIGH_UTILIZATION {
                next = (
                    shrink(capacity, SHRINK_FACTOR, MIN_CAPACITY),
                    shrink(rate, SHRINK_FACTOR, MIN_REFILL_RATE),
                );
                debug!(
                    utilization,
                    capacity = next.0,
                    refill_rate = next.1,
                    "high quota utilization, shrinking rate limit"
                );
            } else if utilization < LOW_UTILIZATION {
                next = (
                    grow(capacity, GROW_FACTOR, MAX_CAPACITY),
                    grow(rate, GROW_FACTOR, MAX_REFILL_RATE),
                );
                debug!(
                    utilization,
                    capacity = next.0,
                    refill_rate = next.1,
                    "low quota utilization, growing rate limit"
                );
            }
        }

        if next != (capacity, rate) {
            st.bucket.reconfigure(next.0, next.1);
            st.adaptations += 1;
        }
    }

    /// Refill the bucket to capacity immediately.
    pub fn reset_tokens(&self) {
        let mut st = self.state();
        st.bucket.reset(Instant::now());
        debug!(capacity = st.bucket.capacity(), "rate limiter tokens reset");
    }

    pub fn get_metrics(&self) -> RateLimiterMetrics {
        let mut st = self.state();
        let now = Instant::now();
        st.bucket.refill(now);
        RateLimiterMetrics {
            capacity: st.bucket.capacity(),
            refill_rate: st.bucket.refill_rate(),
            tokens_available: st.bucket.tokens_available(),
            estimated_wait_ms: st.bucket.estimated_wait_ms(1.0, now),
            granted: st.granted,
            rejected: st.rejected,
            adaptations: st.adaptations,
            throttled_responses: st.throttled_responses,
        }
    }
}

// Never grows the value, even when it already sits below the floor.
fn shrink(value: f64, factor: f64, floor: f64) -> f64 {
    (value * factor).max(floor).min(value)
}

// Never shrinks the value, even when it already sits above the cap.
fn grow(value: f64, factor: f64, cap: f64) -> f64 {
    (value * factor).min(cap).max(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn limiter(capacity: u32, rate: f64) -> RateLimiter {
        RateLimiter::new(
            RateLimiterConfig::new()
                .with_capacity(capacity)
                .with_refill_rate(rate),
        )
    }

    #[test]
    fn test_rate_limiter_config_defaults() {
        let config = RateLimiterConfig::default();
        assert_eq!(config.capacity, 50.0);
        assert_eq!(config.refill_rate, 1.0);
        assert_eq!(config.max_wait_slice_ms, 5_000);
    }

    #[test]
    fn test_rate_limiter_config_builder() {
        let config = RateLimiterConfig::new()
            .with_capacity(100)
            .with_refill_rate(2.0)
            .with_max_wait_slice(Duration::from_millis(250));
        assert_eq!(config.capacity, 100.0);
        assert_eq!(config.refill_rate, 2.0);
        assert_eq!(config.max_wait_slice_ms, 250);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consume_and_metrics() {
        let limiter = limiter(3, 1.0);
        assert!(limiter.consume_token(1));
        assert!(limiter.consume_token(2));
        assert!(!limiter.consume_token(1));

        let m = limiter.get_metrics();
        assert_eq!(m.tokens_available, 0.0);
        assert_eq!(m.granted, 2);
        assert_eq!(m.rejected, 1);
        assert_eq!(m.estimated_wait_ms, Some(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_after_one_second() {
        let limiter = limiter(50, 1.0);
        for _ in 0..50 {
            assert!(limiter.consume_token(1));
        }
        assert!(!limiter.can_make_request(1));
        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(!limiter.can_make_request(1));
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(limiter.can_make_request(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_high_utilization_shrinks() {
        let limiter = limiter(50, 1.0);
        limiter.adapt_rate_limit(&RateLimitSignal::from_status(200).with_quota(10, 100));
        let m = limiter.get_metrics();
        assert_eq!(m.capacity, 40.0);
        assert_eq!(m.refill_rate, 0.8);
        assert_eq!(m.tokens_available, 40.0);
        assert_eq!(m.adaptations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shrink_floors() {
        let limiter = limiter(11, 0.55);
        limiter.adapt_rate_limit(&RateLimitSignal::from_status(200).with_quota(0, 100));
        let m = limiter.get_metrics();
        assert_eq!(m.capacity, 10.0);
        assert_eq!(m.refill_rate, 0.5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_utilization_grows_with_caps() {
        let limiter = limiter(95, 1.9);
        limiter.adapt_rate_limit(&RateLimitSignal::from_status(200).with_quota(90, 100));
        let m = limiter.get_metrics();
        assert_eq!(m.capacity, 100.0);
        assert_eq!(m.refill_rate, 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hysteresis_band_is_noop() {
        let limiter = limiter(50, 1.0);
        limiter.adapt_rate_limit(&RateLimitSignal::from_status(200).with_quota(50, 100));
        let m = limiter.get_metrics();
        assert_eq!(m.capacity, 50.0);
        assert_eq!(m.refill_rate, 1.0);
        assert_eq!(m.adaptations, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_429_brakes_hard() {
        let limiter = limiter(50, 1.0);
        limiter.adapt_rate_limit(&RateLimitSignal::from_status(429));
        let m = limiter.get_metrics();
        assert_eq!(m.tokens_available, 0.0);
        assert_eq!(m.capacity, 25.0);
        assert_eq!(m.refill_rate, 0.5);
        assert_eq!(m.throttled_responses, 1);

        for _ in 0..10 {
            limiter.adapt_rate_limit(&RateLimitSignal::from_status(429));
        }
        let m = limiter.get_metrics();
        assert_eq!(m.capacity, 5.0);
        assert_eq!(m.refill_rate, 0.2);
        assert_eq!(m.tokens_available, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_tokens() {
        let limiter = limiter(10, 1.0);
        limiter.adapt_rate_limit(&RateLimitSignal::from_status(429));
        assert!(!limiter.can_make_request(1));
        limiter.reset_tokens();
        assert_eq!(limiter.get_metrics().tokens_available, 5.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_tokens_sleeps_until_refill() {
        let limiter = limiter(2, 1.0);
        assert!(limiter.consume_token(2));
        let start = Instant::now();
        limiter.wait_for_tokens(1).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(1));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_tokens_rejects_cost_above_capacity() {
        let limiter = limiter(5, 1.0);
        let err = limiter.wait_for_tokens(6).await.unwrap_err();
        assert!(matches!(err, Error::CostExceedsCapacity { cost: 6, .. }));
        assert_eq!(limiter.estimated_wait_time(6), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_tokens_cancelled() {
        let limiter = limiter(1, 0.2);
        assert!(limiter.consume_token(1));
        let token = CancellationToken::new();
        let child = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            child.cancel();
        });
        let err = limiter
            .wait_for_tokens_with_cancel(1, &token)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(limiter.get_metrics().tokens_available, 0.0);
    }

    #[test]
    fn test_signal_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("12"));
        headers.insert("x-ratelimit-limit-requests", HeaderValue::from_static("100"));
        headers.insert("retry-after", HeaderValue::from_static("30"));
        let signal = RateLimitSignal::from_headers(200, &headers);
        assert_eq!(signal.remaining_quota, Some(12));
        assert_eq!(signal.total_quota, Some(100));
        assert_eq!(signal.reset_after, Some(Duration::from_secs(30)));
        assert_eq!(signal.utilization(), Some(0.88));
    }

    #[test]
    fn test_signal_ignores_unusable_reset_values() {
        for raw in ["99999999999999999999", "1e400", "-3", "NaN", "soon"] {
            let mut headers = HeaderMap::new();
            headers.insert("x-ratelimit-reset", HeaderValue::from_static(raw));
            let signal = RateLimitSignal::from_headers(200, &headers);
            assert_eq!(signal.reset_after, None, "{}", raw);
        }

        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-reset", HeaderValue::from_static("1.5s"));
        let signal = RateLimitSignal::from_headers(200, &headers);
        assert_eq!(signal.reset_after, Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_signal_without_quota() {
        let signal = RateLimitSignal::from_headers(429, &HeaderMap::new());
        assert_eq!(signal.utilization(), None);
        assert_eq!(
            RateLimitSignal::from_status(200).with_quota(5, 0).utilization(),
            None
        );
    }
}

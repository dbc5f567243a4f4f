//! 弹性模式模块：提供自适应限流器和熔断器等可靠性保障机制。
//!
//! # Resilience Primitives Module
//!
//! Throttling and circuit-breaking primitives shared by the health monitor and
//! the request guard.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`token_bucket`] | Pure token bucket with lazy, wall-clock-delta refill |
//! | [`rate_limiter`] | Adaptive limiter driven by upstream quota signals |
//! | [`circuit_breaker`] | Consecutive-failure breaker with cooldown |
//!
//! ## Rate Limiter
//!
//! ```rust
//! use dashboard_resilience::resilience::rate_limiter::{
//!     RateLimitSignal, RateLimiter, RateLimiterConfig,
//! };
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let limiter = RateLimiter::new(
//!     RateLimiterConfig::new().with_capacity(50).with_refill_rate(1.0),
//! );
//!
//! if limiter.consume_token(1) {
//!     // Make the upstream call, then feed its response back:
//!     limiter.adapt_rate_limit(&RateLimitSignal::from_status(200).with_quota(40, 100));
//! }
//! # }
//! ```
//!
//! ## Circuit Breaker
//!
//! - **Closed**: normal operation, probes run on every cycle
//! - **Open**: failures reached the threshold; probing pauses for the cooldown
//! - A successful attempt after the cooldown closes the circuit again

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod token_bucket;

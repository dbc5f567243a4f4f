//! # dashboard-resilience
//!
//! 仪表盘客户端的弹性控制面：自适应限流、熔断式健康监控与分类重试。
//!
//! Client-side resilience control plane for a dashboard talking to a
//! quota-constrained backend.
//!
//! ## Overview
//!
//! Three cooperating mechanisms keep the client from hammering an upstream
//! that is throttled, unhealthy or rejecting its credentials:
//!
//! - **Adaptive rate limiting**: a token bucket whose capacity and refill rate
//!   follow the upstream's quota headers and brake hard on 429
//! - **Health monitoring**: pluggable probes on a schedule with a circuit that
//!   pauses probing and fails callers fast while the system is down
//! - **Classified retry**: exponential backoff for transient failures, one-shot
//!   session recovery for authentication failures
//!
//! [`guard::ResilienceGuard`] composes all three around a single remote call.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dashboard_resilience::config::ResilienceConfig;
//! use dashboard_resilience::guard::{Observed, ResilienceGuard};
//! use dashboard_resilience::health::probes::HttpReachabilityProbe;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> dashboard_resilience::Result<()> {
//!     let cfg = ResilienceConfig::load("resilience.yaml")?.with_env_overrides()?;
//!     let guard = ResilienceGuard::from_config(&cfg)?;
//!     guard.monitor().register_probe(Arc::new(HttpReachabilityProbe::new(
//!         "backend",
//!         "https://api.example.com/health",
//!     )?));
//!     guard.monitor().start_default();
//!
//!     let teams: Vec<String> = guard
//!         .call(1, || async { Ok(Observed::ok(vec!["core".to_string()])) })
//!         .await?;
//!     println!("{teams:?}");
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`resilience`] | Token bucket, adaptive rate limiter, circuit breaker |
//! | [`health`] | Health probes, circuit health monitor, snapshots |
//! | [`retry`] | Retry policy and session recovery |
//! | [`guard`] | Composition of the above around one call |
//! | [`config`] | File and environment configuration |
//! | [`error_kind`] | Error classification shared by retry and messaging |

pub mod config;
pub mod error_kind;
pub mod guard;
pub mod health;
pub mod resilience;
pub mod retry;

pub use config::ResilienceConfig;
pub use error_kind::ErrorKind;
pub use guard::{Observed, Preflight, ResilienceGuard, SignalsSnapshot};
pub use health::{CircuitHealthMonitor, HealthProbe, HealthStatus, MonitorConfig};
pub use resilience::rate_limiter::{RateLimitSignal, RateLimiter, RateLimiterConfig};
pub use retry::{RetryConfig, RetryPolicy};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext};

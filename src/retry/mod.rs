//! 重试策略模块：基于错误分类的指数退避重试，认证类错误永不重试。
//!
//! # Retry Policy
//!
//! Decides, per error, whether to retry with exponential backoff or fail fast.
//! Authentication-class failures are never retried; they go through the
//! separate one-shot [`session::SessionRecovery`] path instead.
//!
//! ```rust
//! use dashboard_resilience::retry::{RetryConfig, RetryPolicy};
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::new(RetryConfig::default());
//! assert_eq!(policy.next_delay(0), Duration::from_millis(1000));
//! assert_eq!(policy.next_delay(3), Duration::from_millis(8000));
//! assert_eq!(policy.next_delay(10), Duration::from_millis(30000));
//! ```

pub mod session;

use crate::error_kind::ErrorKind;
use crate::Error;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Symmetric jitter fraction applied to each sleep (0.2 = ±20%).
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_attempts: 3,
            jitter: 0.2,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }
}

/// Classifier verdict for one error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub kind: ErrorKind,
    pub retryable: bool,
    /// Auth-class errors are never retryable.
    pub auth_class: bool,
}

/// Terminal failure returned by [`RetryPolicy::execute`].
#[derive(Debug)]
pub struct RetryFailure {
    pub last_error: Error,
    /// Attempts actually made, including the first.
    pub attempts: u32,
    pub classification: Classification,
}

impl RetryFailure {
    pub fn into_error(self) -> Error {
        self.last_error
    }
}

impl fmt::Display for RetryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "failed after {} attempt(s) [{}]: {}",
            self.attempts, self.classification.kind, self.last_error
        )
    }
}

impl std::error::Error for RetryFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.last_error)
    }
}

/// Classification-driven retry with capped exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    cfg: RetryConfig,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(cfg: RetryConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.cfg
    }

    pub fn classify(&self, error: &Error) -> Classification {
        Self::classify_kind(error.kind())
    }

    /// Adapter for errors that only arrive as text.
    pub fn classify_message(&self, message: &str) -> Classification {
        Self::classify_kind(ErrorKind::from_message(message))
    }

    fn classify_kind(kind: ErrorKind) -> Classification {
        let auth_class = kind.is_auth();
        Classification {
            kind,
            retryable: kind.retryable() && !auth_class,
            auth_class,
        }
    }

    /// `min(base * 2^attempt, cap)`, without jitter.
    pub fn next_delay(&self, attempt_index: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt_index).unwrap_or(u64::MAX);
        let delay = self
            .cfg
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.cfg.max_delay_ms);
        Duration::from_millis(delay)
    }

    /// [`next_delay`](Self::next_delay) with the configured symmetric jitter,
    /// still capped at `max_delay_ms`.
    pub fn jittered_delay(&self, attempt_index: u32) -> Duration {
        let base = self.next_delay(attempt_index);
        let jitter = self.cfg.jitter.clamp(0.0, 0.99);
        if jitter == 0.0 || base.is_zero() {
            return base;
        }
        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        let ms = (base.as_millis() as f64 * factor).round() as u64;
        Duration::from_millis(ms.min(self.cfg.max_delay_ms))
    }

    /// Run `operation` with the configured attempt budget.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T, RetryFailure>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = crate::Result<T>>,
    {
        self.execute_with_cancel(operation, self.cfg.max_attempts, &CancellationToken::new())
            .await
    }

    /// Run `operation` up to `max_attempts` times.
    ///
    /// The closure receives the 0-based attempt index. Retryable failures
    /// sleep `jittered_delay(attempt)` before the next attempt; anything else,
    /// exhaustion, or `cancel` firing ends the loop with a [`RetryFailure`].
    pub async fn execute_with_cancel<F, Fut, T>(
        &self,
        mut operation: F,
        max_attempts: u32,
        cancel: &CancellationToken,
    ) -> Result<T, RetryFailure>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = crate::Result<T>>,
    {
        let max_attempts = max_attempts.max(1);
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(Self::failure(Error::Cancelled, attempt));
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => Err(Error::Cancelled),
                r = operation(attempt) => r,
            };
            let made = attempt + 1;

            let error = match result {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(attempts = made, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            let class = self.classify(&error);
            if !class.retryable {
                debug!(kind = %class.kind, attempts = made, "non-retryable error: {}", error);
                return Err(RetryFailure {
                    last_error: error,
                    attempts: made,
                    classification: class,
                });
            }
            if made >= max_attempts {
                warn!(attempts = made, "retries exhausted, last error: {}", error);
                return Err(RetryFailure {
                    last_error: error,
                    attempts: made,
                    classification: class,
                });
            }

            let delay = self.jittered_delay(attempt);
            debug!(
                attempt = made,
                delay_ms = delay.as_millis() as u64,
                kind = %class.kind,
                "retrying after error: {}",
                error
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(Self::failure(Error::Cancelled, made)),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    fn failure(error: Error, attempts: u32) -> RetryFailure {
        let classification = Self::classify_kind(error.kind());
        RetryFailure {
            last_error: error,
            attempts,
            classification,
        }
    }
}

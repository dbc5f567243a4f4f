//! Request guard: the composition root that wires the limiter, the health
//! monitor, the retry policy and session recovery around a remote call.
//!
//! Control flow for every attempt:
//! 1. fail fast if the health circuit is open
//! 2. wait for rate-limit tokens
//! 3. run the operation
//! 4. feed the response (or error status) back into the limiter
//!
//! Failed attempts go through [`RetryPolicy`]. Auth-class terminal failures
//! trigger one session recovery and, if it refreshed, a single re-issue.

use crate::config::ResilienceConfig;
use crate::health::{CircuitHealthMonitor, MonitoringSnapshot};
use crate::resilience::rate_limiter::{RateLimitSignal, RateLimiter, RateLimiterMetrics};
use crate::retry::session::SessionRecovery;
use crate::retry::RetryPolicy;
use crate::{Error, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Value returned by a guarded operation plus the response facts the limiter adapts on.
#[derive(Debug, Clone)]
pub struct Observed<T> {
    pub value: T,
    pub signal: RateLimitSignal,
}

impl<T> Observed<T> {
    pub fn new(value: T, signal: RateLimitSignal) -> Self {
        Self { value, signal }
    }

    /// A plain 200 without quota headers.
    pub fn ok(value: T) -> Self {
        Self::new(value, RateLimitSignal::from_status(200))
    }
}

/// Facts-only view of the control plane for dashboards and orchestration.
#[derive(Debug, Clone)]
pub struct SignalsSnapshot {
    pub rate_limiter: RateLimiterMetrics,
    pub health: Arc<MonitoringSnapshot>,
}

/// Non-blocking verdict for UI collaborators deciding whether to enable an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preflight {
    Ready,
    Throttled { wait: Option<Duration> },
    Unhealthy,
}

pub struct ResilienceGuard {
    limiter: Arc<RateLimiter>,
    monitor: Arc<CircuitHealthMonitor>,
    retry: RetryPolicy,
    session: Option<Arc<SessionRecovery>>,
}

impl ResilienceGuard {
    pub fn new(
        limiter: Arc<RateLimiter>,
        monitor: Arc<CircuitHealthMonitor>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            limiter,
            monitor,
            retry,
            session: None,
        }
    }

    /// Build fresh limiter, monitor and retry policy from one config.
    ///
    /// Probes are registered on [`monitor`](Self::monitor) afterwards.
    pub fn from_config(cfg: &ResilienceConfig) -> Result<Self> {
        cfg.validate()?;
        Ok(Self::new(
            Arc::new(RateLimiter::new(cfg.rate_limiter.clone())),
            Arc::new(CircuitHealthMonitor::new(cfg.monitor.clone())),
            RetryPolicy::new(cfg.retry.clone()),
        ))
    }

    pub fn with_session_recovery(mut self, recovery: Arc<SessionRecovery>) -> Self {
        self.session = Some(recovery);
        self
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn monitor(&self) -> &Arc<CircuitHealthMonitor> {
        &self.monitor
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn signals(&self) -> SignalsSnapshot {
        SignalsSnapshot {
            rate_limiter: self.limiter.get_metrics(),
            health: self.monitor.get_snapshot(),
        }
    }

    pub fn preflight(&self, cost: u32) -> Preflight {
        if self.monitor.is_open() {
            return Preflight::Unhealthy;
        }
        if self.limiter.can_make_request(cost) {
            Preflight::Ready
        } else {
            Preflight::Throttled {
                wait: self.limiter.estimated_wait_time(cost),
            }
        }
    }

    pub async fn call<F, Fut, T>(&self, cost: u32, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Observed<T>>>,
    {
        self.call_with_cancel(cost, op, &CancellationToken::new())
            .await
    }

    /// Run `op` under the full control plane.
    ///
    /// The future returned by `op` is not polled until the circuit check and
    /// the token wait have passed. Cancellation abandons any wait without
    /// consuming tokens or touching circuit state.
    pub async fn call_with_cancel<F, Fut, T>(
        &self,
        cost: u32,
        mut op: F,
        cancel: &CancellationToken,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Observed<T>>>,
    {
        let generation = self.session.as_ref().map(|s| s.generation());
        let max_attempts = self.retry.config().max_attempts;

        let failure = match self
            .retry
            .execute_with_cancel(|_| self.attempt(cost, op(), cancel), max_attempts, cancel)
            .await
        {
            Ok(value) => return Ok(value),
            Err(failure) => failure,
        };

        if failure.classification.auth_class {
            if let (Some(recovery), Some(generation)) = (&self.session, generation) {
                recovery.recover(generation).await?;
                debug!("re-issuing operation once after session recovery");
                return self.attempt(cost, op(), cancel).await;
            }
        }

        if !matches!(
            failure.last_error,
            Error::Cancelled | Error::ServiceUnhealthy { .. }
        ) {
            self.monitor.record_error(failure.to_string());
        }
        Err(failure.into_error())
    }

    async fn attempt<Fut, T>(&self, cost: u32, fut: Fut, cancel: &CancellationToken) -> Result<T>
    where
        Fut: Future<Output = Result<Observed<T>>>,
    {
        self.monitor.check_available()?;
        self.limiter.wait_for_tokens_with_cancel(cost, cancel).await?;

        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            r = fut => r,
        };
        match result {
            Ok(observed) => {
                self.limiter.adapt_rate_limit(&observed.signal);
                Ok(observed.value)
            }
            Err(e) => {
                if let Error::Upstream {
                    status: Some(status),
                    ..
                } = &e
                {
                    self.limiter
                        .adapt_rate_limit(&RateLimitSignal::from_status(*status));
                }
                Err(e)
            }
        }
    }
}

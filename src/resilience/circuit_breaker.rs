use crate::{Error, Result};
use serde::Serialize;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CircuitSnapshot {
    pub max_failures: u32,
    pub cooldown_ms: u64,
    pub consecutive_failures: u32,
    pub is_open: bool,
    /// Time left before the next attempt is allowed, if currently open.
    pub cooldown_remaining_ms: Option<u64>,
    /// Time since the last successful cycle, if any.
    pub since_last_success_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub max_failures: u32,
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 3,
            cooldown: Duration::from_secs(600),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the failure threshold
    pub fn with_max_failures(mut self, threshold: u32) -> Self {
        self.max_failures = threshold;
        self
    }

    /// Set the cooldown duration
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }
}

/// State change produced by recording an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitTransition {
    Opened,
    Closed,
}

#[derive(Debug)]
struct State {
    consecutive_failures: u32,
    is_open: bool,
    last_attempt_at: Option<Instant>,
    last_success_at: Option<Instant>,
}

/// Consecutive-failure circuit breaker.
///
/// - Opens once `consecutive_failures >= max_failures`
/// - While open, attempts are refused until `cooldown` has passed since the last attempt
/// - Closes only when an attempt made after the cooldown succeeds
pub struct CircuitBreaker {
    cfg: CircuitBreakerConfig,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(cfg: CircuitBreakerConfig) -> Self {
        Self {
            cfg,
            state: Mutex::new(State {
                consecutive_failures: 0,
                is_open: false,
                last_attempt_at: None,
                last_success_at: None,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether an attempt may run now: `false` while open and cooling down.
    ///
    /// Does not change state. The attempt only counts toward the cooldown once
    /// its outcome is recorded, so an abandoned attempt leaves it untouched.
    pub fn may_attempt(&self, now: Instant) -> bool {
        let st = self.state();
        match (st.is_open, st.last_attempt_at) {
            (true, Some(last)) => now.saturating_duration_since(last) >= self.cfg.cooldown,
            _ => true,
        }
    }

    /// Record an attempt started at `attempted_at` that succeeded at `finished`.
    pub fn record_success(
        &self,
        attempted_at: Instant,
        finished: Instant,
    ) -> Option<CircuitTransition> {
        let mut st = self.state();
        let was_open = st.is_open;
        st.last_attempt_at = Some(attempted_at);
        st.consecutive_failures = 0;
        st.is_open = false;
        st.last_success_at = Some(finished);
        was_open.then_some(CircuitTransition::Closed)
    }

    /// Record a failed attempt started at `attempted_at`.
    pub fn record_failure(&self, attempted_at: Instant) -> Option<CircuitTransition> {
        let mut st = self.state();
        st.last_attempt_at = Some(attempted_at);
        st.consecutive_failures = st.consecutive_failures.saturating_add(1);
        if !st.is_open && st.consecutive_failures >= self.cfg.max_failures {
            st.is_open = true;
            return Some(CircuitTransition::Opened);
        }
        None
    }

    pub fn is_open(&self) -> bool {
        self.state().is_open
    }

    /// Fail fast while the circuit is open.
    pub fn allow(&self) -> Result<()> {
        let st = self.state();
        if st.is_open {
            return Err(Error::unhealthy(format!(
                "health circuit open after {} consecutive failures",
                st.consecutive_failures
            )));
        }
        Ok(())
    }

    pub fn snapshot(&self, now: Instant) -> CircuitSnapshot {
        let st = self.state();
        let cooldown_remaining_ms = if st.is_open {
            st.last_attempt_at.and_then(|last| {
                let elapsed = now.saturating_duration_since(last);
                self.cfg
                    .cooldown
                    .checked_sub(elapsed)
                    .filter(|d| !d.is_zero())
                    .map(|d| d.as_millis() as u64)
            })
        } else {
            None
        };
        CircuitSnapshot {
            max_failures: self.cfg.max_failures,
            cooldown_ms: self.cfg.cooldown.as_millis() as u64,
            consecutive_failures: st.consecutive_failures,
            is_open: st.is_open,
            cooldown_remaining_ms,
            since_last_success_ms: st
                .last_success_at
                .map(|t| now.saturating_duration_since(t).as_millis() as u64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn breaker(max: u32, cooldown_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            CircuitBreakerConfig::new()
                .with_max_failures(max)
                .with_cooldown(Duration::from_millis(cooldown_ms)),
        )
    }

    #[test]
    fn test_circuit_breaker_config_defaults() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.max_failures, 3);
        assert_eq!(config.cooldown, Duration::from_secs(600));
    }

    #[test]
    fn test_initial_state() {
        let cb = breaker(3, 100);
        assert!(cb.allow().is_ok());
        let snapshot = cb.snapshot(Instant::now());
        assert_eq!(snapshot.consecutive_failures, 0);
        assert!(!snapshot.is_open);
        assert!(snapshot.cooldown_remaining_ms.is_none());
        assert!(snapshot.since_last_success_ms.is_none());
    }

    #[test]
    fn test_opens_at_threshold() {
        let cb = breaker(3, 100);
        let now = Instant::now();
        assert!(cb.may_attempt(now));
        assert_eq!(cb.record_failure(now), None);
        assert_eq!(cb.record_failure(now), None);
        assert!(cb.allow().is_ok());
        assert_eq!(cb.record_failure(now), Some(CircuitTransition::Opened));
        assert!(cb.is_open());
        assert!(cb.allow().is_err());
        assert_eq!(cb.record_failure(now), None);
    }

    #[test]
    fn test_cooldown_measured_from_last_attempt() {
        let cb = breaker(1, 1_000);
        let t0 = Instant::now();
        assert!(cb.may_attempt(t0));
        cb.record_failure(t0);
        assert!(!cb.may_attempt(t0 + Duration::from_millis(999)));
        assert_eq!(
            cb.snapshot(t0 + Duration::from_millis(400)).cooldown_remaining_ms,
            Some(600)
        );

        // A failing attempt after cooldown restarts the cooldown.
        let t1 = t0 + Duration::from_millis(1_000);
        assert!(cb.may_attempt(t1));
        cb.record_failure(t1);
        assert!(!cb.may_attempt(t1 + Duration::from_millis(500)));
        assert!(cb.may_attempt(t1 + Duration::from_millis(1_000)));
    }

    #[test]
    fn test_unrecorded_attempt_keeps_cooldown() {
        let cb = breaker(1, 1_000);
        let t0 = Instant::now();
        cb.record_failure(t0);

        // Permission checked but the attempt never reported an outcome.
        let t1 = t0 + Duration::from_millis(1_000);
        assert!(cb.may_attempt(t1));
        assert!(cb.may_attempt(t1 + Duration::from_millis(10)));
        assert_eq!(cb.snapshot(t1).cooldown_remaining_ms, None);
    }

    #[test]
    fn test_success_closes_and_resets() {
        let cb = breaker(2, 10);
        let t0 = Instant::now();
        cb.record_failure(t0);
        cb.record_failure(t0);
        assert!(cb.is_open());
        let t1 = t0 + Duration::from_millis(20);
        assert!(cb.may_attempt(t1));
        assert_eq!(cb.record_success(t1, t1), Some(CircuitTransition::Closed));
        let snap = cb.snapshot(t1);
        assert!(!snap.is_open);
        assert_eq!(snap.consecutive_failures, 0);
        assert_eq!(snap.since_last_success_ms, Some(0));
        assert_eq!(cb.record_success(t1, t1), None);
    }

    #[test]
    fn test_thread_safe() {
        use std::sync::Arc;

        let cb = Arc::new(breaker(100, 10));
        let mut handles = vec![];
        for _ in 0..10 {
            let cb_clone = Arc::clone(&cb);
            handles.push(thread::spawn(move || {
                for _ in 0..5 {
                    cb_clone.record_failure(Instant::now());
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cb.snapshot(Instant::now()).consecutive_failures, 50);
    }
}

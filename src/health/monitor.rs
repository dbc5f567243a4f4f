use super::snapshot::{ErrorCounter, MonitoringSnapshot, PerformanceFigures};
use super::{now_epoch_ms, HealthCheckResult, HealthProbe, HealthStatus, ProbeOutcome};
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitTransition};
use crate::Result;
use arc_swap::ArcSwap;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MonitorConfig {
    /// Scheduler period.
    pub interval_ms: u64,
    /// Consecutive failing cycles before the circuit opens.
    pub max_failures: u32,
    /// Pause between attempts while the circuit is open.
    pub cooldown_ms: u64,
    /// Bound applied to probes without an intrinsic timeout.
    pub probe_timeout_ms: u64,
    pub max_snapshot_bytes: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5 * 60 * 1000,
            max_failures: 3,
            cooldown_ms: 10 * 60 * 1000,
            probe_timeout_ms: 5_000,
            max_snapshot_bytes: super::snapshot::DEFAULT_MAX_SNAPSHOT_BYTES,
        }
    }
}

impl MonitorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_max_failures(mut self, n: u32) -> Self {
        self.max_failures = n;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown_ms = cooldown.as_millis() as u64;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::new()
            .with_max_failures(self.max_failures)
            .with_cooldown(Duration::from_millis(self.cooldown_ms))
    }
}

/// What a call to [`CircuitHealthMonitor::run_cycle`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Circuit open and cooling down; no probe ran.
    Skipped,
    /// No critical probe was unhealthy.
    Passed { transition: Option<CircuitTransition> },
    /// At least one critical probe was unhealthy.
    Failed {
        consecutive_failures: u32,
        transition: Option<CircuitTransition>,
    },
}

struct Scheduler {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct MonitorState {
    errors: ErrorCounter,
    performance: PerformanceFigures,
    last_status: HashMap<String, HealthStatus>,
}

/// Runs health probes on a schedule and keeps a circuit over the results.
///
/// Only state transitions and critical probe failures are logged; steady
/// state cycles are silent.
pub struct CircuitHealthMonitor {
    cfg: MonitorConfig,
    probes: RwLock<Vec<Arc<dyn HealthProbe>>>,
    breaker: CircuitBreaker,
    snapshot: ArcSwap<MonitoringSnapshot>,
    state: Mutex<MonitorState>,
    // Serializes cycles started by the scheduler and by direct callers.
    cycle_lock: tokio::sync::Mutex<()>,
    scheduler: Mutex<Option<Scheduler>>,
}

impl CircuitHealthMonitor {
    pub fn new(cfg: MonitorConfig) -> Self {
        let breaker = CircuitBreaker::new(cfg.breaker_config());
        let initial = MonitoringSnapshot {
            results: Vec::new(),
            errors: ErrorCounter::default(),
            performance: PerformanceFigures::default(),
            connected: true,
            circuit: breaker.snapshot(Instant::now()),
            generated_at: now_epoch_ms(),
        };
        Self {
            cfg,
            probes: RwLock::new(Vec::new()),
            breaker,
            snapshot: ArcSwap::from_pointee(initial),
            state: Mutex::new(MonitorState::default()),
            cycle_lock: tokio::sync::Mutex::new(()),
            scheduler: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.cfg
    }

    pub fn register_probe(&self, probe: Arc<dyn HealthProbe>) {
        self.probes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(probe);
    }

    fn state(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn registered_probes(&self) -> Vec<Arc<dyn HealthProbe>> {
        self.probes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Run every registered probe once, sequentially.
    ///
    /// A probe that errors, panics or exceeds its timeout becomes an
    /// `unhealthy` result; the remaining probes still run.
    pub async fn perform_health_check(&self) -> Vec<HealthCheckResult> {
        let default_timeout = Duration::from_millis(self.cfg.probe_timeout_ms.max(1));
        let mut results = Vec::new();
        for probe in self.registered_probes() {
            let limit = probe.timeout().unwrap_or(default_timeout);
            let started = Instant::now();
            let run = AssertUnwindSafe(probe.run()).catch_unwind();
            let outcome = match tokio::time::timeout(limit, run).await {
                Ok(Ok(Ok(outcome))) => outcome,
                Ok(Ok(Err(e))) => ProbeOutcome::unhealthy(e.to_string()),
                Ok(Err(_)) => ProbeOutcome::unhealthy("probe panicked"),
                Err(_) => ProbeOutcome::unhealthy(format!(
                    "probe timed out after {} ms",
                    limit.as_millis()
                )),
            };
            let outcome = match outcome.latency_ms {
                Some(_) => outcome,
                None => outcome.with_latency(started.elapsed()),
            };
            results.push(HealthCheckResult::from_outcome(
                probe.name(),
                probe.is_critical(),
                outcome,
            ));
        }
        results
    }

    /// One scheduler tick.
    ///
    /// Skipped entirely while the circuit is open and cooling down. Otherwise
    /// runs all probes, updates the circuit from the critical ones and
    /// publishes a fresh snapshot.
    pub async fn run_cycle(&self) -> CycleOutcome {
        let _cycle = self.cycle_lock.lock().await;
        let started = Instant::now();
        if !self.breaker.may_attempt(started) {
            return CycleOutcome::Skipped;
        }

        let results = self.perform_health_check().await;
        let finished = Instant::now();

        let critical_failures: Vec<&HealthCheckResult> = results
            .iter()
            .filter(|r| r.critical && r.status == HealthStatus::Unhealthy)
            .collect();
        for r in &critical_failures {
            warn!(
                probe = %r.service_name,
                error = r.error.as_deref().unwrap_or(""),
                "critical health probe unhealthy"
            );
        }

        let outcome = if critical_failures.is_empty() {
            let transition = self.breaker.record_success(started, finished);
            if transition == Some(CircuitTransition::Closed) {
                info!("health circuit closed after successful probe cycle");
            }
            CycleOutcome::Passed { transition }
        } else {
            let transition = self.breaker.record_failure(started);
            let circuit = self.breaker.snapshot(finished);
            if transition == Some(CircuitTransition::Opened) {
                warn!(
                    consecutive_failures = circuit.consecutive_failures,
                    cooldown_ms = circuit.cooldown_ms,
                    "health circuit opened, pausing probes"
                );
            }
            CycleOutcome::Failed {
                consecutive_failures: circuit.consecutive_failures,
                transition,
            }
        };

        let mut st = self.state();
        for r in &results {
            let previous = st.last_status.insert(r.service_name.clone(), r.status);
            if previous == Some(r.status) || r.critical {
                continue;
            }
            match (previous, r.status) {
                (_, HealthStatus::Unhealthy) => warn!(
                    probe = %r.service_name,
                    error = r.error.as_deref().unwrap_or(""),
                    "health probe became unhealthy"
                ),
                (Some(HealthStatus::Unhealthy), _) => {
                    info!(probe = %r.service_name, status = %r.status, "health probe recovered")
                }
                _ => {}
            }
        }

        let latencies: Vec<u64> = results.iter().filter_map(|r| r.response_time_ms).collect();
        st.performance.last_cycle_ms = Some(finished.duration_since(started).as_millis() as u64);
        st.performance.mean_probe_latency_ms = if latencies.is_empty() {
            None
        } else {
            Some(latencies.iter().sum::<u64>() as f64 / latencies.len() as f64)
        };
        st.performance.cycles_run += 1;
        debug!(
            cycle_ms = st.performance.last_cycle_ms,
            probes = results.len(),
            "health cycle finished"
        );

        self.publish(&st, Some(results));
        outcome
    }

    // Callers hold the state lock so concurrent publishes cannot interleave.
    fn publish(&self, st: &MonitorState, results: Option<Vec<HealthCheckResult>>) {
        let results = results.unwrap_or_else(|| self.snapshot.load().results.clone());
        let connected = !results
            .iter()
            .any(|r| r.critical && r.status == HealthStatus::Unhealthy);
        self.snapshot.store(Arc::new(MonitoringSnapshot {
            results,
            errors: st.errors.clone(),
            performance: st.performance.clone(),
            connected,
            circuit: self.breaker.snapshot(Instant::now()),
            generated_at: now_epoch_ms(),
        }));
    }

    /// Record an error seen by a collaborator (e.g. an error boundary).
    pub fn record_error(&self, message: impl Into<String>) {
        let mut st = self.state();
        st.errors.count += 1;
        st.errors.last_error = Some(message.into());
        st.errors.last_error_at = Some(now_epoch_ms());
        self.publish(&st, None);
    }

    /// Latest snapshot as an immutable copy.
    pub fn get_snapshot(&self) -> Arc<MonitoringSnapshot> {
        self.snapshot.load_full()
    }

    /// Latest snapshot serialized as JSON, bounded by `max_snapshot_bytes`.
    pub fn snapshot_json(&self) -> Result<String> {
        self.get_snapshot()
            .to_bounded_json(self.cfg.max_snapshot_bytes)
    }

    pub fn is_open(&self) -> bool {
        self.breaker.is_open()
    }

    /// `Err(ServiceUnhealthy)` while the circuit is open.
    pub fn check_available(&self) -> Result<()> {
        self.breaker.allow()
    }

    /// Human-readable summary of the latest snapshot.
    pub fn generate_health_report(&self) -> String {
        let snap = self.get_snapshot();
        let circuit = &snap.circuit;
        let mut out = String::new();

        let _ = writeln!(out, "Health report (generated at {} ms)", snap.generated_at);
        let _ = writeln!(
            out,
            "Overall: {} | circuit: {} ({}/{} consecutive failures) | connected: {}",
            snap.overall_status(),
            if circuit.is_open { "open" } else { "closed" },
            circuit.consecutive_failures,
            circuit.max_failures,
            if snap.connected { "yes" } else { "no" },
        );
        if let Some(remaining) = circuit.cooldown_remaining_ms {
            let _ = writeln!(out, "Next probe attempt in {} ms", remaining);
        }
        let _ = writeln!(
            out,
            "Probes: {} total, {} healthy, {} degraded, {} unhealthy",
            snap.results.len(),
            snap.count(HealthStatus::Healthy),
            snap.count(HealthStatus::Degraded),
            snap.count(HealthStatus::Unhealthy),
        );
        for r in &snap.results {
            let _ = write!(
                out,
                "  - {}{}: {}",
                r.service_name,
                if r.critical { " [critical]" } else { "" },
                r.status
            );
            if let Some(ms) = r.response_time_ms {
                let _ = write!(out, " ({} ms)", ms);
            }
            if let Some(err) = &r.error {
                let _ = write!(out, " - {}", err);
            }
            out.push('\n');
        }
        let _ = write!(out, "Errors: {} recorded", snap.errors.count);
        if let Some(last) = &snap.errors.last_error {
            let _ = write!(out, ", last: {}", last);
        }
        out.push('\n');
        if let Some(ms) = snap.performance.last_cycle_ms {
            let _ = writeln!(
                out,
                "Last cycle: {} ms over {} cycles",
                ms, snap.performance.cycles_run
            );
        }
        out
    }

    /// Start the periodic scheduler. Returns `false` if it is already running.
    ///
    /// Must be called from within a Tokio runtime. The first cycle runs
    /// immediately. The task holds only a weak reference, so dropping the
    /// last `Arc` also ends it.
    pub fn start(self: &Arc<Self>, interval: Duration) -> bool {
        let mut slot = self.scheduler.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = slot.as_ref() {
            if !existing.handle.is_finished() {
                return false;
            }
        }

        let interval = interval.max(Duration::from_millis(1));
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(monitor) = weak.upgrade() else { break };
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = monitor.run_cycle() => {}
                        }
                    }
                }
            }
            debug!("health monitor scheduler exited");
        });

        *slot = Some(Scheduler { cancel, handle });
        info!(interval_ms = interval.as_millis() as u64, "health monitor started");
        true
    }

    /// Start with the configured interval.
    pub fn start_default(self: &Arc<Self>) -> bool {
        self.start(self.cfg.interval())
    }

    /// Stop the scheduler. Returns `false` if it was not running.
    pub fn stop(&self) -> bool {
        let scheduler = self
            .scheduler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match scheduler {
            Some(s) => {
                s.cancel.cancel();
                s.handle.abort();
                info!("health monitor stopped");
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.scheduler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|s| !s.handle.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for CircuitHealthMonitor {
    fn drop(&mut self) {
        let slot = self.scheduler.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(s) = slot.take() {
            s.cancel.cancel();
            s.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::probes::FnProbe;
    use crate::Error;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn monitor(max_failures: u32, cooldown: Duration) -> CircuitHealthMonitor {
        CircuitHealthMonitor::new(
            MonitorConfig::new()
                .with_max_failures(max_failures)
                .with_cooldown(cooldown)
                .with_probe_timeout(Duration::from_millis(200)),
        )
    }

    fn switchable_probe(healthy: Arc<AtomicBool>, calls: Arc<AtomicUsize>) -> Arc<dyn HealthProbe> {
        Arc::new(FnProbe::new("backend", move || {
            let healthy = healthy.clone();
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if healthy.load(Ordering::SeqCst) {
                    Ok(ProbeOutcome::healthy())
                } else {
                    Ok(ProbeOutcome::unhealthy("connection refused"))
                }
            }
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_probe_does_not_abort_others() {
        let m = monitor(3, Duration::from_secs(60));
        m.register_probe(Arc::new(FnProbe::new("errors", || async {
            Err(Error::transient("boom"))
        })));
        m.register_probe(Arc::new(FnProbe::new("panics", || async {
            if true {
                panic!("probe bug");
            }
            Ok(ProbeOutcome::healthy())
        })));
        m.register_probe(Arc::new(FnProbe::new("hangs", || async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(ProbeOutcome::healthy())
        })));
        m.register_probe(Arc::new(FnProbe::new("ok", || async {
            Ok(ProbeOutcome::healthy())
        })));

        let results = m.perform_health_check().await;
        assert_eq!(results.len(), 4);
        assert_eq!(results[0].status, HealthStatus::Unhealthy);
        assert!(results[0].error.as_deref().unwrap().contains("boom"));
        assert_eq!(results[1].error.as_deref(), Some("probe panicked"));
        assert!(results[2].error.as_deref().unwrap().contains("timed out"));
        assert_eq!(results[3].status, HealthStatus::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trip_skip_and_recover() {
        let healthy = Arc::new(AtomicBool::new(false));
        let calls = Arc::new(AtomicUsize::new(0));
        let m = monitor(3, Duration::from_secs(600));
        m.register_probe(switchable_probe(healthy.clone(), calls.clone()));

        for i in 1..=2 {
            assert_eq!(
                m.run_cycle().await,
                CycleOutcome::Failed {
                    consecutive_failures: i,
                    transition: None
                }
            );
        }
        assert_eq!(
            m.run_cycle().await,
            CycleOutcome::Failed {
                consecutive_failures: 3,
                transition: Some(CircuitTransition::Opened)
            }
        );
        assert!(m.is_open());
        assert!(m.check_available().is_err());
        assert!(!m.get_snapshot().connected);

        healthy.store(true, Ordering::SeqCst);
        tokio::time::advance(Duration::from_secs(599)).await;
        assert_eq!(m.run_cycle().await, CycleOutcome::Skipped);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(
            m.run_cycle().await,
            CycleOutcome::Passed {
                transition: Some(CircuitTransition::Closed)
            }
        );
        assert!(!m.is_open());
        let snap = m.get_snapshot();
        assert_eq!(snap.circuit.consecutive_failures, 0);
        assert!(snap.connected);
        assert_eq!(snap.performance.cycles_run, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_critical_failures_do_not_trip() {
        let m = monitor(1, Duration::from_secs(60));
        m.register_probe(Arc::new(
            FnProbe::new("storage", || async { Ok(ProbeOutcome::unhealthy("full")) })
                .with_critical(false),
        ));
        assert!(matches!(m.run_cycle().await, CycleOutcome::Passed { .. }));
        assert!(!m.is_open());
        assert!(m.get_snapshot().connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_and_errors() {
        let m = monitor(3, Duration::from_secs(60));
        m.register_probe(Arc::new(FnProbe::new("backend", || async {
            Ok(ProbeOutcome::degraded("slow"))
        })));
        m.run_cycle().await;
        m.record_error("TypeError: failed to fetch");
        m.record_error("JWT expired");

        let snap = m.get_snapshot();
        assert_eq!(snap.errors.count, 2);
        assert_eq!(snap.errors.last_error.as_deref(), Some("JWT expired"));
        assert_eq!(snap.results.len(), 1);

        let report = m.generate_health_report();
        assert!(report.contains("Overall: degraded"));
        assert!(report.contains("circuit: closed"));
        assert!(report.contains("1 total, 0 healthy, 1 degraded, 0 unhealthy"));
        assert!(report.contains("backend [critical]: degraded"));
        assert!(report.contains("Errors: 2 recorded, last: JWT expired"));
        assert!(m.snapshot_json().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_stop_idempotent() {
        let calls = Arc::new(AtomicUsize::new(0));
        let m = Arc::new(monitor(3, Duration::from_secs(60)));
        m.register_probe(switchable_probe(Arc::new(AtomicBool::new(true)), calls.clone()));

        assert!(m.start(Duration::from_secs(300)));
        assert!(!m.start(Duration::from_secs(300)));
        assert!(m.is_running());

        // First tick fires immediately, then one per interval.
        tokio::time::sleep(Duration::from_secs(301)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        assert!(m.stop());
        assert!(!m.stop());
        assert!(!m.is_running());
        tokio::time::sleep(Duration::from_secs(1200)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        assert!(m.start(Duration::from_secs(300)));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        m.stop();
    }
}

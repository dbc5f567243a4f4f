//! 健康监控模块：可插拔探针、熔断式健康监控器与监控快照。
//!
//! # Health Monitoring Module
//!
//! Periodically probes the subsystems the dashboard depends on and keeps a
//! circuit over the results, so callers can skip expensive work while the
//! system is already known to be unhealthy.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`HealthProbe`] | Trait implemented by every check |
//! | [`probes`] | Built-in probes (HTTP reachability, storage, runtime, liveness) |
//! | [`monitor::CircuitHealthMonitor`] | Scheduler, circuit state and aggregation |
//! | [`snapshot::MonitoringSnapshot`] | Latest aggregate handed out to readers |

pub mod monitor;
pub mod probes;
pub mod snapshot;

pub use monitor::{CircuitHealthMonitor, CycleOutcome, MonitorConfig};
pub use snapshot::MonitoringSnapshot;

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub(crate) fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a probe reports about its own check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub status: HealthStatus,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

impl ProbeOutcome {
    pub fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            latency_ms: None,
            error: None,
        }
    }

    pub fn degraded(reason: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Degraded,
            latency_ms: None,
            error: Some(reason.into()),
        }
    }

    pub fn unhealthy(reason: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            latency_ms: None,
            error: Some(reason.into()),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency_ms = Some(latency.as_millis() as u64);
        self
    }

    pub fn is_unhealthy(&self) -> bool {
        self.status == HealthStatus::Unhealthy
    }
}

/// One probe's result within a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub service_name: String,
    pub status: HealthStatus,
    pub response_time_ms: Option<u64>,
    pub error: Option<String>,
    /// Wall-clock observation time, ms since the Unix epoch.
    pub observed_at: u64,
    /// Whether this probe participates in the circuit's trust decision.
    pub critical: bool,
}

impl HealthCheckResult {
    pub fn from_outcome(name: &str, critical: bool, outcome: ProbeOutcome) -> Self {
        Self {
            service_name: name.to_string(),
            status: outcome.status,
            response_time_ms: outcome.latency_ms,
            error: outcome.error,
            observed_at: now_epoch_ms(),
            critical,
        }
    }
}

/// An isolated check against one dependency or capability.
///
/// Implementations must not mutate application state. A probe returning
/// `Err` (or panicking) is recorded as unhealthy; it never aborts the cycle.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    fn name(&self) -> &str;

    /// Critical probes decide whether the circuit counts a cycle as failed.
    fn is_critical(&self) -> bool {
        true
    }

    /// Intrinsic timeout, if the probe enforces one itself. Probes returning
    /// `None` are bounded by the monitor's probe timeout.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    async fn run(&self) -> Result<ProbeOutcome>;
}

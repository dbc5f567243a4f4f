use super::{HealthCheckResult, HealthStatus};
use crate::resilience::circuit_breaker::CircuitSnapshot;
use crate::{Error, Result};
use serde::Serialize;

/// Default upper bound for a serialized snapshot handed to persistence.
pub const DEFAULT_MAX_SNAPSHOT_BYTES: usize = 50 * 1024;

/// Rolling error counter fed by error boundaries.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ErrorCounter {
    pub count: u64,
    pub last_error: Option<String>,
    /// ms since the Unix epoch.
    pub last_error_at: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct PerformanceFigures {
    pub last_cycle_ms: Option<u64>,
    /// Mean reported latency of the probes in the last cycle.
    pub mean_probe_latency_ms: Option<f64>,
    pub cycles_run: u64,
}

/// Latest aggregate view produced by the health monitor.
///
/// Readers receive an immutable copy; the monitor replaces it every cycle.
#[derive(Debug, Clone, Serialize)]
pub struct MonitoringSnapshot {
    pub results: Vec<HealthCheckResult>,
    pub errors: ErrorCounter,
    pub performance: PerformanceFigures,
    /// False when any critical probe was unhealthy in the last cycle.
    pub connected: bool,
    pub circuit: CircuitSnapshot,
    /// ms since the Unix epoch.
    pub generated_at: u64,
}

impl MonitoringSnapshot {
    pub fn count(&self, status: HealthStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    /// Worst status across all results, `Healthy` when there are none.
    pub fn overall_status(&self) -> HealthStatus {
        if self.count(HealthStatus::Unhealthy) > 0 {
            HealthStatus::Unhealthy
        } else if self.count(HealthStatus::Degraded) > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    /// Serialize to JSON, refusing snapshots above `max_bytes`.
    pub fn to_bounded_json(&self, max_bytes: usize) -> Result<String> {
        let json = serde_json::to_string(self)?;
        if json.len() > max_bytes {
            return Err(Error::SnapshotTooLarge {
                size: json.len(),
                limit: max_bytes,
            });
        }
        Ok(json)
    }
}

//! Built-in health probes.

use super::{HealthProbe, ProbeOutcome};
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use rand::Rng;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use url::Url;

/// GETs a dependency endpoint and checks the status code.
pub struct HttpReachabilityProbe {
    name: String,
    url: Url,
    client: reqwest::Client,
    expected_status: Vec<u16>,
    timeout: Duration,
    degraded_after: Duration,
    critical: bool,
}

impl HttpReachabilityProbe {
    pub fn new(name: impl Into<String>, url: &str) -> Result<Self> {
        let url = Url::parse(url).map_err(|e| {
            Error::configuration_with_context(
                format!("invalid probe url: {}", e),
                ErrorContext::new()
                    .with_field_path("probe.url")
                    .with_details(url.to_string())
                    .with_source("http_probe"),
            )
        })?;
        let timeout = Duration::from_secs(5);
        Ok(Self {
            name: name.into(),
            url,
            client: build_client(timeout)?,
            expected_status: vec![200, 204],
            timeout,
            degraded_after: Duration::from_secs(2),
            critical: true,
        })
    }

    pub fn with_expected_status(mut self, statuses: Vec<u16>) -> Self {
        self.expected_status = statuses;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.client = build_client(timeout)?;
        self.timeout = timeout;
        Ok(self)
    }

    /// Responses slower than this are reported as degraded.
    pub fn with_degraded_after(mut self, threshold: Duration) -> Self {
        self.degraded_after = threshold;
        self
    }

    pub fn with_critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }
}

fn build_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| {
            Error::configuration_with_context(
                format!("failed to build probe http client: {}", e),
                ErrorContext::new().with_source("http_probe"),
            )
        })
}

#[async_trait]
impl HealthProbe for HttpReachabilityProbe {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_critical(&self) -> bool {
        self.critical
    }

    fn timeout(&self) -> Option<Duration> {
        Some(self.timeout)
    }

    async fn run(&self) -> Result<ProbeOutcome> {
        let started = Instant::now();
        let outcome = match self.client.get(self.url.clone()).send().await {
            Ok(resp) => {
                let status = resp.status().as_u16();
                if !self.expected_status.contains(&status) {
                    ProbeOutcome::unhealthy(format!("unexpected status {}", status))
                } else if started.elapsed() > self.degraded_after {
                    ProbeOutcome::degraded(format!(
                        "slow response ({} ms)",
                        started.elapsed().as_millis()
                    ))
                } else {
                    ProbeOutcome::healthy()
                }
            }
            Err(e) if e.is_timeout() => ProbeOutcome::unhealthy("request timed out"),
            Err(e) => ProbeOutcome::unhealthy(format!("unreachable: {}", e)),
        };
        Ok(outcome.with_latency(started.elapsed()))
    }
}

/// Checks that a local directory can be written, read back and cleaned up.
pub struct StorageProbe {
    name: String,
    dir: PathBuf,
    critical: bool,
}

impl StorageProbe {
    pub fn new(name: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            dir: dir.into(),
            critical: false,
        }
    }

    pub fn with_critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }
}

#[async_trait]
impl HealthProbe for StorageProbe {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_critical(&self) -> bool {
        self.critical
    }

    async fn run(&self) -> Result<ProbeOutcome> {
        let started = Instant::now();
        let nonce: u64 = rand::thread_rng().gen();
        let path = self.dir.join(format!(".health-probe-{:016x}", nonce));
        let payload = nonce.to_le_bytes();

        tokio::fs::write(&path, payload).await?;
        let read_back = tokio::fs::read(&path).await;
        // Remove before inspecting the read so a mismatch never leaves the marker behind.
        let removed = tokio::fs::remove_file(&path).await;
        let read_back = read_back?;
        removed?;

        if read_back != payload {
            return Ok(ProbeOutcome::unhealthy("storage returned different bytes")
                .with_latency(started.elapsed()));
        }
        Ok(ProbeOutcome::healthy().with_latency(started.elapsed()))
    }
}

/// Checks the capabilities the process expects from its host.
pub struct RuntimeCapabilityProbe {
    required_env: Vec<String>,
    min_parallelism: usize,
}

impl RuntimeCapabilityProbe {
    pub fn new() -> Self {
        Self {
            required_env: Vec::new(),
            min_parallelism: 1,
        }
    }

    /// Environment variables that must be present and non-empty.
    pub fn with_required_env(mut self, vars: Vec<String>) -> Self {
        self.required_env = vars;
        self
    }

    /// Fewer available cores than this reports degraded.
    pub fn with_min_parallelism(mut self, n: usize) -> Self {
        self.min_parallelism = n;
        self
    }
}

impl Default for RuntimeCapabilityProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HealthProbe for RuntimeCapabilityProbe {
    fn name(&self) -> &str {
        "runtime"
    }

    fn is_critical(&self) -> bool {
        false
    }

    async fn run(&self) -> Result<ProbeOutcome> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Ok(ProbeOutcome::unhealthy("no async runtime available"));
        }

        let missing: Vec<&str> = self
            .required_env
            .iter()
            .filter(|v| std::env::var(v).map(|s| s.is_empty()).unwrap_or(true))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Ok(ProbeOutcome::unhealthy(format!(
                "missing environment: {}",
                missing.join(", ")
            )));
        }

        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        if parallelism < self.min_parallelism {
            return Ok(ProbeOutcome::degraded(format!(
                "available parallelism {} below {}",
                parallelism, self.min_parallelism
            )));
        }
        Ok(ProbeOutcome::healthy())
    }
}

/// Always healthy; proves the monitor loop itself is alive.
pub struct LivenessProbe;

#[async_trait]
impl HealthProbe for LivenessProbe {
    fn name(&self) -> &str {
        "liveness"
    }

    fn is_critical(&self) -> bool {
        false
    }

    async fn run(&self) -> Result<ProbeOutcome> {
        Ok(ProbeOutcome::healthy())
    }
}

type ProbeFn = dyn Fn() -> BoxFuture<'static, Result<ProbeOutcome>> + Send + Sync;

/// Adapts an async closure into a probe.
///
/// ```rust
/// use dashboard_resilience::health::probes::FnProbe;
/// use dashboard_resilience::health::ProbeOutcome;
///
/// let probe = FnProbe::new("cache", || async { Ok(ProbeOutcome::healthy()) });
/// ```
pub struct FnProbe {
    name: String,
    critical: bool,
    check: Box<ProbeFn>,
}

impl FnProbe {
    pub fn new<F, Fut>(name: impl Into<String>, check: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<ProbeOutcome>> + Send + 'static,
    {
        Self {
            name: name.into(),
            critical: true,
            check: Box::new(move || Box::pin(check())),
        }
    }

    pub fn with_critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }
}

#[async_trait]
impl HealthProbe for FnProbe {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_critical(&self) -> bool {
        self.critical
    }

    async fn run(&self) -> Result<ProbeOutcome> {
        (self.check)().await
    }
}

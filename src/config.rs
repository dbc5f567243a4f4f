//! Resilience configuration: file loading, environment overrides, validation.
//!
//! Every section is optional in the file; missing keys take their defaults.
//!
//! ```yaml
//! rate_limiter:
//!   capacity: 50
//!   refill_rate: 1.0
//! monitor:
//!   interval_ms: 300000
//!   max_failures: 3
//!   cooldown_ms: 600000
//! retry:
//!   base_delay_ms: 1000
//!   max_delay_ms: 30000
//!   max_attempts: 3
//! ```

use crate::health::MonitorConfig;
use crate::resilience::rate_limiter::RateLimiterConfig;
use crate::retry::RetryConfig;
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::str::FromStr;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResilienceConfig {
    pub rate_limiter: RateLimiterConfig,
    pub monitor: MonitorConfig,
    pub retry: RetryConfig,
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|s| s.trim().parse::<T>().ok())
}

fn invalid(field: &str, message: impl Into<String>) -> Error {
    Error::configuration_with_context(
        message,
        ErrorContext::new()
            .with_field_path(field)
            .with_source("resilience_config"),
    )
}

impl ResilienceConfig {
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        let cfg: Self = serde_yaml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a `.json`, `.yaml` or `.yml` file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&raw),
            Some("yaml") | Some("yml") => Self::from_yaml_str(&raw),
            other => Err(Error::configuration_with_context(
                "unsupported config file extension",
                ErrorContext::new()
                    .with_details(format!("{:?}", other))
                    .with_field_path(path.display().to_string())
                    .with_source("resilience_config"),
            )),
        }
    }

    /// Apply `DASHBOARD_*` environment overrides; unparsable values are ignored.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Some(v) = env_parse::<f64>("DASHBOARD_RATE_CAPACITY") {
            self.rate_limiter.capacity = v;
        }
        if let Some(v) = env_parse::<f64>("DASHBOARD_RATE_REFILL_PER_SEC") {
            self.rate_limiter.refill_rate = v;
        }
        if let Some(v) = env_parse::<u64>("DASHBOARD_MONITOR_INTERVAL_MS") {
            self.monitor.interval_ms = v;
        }
        if let Some(v) = env_parse::<u64>("DASHBOARD_MONITOR_COOLDOWN_MS") {
            self.monitor.cooldown_ms = v;
        }
        if let Some(v) = env_parse::<u32>("DASHBOARD_MONITOR_MAX_FAILURES") {
            self.monitor.max_failures = v;
        }
        if let Some(v) = env_parse::<u64>("DASHBOARD_RETRY_BASE_DELAY_MS") {
            self.retry.base_delay_ms = v;
        }
        if let Some(v) = env_parse::<u64>("DASHBOARD_RETRY_MAX_DELAY_MS") {
            self.retry.max_delay_ms = v;
        }
        if let Some(v) = env_parse::<u32>("DASHBOARD_RETRY_MAX_ATTEMPTS") {
            self.retry.max_attempts = v;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        let rl = &self.rate_limiter;
        if !rl.capacity.is_finite() || rl.capacity < 1.0 {
            return Err(invalid("rate_limiter.capacity", "capacity must be at least 1"));
        }
        if !rl.refill_rate.is_finite() || rl.refill_rate <= 0.0 {
            return Err(invalid(
                "rate_limiter.refill_rate",
                "refill rate must be positive",
            ));
        }
        if rl.max_wait_slice_ms == 0 {
            return Err(invalid(
                "rate_limiter.max_wait_slice_ms",
                "wait slice must be positive",
            ));
        }

        let m = &self.monitor;
        if m.interval_ms == 0 {
            return Err(invalid("monitor.interval_ms", "interval must be positive"));
        }
        if m.max_failures == 0 {
            return Err(invalid("monitor.max_failures", "max failures must be at least 1"));
        }
        if m.probe_timeout_ms == 0 {
            return Err(invalid(
                "monitor.probe_timeout_ms",
                "probe timeout must be positive",
            ));
        }

        let r = &self.retry;
        if r.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "max attempts must be at least 1"));
        }
        if r.base_delay_ms > r.max_delay_ms {
            return Err(invalid(
                "retry.base_delay_ms",
                "base delay must not exceed max delay",
            ));
        }
        if !(0.0..1.0).contains(&r.jitter) {
            return Err(invalid("retry.jitter", "jitter must be in [0, 1)"));
        }
        Ok(())
    }
}

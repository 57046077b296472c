//! Control-plane configuration.

use crate::errors::FlowError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Prefix for environment variable overrides.
pub const ENV_PREFIX: &str = "PODFLOW_";

/// Timing and concurrency settings for the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlPlaneConfig {
    /// Delay between two health probes of a starting replica.
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_ms: u64,
    /// How long a replica may take to report healthy.
    #[serde(default = "default_health_check_timeout")]
    pub health_check_timeout_ms: u64,
    /// How long a retiring replica may drain in-flight work.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_ms: u64,
    /// Upper bound for materializing a whole flow.
    #[serde(default = "default_build_timeout")]
    pub build_timeout_ms: u64,
    /// Upper bound for tearing down a failed attempt.
    #[serde(default = "default_cleanup_timeout")]
    pub cleanup_timeout_ms: u64,
    /// Whether health probes are jittered.
    #[serde(default = "default_health_jitter")]
    pub health_jitter: bool,
    /// Maximum replicas started concurrently within one dependency level.
    #[serde(default = "default_max_concurrent_starts")]
    pub max_concurrent_starts: usize,
}

fn default_health_check_interval() -> u64 {
    50
}

fn default_health_check_timeout() -> u64 {
    5_000
}

fn default_drain_timeout() -> u64 {
    2_000
}

fn default_build_timeout() -> u64 {
    60_000
}

fn default_cleanup_timeout() -> u64 {
    10_000
}

fn default_health_jitter() -> bool {
    true
}

fn default_max_concurrent_starts() -> usize {
    16
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            health_check_interval_ms: default_health_check_interval(),
            health_check_timeout_ms: default_health_check_timeout(),
            drain_timeout_ms: default_drain_timeout(),
            build_timeout_ms: default_build_timeout(),
            cleanup_timeout_ms: default_cleanup_timeout(),
            health_jitter: default_health_jitter(),
            max_concurrent_starts: default_max_concurrent_starts(),
        }
    }
}

impl ControlPlaneConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON document; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, FlowError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| FlowError::InvalidRequest(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `PODFLOW_<FIELD>` environment variables on top of this config.
    pub fn with_env_overrides(self) -> Result<Self, FlowError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary lookup, keyed like the environment.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, FlowError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read_u64 = |field: &str, target: &mut u64| -> Result<(), FlowError> {
            let key = format!("{ENV_PREFIX}{}", field.to_uppercase());
            if let Some(raw) = lookup(&key) {
                *target = raw
                    .trim()
                    .parse()
                    .map_err(|_| FlowError::InvalidRequest(format!("{key}={raw} is not an integer")))?;
            }
            Ok(())
        };

        read_u64("health_check_interval_ms", &mut self.health_check_interval_ms)?;
        read_u64("health_check_timeout_ms", &mut self.health_check_timeout_ms)?;
        read_u64("drain_timeout_ms", &mut self.drain_timeout_ms)?;
        read_u64("build_timeout_ms", &mut self.build_timeout_ms)?;
        read_u64("cleanup_timeout_ms", &mut self.cleanup_timeout_ms)?;

        let mut concurrency = self.max_concurrent_starts as u64;
        read_u64("max_concurrent_starts", &mut concurrency)?;
        self.max_concurrent_starts = usize::try_from(concurrency)
            .map_err(|_| FlowError::InvalidRequest("max_concurrent_starts out of range".into()))?;

        if let Some(raw) = lookup(&format!("{ENV_PREFIX}HEALTH_JITTER")) {
            self.health_jitter = matches!(raw.trim(), "1" | "true" | "yes" | "on");
        }

        self.validate()?;
        Ok(self)
    }

    /// Sets the health probe interval.
    #[must_use]
    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval_ms = duration_ms(interval);
        self
    }

    /// Sets the health timeout.
    #[must_use]
    pub fn with_health_check_timeout(mut self, timeout: Duration) -> Self {
        self.health_check_timeout_ms = duration_ms(timeout);
        self
    }

    /// Sets the drain timeout.
    #[must_use]
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout_ms = duration_ms(timeout);
        self
    }

    /// Sets the build timeout.
    #[must_use]
    pub fn with_build_timeout(mut self, timeout: Duration) -> Self {
        self.build_timeout_ms = duration_ms(timeout);
        self
    }

    /// Disables health probe jitter.
    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.health_jitter = false;
        self
    }

    /// Rejects zero intervals, timeouts and concurrency.
    pub fn validate(&self) -> Result<(), FlowError> {
        let checks = [
            ("health_check_interval_ms", self.health_check_interval_ms),
            ("health_check_timeout_ms", self.health_check_timeout_ms),
            ("build_timeout_ms", self.build_timeout_ms),
            ("cleanup_timeout_ms", self.cleanup_timeout_ms),
            ("max_concurrent_starts", self.max_concurrent_starts as u64),
        ];
        for (field, value) in checks {
            if value == 0 {
                return Err(FlowError::InvalidRequest(format!("{field} must be greater than 0")));
            }
        }
        Ok(())
    }

    /// Health probe interval.
    #[must_use]
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    /// Health timeout.
    #[must_use]
    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }

    /// Drain timeout.
    #[must_use]
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Build timeout.
    #[must_use]
    pub fn build_timeout(&self) -> Duration {
        Duration::from_millis(self.build_timeout_ms)
    }

    /// Cleanup timeout.
    #[must_use]
    pub fn cleanup_timeout(&self) -> Duration {
        Duration::from_millis(self.cleanup_timeout_ms)
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = ControlPlaneConfig::default();
        assert_eq!(config.health_check_interval(), Duration::from_millis(50));
        assert_eq!(config.build_timeout(), Duration::from_secs(60));
        assert!(config.health_jitter);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_partial() {
        let config = ControlPlaneConfig::from_json_str(r#"{"drain_timeout_ms": 10}"#).unwrap();
        assert_eq!(config.drain_timeout_ms, 10);
        assert_eq!(config.health_check_timeout_ms, 5_000);
    }

    #[test]
    fn test_from_json_rejects_zero() {
        assert!(ControlPlaneConfig::from_json_str(r#"{"build_timeout_ms": 0}"#).is_err());
        assert!(ControlPlaneConfig::from_json_str("not json").is_err());
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("PODFLOW_HEALTH_CHECK_TIMEOUT_MS", "250"),
            ("PODFLOW_MAX_CONCURRENT_STARTS", "2"),
            ("PODFLOW_HEALTH_JITTER", "false"),
        ]
        .into_iter()
        .collect();

        let config = ControlPlaneConfig::default()
            .with_overrides(|key| env.get(key).map(|v| (*v).to_string()))
            .unwrap();

        assert_eq!(config.health_check_timeout_ms, 250);
        assert_eq!(config.max_concurrent_starts, 2);
        assert!(!config.health_jitter);
    }

    #[test]
    fn test_overrides_reject_garbage() {
        let result = ControlPlaneConfig::default().with_overrides(|key| {
            (key == "PODFLOW_DRAIN_TIMEOUT_MS").then(|| "soon".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_setters() {
        let config = ControlPlaneConfig::new()
            .with_health_check_interval(Duration::from_millis(5))
            .with_drain_timeout(Duration::from_millis(1))
            .without_jitter();
        assert_eq!(config.health_check_interval_ms, 5);
        assert_eq!(config.drain_timeout_ms, 1);
        assert!(!config.health_jitter);
    }
}

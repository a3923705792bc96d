//! Supervisor configuration
//!
//! Loaded once at startup from an optional TOML file layered under
//! `SUPERVISOR__*` environment variables, then validated. Nothing here is
//! mutated after load.

use crate::capacity::TimeBasedUsagePolicy;
use crate::error::{Result, SupervisorError};
use crate::models::StopOptions;
use crate::runtime::RuntimeId;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment prefix; nested keys use `__`, e.g. `SUPERVISOR__WATCHDOG__MAX_RESTARTS`
pub const ENV_PREFIX: &str = "SUPERVISOR";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Interval between health polls of monitored containers
    pub poll_interval_ms: u64,
    pub container: ContainerConfig,
    pub health_check: HealthCheckConfig,
    pub watchdog: WatchdogConfig,
    pub time_based_usage: TimeBasedUsagePolicy,
    pub api: ApiConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            container: ContainerConfig::default(),
            health_check: HealthCheckConfig::default(),
            watchdog: WatchdogConfig::default(),
            time_based_usage: TimeBasedUsagePolicy::default(),
            api: ApiConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Preferred engine; probed first when set
    pub runtime: Option<RuntimeId>,
    /// Name prefix identifying containers this supervisor manages
    pub name_prefix: String,
    /// Monitor every created container, not only prefixed ones
    pub monitor_all: bool,
    /// Consecutive failed polls before a container is unhealthy
    pub max_failures: u32,
    /// Per-poll stats budget
    pub health_timeout_ms: u64,
    /// Grace the engine gives a container on stop before SIGKILL
    pub stop_timeout_secs: u64,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            runtime: None,
            name_prefix: "agent-task-".to_string(),
            monitor_all: false,
            max_failures: 3,
            health_timeout_ms: 5_000,
            stop_timeout_secs: 10,
        }
    }
}

/// Watchdog self-check settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    pub timeout_ms: u64,
    pub retries: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 30_000,
            timeout_ms: 5_000,
            retries: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub enabled: bool,
    pub restart_delay_ms: u64,
    pub max_restarts: u32,
    pub restart_window_secs: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            restart_delay_ms: 5_000,
            max_restarts: 5,
            restart_window_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Daemon health/metrics/status port
    pub port: u16,
    /// Watchdog status port
    pub watchdog_port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            watchdog_port: 8081,
        }
    }
}

impl SupervisorConfig {
    /// Load from an optional file plus environment overrides, then validate
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("time_based_usage.day_mode_hours")
                    .with_list_parse_key("time_based_usage.night_mode_hours")
                    .try_parsing(true),
            )
            .build()?;

        let parsed: SupervisorConfig = config.try_deserialize()?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Check every numeric field; thresholds in [0, 1], counts and intervals positive
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("poll_interval_ms", self.poll_interval_ms),
            ("container.health_timeout_ms", self.container.health_timeout_ms),
            ("container.max_failures", u64::from(self.container.max_failures)),
            ("container.stop_timeout_secs", self.container.stop_timeout_secs),
            ("health_check.interval_ms", self.health_check.interval_ms),
            ("health_check.timeout_ms", self.health_check.timeout_ms),
            ("health_check.retries", u64::from(self.health_check.retries)),
            ("watchdog.restart_delay_ms", self.watchdog.restart_delay_ms),
            ("watchdog.max_restarts", u64::from(self.watchdog.max_restarts)),
            ("watchdog.restart_window_secs", self.watchdog.restart_window_secs),
        ];

        for (name, value) in positive {
            if value == 0 {
                return Err(SupervisorError::Config(format!("{name} must be positive")));
            }
        }

        if self.container.name_prefix.is_empty() && !self.container.monitor_all {
            return Err(SupervisorError::Config(
                "container.name_prefix must be set unless monitor_all is enabled".into(),
            ));
        }

        self.time_based_usage.validate()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.container.health_timeout_ms)
    }
}

impl From<&SupervisorConfig> for StopOptions {
    fn from(config: &SupervisorConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.container.stop_timeout_secs),
        }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl WatchdogConfig {
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn restart_window(&self) -> Duration {
        Duration::from_secs(self.restart_window_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_are_valid() {
        tokio_test::assert_ok!(SupervisorConfig::default().validate());
    }

    #[test]
    fn test_load_from_file() {
        let file = write_config(
            r#"
poll_interval_ms = 1000

[container]
runtime = "podman"
name_prefix = "sbx-"
max_failures = 2

[watchdog]
max_restarts = 3
restart_window_secs = 60

[time_based_usage]
enabled = true
day_mode_hours = [8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18]
night_mode_hours = [0, 1, 2, 3, 4, 5, 6, 7, 19, 20, 21, 22, 23]
day_mode_capacity_threshold = 0.4
night_mode_capacity_threshold = 0.95
"#,
        );

        let config = SupervisorConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.container.runtime, Some(RuntimeId::Podman));
        assert_eq!(config.container.name_prefix, "sbx-");
        assert_eq!(config.container.max_failures, 2);
        assert_eq!(config.watchdog.max_restarts, 3);
        assert!(config.time_based_usage.enabled);
        assert!(config.time_based_usage.day_mode_hours.contains(&10));
        assert_eq!(config.time_based_usage.day_mode_capacity_threshold, 0.4);
        // Untouched sections keep their defaults
        assert_eq!(config.health_check, HealthCheckConfig::default());
    }

    #[test]
    fn test_load_rejects_out_of_range_threshold() {
        let file = write_config(
            r#"
[time_based_usage]
day_mode_capacity_threshold = 1.2
"#,
        );

        let err = SupervisorConfig::load(Some(file.path())).unwrap_err();
        assert!(matches!(err, SupervisorError::Config(_)));
        assert!(err.to_string().contains("day_mode_capacity_threshold"));
    }

    #[test]
    fn test_load_rejects_non_finite_threshold() {
        let file = write_config(
            r#"
[time_based_usage]
night_mode_capacity_threshold = nan
"#,
        );

        assert!(SupervisorConfig::load(Some(file.path())).is_err());

        let file = write_config(
            r#"
[time_based_usage]
night_mode_capacity_threshold = inf
"#,
        );

        assert!(SupervisorConfig::load(Some(file.path())).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_intervals_and_counts() {
        let mut config = SupervisorConfig::default();
        config.poll_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = SupervisorConfig::default();
        config.watchdog.max_restarts = 0;
        assert!(config.validate().is_err());

        let mut config = SupervisorConfig::default();
        config.container.max_failures = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_restart_delay_and_stop_timeout() {
        let mut config = SupervisorConfig::default();
        config.watchdog.restart_delay_ms = 0;
        let err = tokio_test::assert_err!(config.validate());
        assert!(err.to_string().contains("watchdog.restart_delay_ms"));

        let mut config = SupervisorConfig::default();
        config.container.stop_timeout_secs = 0;
        let err = tokio_test::assert_err!(config.validate());
        assert!(err.to_string().contains("container.stop_timeout_secs"));
    }

    #[test]
    fn test_stop_options_from_config() {
        let file = write_config(
            r#"
[container]
stop_timeout_secs = 25
"#,
        );

        let config = SupervisorConfig::load(Some(file.path())).unwrap();
        assert_eq!(StopOptions::from(&config).timeout, Duration::from_secs(25));
        assert_eq!(
            StopOptions::from(&SupervisorConfig::default()),
            StopOptions::default()
        );
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = SupervisorConfig::load(Some(Path::new("/nonexistent/supervisor.toml")));
        assert!(err.is_err());
    }
}

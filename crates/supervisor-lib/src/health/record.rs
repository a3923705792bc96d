//! Per-container health record and its state transitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Tracked, no successful poll yet since the last start
    Starting,
    Healthy,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Starting => "starting",
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub container_id: String,
    pub container_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub status: HealthStatus,
    /// Consecutive failed polls, capped at the failure limit
    pub failing_streak: u32,
    pub last_check_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthRecord {
    pub fn starting(
        container_id: impl Into<String>,
        container_name: impl Into<String>,
        task_id: Option<String>,
    ) -> Self {
        Self {
            container_id: container_id.into(),
            container_name: container_name.into(),
            task_id,
            status: HealthStatus::Starting,
            failing_streak: 0,
            last_check_at: None,
            error: None,
        }
    }

    /// The container (re)started
    pub fn restart(&mut self) {
        self.status = HealthStatus::Starting;
        self.failing_streak = 0;
        self.error = None;
    }

    pub fn record_success(&mut self) {
        self.status = HealthStatus::Healthy;
        self.failing_streak = 0;
        self.error = None;
        self.last_check_at = Some(Utc::now());
    }

    pub fn record_failure(&mut self, reason: impl Into<String>, max_failures: u32) {
        self.failing_streak = (self.failing_streak + 1).min(max_failures);
        if self.failing_streak >= max_failures {
            self.status = HealthStatus::Unhealthy;
        }
        self.error = Some(reason.into());
        self.last_check_at = Some(Utc::now());
    }

    pub fn record_death(&mut self, exit_code: i64, oom_killed: bool, max_failures: u32) {
        self.status = HealthStatus::Unhealthy;
        self.failing_streak = max_failures;
        self.error = Some(death_message(exit_code, oom_killed));
    }
}

pub fn death_message(exit_code: i64, oom_killed: bool) -> String {
    let mut message = format!("Container died unexpectedly (exit code: {exit_code})");
    if oom_killed {
        message.push_str(" [OOM killed]");
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> HealthRecord {
        HealthRecord::starting("c1", "agent-task-1", None)
    }

    #[test]
    fn test_failures_saturate_at_limit() {
        let mut r = record();
        r.record_failure("stats unavailable", 3);
        r.record_failure("stats unavailable", 3);
        assert_eq!(r.status, HealthStatus::Starting);
        assert_eq!(r.failing_streak, 2);

        r.record_failure("stats unavailable", 3);
        assert_eq!(r.status, HealthStatus::Unhealthy);
        assert_eq!(r.failing_streak, 3);

        r.record_failure("stats unavailable", 3);
        assert_eq!(r.failing_streak, 3);
    }

    #[test]
    fn test_success_resets_unhealthy() {
        let mut r = record();
        for _ in 0..3 {
            r.record_failure("boom", 3);
        }
        r.record_success();

        assert_eq!(r.status, HealthStatus::Healthy);
        assert_eq!(r.failing_streak, 0);
        assert_eq!(r.error, None);
        assert!(r.last_check_at.is_some());
    }

    #[test]
    fn test_death_and_restart() {
        let mut r = record();
        r.record_success();
        r.record_death(137, true, 3);

        assert_eq!(r.status, HealthStatus::Unhealthy);
        assert_eq!(r.failing_streak, 3);
        assert_eq!(
            r.error.as_deref(),
            Some("Container died unexpectedly (exit code: 137) [OOM killed]")
        );

        r.restart();
        assert_eq!(r.status, HealthStatus::Starting);
        assert_eq!(r.failing_streak, 0);
        assert_eq!(r.error, None);
    }
}

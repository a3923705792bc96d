//! Daemon watchdog
//!
//! Runs the supervisor daemon as a child, restarts it when it crashes and
//! gives up once restarts pile up inside the configured window. Alongside
//! supervision it probes the daemon periodically and keeps the counters
//! reported as [`HealthMetrics`].

mod supervised;
mod tracker;

pub use supervised::{ChildProcess, ExitInfo, Supervised, EXIT_CIRCUIT_OPEN, EXIT_NO_RUNTIME, TERM_GRACE};
pub use tracker::{RestartDecision, RestartRecord, RestartTracker, RESTART_HISTORY_CAP};

use crate::config::{HealthCheckConfig, SupervisorConfig};
use crate::error::{Result, SupervisorError};
use crate::observability::{host_name, StructuredLogger, SupervisorMetrics};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Liveness probe of the supervised daemon
#[async_trait]
pub trait SelfCheck: Send + Sync {
    async fn check(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskOutcome {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub active: u64,
}

/// Snapshot reported on the watchdog status endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthMetrics {
    pub uptime_secs: u64,
    pub memory_usage_bytes: u64,
    pub task_counts: TaskCounts,
    pub last_health_check: Option<DateTime<Utc>>,
    pub health_checks_passed: u64,
    pub health_checks_failed: u64,
    /// Newest first
    pub restart_history: Vec<RestartRecord>,
    pub circuit_open: bool,
}

#[derive(Debug, Clone)]
pub struct WatchdogSettings {
    pub restart_delay: Duration,
    pub max_restarts: u32,
    pub restart_window: Duration,
    pub health_check: HealthCheckConfig,
    /// Kill and relaunch the daemon when a whole self-check round fails
    pub restart_on_failed_check: bool,
}

impl From<&SupervisorConfig> for WatchdogSettings {
    fn from(config: &SupervisorConfig) -> Self {
        Self {
            restart_delay: config.watchdog.restart_delay(),
            max_restarts: config.watchdog.max_restarts,
            restart_window: config.watchdog.restart_window(),
            health_check: config.health_check.clone(),
            restart_on_failed_check: true,
        }
    }
}

#[derive(Default)]
struct CheckCounts {
    passed: u64,
    failed: u64,
    last: Option<DateTime<Utc>>,
}

pub struct Watchdog {
    settings: WatchdogSettings,
    tracker: RestartTracker,
    started_at: Instant,
    tasks: Mutex<TaskCounts>,
    checks: Mutex<CheckCounts>,
    restart_requested: Notify,
    cancel: CancellationToken,
    metrics: SupervisorMetrics,
    logger: StructuredLogger,
}

enum Crash {
    Exited(ExitInfo),
    LaunchFailed(String),
    WaitFailed(String),
    FailedChecks,
}

impl Crash {
    fn reason(&self) -> String {
        match self {
            Crash::Exited(exit) => exit.describe(),
            Crash::LaunchFailed(e) => format!("launch failed: {e}"),
            Crash::WaitFailed(e) => format!("wait failed: {e}"),
            Crash::FailedChecks => "health checks failed".to_string(),
        }
    }

    fn exit_code(&self) -> Option<i32> {
        match self {
            Crash::Exited(exit) => exit.code,
            _ => None,
        }
    }
}

impl Watchdog {
    pub fn new(settings: WatchdogSettings, cancel: CancellationToken) -> Self {
        Self {
            tracker: RestartTracker::new(settings.max_restarts, settings.restart_window),
            settings,
            started_at: Instant::now(),
            tasks: Mutex::new(TaskCounts::default()),
            checks: Mutex::new(CheckCounts::default()),
            restart_requested: Notify::new(),
            cancel,
            metrics: SupervisorMetrics::new(),
            logger: StructuredLogger::new(host_name()),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run `process` until it exits cleanly, supervision is cancelled, or
    /// the restart budget is exhausted
    pub async fn supervise(&self, process: &mut dyn Supervised) -> Result<()> {
        let name = process.name();

        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            let crash = match process.launch().await {
                Err(e) => Crash::LaunchFailed(e.to_string()),
                Ok(()) => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            info!(process = %name, "Supervision cancelled, stopping process");
                            if let Err(e) = process.kill().await {
                                warn!(process = %name, error = %e, "Failed to kill process");
                            }
                            return Ok(());
                        }
                        _ = self.restart_requested.notified() => {
                            if let Err(e) = process.kill().await {
                                warn!(process = %name, error = %e, "Failed to kill process");
                            }
                            Crash::FailedChecks
                        }
                        exit = process.wait() => match exit {
                            Ok(exit) if exit.success() => {
                                info!(process = %name, "Supervised process exited cleanly");
                                return Ok(());
                            }
                            Ok(exit) if exit.runtime_missing() => {
                                error!(process = %name, "Supervised process found no container runtime, not restarting");
                                return Err(SupervisorError::RuntimeNotFound { tried: Vec::new() });
                            }
                            Ok(exit) => Crash::Exited(exit),
                            Err(e) => Crash::WaitFailed(e.to_string()),
                        },
                    }
                }
            };

            let reason = crash.reason();
            let triggered = matches!(crash, Crash::FailedChecks);
            match self.tracker.try_record(reason.clone(), crash.exit_code(), triggered) {
                RestartDecision::CircuitOpen { restarts } => {
                    self.logger
                        .log_circuit_open(restarts, self.tracker.window().as_secs());
                    return Err(SupervisorError::WatchdogCircuitOpen {
                        restarts,
                        window: self.tracker.window(),
                    });
                }
                RestartDecision::Restart { restarts_in_window } => {
                    self.logger
                        .log_restart(&reason, crash.exit_code(), restarts_in_window);
                    self.metrics.inc_watchdog_restarts();
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.settings.restart_delay) => {}
            }
        }
    }

    /// Ask the supervise loop to kill and relaunch the current process
    pub fn request_restart(&self) {
        self.restart_requested.notify_waiters();
    }

    /// Probe every `interval` until cancelled
    pub async fn run_self_checks(&self, check: &dyn SelfCheck) {
        if !self.settings.health_check.enabled {
            debug!("Self-checks disabled");
            return;
        }

        let period = self.settings.health_check.interval();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let passed = self.self_check_round(check).await;
                    if !passed && self.settings.restart_on_failed_check {
                        self.request_restart();
                    }
                }
            }
        }
    }

    /// Up to `retries` attempts, each bounded by `timeout`; any success passes
    pub async fn self_check_round(&self, check: &dyn SelfCheck) -> bool {
        let attempts = self.settings.health_check.retries.max(1);
        let timeout = self.settings.health_check.timeout();
        let mut passed = false;

        for attempt in 1..=attempts {
            match tokio::time::timeout(timeout, check.check()).await {
                Ok(Ok(())) => {
                    passed = true;
                    break;
                }
                Ok(Err(e)) => debug!(attempt, error = %e, "Self-check attempt failed"),
                Err(_) => debug!(attempt, timeout_ms = timeout.as_millis() as u64, "Self-check attempt timed out"),
            }
        }

        let mut checks = self.checks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        checks.last = Some(Utc::now());
        if passed {
            checks.passed += 1;
        } else {
            checks.failed += 1;
            warn!(attempts, "Daemon self-check failed");
        }
        passed
    }

    pub fn record_task_started(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        tasks.active += 1;
    }

    pub fn record_task_finished(&self, outcome: TaskOutcome) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        tasks.active = tasks.active.saturating_sub(1);
        tasks.processed += 1;
        match outcome {
            TaskOutcome::Succeeded => tasks.succeeded += 1,
            TaskOutcome::Failed => tasks.failed += 1,
        }
    }

    pub fn metrics(&self) -> HealthMetrics {
        let task_counts = *self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let checks = self.checks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        HealthMetrics {
            uptime_secs: self.started_at.elapsed().as_secs(),
            memory_usage_bytes: resident_memory_bytes(),
            task_counts,
            last_health_check: checks.last,
            health_checks_passed: checks.passed,
            health_checks_failed: checks.failed,
            restart_history: self.tracker.history(),
            circuit_open: self.tracker.is_circuit_open(),
        }
    }
}

/// Resident set size of this process, 0 where /proc is unavailable
fn resident_memory_bytes() -> u64 {
    std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| parse_vm_rss(&status))
        .unwrap_or(0)
}

/// `VmRSS:    1234 kB` from a /proc status file, in bytes
fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
    let mut fields = line["VmRSS:".len()..].split_whitespace();
    let value: u64 = fields.next()?.parse().ok()?;
    match fields.next() {
        Some("kB") | None => Some(value * 1024),
        Some(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Clone, Copy)]
    enum Run {
        Exit(i32),
        FailLaunch,
        Hang,
    }

    /// Plays back one scripted run per launch
    struct ScriptedProcess {
        runs: VecDeque<Run>,
        current: Option<Run>,
        launches: u32,
        kills: u32,
    }

    impl ScriptedProcess {
        fn new(runs: &[Run]) -> Self {
            Self {
                runs: runs.iter().copied().collect(),
                current: None,
                launches: 0,
                kills: 0,
            }
        }
    }

    #[async_trait]
    impl Supervised for ScriptedProcess {
        async fn launch(&mut self) -> Result<()> {
            self.launches += 1;
            let run = self.runs.pop_front().unwrap_or(Run::Exit(0));
            if let Run::FailLaunch = run {
                return Err(SupervisorError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "binary missing",
                )));
            }
            self.current = Some(run);
            Ok(())
        }

        async fn wait(&mut self) -> Result<ExitInfo> {
            match self.current.take() {
                Some(Run::Exit(code)) => Ok(ExitInfo { code: Some(code) }),
                _ => std::future::pending().await,
            }
        }

        async fn kill(&mut self) -> Result<()> {
            self.kills += 1;
            self.current = None;
            Ok(())
        }

        fn name(&self) -> String {
            "scripted".to_string()
        }
    }

    fn settings(max_restarts: u32) -> WatchdogSettings {
        WatchdogSettings {
            restart_delay: Duration::from_millis(100),
            max_restarts,
            restart_window: Duration::from_secs(300),
            health_check: HealthCheckConfig {
                enabled: true,
                interval_ms: 1_000,
                timeout_ms: 100,
                retries: 3,
            },
            restart_on_failed_check: true,
        }
    }

    #[test]
    fn test_parse_vm_rss() {
        let status = "Name:\tsupervisord\nVmPeak:\t  200000 kB\nVmRSS:\t   51234 kB\nThreads:\t8\n";
        assert_eq!(parse_vm_rss(status), Some(51234 * 1024));
        assert_eq!(parse_vm_rss("Name:\tkthreadd\nThreads:\t1\n"), None);
        assert_eq!(parse_vm_rss("VmRSS:\tlots kB\n"), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_resident_memory_is_reported() {
        assert!(resident_memory_bytes() > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restarts_until_clean_exit() {
        let watchdog = Watchdog::new(settings(5), CancellationToken::new());
        let mut process = ScriptedProcess::new(&[Run::Exit(1), Run::FailLaunch, Run::Exit(0)]);

        watchdog.supervise(&mut process).await.unwrap();

        assert_eq!(process.launches, 3);
        let metrics = watchdog.metrics();
        assert_eq!(metrics.restart_history.len(), 2);
        assert!(metrics.restart_history[0].reason.starts_with("launch failed"));
        assert_eq!(metrics.restart_history[1].exit_code, Some(1));
        assert!(!metrics.circuit_open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_opens_after_max_restarts() {
        let watchdog = Watchdog::new(settings(3), CancellationToken::new());
        let mut process = ScriptedProcess::new(&[Run::Exit(1); 10]);

        let err = watchdog.supervise(&mut process).await.unwrap_err();
        assert!(matches!(err, SupervisorError::WatchdogCircuitOpen { restarts: 3, .. }));
        assert!(err.is_fatal());

        // Three restarts allowed, the fourth crash opens the circuit
        assert_eq!(process.launches, 4);
        let metrics = watchdog.metrics();
        assert!(metrics.circuit_open);
        assert_eq!(metrics.restart_history.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_runtime_exit_is_not_restarted() {
        let watchdog = Watchdog::new(settings(5), CancellationToken::new());
        let mut process = ScriptedProcess::new(&[Run::Exit(EXIT_NO_RUNTIME), Run::Exit(0)]);

        let err = watchdog.supervise(&mut process).await.unwrap_err();
        assert!(matches!(err, SupervisorError::RuntimeNotFound { .. }));
        assert!(err.is_fatal());

        assert_eq!(process.launches, 1);
        let metrics = watchdog.metrics();
        assert!(metrics.restart_history.is_empty());
        assert!(!metrics.circuit_open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_supervision() {
        let cancel = CancellationToken::new();
        let watchdog = Arc::new(Watchdog::new(settings(3), cancel.clone()));

        let task = {
            let watchdog = watchdog.clone();
            tokio::spawn(async move {
                let mut process = ScriptedProcess::new(&[Run::Hang]);
                watchdog.supervise(&mut process).await.map(|_| process.kills)
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        assert_eq!(task.await.unwrap().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requested_restart_is_recorded() {
        let watchdog = Arc::new(Watchdog::new(settings(3), CancellationToken::new()));

        let task = {
            let watchdog = watchdog.clone();
            tokio::spawn(async move {
                let mut process = ScriptedProcess::new(&[Run::Hang, Run::Exit(0)]);
                watchdog.supervise(&mut process).await.map(|_| process.launches)
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        watchdog.request_restart();

        assert_eq!(task.await.unwrap().unwrap(), 2);
        let history = watchdog.metrics().restart_history;
        assert_eq!(history.len(), 1);
        assert!(history[0].triggered_by_watchdog);
        assert_eq!(history[0].reason, "health checks failed");
    }

    struct FlakyCheck {
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl SelfCheck for FlakyCheck {
        async fn check(&self) -> Result<()> {
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(SupervisorError::SelfCheck("connection refused".to_string()));
            }
            Ok(())
        }
    }

    struct HangingCheck;

    #[async_trait]
    impl SelfCheck for HangingCheck {
        async fn check(&self) -> Result<()> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_self_check_retries_within_round() {
        let watchdog = Watchdog::new(settings(3), CancellationToken::new());

        let check = FlakyCheck {
            failures_left: AtomicU32::new(2),
        };
        assert!(watchdog.self_check_round(&check).await);

        let check = FlakyCheck {
            failures_left: AtomicU32::new(5),
        };
        assert!(!watchdog.self_check_round(&check).await);

        let metrics = watchdog.metrics();
        assert_eq!(metrics.health_checks_passed, 1);
        assert_eq!(metrics.health_checks_failed, 1);
        assert!(metrics.last_health_check.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_self_check_timeout_counts_as_failure() {
        let watchdog = Watchdog::new(settings(3), CancellationToken::new());
        assert!(!watchdog.self_check_round(&HangingCheck).await);
        assert_eq!(watchdog.metrics().health_checks_failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_self_checks() {
        let cancel = CancellationToken::new();
        let watchdog = Arc::new(Watchdog::new(settings(3), cancel.clone()));

        let task = {
            let watchdog = watchdog.clone();
            tokio::spawn(async move {
                let check = FlakyCheck {
                    failures_left: AtomicU32::new(0),
                };
                watchdog.run_self_checks(&check).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(watchdog.metrics().health_checks_passed, 3);
    }

    #[test]
    fn test_task_counts() {
        let watchdog = Watchdog::new(settings(3), CancellationToken::new());
        watchdog.record_task_finished(TaskOutcome::Failed);
        watchdog.record_task_started();
        watchdog.record_task_started();
        watchdog.record_task_finished(TaskOutcome::Succeeded);

        let counts = watchdog.metrics().task_counts;
        assert_eq!(counts.active, 1);
        assert_eq!(counts.succeeded, 1);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.processed, counts.succeeded + counts.failed);
    }
}

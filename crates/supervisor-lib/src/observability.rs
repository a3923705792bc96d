//! Observability infrastructure for the supervisor
//!
//! Provides:
//! - Prometheus metrics (monitored containers, health results, poll latency,
//!   lifecycle events, watchdog restarts, streamed log entries)
//! - Event-named structured logging with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{error, info, warn};

/// Poll latency buckets in seconds; stats calls take tens to hundreds of ms
const POLL_LATENCY_BUCKETS: &[f64] = &[0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

static GLOBAL_METRICS: OnceLock<SupervisorMetricsInner> = OnceLock::new();

struct SupervisorMetricsInner {
    containers_monitored: IntGauge,
    containers_unhealthy: IntGauge,
    health_checks: IntCounterVec,
    poll_latency_seconds: Histogram,
    container_events: IntCounterVec,
    watchdog_restarts: IntCounter,
    log_entries_streamed: IntCounter,
}

impl SupervisorMetricsInner {
    fn new() -> Self {
        Self {
            containers_monitored: register_int_gauge!(
                "supervisor_containers_monitored",
                "Number of containers with a health record"
            )
            .expect("Failed to register containers_monitored"),

            containers_unhealthy: register_int_gauge!(
                "supervisor_containers_unhealthy",
                "Number of monitored containers currently unhealthy"
            )
            .expect("Failed to register containers_unhealthy"),

            health_checks: register_int_counter_vec!(
                "supervisor_health_checks_total",
                "Container health polls by result",
                &["result"]
            )
            .expect("Failed to register health_checks"),

            poll_latency_seconds: register_histogram!(
                "supervisor_poll_latency_seconds",
                "Time spent in a single container stats poll",
                POLL_LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register poll_latency_seconds"),

            container_events: register_int_counter_vec!(
                "supervisor_container_events_total",
                "Container lifecycle events by kind",
                &["kind"]
            )
            .expect("Failed to register container_events"),

            watchdog_restarts: register_int_counter!(
                "supervisor_watchdog_restarts_total",
                "Daemon restarts performed by the watchdog"
            )
            .expect("Failed to register watchdog_restarts"),

            log_entries_streamed: register_int_counter!(
                "supervisor_log_entries_streamed_total",
                "Container log entries delivered to consumers"
            )
            .expect("Failed to register log_entries_streamed"),
        }
    }
}

/// Handle to the process-wide supervisor metrics
///
/// Clones share the same underlying Prometheus collectors.
#[derive(Clone)]
pub struct SupervisorMetrics {
    _private: (),
}

impl Default for SupervisorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl SupervisorMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(SupervisorMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &SupervisorMetricsInner {
        GLOBAL_METRICS.get_or_init(SupervisorMetricsInner::new)
    }

    pub fn set_health_counts(&self, monitored: usize, unhealthy: usize) {
        self.inner().containers_monitored.set(monitored as i64);
        self.inner().containers_unhealthy.set(unhealthy as i64);
    }

    /// `result` is one of `success`, `failure`, `timeout`, `skipped`
    pub fn record_health_check(&self, result: &str, latency_secs: Option<f64>) {
        self.inner().health_checks.with_label_values(&[result]).inc();
        if let Some(latency) = latency_secs {
            self.inner().poll_latency_seconds.observe(latency);
        }
    }

    pub fn record_container_event(&self, kind: &str) {
        self.inner().container_events.with_label_values(&[kind]).inc();
    }

    pub fn inc_watchdog_restarts(&self) {
        self.inner().watchdog_restarts.inc();
    }

    pub fn inc_log_entries(&self) {
        self.inner().log_entries_streamed.inc();
    }
}

/// Render every registered metric in Prometheus text format
pub fn gather_text() -> String {
    use prometheus::Encoder;

    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Host label for log records; `HOSTNAME` when set
pub fn host_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

/// Structured logger for supervisor events
///
/// Every record carries an `event` field so log pipelines can filter on it.
#[derive(Clone)]
pub struct StructuredLogger {
    host: String,
}

impl StructuredLogger {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }

    pub fn log_startup(&self, role: &str, version: &str, runtime: &str) {
        info!(
            event = "supervisor_started",
            host = %self.host,
            role = %role,
            version = %version,
            runtime = %runtime,
            "Supervisor started"
        );
    }

    pub fn log_shutdown(&self, role: &str, reason: &str) {
        info!(
            event = "supervisor_shutdown",
            host = %self.host,
            role = %role,
            reason = %reason,
            "Supervisor shutting down"
        );
    }

    pub fn log_container_event(&self, kind: &str, container_id: &str, task_id: Option<&str>) {
        info!(
            event = "container_event",
            host = %self.host,
            kind = %kind,
            container_id = %container_id,
            task_id = ?task_id,
            "Container lifecycle event"
        );
    }

    pub fn log_health_transition(
        &self,
        container_id: &str,
        from: Option<&str>,
        to: &str,
        failing_streak: u32,
        error: Option<&str>,
    ) {
        if to == "unhealthy" {
            warn!(
                event = "health_transition",
                host = %self.host,
                container_id = %container_id,
                from = ?from,
                to = %to,
                failing_streak = failing_streak,
                error = ?error,
                "Container became unhealthy"
            );
        } else {
            info!(
                event = "health_transition",
                host = %self.host,
                container_id = %container_id,
                from = ?from,
                to = %to,
                failing_streak = failing_streak,
                "Container health changed"
            );
        }
    }

    pub fn log_restart(&self, reason: &str, exit_code: Option<i32>, restarts_in_window: usize) {
        warn!(
            event = "watchdog_restart",
            host = %self.host,
            reason = %reason,
            exit_code = ?exit_code,
            restarts_in_window = restarts_in_window,
            "Restarting supervised daemon"
        );
    }

    pub fn log_circuit_open(&self, restarts: usize, window_secs: u64) {
        error!(
            event = "watchdog_circuit_open",
            host = %self.host,
            restarts = restarts,
            window_secs = window_secs,
            "Restart limit reached, giving up on the daemon"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recorded_and_exported() {
        let metrics = SupervisorMetrics::new();
        metrics.set_health_counts(3, 1);
        metrics.record_health_check("success", Some(0.02));
        metrics.record_health_check("skipped", None);
        metrics.record_container_event("died");
        metrics.inc_watchdog_restarts();
        metrics.inc_log_entries();

        // A second handle shares the registry
        SupervisorMetrics::new().record_container_event("died");

        let text = gather_text();
        assert!(text.contains("supervisor_containers_monitored"));
        assert!(text.contains("supervisor_health_checks_total"));
        assert!(text.contains("kind=\"died\""));
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("node-a");
        assert_eq!(logger.host, "node-a");
        logger.log_health_transition("abc", Some("starting"), "unhealthy", 3, Some("boom"));
    }
}

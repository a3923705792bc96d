use super::record::{HealthRecord, HealthStatus};
use crate::config::SupervisorConfig;
use crate::container::{ContainerEvent, ContainerInspector};
use crate::error::{Result, SupervisorError};
use crate::observability::{host_name, StructuredLogger, SupervisorMetrics};
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Tuning for the health monitor
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub name_prefix: String,
    pub monitor_all: bool,
    pub max_failures: u32,
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self::from(&SupervisorConfig::default())
    }
}

impl From<&SupervisorConfig> for MonitorConfig {
    fn from(config: &SupervisorConfig) -> Self {
        Self {
            name_prefix: config.container.name_prefix.clone(),
            monitor_all: config.container.monitor_all,
            max_failures: config.container.max_failures,
            interval: config.poll_interval(),
            timeout: config.health_timeout(),
        }
    }
}

/// Published on every record update, including unchanged poll results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MonitorEvent {
    Health(HealthRecord),
    Untracked { container_id: String },
}

impl MonitorEvent {
    pub fn name(&self) -> &'static str {
        match self {
            MonitorEvent::Health(_) => "container:health",
            MonitorEvent::Untracked { .. } => "container:untracked",
        }
    }
}

/// Result of a single poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Healthy,
    Failed(String),
    /// The stats call exceeded the poll budget
    TimedOut(String),
    /// A poll for this container was already running
    Skipped,
    /// The container is not tracked (or stopped being tracked mid-poll)
    Untracked,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorStats {
    pub total: usize,
    pub starting: usize,
    pub healthy: usize,
    pub unhealthy: usize,
}

/// Removes a container from the in-flight set when the poll ends or is dropped
struct InFlight<'a> {
    set: &'a DashSet<String>,
    id: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.id);
    }
}

/// Tracks health of supervised containers
///
/// Records are driven by container lifecycle events and by periodic stats
/// polls. Callers only ever see clones of the records.
pub struct HealthMonitor {
    inspector: Arc<dyn ContainerInspector>,
    config: MonitorConfig,
    records: DashMap<String, HealthRecord>,
    in_flight: DashSet<String>,
    events: broadcast::Sender<MonitorEvent>,
    active: Mutex<Option<CancellationToken>>,
    metrics: SupervisorMetrics,
    logger: StructuredLogger,
}

impl HealthMonitor {
    pub fn new(inspector: Arc<dyn ContainerInspector>, config: MonitorConfig) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            inspector,
            config,
            records: DashMap::new(),
            in_flight: DashSet::new(),
            events,
            active: Mutex::new(None),
            metrics: SupervisorMetrics::new(),
            logger: StructuredLogger::new(host_name()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    pub fn is_active(&self) -> bool {
        self.token().is_some()
    }

    fn token(&self) -> Option<CancellationToken> {
        self.active.lock().ok().and_then(|guard| guard.clone())
    }

    /// Begin periodic polling; no-op if already active
    pub fn start_monitoring(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let token = {
            let Ok(mut active) = self.active.lock() else {
                warn!("Health monitor state poisoned, not starting");
                return None;
            };
            if active.is_some() {
                return None;
            }
            let token = CancellationToken::new();
            *active = Some(token.clone());
            token
        };

        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            max_failures = self.config.max_failures,
            "Starting health monitor"
        );

        let monitor = Arc::clone(self);
        Some(tokio::spawn(async move { monitor.run(token).await }))
    }

    /// Stop polling, cancel in-flight polls and forget every record
    pub fn stop_monitoring(&self) {
        let token = self.active.lock().ok().and_then(|mut guard| guard.take());
        if let Some(token) = token {
            token.cancel();
            info!("Health monitor stopped");
        }
        self.records.clear();
        self.in_flight.clear();
        self.update_gauges();
    }

    async fn run(self: Arc<Self>, token: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + self.config.interval, self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let ids: Vec<String> = self.records.iter().map(|r| r.key().clone()).collect();
                    trace!(containers = ids.len(), "Polling container health");

                    for id in ids {
                        let monitor = Arc::clone(&self);
                        let token = token.clone();
                        tokio::spawn(async move {
                            tokio::select! {
                                _ = token.cancelled() => {}
                                _ = monitor.poll_container(&id) => {}
                            }
                        });
                    }
                }
            }
        }

        debug!("Health poll loop exited");
    }

    /// Consume lifecycle events in order until the monitor stops or the bus closes
    pub fn attach(self: &Arc<Self>, mut rx: broadcast::Receiver<ContainerEvent>) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        let token = self.token();

        tokio::spawn(async move {
            let Some(token) = token else {
                warn!("Health monitor not active, ignoring container events");
                return;
            };

            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    event = rx.recv() => event,
                };

                match event {
                    Ok(event) => monitor.handle_event(&event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Health monitor fell behind on container events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn should_track(&self, name: &str) -> bool {
        self.config.monitor_all || name.starts_with(&self.config.name_prefix)
    }

    /// Apply one lifecycle event to the record table
    pub fn handle_event(&self, event: &ContainerEvent) {
        let meta = event.meta();
        let id = meta.container_id.as_str();

        match event {
            ContainerEvent::Created { .. } => {
                if self.should_track(&meta.container_name) && !self.records.contains_key(id) {
                    let record = HealthRecord::starting(id, &meta.container_name, meta.task_id.clone());
                    self.records.insert(id.to_string(), record.clone());
                    self.changed(None, record);
                }
            }
            ContainerEvent::Started { .. } => {
                self.update_or_track(id, &meta.container_name, meta.task_id.clone(), |r| r.restart());
            }
            ContainerEvent::Died {
                exit_code, oom_killed, ..
            } => {
                let max = self.config.max_failures;
                self.update_or_track(id, &meta.container_name, meta.task_id.clone(), |r| {
                    r.record_death(*exit_code, *oom_killed, max)
                });
            }
            ContainerEvent::Stopped { .. } | ContainerEvent::Removed { .. } => {
                if self.records.remove(id).is_some() {
                    debug!(container_id = %id, event = event.name(), "No longer monitoring container");
                    self.update_gauges();
                    let _ = self.events.send(MonitorEvent::Untracked {
                        container_id: id.to_string(),
                    });
                }
            }
        }
    }

    fn update_or_track<F>(&self, id: &str, name: &str, task_id: Option<String>, apply: F)
    where
        F: FnOnce(&mut HealthRecord),
    {
        let before = self.records.get(id).map(|r| r.clone());
        if before.is_none() && !self.should_track(name) {
            return;
        }

        let after = {
            let mut entry = self
                .records
                .entry(id.to_string())
                .or_insert_with(|| HealthRecord::starting(id, name, task_id));
            apply(entry.value_mut());
            entry.clone()
        };
        self.changed(before, after);
    }

    /// Track a container that was not announced through events
    pub async fn add_container(&self, id: &str) -> bool {
        if self.records.contains_key(id) {
            return true;
        }

        let info = match self.inspector.get_container_info(id).await {
            Ok(Some(info)) => info,
            Ok(None) => {
                warn!(container_id = %id, "Cannot monitor unknown container");
                return false;
            }
            Err(e) => {
                warn!(container_id = %id, error = %e, "Container manager unavailable, not monitoring");
                return false;
            }
        };

        let task_id = info.task_id().map(String::from);
        let record = HealthRecord::starting(&info.id, &info.name, task_id);
        if self.records.insert(info.id.clone(), record.clone()).is_none() {
            self.changed(None, record);
        }
        true
    }

    /// Adopt running containers whose names start with `name_prefix`
    pub async fn discover(&self, name_prefix: &str) -> Result<usize> {
        let containers = self.inspector.list_managed_containers(name_prefix).await?;
        let mut adopted = 0;

        for info in containers.into_iter().filter(|c| c.is_running()) {
            if self.records.contains_key(&info.id) {
                continue;
            }
            let task_id = info.task_id().map(String::from);
            let record = HealthRecord::starting(&info.id, &info.name, task_id);
            self.records.insert(info.id.clone(), record.clone());
            self.changed(None, record);
            adopted += 1;
        }

        info!(adopted, prefix = %name_prefix, "Discovered existing containers");
        Ok(adopted)
    }

    /// Poll one container's stats and apply the result
    pub async fn poll_container(&self, id: &str) -> PollOutcome {
        if !self.records.contains_key(id) {
            return PollOutcome::Untracked;
        }
        if !self.in_flight.insert(id.to_string()) {
            trace!(container_id = %id, "Poll already in flight, skipping");
            self.metrics.record_health_check("skipped", None);
            return PollOutcome::Skipped;
        }
        let _in_flight = InFlight {
            set: &self.in_flight,
            id: id.to_string(),
        };

        let timeout = self.config.timeout;
        let started = Instant::now();
        let result = tokio::time::timeout(timeout, self.inspector.get_stats(id, timeout)).await;
        let latency = started.elapsed().as_secs_f64();

        let outcome = match result {
            Ok(Ok(Some(_))) => PollOutcome::Healthy,
            Ok(Ok(None)) => PollOutcome::Failed("stats unavailable".to_string()),
            Ok(Err(e)) => PollOutcome::Failed(e.to_string()),
            Err(_) => PollOutcome::TimedOut(
                SupervisorError::HealthCheckTimeout {
                    container: id.to_string(),
                    timeout,
                }
                .to_string(),
            ),
        };

        let label = match &outcome {
            PollOutcome::Healthy => "success",
            PollOutcome::TimedOut(_) => "timeout",
            _ => "failure",
        };
        self.metrics.record_health_check(label, Some(latency));

        let max = self.config.max_failures;
        let update = self.records.get_mut(id).map(|mut record| {
            let before = record.clone();
            match &outcome {
                PollOutcome::Healthy => record.record_success(),
                PollOutcome::Failed(reason) | PollOutcome::TimedOut(reason) => {
                    record.record_failure(reason.clone(), max)
                }
                PollOutcome::Skipped | PollOutcome::Untracked => {}
            }
            (before, record.clone())
        });

        match update {
            Some((before, after)) => {
                self.changed(Some(before), after);
                outcome
            }
            // Untracked while the poll was running
            None => PollOutcome::Untracked,
        }
    }

    /// Publish `after`; the transition log only fires when the status moved
    fn changed(&self, before: Option<HealthRecord>, after: HealthRecord) {
        let from = before.as_ref().map(|b| b.status);
        if from != Some(after.status) {
            self.logger.log_health_transition(
                &after.container_id,
                from.map(|s| s.as_str()),
                after.status.as_str(),
                after.failing_streak,
                after.error.as_deref(),
            );
        }

        self.update_gauges();
        let _ = self.events.send(MonitorEvent::Health(after));
    }

    fn update_gauges(&self) {
        let stats = self.get_stats();
        self.metrics.set_health_counts(stats.total, stats.unhealthy);
    }

    pub fn get_container_health(&self, id: &str) -> Option<HealthRecord> {
        self.records.get(id).map(|r| r.clone())
    }

    /// Every record, ordered by container name
    pub fn records(&self) -> Vec<HealthRecord> {
        let mut records: Vec<HealthRecord> = self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.container_name.cmp(&b.container_name));
        records
    }

    pub fn get_stats(&self) -> MonitorStats {
        let mut stats = MonitorStats::default();
        for record in self.records.iter() {
            stats.total += 1;
            match record.status {
                HealthStatus::Starting => stats.starting += 1,
                HealthStatus::Healthy => stats.healthy += 1,
                HealthStatus::Unhealthy => stats.unhealthy += 1,
            }
        }
        stats
    }
}

//! Supervisor context
//!
//! Everything the daemon shares between its components is built once here
//! and passed around explicitly.

use crate::capacity::{resolve_mode, ActiveCapacity};
use crate::config::SupervisorConfig;
use crate::container::ContainerManager;
use crate::error::Result;
use crate::health::{components, ComponentRegistry, HealthMonitor, MonitorConfig, MonitorStats};
use crate::models::StopOptions;
use crate::observability::SupervisorMetrics;
use crate::process::{CommandRunner, SystemRunner};
use crate::runtime::{RuntimeDetector, RuntimeId};
use chrono::{DateTime, TimeZone};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Pause before reopening a closed engine event stream
const EVENT_WATCH_RETRY: Duration = Duration::from_secs(5);

/// Snapshot served on the daemon status endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub runtime: RuntimeId,
    pub version: String,
    pub uptime_secs: u64,
    pub monitoring: bool,
    pub containers: MonitorStats,
    pub capacity: ActiveCapacity,
}

pub struct SupervisorContext {
    pub config: Arc<SupervisorConfig>,
    pub runtime: RuntimeId,
    pub manager: Arc<ContainerManager>,
    pub monitor: Arc<HealthMonitor>,
    pub components: ComponentRegistry,
    pub metrics: SupervisorMetrics,
    pub cancel: CancellationToken,
    started_at: Instant,
}

impl SupervisorContext {
    /// Detect the engine and build every component; fails when no engine answers
    pub async fn initialize(config: SupervisorConfig) -> Result<Self> {
        Self::with_runner(config, Arc::new(SystemRunner)).await
    }

    pub async fn with_runner(config: SupervisorConfig, runner: Arc<dyn CommandRunner>) -> Result<Self> {
        let components = ComponentRegistry::new();
        let detector = RuntimeDetector::with_runner(runner.clone(), config.container.runtime);

        let runtime = match detector.get_best_runtime().await {
            Ok(runtime) => runtime,
            Err(e) => {
                components.set_unhealthy(components::RUNTIME, e.to_string()).await;
                return Err(e);
            }
        };
        components.register(components::RUNTIME).await;

        let manager = Arc::new(
            ContainerManager::with_runner(runtime, runner).with_stop_options(StopOptions::from(&config)),
        );
        components.register(components::CONTAINER_MANAGER).await;

        let monitor = Arc::new(HealthMonitor::new(manager.clone(), MonitorConfig::from(&config)));

        info!(runtime = %runtime, "Supervisor context initialized");

        Ok(Self {
            config: Arc::new(config),
            runtime,
            manager,
            monitor,
            components,
            metrics: SupervisorMetrics::new(),
            cancel: CancellationToken::new(),
            started_at: Instant::now(),
        })
    }

    /// Start monitoring, adopt existing containers and watch engine events
    pub async fn start(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        // Subscribe before anything can publish
        let events = self.manager.subscribe();
        if let Some(handle) = self.monitor.start_monitoring() {
            handles.push(handle);
        }
        handles.push(self.monitor.attach(events));
        self.components.register(components::HEALTH_MONITOR).await;

        if let Err(e) = self.monitor.discover(&self.config.container.name_prefix).await {
            warn!(error = %e, "Could not discover existing containers");
        }

        handles.push(self.spawn_event_watcher());
        self.components.set_ready(true).await;
        handles
    }

    fn spawn_event_watcher(&self) -> JoinHandle<()> {
        let manager = self.manager.clone();
        let registry = self.components.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            loop {
                registry.set_healthy(components::EVENT_WATCHER).await;
                match manager.watch_engine_events(cancel.child_token()).await {
                    Ok(()) => break,
                    Err(e) => {
                        warn!(error = %e, "Engine event watcher stopped, retrying");
                        registry
                            .set_degraded(components::EVENT_WATCHER, e.to_string())
                            .await;
                    }
                }

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(EVENT_WATCH_RETRY) => {}
                }
            }
        })
    }

    /// Capacity thresholds in force at `now`
    pub fn active_capacity<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> ActiveCapacity {
        resolve_mode(now, &self.config.time_based_usage)
    }

    pub fn status<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> DaemonStatus {
        DaemonStatus {
            runtime: self.runtime,
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            monitoring: self.monitor.is_active(),
            containers: self.monitor.get_stats(),
            capacity: self.active_capacity(now),
        }
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.monitor.stop_monitoring();
        self.components.set_ready(false).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capacity::CapacityMode;
    use crate::error::SupervisorError;
    use crate::health::ComponentStatus;
    use crate::process::testing::{fail, ok, ScriptedRunner};
    use chrono::Utc;

    #[tokio::test]
    async fn test_initialize_picks_runtime() {
        let runner = Arc::new(ScriptedRunner::new().on(&["version"], ok("Version: 1")));
        let mut config = SupervisorConfig::default();
        config.container.stop_timeout_secs = 20;
        let context = SupervisorContext::with_runner(config, runner)
            .await
            .unwrap();

        assert_eq!(context.runtime, RuntimeId::Docker);
        assert_eq!(context.manager.runtime(), RuntimeId::Docker);
        assert_eq!(context.manager.stop_options().timeout, Duration::from_secs(20));
        assert!(!context.monitor.is_active());

        let health = context.components.health().await;
        assert_eq!(health.status, ComponentStatus::Healthy);
        assert!(!context.components.readiness().await.ready);
    }

    #[tokio::test]
    async fn test_initialize_without_runtime_fails() {
        let runner = Arc::new(ScriptedRunner::new().on(&["version"], fail(127, "not found")));
        let err = SupervisorContext::with_runner(SupervisorConfig::default(), runner)
            .await
            .err()
            .unwrap();

        assert!(matches!(err, SupervisorError::RuntimeNotFound { .. }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_active_capacity_uses_config() {
        let runner = Arc::new(ScriptedRunner::new().on(&["version"], ok("Version: 1")));
        let context = SupervisorContext::with_runner(SupervisorConfig::default(), runner)
            .await
            .unwrap();

        // Default policy is disabled: no time-based throttling
        let capacity = context.active_capacity(&Utc::now());
        assert_eq!(capacity.mode, CapacityMode::Day);
        assert_eq!(capacity.capacity_threshold, 1.0);

        let status = context.status(&Utc::now());
        assert_eq!(status.runtime, RuntimeId::Docker);
        assert!(!status.monitoring);
        assert_eq!(status.containers.total, 0);
        assert_eq!(status.capacity, capacity);
    }
}

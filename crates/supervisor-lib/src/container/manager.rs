use super::events::{ContainerEvent, EventBus, EventMeta};
use super::parse::{parse_engine_event, parse_inspect, parse_stats, EngineEvent};
use super::ContainerInspector;
use crate::error::{Result, SupervisorError};
use crate::logs::{LogOptions, LogStream};
use crate::models::{ContainerInfo, ContainerSpec, ContainerStats, RemoveOptions, StopOptions, LABEL_TASK_ID};
use crate::observability::{host_name, StructuredLogger, SupervisorMetrics};
use crate::process::{CommandOutput, CommandRunner, SystemRunner};
use crate::runtime::RuntimeId;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Slack past the stop timeout for the engine to report the exit
const EXPECTED_EXIT_MARGIN: Duration = Duration::from_secs(30);

/// Drives one container engine through its CLI
pub struct ContainerManager {
    runtime: RuntimeId,
    runner: Arc<dyn CommandRunner>,
    events: EventBus,
    /// Containers the manager is stopping or removing, with the deadline by
    /// which their `die` is expected
    stopping: DashMap<String, Instant>,
    stop_options: StopOptions,
    metrics: SupervisorMetrics,
    logger: StructuredLogger,
}

impl ContainerManager {
    pub fn new(runtime: RuntimeId) -> Self {
        Self::with_runner(runtime, Arc::new(SystemRunner))
    }

    pub fn with_runner(runtime: RuntimeId, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runtime,
            runner,
            events: EventBus::default(),
            stopping: DashMap::new(),
            stop_options: StopOptions::default(),
            metrics: SupervisorMetrics::new(),
            logger: StructuredLogger::new(host_name()),
        }
    }

    /// Stop grace used when removing a running container, and the default for callers
    pub fn with_stop_options(mut self, opts: StopOptions) -> Self {
        self.stop_options = opts;
        self
    }

    pub fn runtime(&self) -> RuntimeId {
        self.runtime
    }

    pub fn stop_options(&self) -> StopOptions {
        self.stop_options
    }

    fn expect_exit(&self, id: &str, stop_timeout: Duration) {
        self.stopping
            .insert(id.to_string(), Instant::now() + stop_timeout + EXPECTED_EXIT_MARGIN);
    }

    /// Consume a pending stop for `id`; entries past their deadline are dropped
    fn take_expected_exit(&self, id: &str) -> bool {
        let now = Instant::now();
        self.stopping.retain(|_, deadline| *deadline > now);
        self.stopping.remove(id).is_some()
    }

    /// Receive every lifecycle event published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ContainerEvent> {
        self.events.subscribe()
    }

    async fn exec(&self, args: Vec<String>) -> Result<CommandOutput> {
        Ok(self.runner.run(self.runtime.binary(), &args).await?)
    }

    fn publish(&self, event: ContainerEvent) {
        self.metrics.record_container_event(event.kind());
        self.logger
            .log_container_event(event.kind(), event.container_id(), event.meta().task_id.as_deref());
        self.events.publish(event);
    }

    /// Create a container; an existing container with the same name is returned as-is
    #[instrument(skip(self, spec), fields(name = %spec.name, image = %spec.image))]
    pub async fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerInfo> {
        let mut args = vec!["create".to_string()];
        args.extend(spec.create_args());

        let output = self.exec(args).await?;
        if !output.success() {
            let message = output.error_message();
            if is_name_conflict(&message) {
                if let Some(existing) = self.get_container_info(&spec.name).await? {
                    debug!(container_id = %existing.id, "Container already exists, reusing");
                    return Ok(existing);
                }
            }
            return Err(SupervisorError::operation("create", &spec.name, output.code, message));
        }

        let id = output.stdout.trim().to_string();
        let info = self.get_container_info(&id).await?.ok_or_else(|| {
            SupervisorError::operation("create", &spec.name, None, "container vanished after create")
        })?;

        self.publish(ContainerEvent::Created {
            meta: meta_for(&info),
            info: info.clone(),
        });
        Ok(info)
    }

    /// Start a created or stopped container; no-op when already running
    #[instrument(skip(self))]
    pub async fn start_container(&self, id: &str) -> Result<()> {
        let before = self
            .get_container_info(id)
            .await?
            .ok_or_else(|| SupervisorError::operation("start", id, None, "no such container"))?;
        if before.is_running() {
            debug!("Container already running");
            return Ok(());
        }

        let output = self.exec(vec!["start".into(), id.into()]).await?;
        if !output.success() {
            return Err(SupervisorError::operation("start", id, output.code, output.error_message()));
        }
        self.stopping.remove(&before.id);

        let info = self.get_container_info(id).await?.unwrap_or(before);
        self.publish(ContainerEvent::Started {
            meta: meta_for(&info),
            info: Some(info),
        });
        Ok(())
    }

    /// Stop a container; a missing container is already stopped
    #[instrument(skip(self, opts))]
    pub async fn stop_container(&self, id: &str, opts: StopOptions) -> Result<()> {
        let Some(info) = self.get_container_info(id).await? else {
            debug!("Container not found, nothing to stop");
            return Ok(());
        };

        if info.is_running() {
            self.expect_exit(&info.id, opts.timeout);
            let args = vec![
                "stop".to_string(),
                "-t".to_string(),
                opts.timeout.as_secs().to_string(),
                id.to_string(),
            ];
            let output = self.exec(args).await?;
            if !output.success() {
                self.stopping.remove(&info.id);
                let message = output.error_message();
                if is_missing(&message) {
                    return Ok(());
                }
                return Err(SupervisorError::operation("stop", id, output.code, message));
            }
        }

        self.publish(ContainerEvent::Stopped { meta: meta_for(&info) });
        Ok(())
    }

    /// Remove a container; a missing container is already removed
    #[instrument(skip(self, opts))]
    pub async fn remove_container(&self, id: &str, opts: RemoveOptions) -> Result<()> {
        let Some(info) = self.get_container_info(id).await? else {
            debug!("Container not found, nothing to remove");
            return Ok(());
        };

        if info.is_running() {
            self.expect_exit(&info.id, self.stop_options.timeout);
        }

        let mut args = vec!["rm".to_string()];
        if opts.force {
            args.push("-f".into());
        }
        if opts.volumes {
            args.push("-v".into());
        }
        args.push(id.to_string());

        let output = self.exec(args).await?;
        if !output.success() {
            self.stopping.remove(&info.id);
            let message = output.error_message();
            if is_missing(&message) {
                return Ok(());
            }
            return Err(SupervisorError::operation("remove", id, output.code, message));
        }

        self.publish(ContainerEvent::Removed { meta: meta_for(&info) });
        Ok(())
    }

    /// Inspect a container by id or name
    pub async fn get_container_info(&self, id: &str) -> Result<Option<ContainerInfo>> {
        let args = vec![
            "inspect".to_string(),
            "--type".to_string(),
            "container".to_string(),
            id.to_string(),
        ];
        let output = self.exec(args).await?;
        if !output.success() {
            let message = output.error_message();
            if is_missing(&message) {
                return Ok(None);
            }
            return Err(SupervisorError::operation("inspect", id, output.code, message));
        }

        Ok(parse_inspect(&output.stdout)?.into_iter().next())
    }

    /// Every container, running or not, whose name starts with `name_prefix`
    pub async fn list_managed_containers(&self, name_prefix: &str) -> Result<Vec<ContainerInfo>> {
        let args = vec![
            "ps".to_string(),
            "-a".to_string(),
            "-q".to_string(),
            "--no-trunc".to_string(),
            "--filter".to_string(),
            format!("name={name_prefix}"),
        ];
        let output = self.exec(args).await?;
        if !output.success() {
            return Err(SupervisorError::operation("list", name_prefix, output.code, output.error_message()));
        }

        let ids: Vec<String> = output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut args = vec!["inspect".to_string(), "--type".to_string(), "container".to_string()];
        args.extend(ids);
        let output = self.exec(args).await?;
        if !output.success() {
            return Err(SupervisorError::operation("inspect", name_prefix, output.code, output.error_message()));
        }

        // The engine name filter matches substrings
        Ok(parse_inspect(&output.stdout)?
            .into_iter()
            .filter(|info| info.name.starts_with(name_prefix))
            .collect())
    }

    /// One stats sample, bounded by `timeout`
    pub async fn get_stats(&self, id: &str, timeout: Duration) -> Result<Option<ContainerStats>> {
        match self.get_container_info(id).await? {
            Some(info) if info.is_running() => {}
            _ => return Ok(None),
        }

        let args = vec![
            "stats".to_string(),
            "--no-stream".to_string(),
            "--format".to_string(),
            self.runtime.json_lines_format().to_string(),
            id.to_string(),
        ];
        let output = match tokio::time::timeout(timeout, self.exec(args)).await {
            Ok(output) => output?,
            Err(_) => {
                return Err(SupervisorError::HealthCheckTimeout {
                    container: id.to_string(),
                    timeout,
                })
            }
        };

        if !output.success() {
            let message = output.error_message();
            if is_missing(&message) {
                return Ok(None);
            }
            return Err(SupervisorError::operation("stats", id, output.code, message));
        }
        parse_stats(&output.stdout)
    }

    /// Open a log stream for one container
    pub fn stream_logs(&self, id: &str, options: &LogOptions) -> Result<LogStream> {
        LogStream::spawn(self.runtime.binary(), &options.to_args(id), id, options.timestamps)
    }

    /// Follow the engine's event stream and publish `Died` for unexpected exits
    ///
    /// Returns when `cancel` fires, or with an error if the engine closes the
    /// stream.
    pub async fn watch_engine_events(&self, cancel: CancellationToken) -> Result<()> {
        let args = [
            "events".to_string(),
            "--format".to_string(),
            self.runtime.json_lines_format().to_string(),
            "--filter".to_string(),
            "type=container".to_string(),
        ];
        let mut child = Command::new(self.runtime.binary())
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child.stdout.take().ok_or_else(|| {
            SupervisorError::operation("events", self.runtime.binary(), None, "stdout not captured")
        })?;
        let mut lines = BufReader::new(stdout).lines();
        let mut oom_killed = HashSet::new();

        info!(runtime = %self.runtime, "Watching engine events");

        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Engine event watcher cancelled");
                    return Ok(());
                }
                line = lines.next_line() => line?,
            };

            let Some(line) = line else {
                let status = child.wait().await?;
                return Err(SupervisorError::operation(
                    "events",
                    self.runtime.binary(),
                    status.code(),
                    "engine event stream closed",
                ));
            };

            match parse_engine_event(&line) {
                Ok(Some(event)) => self.handle_engine_event(event, &mut oom_killed).await,
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Skipping unparsable engine event"),
            }
        }
    }

    async fn handle_engine_event(&self, event: EngineEvent, oom_killed: &mut HashSet<String>) {
        match event.action.as_str() {
            "oom" => {
                oom_killed.insert(event.container_id);
            }
            "die" | "died" => {
                let was_oom = oom_killed.remove(&event.container_id);
                if self.take_expected_exit(&event.container_id) {
                    debug!(container_id = %event.container_id, "Ignoring exit of container being stopped");
                    return;
                }

                let mut exit_code = event.exit_code;
                let mut oom = was_oom;
                let mut name = event.container_name.clone();
                if exit_code.is_none() || name.is_none() {
                    match self.get_container_info(&event.container_id).await {
                        Ok(Some(info)) => {
                            exit_code = exit_code.or(info.exit_code);
                            oom |= info.oom_killed;
                            name = name.or(Some(info.name));
                        }
                        Ok(None) => {}
                        Err(e) => debug!(error = %e, "Could not inspect dead container"),
                    }
                }

                let meta = EventMeta::new(
                    event.container_id.clone(),
                    name.unwrap_or_else(|| event.container_id.clone())
                        .trim_start_matches('/')
                        .to_string(),
                    event.attributes.get(LABEL_TASK_ID).cloned(),
                );
                self.publish(ContainerEvent::Died {
                    meta,
                    exit_code: exit_code.unwrap_or(-1),
                    oom_killed: oom,
                });
            }
            "destroy" | "remove" => {
                self.stopping.remove(&event.container_id);
                oom_killed.remove(&event.container_id);
            }
            _ => {}
        }
    }
}

#[async_trait]
impl ContainerInspector for ContainerManager {
    async fn get_container_info(&self, id: &str) -> Result<Option<ContainerInfo>> {
        ContainerManager::get_container_info(self, id).await
    }

    async fn get_stats(&self, id: &str, timeout: Duration) -> Result<Option<ContainerStats>> {
        ContainerManager::get_stats(self, id, timeout).await
    }

    async fn list_managed_containers(&self, name_prefix: &str) -> Result<Vec<ContainerInfo>> {
        ContainerManager::list_managed_containers(self, name_prefix).await
    }
}

fn meta_for(info: &ContainerInfo) -> EventMeta {
    EventMeta::new(info.id.clone(), info.name.clone(), info.task_id().map(String::from))
}

fn is_missing(message: &str) -> bool {
    message.to_ascii_lowercase().contains("no such")
}

fn is_name_conflict(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("already in use") || message.contains("already exists")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ContainerStatus;
    use crate::process::testing::{fail, ok, ScriptedRunner};

    fn inspect_json(id: &str, name: &str, state: &str) -> String {
        format!(
            r#"[{{"Id":"{id}","Name":"/{name}","Created":"2024-05-01T10:00:00Z","State":{{"Status":"{state}","ExitCode":0,"OOMKilled":false}},"Config":{{"Image":"node:20","Labels":{{"supervisor.managed":"true","supervisor.task-id":"t-{id}"}}}}}}]"#
        )
    }

    const NO_SUCH: &str = "Error: No such object: ghost";

    fn manager(runner: ScriptedRunner) -> (ContainerManager, Arc<ScriptedRunner>) {
        let runner = Arc::new(runner);
        (ContainerManager::with_runner(RuntimeId::Docker, runner.clone()), runner)
    }

    #[tokio::test]
    async fn test_create_publishes_created() {
        let (manager, _) = manager(
            ScriptedRunner::new()
                .on(&["create"], ok("c1\n"))
                .on(&["inspect"], ok(&inspect_json("c1", "agent-task-1", "created"))),
        );
        let mut events = manager.subscribe();

        let spec = ContainerSpec::new("agent-task-1", "node:20").with_task("t-c1");
        let info = manager.create_container(&spec).await.unwrap();
        assert_eq!(info.id, "c1");
        assert_eq!(info.status, ContainerStatus::Created);

        match events.recv().await.unwrap() {
            ContainerEvent::Created { meta, info } => {
                assert_eq!(meta.container_name, "agent-task-1");
                assert_eq!(meta.task_id.as_deref(), Some("t-c1"));
                assert_eq!(info.id, "c1");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_create_with_existing_name_returns_existing() {
        let (manager, _) = manager(
            ScriptedRunner::new()
                .on(
                    &["create"],
                    fail(125, "Conflict. The container name \"/agent-task-1\" is already in use"),
                )
                .on(&["inspect"], ok(&inspect_json("c1", "agent-task-1", "running"))),
        );
        let mut events = manager.subscribe();

        let info = manager
            .create_container(&ContainerSpec::new("agent-task-1", "node:20"))
            .await
            .unwrap();
        assert_eq!(info.id, "c1");
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_create_failure_is_operation_error() {
        let (manager, _) = manager(ScriptedRunner::new().on(&["create"], fail(125, "pull access denied")));

        let err = manager
            .create_container(&ContainerSpec::new("agent-task-1", "nope:latest"))
            .await
            .unwrap_err();
        match err {
            SupervisorError::ContainerOperation { operation, exit_code, message, .. } => {
                assert_eq!(operation, "create");
                assert_eq!(exit_code, Some(125));
                assert!(message.contains("pull access denied"));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn test_start_running_container_is_noop() {
        let (manager, runner) = manager(
            ScriptedRunner::new().on(&["inspect"], ok(&inspect_json("c1", "agent-task-1", "running"))),
        );
        let mut events = manager.subscribe();

        manager.start_container("c1").await.unwrap();
        assert_eq!(runner.calls_with("start"), 0);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_start_publishes_started() {
        let (manager, runner) = manager(
            ScriptedRunner::new()
                .on(&["inspect"], ok(&inspect_json("c1", "agent-task-1", "created")))
                .on(&["start"], ok("c1\n")),
        );
        let mut events = manager.subscribe();

        manager.start_container("c1").await.unwrap();
        assert_eq!(runner.calls_with("start"), 1);
        assert_eq!(events.recv().await.unwrap().name(), "container:started");
    }

    #[tokio::test]
    async fn test_stop_and_remove_missing_container_succeed_silently() {
        let (manager, runner) = manager(ScriptedRunner::new().on(&["inspect"], fail(1, NO_SUCH)));
        let mut events = manager.subscribe();

        manager.stop_container("ghost", StopOptions::default()).await.unwrap();
        manager.remove_container("ghost", RemoveOptions::default()).await.unwrap();

        assert_eq!(runner.calls_with("stop"), 0);
        assert_eq!(runner.calls_with("rm"), 0);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stop_running_container() {
        let (manager, runner) = manager(
            ScriptedRunner::new()
                .on(&["inspect"], ok(&inspect_json("c1", "agent-task-1", "running")))
                .on(&["stop"], ok("c1\n")),
        );
        let mut events = manager.subscribe();

        let opts = StopOptions {
            timeout: Duration::from_secs(3),
        };
        manager.stop_container("c1", opts).await.unwrap();

        let calls = runner.calls.lock().unwrap().clone();
        let (_, stop_args) = calls.iter().find(|(_, args)| args[0] == "stop").unwrap();
        assert_eq!(stop_args, &vec!["stop", "-t", "3", "c1"]);
        assert_eq!(events.recv().await.unwrap().name(), "container:stopped");
        assert!(manager.stopping.contains_key("c1"));
    }

    #[tokio::test]
    async fn test_remove_uses_force_flag() {
        let (manager, runner) = manager(
            ScriptedRunner::new()
                .on(&["inspect"], ok(&inspect_json("c1", "agent-task-1", "exited")))
                .on(&["rm"], ok("c1\n")),
        );
        let mut events = manager.subscribe();

        manager.remove_container("c1", RemoveOptions::default()).await.unwrap();

        let calls = runner.calls.lock().unwrap().clone();
        assert!(calls.iter().any(|(_, args)| args == &vec!["rm", "-f", "c1"]));
        assert_eq!(events.recv().await.unwrap().name(), "container:removed");
    }

    #[tokio::test]
    async fn test_get_stats_not_running_is_none() {
        let (manager, runner) = manager(
            ScriptedRunner::new().on(&["inspect"], ok(&inspect_json("c1", "agent-task-1", "exited"))),
        );

        let stats = manager.get_stats("c1", Duration::from_secs(1)).await.unwrap();
        assert!(stats.is_none());
        assert_eq!(runner.calls_with("stats"), 0);
    }

    #[tokio::test]
    async fn test_get_stats_running() {
        let (manager, runner) = manager(
            ScriptedRunner::new()
                .on(&["inspect"], ok(&inspect_json("c1", "agent-task-1", "running")))
                .on(
                    &["stats"],
                    ok(r#"{"CPUPerc":"3.00%","MemUsage":"1MiB / 2MiB","MemPerc":"50.00%","NetIO":"0B / 0B","BlockIO":"0B / 0B","PIDs":"2"}"#),
                ),
        );

        let stats = manager.get_stats("c1", Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(stats.cpu_percent, 3.0);
        assert_eq!(stats.memory_limit, 2 * 1024 * 1024);

        let calls = runner.calls.lock().unwrap().clone();
        let (_, args) = calls.iter().find(|(_, args)| args[0] == "stats").unwrap();
        assert_eq!(args, &vec!["stats", "--no-stream", "--format", "{{json .}}", "c1"]);
    }

    #[tokio::test]
    async fn test_list_managed_filters_by_prefix() {
        let listing = r#"[
            {"Id":"c1","Name":"/agent-task-1","State":{"Status":"running"},"Config":{"Image":"node:20"}},
            {"Id":"c2","Name":"/other-agent-task-2","State":{"Status":"running"},"Config":{"Image":"node:20"}}
        ]"#;
        let (manager, _) = manager(
            ScriptedRunner::new()
                .on(&["ps"], ok("c1\nc2\n"))
                .on(&["inspect", "--type", "container", "c1", "c2"], ok(listing)),
        );

        let containers = manager.list_managed_containers("agent-task-").await.unwrap();
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].id, "c1");
    }

    #[tokio::test]
    async fn test_list_managed_empty() {
        let (manager, runner) = manager(ScriptedRunner::new().on(&["ps"], ok("")));
        assert!(manager.list_managed_containers("agent-task-").await.unwrap().is_empty());
        assert_eq!(runner.calls_with("inspect"), 0);
    }

    fn engine_event(action: &str, id: &str, exit_code: Option<i64>) -> EngineEvent {
        let mut attributes = std::collections::HashMap::new();
        attributes.insert(LABEL_TASK_ID.to_string(), "t1".to_string());
        EngineEvent {
            action: action.to_string(),
            container_id: id.to_string(),
            container_name: Some(format!("agent-task-{id}")),
            exit_code,
            attributes,
        }
    }

    #[tokio::test]
    async fn test_unexpected_die_publishes_died_with_oom() {
        let (manager, _) = manager(ScriptedRunner::new());
        let mut events = manager.subscribe();
        let mut oom = HashSet::new();

        manager.handle_engine_event(engine_event("oom", "c1", None), &mut oom).await;
        manager
            .handle_engine_event(engine_event("die", "c1", Some(137)), &mut oom)
            .await;

        match events.recv().await.unwrap() {
            ContainerEvent::Died { meta, exit_code, oom_killed } => {
                assert_eq!(meta.container_id, "c1");
                assert_eq!(meta.task_id.as_deref(), Some("t1"));
                assert_eq!(exit_code, 137);
                assert!(oom_killed);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(oom.is_empty());
    }

    #[tokio::test]
    async fn test_die_during_stop_is_suppressed() {
        let (manager, _) = manager(ScriptedRunner::new());
        let mut events = manager.subscribe();
        let mut oom = HashSet::new();

        manager.expect_exit("c1", Duration::from_secs(10));
        manager
            .handle_engine_event(engine_event("die", "c1", Some(143)), &mut oom)
            .await;
        assert!(events.try_recv().is_err());

        // Only the first exit after a stop is expected
        manager
            .handle_engine_event(engine_event("die", "c1", Some(1)), &mut oom)
            .await;
        assert_eq!(events.recv().await.unwrap().name(), "container:died");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_stop_does_not_suppress_later_die() {
        let (manager, _) = manager(ScriptedRunner::new());
        let mut events = manager.subscribe();
        let mut oom = HashSet::new();

        // The stop's own exit was never reported
        manager.expect_exit("c1", Duration::from_secs(10));
        manager.expect_exit("c2", Duration::from_secs(60));
        tokio::time::advance(Duration::from_secs(10) + EXPECTED_EXIT_MARGIN + Duration::from_secs(1)).await;

        manager
            .handle_engine_event(engine_event("die", "c1", Some(1)), &mut oom)
            .await;
        assert_eq!(events.recv().await.unwrap().name(), "container:died");
        assert!(!manager.stopping.contains_key("c1"));

        // A longer stop timeout is still within its window
        manager
            .handle_engine_event(engine_event("die", "c2", Some(143)), &mut oom)
            .await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_remove_running_uses_configured_stop_timeout() {
        let (manager, _) = manager(
            ScriptedRunner::new()
                .on(&["inspect"], ok(&inspect_json("c1", "agent-task-1", "running")))
                .on(&["rm"], ok("c1\n")),
        );
        let manager = manager.with_stop_options(StopOptions {
            timeout: Duration::from_secs(45),
        });
        assert_eq!(manager.stop_options().timeout, Duration::from_secs(45));

        manager.remove_container("c1", RemoveOptions::default()).await.unwrap();

        let deadline = *manager.stopping.get("c1").unwrap();
        assert!(deadline >= Instant::now() + Duration::from_secs(45));
    }

    #[tokio::test]
    async fn test_die_without_exit_code_falls_back_to_inspect() {
        let inspect = r#"[{"Id":"c1","Name":"/agent-task-c1","State":{"Status":"exited","ExitCode":2,"OOMKilled":false},"Config":{"Image":"node:20"}}]"#;
        let (manager, _) = manager(ScriptedRunner::new().on(&["inspect"], ok(inspect)));
        let mut events = manager.subscribe();

        manager
            .handle_engine_event(engine_event("died", "c1", None), &mut HashSet::new())
            .await;

        match events.recv().await.unwrap() {
            ContainerEvent::Died { exit_code, .. } => assert_eq!(exit_code, 2),
            other => panic!("unexpected event {other:?}"),
        }
    }
}

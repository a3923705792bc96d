//! Core data models for the supervisor

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Label stamped on every container created by the manager
pub const LABEL_MANAGED: &str = "supervisor.managed";
/// Label carrying the agent task a container was created for
pub const LABEL_TASK_ID: &str = "supervisor.task-id";

/// Lifecycle status of a container as seen by the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Created,
    Running,
    Stopped,
    Removed,
}

impl ContainerStatus {
    /// Map an engine state string (`docker inspect .State.Status`) to a status
    pub fn from_engine_state(state: &str) -> Self {
        match state.to_ascii_lowercase().as_str() {
            "created" | "configured" | "initialized" => ContainerStatus::Created,
            "running" | "paused" | "restarting" => ContainerStatus::Running,
            "removing" => ContainerStatus::Removed,
            _ => ContainerStatus::Stopped,
        }
    }
}

/// Identity and status snapshot of a container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: ContainerStatus,
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    #[serde(default)]
    pub oom_killed: bool,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl ContainerInfo {
    pub fn is_running(&self) -> bool {
        self.status == ContainerStatus::Running
    }

    pub fn task_id(&self) -> Option<&str> {
        self.labels.get(LABEL_TASK_ID).map(String::as_str)
    }
}

/// Point-in-time resource sample for one container
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerStats {
    pub cpu_percent: f64,
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub memory_percent: f64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
    pub block_read_bytes: u64,
    pub block_write_bytes: u64,
    pub pids: u64,
}

/// Bind mount passed to `create`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub host: PathBuf,
    pub container: PathBuf,
    #[serde(default)]
    pub read_only: bool,
}

impl VolumeMount {
    pub fn new(host: impl Into<PathBuf>, container: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
            read_only: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    fn to_arg(&self) -> String {
        let mut arg = format!("{}:{}", self.host.display(), self.container.display());
        if self.read_only {
            arg.push_str(":ro");
        }
        arg
    }
}

/// Everything needed to create a task container
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    /// Memory limit in engine notation (e.g. "512m", "2g")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpus: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(default)]
    pub volumes: Vec<VolumeMount>,
    #[serde(default)]
    pub auto_remove: bool,
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            ..Default::default()
        }
    }

    pub fn with_command(mut self, cmd: Vec<String>) -> Self {
        self.command = cmd;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_volume(mut self, mount: VolumeMount) -> Self {
        self.volumes.push(mount);
        self
    }

    /// Arguments following `create`, ending with the image and command
    pub fn create_args(&self) -> Vec<String> {
        let mut args = vec!["--name".to_string(), self.name.clone()];

        args.push("--label".into());
        args.push(format!("{}=true", LABEL_MANAGED));
        if let Some(task_id) = &self.task_id {
            args.push("--label".into());
            args.push(format!("{}={}", LABEL_TASK_ID, task_id));
        }
        for (key, value) in &self.labels {
            args.push("--label".into());
            args.push(format!("{}={}", key, value));
        }
        for (key, value) in &self.env {
            args.push("-e".into());
            args.push(format!("{}={}", key, value));
        }
        if let Some(dir) = &self.working_dir {
            args.push("-w".into());
            args.push(dir.display().to_string());
        }
        if let Some(memory) = &self.memory_limit {
            args.push("--memory".into());
            args.push(memory.clone());
        }
        if let Some(cpus) = self.cpus {
            args.push("--cpus".into());
            args.push(cpus.to_string());
        }
        if let Some(network) = &self.network {
            args.push("--network".into());
            args.push(network.clone());
        }
        for volume in &self.volumes {
            args.push("-v".into());
            args.push(volume.to_arg());
        }
        if self.auto_remove {
            args.push("--rm".into());
        }

        args.push(self.image.clone());
        args.extend(self.command.iter().cloned());
        args
    }
}

/// Options for `stop_container`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopOptions {
    /// Grace period before the engine sends SIGKILL
    pub timeout: Duration,
}

impl Default for StopOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
        }
    }
}

/// Options for `remove_container`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoveOptions {
    pub force: bool,
    pub volumes: bool,
}

impl Default for RemoveOptions {
    fn default() -> Self {
        Self {
            force: true,
            volumes: false,
        }
    }
}

//! Container engine detection
//!
//! Probes the known engines in priority order and remembers the first one
//! that answers. The set of installed engines does not change while the
//! process runs, so the choice is made at most once per detector.

use crate::error::{Result, SupervisorError};
use crate::process::{CommandRunner, SystemRunner};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Upper bound for a single version probe
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Engines the supervisor knows how to drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeId {
    Docker,
    Podman,
    Nerdctl,
}

impl RuntimeId {
    /// Probe order when no preference is configured
    pub const PRIORITY: [RuntimeId; 3] = [RuntimeId::Docker, RuntimeId::Podman, RuntimeId::Nerdctl];

    /// Executable name on PATH
    pub fn binary(&self) -> &'static str {
        match self {
            RuntimeId::Docker => "docker",
            RuntimeId::Podman => "podman",
            RuntimeId::Nerdctl => "nerdctl",
        }
    }

    /// Go-template formats emit one JSON object per line; podman wants `json`
    pub(crate) fn json_lines_format(&self) -> &'static str {
        match self {
            RuntimeId::Podman => "json",
            RuntimeId::Docker | RuntimeId::Nerdctl => "{{json .}}",
        }
    }

    fn probe_args(&self) -> Vec<String> {
        vec!["version".to_string()]
    }
}

impl std::fmt::Display for RuntimeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.binary())
    }
}

impl std::str::FromStr for RuntimeId {
    type Err = SupervisorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "docker" => Ok(RuntimeId::Docker),
            "podman" => Ok(RuntimeId::Podman),
            "nerdctl" => Ok(RuntimeId::Nerdctl),
            other => Err(SupervisorError::Config(format!("unknown container runtime '{other}'"))),
        }
    }
}

/// Picks the container engine to shell out to
pub struct RuntimeDetector {
    runner: Arc<dyn CommandRunner>,
    preferred: Option<RuntimeId>,
    probe_timeout: Duration,
    chosen: OnceCell<RuntimeId>,
}

impl RuntimeDetector {
    pub fn new(preferred: Option<RuntimeId>) -> Self {
        Self::with_runner(Arc::new(SystemRunner), preferred)
    }

    pub fn with_runner(runner: Arc<dyn CommandRunner>, preferred: Option<RuntimeId>) -> Self {
        Self {
            runner,
            preferred,
            probe_timeout: PROBE_TIMEOUT,
            chosen: OnceCell::new(),
        }
    }

    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Probe order: the preferred engine first, then the fixed priority list
    pub fn candidates(&self) -> Vec<RuntimeId> {
        let mut order = Vec::with_capacity(RuntimeId::PRIORITY.len());
        if let Some(preferred) = self.preferred {
            order.push(preferred);
        }
        order.extend(RuntimeId::PRIORITY.iter().filter(|r| Some(**r) != self.preferred));
        order
    }

    /// The first responding engine, probed once and cached
    pub async fn get_best_runtime(&self) -> Result<RuntimeId> {
        self.chosen
            .get_or_try_init(|| async {
                for runtime in self.candidates() {
                    if self.probe(runtime).await {
                        info!(runtime = %runtime, "Selected container runtime");
                        return Ok(runtime);
                    }
                }

                let tried = self
                    .candidates()
                    .iter()
                    .map(|r| r.binary().to_string())
                    .collect();
                Err(SupervisorError::RuntimeNotFound { tried })
            })
            .await
            .copied()
    }

    /// Every engine that currently answers, in probe order
    pub async fn available_runtimes(&self) -> Vec<RuntimeId> {
        let mut available = Vec::new();
        for runtime in self.candidates() {
            if self.probe(runtime).await {
                available.push(runtime);
            }
        }
        available
    }

    async fn probe(&self, runtime: RuntimeId) -> bool {
        let args = runtime.probe_args();
        let probe = self.runner.run(runtime.binary(), &args);

        match tokio::time::timeout(self.probe_timeout, probe).await {
            Ok(Ok(output)) if output.success() => {
                debug!(runtime = %runtime, "Runtime responded to probe");
                true
            }
            Ok(Ok(output)) => {
                debug!(
                    runtime = %runtime,
                    code = ?output.code,
                    error = %output.error_message(),
                    "Runtime probe exited unsuccessfully"
                );
                false
            }
            Ok(Err(e)) => {
                debug!(runtime = %runtime, error = %e, "Runtime binary not usable");
                false
            }
            Err(_) => {
                warn!(
                    runtime = %runtime,
                    timeout_ms = self.probe_timeout.as_millis() as u64,
                    "Runtime probe timed out"
                );
                false
            }
        }
    }
}

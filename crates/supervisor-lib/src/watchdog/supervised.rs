//! Processes the watchdog can supervise

use crate::error::{Result, SupervisorError};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Exit code of a daemon that found no container runtime
pub const EXIT_NO_RUNTIME: i32 = 2;

/// Exit code of a watchdog that stopped restarting its daemon
pub const EXIT_CIRCUIT_OPEN: i32 = 3;

/// Time a child gets to exit after SIGTERM before it is killed
pub const TERM_GRACE: Duration = Duration::from_secs(5);

/// How a supervised unit ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// `None` when killed by a signal
    pub code: Option<i32>,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// The daemon gave up because no engine is installed; relaunching cannot fix that
    pub fn runtime_missing(&self) -> bool {
        self.code == Some(EXIT_NO_RUNTIME)
    }

    pub fn describe(&self) -> String {
        match self.code {
            Some(code) => format!("exited with code {code}"),
            None => "terminated by signal".to_string(),
        }
    }
}

/// A unit of work the watchdog launches, waits on and restarts
#[async_trait]
pub trait Supervised: Send {
    async fn launch(&mut self) -> Result<()>;

    /// Resolves when the current launch ends
    async fn wait(&mut self) -> Result<ExitInfo>;

    /// Stop the current launch, gracefully where the unit supports it
    async fn kill(&mut self) -> Result<()>;

    fn name(&self) -> String;
}

/// A child process re-executed on every launch
pub struct ChildProcess {
    program: PathBuf,
    args: Vec<String>,
    child: Option<Child>,
    grace: Duration,
}

impl ChildProcess {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            child: None,
            grace: TERM_GRACE,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// The current executable with `args`, e.g. `supervisord run`
    pub fn current_exe(args: Vec<String>) -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?, args))
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }
}

#[async_trait]
impl Supervised for ChildProcess {
    async fn launch(&mut self) -> Result<()> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        info!(program = %self.program.display(), pid = ?child.id(), "Launched supervised process");
        self.child = Some(child);
        Ok(())
    }

    async fn wait(&mut self) -> Result<ExitInfo> {
        let child = self.child.as_mut().ok_or_else(|| {
            SupervisorError::operation("wait", self.program.display().to_string(), None, "process not running")
        })?;
        let status = child.wait().await?;
        self.child = None;
        Ok(ExitInfo { code: status.code() })
    }

    async fn kill(&mut self) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        if terminate(&child) {
            debug!(pid = ?child.id(), grace_ms = self.grace.as_millis() as u64, "Sent SIGTERM to supervised process");
            match tokio::time::timeout(self.grace, child.wait()).await {
                Ok(Ok(status)) => {
                    debug!(status = %status, "Supervised process exited after SIGTERM");
                    return Ok(());
                }
                Ok(Err(e)) => warn!(error = %e, "Failed to wait for supervised process"),
                Err(_) => warn!(pid = ?child.id(), "Supervised process ignored SIGTERM, killing"),
            }
        }

        child.kill().await?;
        Ok(())
    }

    fn name(&self) -> String {
        self.program
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string())
    }
}

/// Ask the child to shut down; false when it is already gone or signals are unsupported
#[cfg(unix)]
fn terminate(child: &Child) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return false;
    };
    match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) => true,
        Err(e) => {
            warn!(pid, error = %e, "Failed to send SIGTERM");
            false
        }
    }
}

#[cfg(not(unix))]
fn terminate(_child: &Child) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_child_process_exit_code() {
        let mut process = ChildProcess::new("sh", vec!["-c".into(), "exit 3".into()]);
        process.launch().await.unwrap();
        assert!(process.pid().is_some());

        let exit = process.wait().await.unwrap();
        assert_eq!(exit.code, Some(3));
        assert!(!exit.success());
        assert_eq!(exit.describe(), "exited with code 3");
        assert_eq!(process.name(), "sh");
    }

    #[tokio::test]
    async fn test_kill_running_process() {
        let mut process = ChildProcess::new("sleep", vec!["30".into()]);
        process.launch().await.unwrap();
        process.kill().await.unwrap();

        // Nothing left to wait on
        assert!(process.wait().await.is_err());
        process.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_kill_lets_process_exit_on_sigterm() {
        let script = "trap 'echo bye > \"$0\"; exit 0' TERM; while true; do sleep 0.1; done";
        let marker = tempfile::NamedTempFile::new().unwrap();
        let mut process = ChildProcess::new(
            "sh",
            vec!["-c".into(), script.into(), marker.path().display().to_string()],
        )
        .with_grace(Duration::from_secs(10));
        process.launch().await.unwrap();
        // Let the shell install its trap
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = std::time::Instant::now();
        process.kill().await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(std::fs::read_to_string(marker.path()).unwrap().trim(), "bye");
    }

    #[tokio::test]
    async fn test_kill_escalates_when_sigterm_ignored() {
        let mut process = ChildProcess::new(
            "sh",
            vec!["-c".into(), "trap '' TERM; while true; do sleep 0.1; done".into()],
        )
        .with_grace(Duration::from_millis(300));
        process.launch().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = std::time::Instant::now();
        process.kill().await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(process.pid().is_none());
    }

    #[test]
    fn test_runtime_missing_exit() {
        assert!(ExitInfo { code: Some(EXIT_NO_RUNTIME) }.runtime_missing());
        assert!(!ExitInfo { code: Some(3) }.runtime_missing());
        assert!(!ExitInfo { code: None }.runtime_missing());
    }

    #[tokio::test]
    async fn test_launch_missing_binary_fails() {
        let mut process = ChildProcess::new("/nonexistent/supervisord", vec![]);
        assert!(process.launch().await.is_err());
    }
}

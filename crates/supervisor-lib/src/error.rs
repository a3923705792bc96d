//! Error taxonomy for the supervisor
//!
//! Only [`SupervisorError::RuntimeNotFound`] and
//! [`SupervisorError::WatchdogCircuitOpen`] are meant to reach an operator.
//! Everything else is either returned to the calling component or
//! absorbed by the monitor loops with a logged warning.

use std::time::Duration;
use thiserror::Error;

/// Result alias used across the library
pub type Result<T, E = SupervisorError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum SupervisorError {
    /// No container engine answered its version probe
    #[error("no container runtime available (tried: {})", tried.join(", "))]
    RuntimeNotFound { tried: Vec<String> },

    /// Spawning the engine CLI failed or it exited non-zero
    #[error("container {operation} failed for {container}: {message}")]
    ContainerOperation {
        operation: &'static str,
        container: String,
        exit_code: Option<i32>,
        message: String,
    },

    /// A stats poll did not finish within its budget
    #[error("health check for {container} timed out after {}ms", timeout.as_millis())]
    HealthCheckTimeout { container: String, timeout: Duration },

    /// Restart budget exhausted inside the trailing window
    #[error(
        "watchdog circuit open: {restarts} restarts within {}s, refusing to restart again",
        window.as_secs()
    )]
    WatchdogCircuitOpen { restarts: usize, window: Duration },

    /// Admission rejected against the active capacity thresholds
    #[error("capacity exceeded: {reason}")]
    CapacityExceeded { reason: String },

    /// The watchdog's probe of the daemon got no healthy answer
    #[error("daemon self-check failed: {0}")]
    SelfCheck(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to parse engine output: {0}")]
    Parse(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SupervisorError {
    pub(crate) fn operation(
        operation: &'static str,
        container: impl Into<String>,
        exit_code: Option<i32>,
        message: impl Into<String>,
    ) -> Self {
        SupervisorError::ContainerOperation {
            operation,
            container: container.into(),
            exit_code,
            message: message.into(),
        }
    }

    /// Errors that should stop the process rather than be retried
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SupervisorError::RuntimeNotFound { .. } | SupervisorError::WatchdogCircuitOpen { .. }
        )
    }

    /// Process exit code for a fatal error
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            SupervisorError::RuntimeNotFound { .. } => Some(crate::watchdog::EXIT_NO_RUNTIME),
            SupervisorError::WatchdogCircuitOpen { .. } => Some(crate::watchdog::EXIT_CIRCUIT_OPEN),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for SupervisorError {
    fn from(err: serde_json::Error) -> Self {
        SupervisorError::Parse(err.to_string())
    }
}

impl From<config::ConfigError> for SupervisorError {
    fn from(err: config::ConfigError) -> Self {
        SupervisorError::Config(err.to_string())
    }
}

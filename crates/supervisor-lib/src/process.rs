//! Engine CLI invocation
//!
//! Every interaction with a container engine goes through [`CommandRunner`],
//! so the manager and the detector can be driven by a scripted runner in
//! tests instead of a real docker/podman binary.

use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tracing::trace;

/// Captured result of one engine invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when terminated by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Trimmed stderr, falling back to stdout when stderr is empty
    pub fn error_message(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

/// Runs an engine binary to completion
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput>;
}

/// Runner backed by real subprocesses
///
/// The child is killed if the returned future is dropped, so callers may
/// wrap `run` in `tokio::time::timeout` without leaking processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput> {
        trace!(program = %program, args = ?args, "Running engine command");

        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted runner shared by the detector and manager tests

    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    type Responder = Box<dyn Fn(&str, &[String]) -> Option<std::io::Result<CommandOutput>> + Send + Sync>;

    /// Answers commands from a list of matchers, recording every call
    #[derive(Default)]
    pub struct ScriptedRunner {
        responders: Mutex<VecDeque<Responder>>,
        pub calls: Mutex<Vec<(String, Vec<String>)>>,
    }

    impl ScriptedRunner {
        pub fn new() -> Self {
            Self::default()
        }

        /// Reply to any invocation whose args start with `prefix`
        pub fn on(self, prefix: &[&str], output: CommandOutput) -> Self {
            let prefix: Vec<String> = prefix.iter().map(|s| s.to_string()).collect();
            self.responders.lock().unwrap().push_back(Box::new(move |_, args| {
                if args.len() >= prefix.len() && args[..prefix.len()] == prefix[..] {
                    Some(Ok(output.clone()))
                } else {
                    None
                }
            }));
            self
        }

        /// Reply to a specific binary regardless of args
        pub fn on_program(self, program: &str, result: fn() -> std::io::Result<CommandOutput>) -> Self {
            let program = program.to_string();
            self.responders.lock().unwrap().push_back(Box::new(move |p, _| {
                if p == program {
                    Some(result())
                } else {
                    None
                }
            }));
            self
        }

        pub fn calls_with(&self, first_arg: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, args)| args.first().map(String::as_str) == Some(first_arg))
                .count()
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput> {
            self.calls
                .lock()
                .unwrap()
                .push((program.to_string(), args.to_vec()));

            let responders = self.responders.lock().unwrap();
            for responder in responders.iter() {
                if let Some(result) = responder(program, args) {
                    return result;
                }
            }

            Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no scripted response for {program} {}", args.join(" ")),
            ))
        }
    }

    pub fn ok(stdout: &str) -> CommandOutput {
        CommandOutput {
            code: Some(0),
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    pub fn fail(code: i32, stderr: &str) -> CommandOutput {
        CommandOutput {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }
}

//! Container log streaming
//!
//! A [`LogStream`] owns one engine `logs` subprocess. Each output pipe gets
//! a reader task that splits it into lines and pushes [`LogEntry`] values
//! into a bounded channel, so a chatty container can never grow the
//! supervisor's memory past the channel capacity: readers simply wait for
//! the consumer.
//!
//! Consumers either pull (`next_entry` or the [`Stream`] impl) or hand over
//! a callback with [`LogStream::on_entry`]. Order is preserved per pipe;
//! how stdout and stderr interleave is up to the scheduler.

use crate::error::Result;
use crate::observability::SupervisorMetrics;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Entries buffered between the readers and the consumer
pub const LOG_CHANNEL_CAPACITY: usize = 1024;

/// Longest line kept intact; the remainder is dropped
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// How long `end` waits for the process before killing it
const END_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStreamKind {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub stream: LogStreamKind,
    pub message: String,
}

/// Options for `logs`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogOptions {
    /// Keep the stream open for new output
    pub follow: bool,
    /// Only the last N lines of existing output
    pub tail: Option<usize>,
    /// Engine-accepted timestamp or relative duration, e.g. "10m"
    pub since: Option<String>,
    /// Ask the engine to prefix lines with RFC3339 timestamps
    pub timestamps: bool,
}

impl LogOptions {
    pub fn follow() -> Self {
        Self {
            follow: true,
            ..Default::default()
        }
    }

    /// Engine arguments, `logs` subcommand included
    pub fn to_args(&self, container: &str) -> Vec<String> {
        let mut args = vec!["logs".to_string()];
        if self.follow {
            args.push("--follow".into());
        }
        if let Some(tail) = self.tail {
            args.push("--tail".into());
            args.push(tail.to_string());
        }
        if let Some(since) = &self.since {
            args.push("--since".into());
            args.push(since.clone());
        }
        if self.timestamps {
            args.push("--timestamps".into());
        }
        args.push(container.to_string());
        args
    }
}

/// Totals reported when a push-mode stream finishes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogStreamSummary {
    pub delivered: u64,
    pub truncated_lines: u64,
}

/// Control handle for ending a stream from outside its consumer
#[derive(Clone)]
pub struct LogStreamHandle {
    cancel: CancellationToken,
    child: Arc<Mutex<Option<Child>>>,
}

impl LogStreamHandle {
    /// Stop reading and terminate the process, killing it if it lingers
    pub async fn end(&self) {
        self.cancel.cancel();
        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };

        match tokio::time::timeout(END_GRACE, child.wait()).await {
            Ok(Ok(status)) => debug!(status = %status, "Log process exited"),
            Ok(Err(e)) => warn!(error = %e, "Failed to wait for log process"),
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill log process");
                }
            }
        }
    }

    /// Kill the process immediately
    pub async fn kill(&self) {
        self.cancel.cancel();
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                warn!(error = %e, "Failed to kill log process");
            }
        }
    }

    pub fn is_ended(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Ordered, cancellable sequence of log entries from one container
pub struct LogStream {
    container_id: String,
    rx: mpsc::Receiver<LogEntry>,
    handle: LogStreamHandle,
    truncated: Arc<AtomicU64>,
    delivered: u64,
}

impl LogStream {
    /// Spawn `program args` and stream its output
    pub fn spawn(
        program: &str,
        args: &[String],
        container_id: impl Into<String>,
        timestamps: bool,
    ) -> Result<Self> {
        let container_id = container_id.into();
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let (tx, rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let truncated = Arc::new(AtomicU64::new(0));

        let reader = PipeReader {
            container_id: container_id.clone(),
            timestamps,
            tx,
            cancel: cancel.clone(),
            truncated: truncated.clone(),
        };
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(reader.clone().run(stdout, LogStreamKind::Stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(reader.run(stderr, LogStreamKind::Stderr));
        }

        debug!(container_id = %container_id, "Log stream opened");

        Ok(Self {
            container_id,
            rx,
            handle: LogStreamHandle {
                cancel,
                child: Arc::new(Mutex::new(Some(child))),
            },
            truncated,
            delivered: 0,
        })
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn handle(&self) -> LogStreamHandle {
        self.handle.clone()
    }

    /// Next entry, or `None` once the stream has ended
    pub async fn next_entry(&mut self) -> Option<LogEntry> {
        let entry = self.rx.recv().await;
        if entry.is_some() {
            self.delivered += 1;
        }
        entry
    }

    /// Deliver every entry to `callback` on a background task
    pub fn on_entry<F>(mut self, mut callback: F) -> JoinHandle<LogStreamSummary>
    where
        F: FnMut(LogEntry) + Send + 'static,
    {
        tokio::spawn(async move {
            while let Some(entry) = self.next_entry().await {
                callback(entry);
            }
            self.summary()
        })
    }

    pub fn summary(&self) -> LogStreamSummary {
        LogStreamSummary {
            delivered: self.delivered,
            truncated_lines: self.truncated.load(Ordering::Relaxed),
        }
    }

    pub async fn end(&self) {
        self.handle.end().await;
    }

    pub async fn kill(&self) {
        self.handle.kill().await;
    }
}

impl Stream for LogStream {
    type Item = LogEntry;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<LogEntry>> {
        let poll = self.rx.poll_recv(cx);
        if let Poll::Ready(Some(_)) = &poll {
            self.delivered += 1;
        }
        poll
    }
}

#[derive(Clone)]
struct PipeReader {
    container_id: String,
    timestamps: bool,
    tx: mpsc::Sender<LogEntry>,
    cancel: CancellationToken,
    truncated: Arc<AtomicU64>,
}

impl PipeReader {
    async fn run<R>(self, pipe: R, stream: LogStreamKind)
    where
        R: AsyncRead + Unpin,
    {
        let metrics = SupervisorMetrics::new();
        let mut reader = BufReader::new(pipe);
        let mut buf = Vec::new();

        loop {
            let line = tokio::select! {
                _ = self.cancel.cancelled() => break,
                line = read_line_bounded(&mut reader, &mut buf, MAX_LINE_BYTES) => line,
            };

            match line {
                Ok(None) => break,
                Ok(Some(truncated)) => {
                    if truncated {
                        self.truncated.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            container_id = %self.container_id,
                            max_bytes = MAX_LINE_BYTES,
                            "Log line truncated"
                        );
                    }
                    let entry = self.entry(stream, &buf);
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        sent = self.tx.send(entry) => {
                            if sent.is_err() {
                                // Consumer dropped the stream
                                break;
                            }
                            metrics.inc_log_entries();
                        }
                    }
                }
                Err(e) => {
                    warn!(container_id = %self.container_id, ?stream, error = %e, "Log pipe read failed");
                    break;
                }
            }
        }
    }

    fn entry(&self, stream: LogStreamKind, raw: &[u8]) -> LogEntry {
        let text = String::from_utf8_lossy(raw);
        let line = text.strip_suffix('\r').unwrap_or(&*text);

        let (timestamp, message) = if self.timestamps {
            split_timestamp(line)
        } else {
            (Utc::now(), line.to_string())
        };

        LogEntry {
            timestamp,
            stream,
            message,
        }
    }
}

/// Split an engine `--timestamps` prefix off a line, falling back to now
fn split_timestamp(line: &str) -> (DateTime<Utc>, String) {
    if let Some((prefix, rest)) = line.split_once(' ') {
        if let Ok(ts) = DateTime::parse_from_rfc3339(prefix) {
            return (ts.with_timezone(&Utc), rest.to_string());
        }
    }
    (Utc::now(), line.to_string())
}

/// Read one `\n`-terminated line into `buf`, keeping at most `max` bytes
///
/// Returns `Ok(None)` at EOF, otherwise whether the line was truncated.
async fn read_line_bounded<R>(reader: &mut R, buf: &mut Vec<u8>, max: usize) -> std::io::Result<Option<bool>>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let mut truncated = false;
    let mut read_any = false;

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(read_any.then_some(truncated));
        }
        read_any = true;

        let (chunk, used, done) = match available.iter().position(|b| *b == b'\n') {
            Some(pos) => (&available[..pos], pos + 1, true),
            None => (available, available.len(), false),
        };

        let room = max.saturating_sub(buf.len());
        if chunk.len() > room {
            truncated = true;
            buf.extend_from_slice(&chunk[..room]);
        } else {
            buf.extend_from_slice(chunk);
        }

        reader.consume(used);
        if done {
            return Ok(Some(truncated));
        }
    }
}

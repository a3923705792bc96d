//! Restart accounting and circuit breaker

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Restarts kept in the reported history
pub const RESTART_HISTORY_CAP: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartRecord {
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// The watchdog killed the daemon itself after failed self-checks
    pub triggered_by_watchdog: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    Restart { restarts_in_window: usize },
    CircuitOpen { restarts: usize },
}

#[derive(Default)]
struct TrackerState {
    window: VecDeque<Instant>,
    history: VecDeque<RestartRecord>,
}

/// Counts restarts over a trailing window and refuses once the budget is spent
pub struct RestartTracker {
    max_restarts: usize,
    window: Duration,
    state: Mutex<TrackerState>,
    circuit_open: AtomicBool,
}

impl RestartTracker {
    pub fn new(max_restarts: u32, window: Duration) -> Self {
        Self {
            max_restarts: max_restarts as usize,
            window,
            state: Mutex::new(TrackerState::default()),
            circuit_open: AtomicBool::new(false),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record a restart unless it would exceed the budget
    ///
    /// Pruning, counting and appending happen under one lock, so concurrent
    /// callers can never both squeeze into the last slot.
    pub fn try_record(&self, reason: impl Into<String>, exit_code: Option<i32>, triggered_by_watchdog: bool) -> RestartDecision {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        while let Some(oldest) = state.window.front() {
            if now.duration_since(*oldest) >= self.window {
                state.window.pop_front();
            } else {
                break;
            }
        }

        if state.window.len() >= self.max_restarts {
            self.circuit_open.store(true, Ordering::SeqCst);
            return RestartDecision::CircuitOpen {
                restarts: state.window.len(),
            };
        }

        state.window.push_back(now);
        state.history.push_front(RestartRecord {
            timestamp: Utc::now(),
            reason: reason.into(),
            exit_code,
            triggered_by_watchdog,
        });
        state.history.truncate(RESTART_HISTORY_CAP);

        RestartDecision::Restart {
            restarts_in_window: state.window.len(),
        }
    }

    /// Newest first
    pub fn history(&self) -> Vec<RestartRecord> {
        let state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        state.history.iter().cloned().collect()
    }

    pub fn is_circuit_open(&self) -> bool {
        self.circuit_open.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_circuit_opens_after_budget() {
        let tracker = RestartTracker::new(3, Duration::from_secs(60));

        for i in 1..=3 {
            assert_eq!(
                tracker.try_record("crash", Some(1), false),
                RestartDecision::Restart { restarts_in_window: i }
            );
        }
        assert!(!tracker.is_circuit_open());

        assert_eq!(
            tracker.try_record("crash", Some(1), false),
            RestartDecision::CircuitOpen { restarts: 3 }
        );
        assert!(tracker.is_circuit_open());
        assert_eq!(tracker.history().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_old_restarts_leave_window() {
        let tracker = RestartTracker::new(2, Duration::from_secs(60));
        tracker.try_record("a", None, false);
        tracker.try_record("b", None, false);

        tokio::time::advance(Duration::from_secs(61)).await;

        assert_eq!(
            tracker.try_record("c", None, false),
            RestartDecision::Restart { restarts_in_window: 1 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_capped_newest_first() {
        let tracker = RestartTracker::new(100, Duration::from_secs(60));
        for i in 0..15 {
            tracker.try_record(format!("crash {i}"), Some(i), false);
        }

        let history = tracker.history();
        assert_eq!(history.len(), RESTART_HISTORY_CAP);
        assert_eq!(history[0].reason, "crash 14");
        assert_eq!(history[9].reason, "crash 5");
    }

    #[tokio::test]
    async fn test_concurrent_callers_respect_budget() {
        let tracker = Arc::new(RestartTracker::new(5, Duration::from_secs(60)));
        let mut handles = Vec::new();
        for _ in 0..20 {
            let tracker = tracker.clone();
            handles.push(tokio::spawn(async move { tracker.try_record("crash", None, false) }));
        }

        let mut allowed = 0;
        for handle in handles {
            if let RestartDecision::Restart { .. } = handle.await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 5);
    }
}

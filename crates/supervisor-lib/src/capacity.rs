//! Time-of-day capacity policy
//!
//! Resolves which set of admission thresholds is active for a given
//! wall-clock instant. Everything in here is a pure function of its
//! inputs: no I/O, no interior state, safe to call from anywhere.

use crate::error::{Result, SupervisorError};
use chrono::{DateTime, TimeZone, Timelike};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Capacity mode selected by the current hour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapacityMode {
    Day,
    Night,
}

impl std::fmt::Display for CapacityMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CapacityMode::Day => write!(f, "day"),
            CapacityMode::Night => write!(f, "night"),
        }
    }
}

/// Hard per-task and per-window caps for one mode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeThresholds {
    pub max_tokens_per_task: u64,
    pub max_cost_per_task: f64,
    pub max_concurrent_tasks: u32,
}

impl ModeThresholds {
    fn validate(&self, mode: CapacityMode) -> Result<()> {
        if self.max_tokens_per_task == 0 {
            return Err(SupervisorError::Config(format!(
                "{mode}_mode_thresholds.max_tokens_per_task must be positive"
            )));
        }
        if !self.max_cost_per_task.is_finite() || self.max_cost_per_task <= 0.0 {
            return Err(SupervisorError::Config(format!(
                "{mode}_mode_thresholds.max_cost_per_task must be a positive finite number"
            )));
        }
        if self.max_concurrent_tasks == 0 {
            return Err(SupervisorError::Config(format!(
                "{mode}_mode_thresholds.max_concurrent_tasks must be positive"
            )));
        }
        Ok(())
    }
}

/// Admission-control configuration, immutable for a process lifetime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeBasedUsagePolicy {
    pub enabled: bool,
    pub day_mode_hours: BTreeSet<u32>,
    pub night_mode_hours: BTreeSet<u32>,
    pub day_mode_capacity_threshold: f64,
    pub night_mode_capacity_threshold: f64,
    pub day_mode_thresholds: ModeThresholds,
    pub night_mode_thresholds: ModeThresholds,
}

impl Default for TimeBasedUsagePolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            day_mode_hours: (8..=18).collect(),
            night_mode_hours: (0..8).chain(19..24).collect(),
            day_mode_capacity_threshold: 0.5,
            night_mode_capacity_threshold: 0.9,
            day_mode_thresholds: ModeThresholds {
                max_tokens_per_task: 200_000,
                max_cost_per_task: 2.0,
                max_concurrent_tasks: 2,
            },
            night_mode_thresholds: ModeThresholds {
                max_tokens_per_task: 500_000,
                max_cost_per_task: 5.0,
                max_concurrent_tasks: 5,
            },
        }
    }
}

impl TimeBasedUsagePolicy {
    /// Reject thresholds outside [0, 1] (NaN and infinities included) and hours past 23
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("day_mode_capacity_threshold", self.day_mode_capacity_threshold),
            ("night_mode_capacity_threshold", self.night_mode_capacity_threshold),
        ] {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(SupervisorError::Config(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }

        for (name, hours) in [
            ("day_mode_hours", &self.day_mode_hours),
            ("night_mode_hours", &self.night_mode_hours),
        ] {
            if let Some(bad) = hours.iter().find(|h| **h > 23) {
                return Err(SupervisorError::Config(format!(
                    "{name} contains invalid hour {bad}"
                )));
            }
        }

        self.day_mode_thresholds.validate(CapacityMode::Day)?;
        self.night_mode_thresholds.validate(CapacityMode::Night)?;
        Ok(())
    }

    /// Mode for an hour of day. Hours listed in neither set, or in both, fall back to day.
    pub fn mode_for_hour(&self, hour: u32) -> CapacityMode {
        let day = self.day_mode_hours.contains(&hour);
        let night = self.night_mode_hours.contains(&hour);
        match (day, night) {
            (false, true) => CapacityMode::Night,
            _ => CapacityMode::Day,
        }
    }
}

/// Thresholds in force at a given instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveCapacity {
    pub mode: CapacityMode,
    pub capacity_threshold: f64,
    pub thresholds: ModeThresholds,
}

/// Current consumption reported by the scheduler
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    /// Fraction of the resource budget already consumed
    pub budget_used_fraction: f64,
    pub active_tasks: u32,
}

/// Projected cost of a task asking for admission
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskEstimate {
    pub tokens: u64,
    pub cost: f64,
}

impl ActiveCapacity {
    /// Admission check the scheduler runs before launching a task container
    pub fn check_admission(&self, usage: &UsageSnapshot, task: &TaskEstimate) -> Result<()> {
        let reject = |reason: String| Err(SupervisorError::CapacityExceeded { reason });

        if usage.budget_used_fraction >= self.capacity_threshold {
            return reject(format!(
                "{:.0}% of budget used, {} mode allows {:.0}%",
                usage.budget_used_fraction * 100.0,
                self.mode,
                self.capacity_threshold * 100.0
            ));
        }
        if usage.active_tasks >= self.thresholds.max_concurrent_tasks {
            return reject(format!(
                "{} tasks active, {} mode allows {}",
                usage.active_tasks, self.mode, self.thresholds.max_concurrent_tasks
            ));
        }
        if task.tokens > self.thresholds.max_tokens_per_task {
            return reject(format!(
                "task needs {} tokens, limit is {}",
                task.tokens, self.thresholds.max_tokens_per_task
            ));
        }
        if task.cost > self.thresholds.max_cost_per_task {
            return reject(format!(
                "task cost {:.2} exceeds limit {:.2}",
                task.cost, self.thresholds.max_cost_per_task
            ));
        }
        Ok(())
    }
}

/// Resolve the active capacity for `now` in its own timezone
///
/// With the policy disabled the day thresholds apply and the capacity
/// threshold is 1.0, i.e. no time-based throttling.
pub fn resolve_mode<Tz: TimeZone>(now: &DateTime<Tz>, policy: &TimeBasedUsagePolicy) -> ActiveCapacity {
    if !policy.enabled {
        return ActiveCapacity {
            mode: CapacityMode::Day,
            capacity_threshold: 1.0,
            thresholds: policy.day_mode_thresholds.clone(),
        };
    }

    match policy.mode_for_hour(now.hour()) {
        CapacityMode::Day => ActiveCapacity {
            mode: CapacityMode::Day,
            capacity_threshold: policy.day_mode_capacity_threshold,
            thresholds: policy.day_mode_thresholds.clone(),
        },
        CapacityMode::Night => ActiveCapacity {
            mode: CapacityMode::Night,
            capacity_threshold: policy.night_mode_capacity_threshold,
            thresholds: policy.night_mode_thresholds.clone(),
        },
    }
}

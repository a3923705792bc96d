//! Container supervisor library
//!
//! This crate provides the core functionality for:
//! - Container engine detection and lifecycle management via the engine CLI
//! - Container log streaming
//! - Per-container health supervision
//! - Daemon watchdog with restart circuit breaker
//! - Time-based capacity policy and admission checks
//! - Configuration, observability and component health

pub mod capacity;
pub mod config;
pub mod container;
pub mod context;
pub mod error;
pub mod health;
pub mod logs;
pub mod models;
pub mod observability;
pub mod process;
pub mod runtime;
pub mod watchdog;

pub use capacity::{resolve_mode, ActiveCapacity, CapacityMode, TimeBasedUsagePolicy};
pub use config::SupervisorConfig;
pub use container::{ContainerEvent, ContainerInspector, ContainerManager};
pub use context::{DaemonStatus, SupervisorContext};
pub use error::{Result, SupervisorError};
pub use health::{HealthMonitor, HealthRecord, HealthStatus, MonitorEvent};
pub use logs::{LogEntry, LogOptions, LogStream};
pub use models::*;
pub use observability::{StructuredLogger, SupervisorMetrics};
pub use runtime::{RuntimeDetector, RuntimeId};
pub use watchdog::{HealthMetrics, SelfCheck, Supervised, TaskOutcome, Watchdog};

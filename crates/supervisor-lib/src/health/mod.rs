//! Container health supervision
//!
//! - [`HealthMonitor`]: per-container health state machine fed by lifecycle
//!   events and periodic stats polls
//! - [`ComponentRegistry`]: readiness of the supervisor's own components

mod monitor;
mod record;
mod registry;

pub use monitor::{HealthMonitor, MonitorConfig, MonitorEvent, MonitorStats, PollOutcome};
pub use record::{death_message, HealthRecord, HealthStatus};
pub use registry::{
    components, ComponentHealth, ComponentRegistry, ComponentStatus, HealthResponse, ReadinessResponse,
};

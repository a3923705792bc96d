//! Container lifecycle management
//!
//! [`ContainerManager`] drives the chosen engine CLI and publishes a
//! [`ContainerEvent`] for every lifecycle change it causes, plus `Died` for
//! exits it did not cause (read from the engine's own event stream).

mod events;
mod manager;
pub mod parse;

pub use events::{ContainerEvent, EventBus, EventMeta, DEFAULT_EVENT_CAPACITY};
pub use manager::ContainerManager;

use crate::error::Result;
use crate::models::{ContainerInfo, ContainerStats};
use async_trait::async_trait;
use std::time::Duration;

/// Read-only view of containers used by the health monitor
///
/// Implemented by [`ContainerManager`]; tests substitute a mock.
#[async_trait]
pub trait ContainerInspector: Send + Sync {
    /// `Ok(None)` when the container does not exist
    async fn get_container_info(&self, id: &str) -> Result<Option<ContainerInfo>>;

    /// `Ok(None)` when the container is missing or not running
    async fn get_stats(&self, id: &str, timeout: Duration) -> Result<Option<ContainerStats>>;

    async fn list_managed_containers(&self, name_prefix: &str) -> Result<Vec<ContainerInfo>>;
}

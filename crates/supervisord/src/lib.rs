//! Supervisor daemon and watchdog entry points

pub mod api;
pub mod self_check;

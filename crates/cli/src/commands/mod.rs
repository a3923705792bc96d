//! svctl subcommands

pub mod capacity;
pub mod health;
pub mod runtime;
pub mod status;

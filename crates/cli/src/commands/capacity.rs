//! Time-based capacity, resolved from the local configuration

use anyhow::{Context, Result};
use chrono::{Local, Timelike};
use colored::Colorize;
use std::path::Path;
use supervisor_lib::{resolve_mode, SupervisorConfig};

use crate::output::{format_percent, print_info, print_json, OutputFormat};

pub fn show_capacity(config_path: Option<&Path>, hour: Option<u32>, format: OutputFormat) -> Result<()> {
    let config = SupervisorConfig::load(config_path).context("Failed to load configuration")?;
    let policy = &config.time_based_usage;

    let now = Local::now();
    let at = match hour {
        Some(hour) => now
            .with_hour(hour)
            .with_context(|| format!("Invalid hour {hour}, expected 0-23"))?,
        None => now,
    };
    let active = resolve_mode(&at, policy);

    match format {
        OutputFormat::Json => print_json(&active),
        OutputFormat::Table => {
            if !policy.enabled {
                print_info("Time-based usage policy disabled, no throttling");
            }
            println!("{}", format!("Capacity at {:02}:00", at.hour()).bold());
            println!("{}", "=".repeat(40));
            println!("Mode:            {}", active.mode.to_string().cyan());
            println!("Budget cap:      {}", format_percent(active.capacity_threshold));
            println!("Tokens per task: {}", active.thresholds.max_tokens_per_task);
            println!("Cost per task:   {:.2}", active.thresholds.max_cost_per_task);
            println!("Concurrent:      {}", active.thresholds.max_concurrent_tasks);
            Ok(())
        }
    }
}

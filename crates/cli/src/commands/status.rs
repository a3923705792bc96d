//! Daemon and watchdog status

use anyhow::Result;
use colored::Colorize;
use serde::Serialize;
use supervisor_lib::{DaemonStatus, HealthMetrics};
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{
    color_status, format_bytes, format_percent, format_uptime, print_info, print_json, print_table, print_warning,
    OutputFormat,
};

#[derive(Serialize)]
struct CombinedStatus {
    daemon: DaemonStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    watchdog: Option<HealthMetrics>,
}

#[derive(Tabled)]
struct RestartRow {
    #[tabled(rename = "When")]
    when: String,
    #[tabled(rename = "Reason")]
    reason: String,
    #[tabled(rename = "Exit")]
    exit_code: String,
    #[tabled(rename = "By Watchdog")]
    triggered: String,
}

pub async fn show_status(daemon: &ApiClient, watchdog: &ApiClient, format: OutputFormat) -> Result<()> {
    let daemon_status: DaemonStatus = daemon.get("status").await?;

    // The watchdog is optional: the daemon may run in the foreground
    let watchdog_status: Option<HealthMetrics> = watchdog.get("status").await.ok();

    match format {
        OutputFormat::Json => print_json(&CombinedStatus {
            daemon: daemon_status,
            watchdog: watchdog_status,
        }),
        OutputFormat::Table => {
            print_daemon(&daemon_status);
            println!();
            match watchdog_status {
                Some(metrics) => print_watchdog(&metrics),
                None => print_warning(&format!("Watchdog not reachable at {}", watchdog.base_url())),
            }
            Ok(())
        }
    }
}

fn print_daemon(status: &DaemonStatus) {
    println!("{}", "Daemon".bold());
    println!("{}", "=".repeat(40));
    println!("Runtime:     {}", status.runtime.to_string().cyan());
    println!("Version:     {}", status.version);
    println!("Uptime:      {}", format_uptime(status.uptime_secs));
    println!(
        "Monitoring:  {}",
        if status.monitoring {
            color_status("running")
        } else {
            color_status("stopped")
        }
    );
    println!(
        "Containers:  {} total, {} healthy, {} starting, {} unhealthy",
        status.containers.total,
        status.containers.healthy.to_string().green(),
        status.containers.starting.to_string().yellow(),
        status.containers.unhealthy.to_string().red(),
    );
    println!(
        "Capacity:    {} mode, threshold {}",
        status.capacity.mode.to_string().cyan(),
        format_percent(status.capacity.capacity_threshold)
    );
}

fn print_watchdog(metrics: &HealthMetrics) {
    println!("{}", "Watchdog".bold());
    println!("{}", "=".repeat(40));
    println!("Uptime:      {}", format_uptime(metrics.uptime_secs));
    println!("Memory:      {}", format_bytes(metrics.memory_usage_bytes));
    println!(
        "Circuit:     {}",
        if metrics.circuit_open {
            color_status("open")
        } else {
            color_status("ok")
        }
    );
    println!(
        "Tasks:       {} active, {} succeeded, {} failed",
        metrics.task_counts.active, metrics.task_counts.succeeded, metrics.task_counts.failed
    );
    println!(
        "Self-checks: {} passed, {} failed{}",
        metrics.health_checks_passed,
        metrics.health_checks_failed,
        metrics
            .last_health_check
            .map(|t| format!(" (last {})", t.format("%Y-%m-%d %H:%M:%S")))
            .unwrap_or_default()
    );

    if metrics.restart_history.is_empty() {
        print_info("No restarts recorded");
        return;
    }

    println!();
    let rows: Vec<RestartRow> = metrics
        .restart_history
        .iter()
        .map(|r| RestartRow {
            when: r.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
            reason: r.reason.clone(),
            exit_code: r.exit_code.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string()),
            triggered: if r.triggered_by_watchdog { "yes" } else { "no" }.to_string(),
        })
        .collect();
    print_table(&rows, "No restarts recorded");
}

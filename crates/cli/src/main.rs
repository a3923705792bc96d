//! Container supervisor CLI
//!
//! Queries the daemon and watchdog status APIs, and answers capacity and
//! runtime questions from the local configuration and engines.

mod client;
mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use supervisor_lib::RuntimeId;

#[derive(Parser)]
#[command(name = "svctl")]
#[command(author, version, about = "CLI for the container supervisor", long_about = None)]
pub struct Cli {
    /// Daemon API URL
    #[arg(long, env = "SVCTL_DAEMON_URL", default_value = "http://localhost:8080")]
    pub daemon_url: String,

    /// Watchdog API URL
    #[arg(long, env = "SVCTL_WATCHDOG_URL", default_value = "http://localhost:8081")]
    pub watchdog_url: String,

    /// Output format
    #[arg(long, short, global = true, default_value = "table")]
    pub format: output::OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show daemon and watchdog status
    Status,

    /// Show container health, for one container or all monitored ones
    Health {
        /// Container ID
        id: Option<String>,
    },

    /// Show the capacity thresholds in force
    Capacity {
        /// Resolve for this local hour (0-23) instead of now
        #[arg(long, value_parser = clap::value_parser!(u32).range(0..24))]
        hour: Option<u32>,

        /// Supervisor configuration file
        #[arg(long, env = "SUPERVISOR_CONFIG")]
        config: Option<PathBuf>,
    },

    /// List container engines available on this host
    Runtime {
        /// Engine to prefer when several are available
        #[arg(long)]
        prefer: Option<RuntimeId>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Status => {
            let daemon = client::ApiClient::new(&cli.daemon_url)?;
            let watchdog = client::ApiClient::new(&cli.watchdog_url)?;
            commands::status::show_status(&daemon, &watchdog, cli.format).await?;
        }
        Commands::Health { id } => {
            let daemon = client::ApiClient::new(&cli.daemon_url)?;
            commands::health::show_health(&daemon, id, cli.format).await?;
        }
        Commands::Capacity { hour, config } => {
            commands::capacity::show_capacity(config.as_deref(), hour, cli.format)?;
        }
        Commands::Runtime { prefer } => {
            commands::runtime::show_runtimes(prefer, cli.format).await?;
        }
    }

    Ok(())
}

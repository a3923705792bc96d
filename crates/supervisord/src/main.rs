//! Container supervisor daemon
//!
//! `supervisord run` starts the daemon in the foreground: engine detection,
//! container health supervision and the HTTP API. `supervisord watch` (the
//! default) runs the daemon as a child process under the watchdog.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use supervisor_lib::{
    observability::{host_name, StructuredLogger},
    watchdog::{ChildProcess, WatchdogSettings},
    SupervisorConfig, SupervisorContext, SupervisorError, Watchdog,
};
use supervisord::api::{self, DaemonState};
use supervisord::self_check::HttpSelfCheck;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Budget for background tasks to wind down after cancellation
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "supervisord", version, about = "Container lifecycle supervisor")]
struct Cli {
    /// TOML configuration file, overridden by SUPERVISOR__* variables
    #[arg(short, long, global = true, env = "SUPERVISOR_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Clone, Copy)]
enum Command {
    /// Run the daemon in the foreground
    Run,
    /// Run the daemon under the watchdog
    Watch,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,supervisor_lib=debug".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let cli = Cli::parse();
    let config = SupervisorConfig::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Command::Watch) {
        Command::Run => run_daemon(config).await,
        Command::Watch if !config.watchdog.enabled => {
            info!("Watchdog disabled, running daemon in the foreground");
            run_daemon(config).await
        }
        Command::Watch => run_watchdog(config, cli.config).await,
    }
}

async fn run_daemon(config: SupervisorConfig) -> Result<ExitCode> {
    let logger = StructuredLogger::new(host_name());
    let port = config.api.port;

    let context = match SupervisorContext::initialize(config).await {
        Ok(context) => Arc::new(context),
        Err(e) => match fatal_exit(&e) {
            Some(code) => {
                error!(error = %e, "Cannot start supervisor");
                return Ok(code);
            }
            None => return Err(e.into()),
        },
    };
    logger.log_startup("daemon", VERSION, context.runtime.binary());

    let handles = context.start().await;

    let mut server = tokio::spawn(api::serve(
        port,
        api::daemon_router(DaemonState::new(context.clone())),
        context.cancel.clone(),
    ));

    let reason = tokio::select! {
        _ = shutdown_signal() => "signal",
        result = &mut server => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "API server failed"),
                Err(e) => error!(error = %e, "API server task panicked"),
            }
            "api server stopped"
        }
    };

    context.shutdown().await;
    for handle in handles {
        if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
            warn!("Background task did not stop in time");
        }
    }
    if !server.is_finished() {
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, server).await;
    }

    logger.log_shutdown("daemon", reason);
    Ok(ExitCode::SUCCESS)
}

async fn run_watchdog(config: SupervisorConfig, config_path: Option<PathBuf>) -> Result<ExitCode> {
    let logger = StructuredLogger::new(host_name());
    let cancel = CancellationToken::new();
    let watchdog = Arc::new(Watchdog::new(WatchdogSettings::from(&config), cancel.clone()));

    let mut args = vec!["run".to_string()];
    if let Some(path) = &config_path {
        args.push("--config".to_string());
        args.push(path.display().to_string());
    }
    let mut daemon = ChildProcess::current_exe(args)?;

    let check = HttpSelfCheck::local(config.api.port, config.health_check.timeout())?;
    info!(url = %check.url(), "Watchdog self-check target");

    logger.log_startup("watchdog", VERSION, "n/a");

    let checks = {
        let watchdog = watchdog.clone();
        tokio::spawn(async move { watchdog.run_self_checks(&check).await })
    };

    let server = tokio::spawn(api::serve(
        config.api.watchdog_port,
        api::watchdog_router(watchdog.clone()),
        cancel.clone(),
    ));

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("Shutdown signal received");
            cancel.cancel();
        });
    }

    let result = watchdog.supervise(&mut daemon).await;
    cancel.cancel();

    let _ = tokio::time::timeout(SHUTDOWN_GRACE, checks).await;
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, server).await;

    match result {
        Ok(()) => {
            logger.log_shutdown("watchdog", "supervision ended");
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => match fatal_exit(&e) {
            Some(code) => {
                error!(error = %e, "Watchdog giving up");
                logger.log_shutdown("watchdog", &e.to_string());
                Ok(code)
            }
            None => Err(e.into()),
        },
    }
}

/// 2 when no runtime exists, 3 when the watchdog circuit opened
fn fatal_exit(err: &SupervisorError) -> Option<ExitCode> {
    err.exit_code()
        .and_then(|code| u8::try_from(code).ok())
        .map(ExitCode::from)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

//! Threadline - Slack thread to workflow bridge binary.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use threadline_bridge::{BridgeBot, BridgeConfig};

/// How long the connection loop and in-flight turns get to finish after a shutdown signal.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Slack conversation bridge
#[derive(Parser)]
#[command(name = "threadline")]
#[command(about = "Bridges Slack threads to a workflow backend over Socket Mode")]
#[command(version)]
struct Args {
    /// Configuration file path (TOML). Environment variables are used when absent.
    #[arg(short, long)]
    config: Option<String>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging
    #[arg(long)]
    json_logs: bool,
}

fn setup_logging(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if json {
        subscriber
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        subscriber
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    setup_logging(&args.log_level, args.json_logs);

    let config = if let Some(config_path) = args.config {
        match BridgeConfig::from_file(&config_path) {
            Ok(c) => c,
            Err(e) => {
                error!("Failed to load config from {}: {}", config_path, e);
                return ExitCode::FAILURE;
            }
        }
    } else {
        match BridgeConfig::from_env() {
            Ok(c) => c,
            Err(e) => {
                error!("Failed to load config from environment: {}", e);
                return ExitCode::FAILURE;
            }
        }
    };

    let bot = match BridgeBot::new(&config) {
        Ok(bot) => Arc::new(bot),
        Err(e) => {
            error!("Failed to start bridge: {}", e);
            return ExitCode::FAILURE;
        }
    };

    info!("Bridging workflow {}", config.workflow_id());
    info!("Press Ctrl+C to stop");

    let runner = bot.clone();
    let mut run = tokio::spawn(async move { runner.start().await });

    let result = tokio::select! {
        joined = &mut run => joined,
        _ = shutdown_signal() => {
            bot.shutdown();
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut run).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!("Bridge did not stop within {:?}, aborting", SHUTDOWN_TIMEOUT);
                    run.abort();
                    return ExitCode::SUCCESS;
                }
            }
        }
    };

    match result {
        Ok(Ok(())) => {
            info!("Bridge stopped");
            ExitCode::SUCCESS
        }
        Ok(Err(e)) => {
            error!("Bridge error: {}", e);
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("Bridge task failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

use std::sync::Arc;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use warden::clock::SystemClock;
use warden::config::WardenConfig;
use warden::ratelimit::{Maintenance, MaintenanceSchedule, RateLimitCoordinator, RateLimitDecision};

/// Adaptive rate limiting with distributed/local failover.
///
/// Reads `identifier action` pairs from stdin and prints one JSON decision
/// per line.
#[derive(Parser, Debug)]
#[command(name = "warden", version, about)]
struct Args {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long)]
    config: Option<String>,

    /// Redis URL; enables the distributed backend
    #[arg(long)]
    redis_url: Option<String>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Serialize)]
struct DecisionLine<'a> {
    identifier: &'a str,
    action: &'a str,
    #[serde(flatten)]
    decision: RateLimitDecision,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    info!("Starting Warden");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => WardenConfig::from_file(path)?,
        None => WardenConfig::default(),
    };
    if let Some(url) = args.redis_url {
        config.redis.enabled = true;
        config.redis.url = url;
    }
    info!(
        redis_enabled = config.redis.enabled,
        requests_per_minute = config.limits.requests_per_minute,
        "Configuration loaded"
    );

    let coordinator =
        Arc::new(RateLimitCoordinator::initialize(&config, Arc::new(SystemClock)).await?);
    let maintenance = Maintenance::start(
        coordinator.clone(),
        MaintenanceSchedule::from(&config.maintenance),
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    info!("Input closed");
                    break;
                };
                let Some((identifier, action)) = parse_request(&line) else {
                    if !line.trim().is_empty() {
                        warn!(line = %line, "Expected `identifier action`, skipping");
                    }
                    continue;
                };

                let decision = coordinator.check_rate_limit(identifier, action).await;
                let output = DecisionLine { identifier, action, decision };
                println!("{}", serde_json::to_string(&output)?);
            }
            _ = &mut shutdown => break,
        }
    }

    maintenance.shutdown().await;
    info!(health = ?coordinator.health_state(), "Warden stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();
    let registry = tracing_subscriber::registry().with(filter);

    // stdout carries decisions
    match format {
        LogFormat::Text => registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(true)
                    .with_writer(std::io::stderr),
            )
            .init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }
}

/// Split an input line into identifier and action.
fn parse_request(line: &str) -> Option<(&str, &str)> {
    let mut parts = line.split_whitespace();
    let identifier = parts.next()?;
    let action = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    Some((identifier, action))
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
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
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}

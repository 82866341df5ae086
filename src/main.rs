//! admin-shield service.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client / proxy                ┌────────────────────────────────────────┐
//!     ─────────────────────────────▶│ http (axum)                            │
//!       POST /v1/inspect            │   defense_middleware / inspect handler │
//!       ANY  /v1/guard              └───────────────┬────────────────────────┘
//!                                                   ▼
//!                                   ┌────────────────────────────────────────┐
//!                                   │ DefenseStack                           │
//!                                   │  RateLimiter → AbuseDetector           │
//!                                   │        ↘            ↙                  │
//!                                   │      IncidentCoordinator → Sessions    │
//!                                   └────────────────────────────────────────┘
//!     Operator ── shield-cli ──────▶ /admin/* (bearer auth)
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;

use admin_shield::config::loader::{load_config, parse_config};
use admin_shield::http::AppState;
use admin_shield::lifecycle::{signals, sweeper, Shutdown};
use admin_shield::observability::{logging, metrics};
use admin_shield::{DefenseStack, HttpServer, SystemClock};

#[derive(Parser)]
#[command(name = "admin-shield")]
#[command(about = "Rate limiting, abuse detection and session revocation service", long_about = None)]
struct Args {
    /// Path to a TOML configuration file; defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => parse_config("")?,
    };

    logging::init_logging(&config.observability);
    tracing::info!("admin-shield v{} starting", env!("CARGO_PKG_VERSION"));

    if config.admin.disable_if_unkeyed() {
        tracing::error!("Admin API disabled: admin.api_key is unset or the placeholder");
    }

    tracing::info!(
        bind_address = %config.listener.bind_address,
        requests_per_minute = config.rate_limit.requests_per_minute,
        requests_per_hour = config.rate_limit.requests_per_hour,
        auto_block_threshold = config.incident.auto_block_threshold,
        session_timeout_minutes = config.session.timeout_minutes,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let stack = DefenseStack::from_config(&config, Arc::new(SystemClock))?;

    let shutdown = Shutdown::new();
    signals::spawn_signal_handler(shutdown.clone());

    let sweeper = config.sweeper.enabled.then(|| {
        sweeper::spawn_sweeper(
            stack.clone(),
            Duration::from_secs(config.sweeper.interval_secs),
            shutdown.subscribe(),
        )
    });

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let server = HttpServer::new(AppState::new(stack, config));
    server.run(listener, shutdown.subscribe()).await?;

    if let Some(handle) = sweeper {
        let _ = handle.await;
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

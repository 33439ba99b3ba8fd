//! Transfer Reaper
//!
//! Standalone process that expires unclaimed transfers in the SQLite store
//! until it receives Ctrl+C or SIGTERM.

use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use transfer_relay::config::Config;
use transfer_relay::db;
use transfer_relay::transfer::{ExpiryReaper, SqliteTransferRepository};
use transfer_relay::SystemClock;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "transfer_relay=debug,transfer_reaper=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();

    let config = load_config(|key| std::env::var(key).ok())?;

    tracing::info!("Starting Transfer Reaper v{}", env!("CARGO_PKG_VERSION"));

    let pool = db::create_pool(&config.database.url).await?;
    tracing::info!("Database initialized at {}", config.database.url);

    let repository = SqliteTransferRepository::new(pool.clone());

    // Packets are left to broker retention; this process has no broker client
    let reaper = ExpiryReaper::new(
        Arc::new(repository),
        Arc::new(SystemClock),
        config.reaper.interval(),
    );

    // One pass up front so a restart does not wait a full interval
    match reaper.sweep().await {
        Ok(report) => tracing::info!(
            examined = report.examined,
            expired = report.expired,
            "Startup sweep finished"
        ),
        Err(e) => tracing::warn!("Startup sweep failed: {}", e),
    }

    let handle = reaper.start();

    shutdown_signal().await;
    handle.shutdown().await;
    pool.close().await;

    tracing::info!("Transfer reaper shutdown complete");
    Ok(())
}

/// Unset keys take their defaults; a malformed value stops startup
fn load_config<F>(lookup: F) -> anyhow::Result<Config>
where
    F: Fn(&str) -> Option<String>,
{
    Config::from_lookup(lookup)
        .inspect_err(|e| tracing::error!("Failed to load config from env: {}", e))
        .context("invalid configuration")
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
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
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}

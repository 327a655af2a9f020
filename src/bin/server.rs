//! Position Guard Server
//!
//! Runs stop-loss / take-profit protection and serves the monitoring API.

use anyhow::{Context, Result};
use position_guard::api::{create_app, AppState};
use position_guard::services::BinanceClient;
use position_guard::{Config, Database, GuardCoordinator};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Default to info for this crate only. Override with RUST_LOG.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,position_guard=info,position_guard_server=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let config = Config::from_env()?;

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║       POSITION GUARD - STOP-LOSS / TAKE-PROFIT SERVER        ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Market stream: {:<44} ║", config.market_stream_url);
    println!("║  Exchange REST: {:<44} ║", config.exchange_rest_url);
    println!(
        "║  Order signing: {:<44} ║",
        if config.credentials_passphrase.is_some() { "ENABLED" } else { "DISABLED (no passphrase)" }
    );
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    if config.credentials_passphrase.is_none() {
        warn!("CREDENTIALS_PASSPHRASE not set; triggered closes will fail until it is configured");
    }

    let db = Arc::new(Database::new(&config.database_path).await?);
    let placer = Arc::new(BinanceClient::new(&config.exchange_rest_url)?);
    let guard = Arc::new(GuardCoordinator::new(db.clone(), placer, config.clone()));

    guard
        .initialize()
        .await
        .context("Failed to start position monitoring")?;

    let app = create_app(AppState {
        db,
        guard: guard.clone(),
    });

    let addr: SocketAddr = config
        .http_bind_addr
        .parse()
        .with_context(|| format!("Invalid HTTP_BIND_ADDR {:?}", config.http_bind_addr))?;
    let listener = TcpListener::bind(addr).await?;

    info!("Server listening on http://{}", addr);
    println!("  Stats:   http://{}/api/monitor/stats", addr);
    println!("  Status:  http://{}/api/monitor/status", addr);
    println!("  Health:  http://{}/health", addr);
    println!();

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Shutdown requested");
        })
        .await?;

    guard.shutdown().await;
    Ok(())
}

//! Stream relay gateway binary
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (lookup on 0.0.0.0:8080, relays on 6001..=7000)
//! cargo run -p remotemedia-stream-relay
//!
//! # With a config file
//! cargo run -p remotemedia-stream-relay -- --config relay.toml
//!
//! # With logging
//! RUST_LOG=debug cargo run -p remotemedia-stream-relay
//! ```
//!
//! Without a config file, `RELAY_*` environment variables override the
//! defaults (see `Config::from_env`).

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use remotemedia_stream_relay::{
    api::{build_router, AppState},
    config::Config,
    launcher::CommandLauncher,
    metadata::UsherClient,
    session::SessionCache,
};

/// RemoteMedia stream relay gateway
///
/// Resolves identifiers to local ports serving a transcoded relay of their stream.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting stream relay gateway...");

    // Load configuration
    let config = Arc::new(Config::load(args.config.as_ref()).context("loading configuration")?);

    tracing::info!(
        "Configuration: query port={}, relay ports={}+1..={}, refresh period={}min",
        config.server.query_port,
        config.ports.start_port,
        u32::from(config.ports.start_port) + u32::from(config.ports.max_ports),
        config.session.refresh_period_minutes
    );

    // Create session cache
    let provider = Arc::new(UsherClient::from_config(&config.upstream)?);
    let launcher = Arc::new(CommandLauncher::new(config.relay.clone()));
    let cache = Arc::new(SessionCache::from_config(&config, provider, launcher));

    // Create shutdown signal channel
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Spawn idle session sweep task
    let sweep_handle = {
        let cache = cache.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        let interval = config.session.sweep_interval();
        tokio::spawn(async move {
            cache.run_sweep_loop(interval, shutdown_rx).await;
        })
    };

    // Build HTTP router
    let router = build_router(AppState::new(cache.clone()));

    // Start HTTP server
    let bind_addr = format!("{}:{}", config.server.host, config.server.query_port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding {}", bind_addr))?;
    tracing::info!("HTTP server listening on {}", bind_addr);

    let shutdown_tx_clone = shutdown_tx.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received, initiating graceful shutdown...");
            let _ = shutdown_tx_clone.send(());
        })
        .await?;

    // Stop the sweep task, then every relay
    let _ = shutdown_tx.send(());
    let _ = sweep_handle.await;

    cache.shutdown(config.session.shutdown_grace()).await;

    tracing::info!("Stream relay gateway shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

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

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

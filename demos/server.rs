//! `revsyncd`: the sync protocol dispatcher as a standalone process.
//!
//! Configuration is loaded once at startup from the path named by
//! `REVSYNC_CONFIG` (default `./revsync.json`); see `revsync::config` for its
//! shape. Every configured repository is opened once, up front, so a bad
//! repository path fails fast at boot rather than on first request.
//!
//! ```bash
//! REVSYNC_CONFIG=./revsync.json REVSYNC_ADDR=0.0.0.0:4870 cargo run --bin revsyncd
//! ```

use std::{net::SocketAddr, path::PathBuf};

use revsync::{config::ServerConfig, protocol};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config_path =
        PathBuf::from(std::env::var("REVSYNC_CONFIG").unwrap_or_else(|_| "./revsync.json".to_string()));
    let config = ServerConfig::load(&config_path).unwrap_or_else(|e| {
        eprintln!("failed to load config from {}: {e}", config_path.display());
        std::process::exit(1);
    });

    let state = protocol::AppState::build(config).await.unwrap_or_else(|e| {
        eprintln!("failed to open configured repositories: {e}");
        std::process::exit(1);
    });

    let app = protocol::router(state);

    let addr: SocketAddr = std::env::var("REVSYNC_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:4870".to_string())
        .parse()
        .expect("REVSYNC_ADDR must be a valid socket address");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind {addr}: {e}"));

    tracing::info!(%addr, "revsyncd listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .expect("server error");
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
    tracing::info!("shutdown signal received");
}

//! Maze room server - authoritative multiplayer maze game server
//!
//! Serves game rooms over WebSocket and exposes health and room
//! listings over HTTP. Usually runs behind `maze-balancer`.

use tokio::net::TcpListener;
use tracing::info;

use maze_fleet::app::{init_tracing, shutdown_signal, AppState};
use maze_fleet::config::ServerConfig;
use maze_fleet::http::build_router;
use maze_fleet::util::time::init_server_time;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = ServerConfig::from_env()?;

    init_tracing(&config.log_level, config.log_json);
    init_server_time();

    info!("Starting maze room server");
    info!("Server address: {}", config.server_addr);

    let state = AppState::new(config.clone());

    // Spawn the empty-room sweeper
    let sweeper = tokio::spawn(state.rooms.clone().run_sweeper());

    let router = build_router(state);

    let listener = TcpListener::bind(config.server_addr).await?;
    let addr = listener.local_addr()?;

    info!("Server listening on {}", addr);
    info!("Health check: http://{}/health", addr);
    info!("WebSocket endpoint: ws://{}/ws", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();
    info!("Server shutdown complete");
    Ok(())
}

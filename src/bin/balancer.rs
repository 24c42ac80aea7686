//! Maze balancer - WebSocket front door for a pool of room servers
//!
//! Picks a backend per connection (sticky by room token, otherwise least
//! connections), bridges frames both ways and keeps failing backends out
//! of rotation with a circuit breaker. Optionally scales the pool.

use tokio::net::TcpListener;
use tracing::{info, warn};

use maze_fleet::app::{init_tracing, shutdown_signal, BalancerState};
use maze_fleet::balancer::{Autoscaler, BackendLauncher};
use maze_fleet::config::BalancerConfig;
use maze_fleet::http::build_balancer_router;
use maze_fleet::util::time::init_server_time;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = BalancerConfig::from_env()?;

    init_tracing(&config.log_level, config.log_json);
    init_server_time();

    info!("Starting maze balancer");
    info!(
        backends = config.backends.len(),
        capacity = config.pool.capacity,
        "Balancer address: {}", config.listen_addr
    );

    let state = BalancerState::new(config.clone());
    if state.pool.is_empty() && config.autoscale.is_none() {
        warn!("No backends configured; register some with POST /backends");
    }

    let autoscaler = config.autoscale.map(|policy| {
        let scaler = Autoscaler::new(
            state.pool.clone(),
            policy,
            BackendLauncher::new(config.launch.clone()),
        );
        tokio::spawn(scaler.run())
    });

    let pool = state.pool.clone();
    let shutdown = async move {
        shutdown_signal().await;
        // Cut proxied sessions so the server can drain
        pool.retire_all();
    };
    let router = build_balancer_router(state);

    let listener = TcpListener::bind(config.listen_addr).await?;
    let addr = listener.local_addr()?;

    info!("Balancer listening on {}", addr);
    info!("Backends: http://{}/backends", addr);
    info!("WebSocket endpoint: ws://{}/ws", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;

    // Dropping the autoscaler kills the processes it launched
    if let Some(handle) = autoscaler {
        handle.abort();
    }

    info!("Balancer shutdown complete");
    Ok(())
}

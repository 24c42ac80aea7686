//! Application state shared across routes

use std::sync::Arc;

use crate::balancer::BackendPool;
use crate::config::{BalancerConfig, ServerConfig};
use crate::rooms::RoomManager;

/// Room server state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub rooms: Arc<RoomManager>,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        let rooms = Arc::new(RoomManager::new(config.rooms));
        Self {
            config: Arc::new(config),
            rooms,
        }
    }
}

/// Balancer state
#[derive(Clone)]
pub struct BalancerState {
    pub config: Arc<BalancerConfig>,
    pub pool: Arc<BackendPool>,
}

impl BalancerState {
    pub fn new(config: BalancerConfig) -> Self {
        let pool = Arc::new(BackendPool::with_backends(
            config.pool,
            config.backends.iter().cloned(),
        ));
        Self {
            config: Arc::new(config),
            pool,
        }
    }
}

//! Maze Fleet - room-based multiplayer maze game servers and their load balancer
//!
//! Two binaries share this library:
//! - `maze-server` runs game rooms and serves clients over WebSocket
//! - `maze-balancer` spreads client connections over a pool of room servers

pub mod app;
pub mod balancer;
pub mod config;
pub mod game;
pub mod http;
pub mod rooms;
pub mod util;
pub mod ws;

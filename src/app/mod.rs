//! Shared state and process bootstrap for both binaries

pub mod runtime;
pub mod state;

pub use runtime::{init_tracing, shutdown_signal};
pub use state::{AppState, BalancerState};

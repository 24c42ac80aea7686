//! HTTP routers for the room server and the balancer

pub mod admin;
pub mod routes;

pub use admin::build_balancer_router;
pub use routes::{build_router, AppError};

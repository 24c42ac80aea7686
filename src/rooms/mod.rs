//! Room placement and lifecycle

pub mod manager;
pub mod token;

pub use manager::{
    Assignment, JoinRequest, ManagerStats, RoomError, RoomManager, RoomManagerConfig, RouteError,
};
pub use token::RoutingToken;

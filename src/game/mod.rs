//! Game simulation modules

pub mod ghost;
pub mod maze;
pub mod room;
pub mod snapshot;
pub mod task;

pub use room::{ConnectionId, Room, RoomFull, RoomPhase, MAX_PLAYERS};
pub use task::{RoomCommand, RoomHandle, RoomStatus, RoomTask};

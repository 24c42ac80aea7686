//! WebSocket protocol message definitions
//! These are the wire types for client-server communication

use serde::{Deserialize, Serialize};

use crate::game::ghost::{GhostMode, Personality};
use crate::game::maze::{Direction, Maze, TilePos};
use crate::game::room::RoomPhase;

/// Keys a client may press or release
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InputKey {
    Up,
    Down,
    Left,
    Right,
    /// Respawn after death, or start over after victory
    Restart,
}

impl InputKey {
    /// Movement direction for this key, if it is one
    pub fn direction(self) -> Option<Direction> {
        match self {
            InputKey::Up => Some(Direction::Up),
            InputKey::Down => Some(Direction::Down),
            InputKey::Left => Some(Direction::Left),
            InputKey::Right => Some(Direction::Right),
            InputKey::Restart => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyAction {
    Press,
    Release,
}

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMsg {
    /// Key press or release
    Input { key: InputKey, action: KeyAction },
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMsg {
    /// Sent once, right after the connection is placed in a room
    RoomAssignment { room_id: String, message: String },

    /// Full room state (sent every tick, coalesced per connection)
    State(StateSnapshot),

    /// Request rejected; the connection is closed after this
    Error { code: String, message: String },
}

impl ServerMsg {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        ServerMsg::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Complete state of one room
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub room_id: String,
    pub players: Vec<PlayerSnapshot>,
    pub ghosts: Vec<GhostSnapshot>,
    pub maze: Maze,
    pub game_stats: GameStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerSnapshot {
    pub id: String,
    pub name: String,
    pub x: f32,
    pub y: f32,
    pub direction: Option<Direction>,
    pub score: u32,
    /// Remaining power ticks (0 = not powered)
    pub power: u32,
    pub alive: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GhostSnapshot {
    pub personality: Personality,
    pub x: f32,
    pub y: f32,
    pub direction: Option<Direction>,
    pub mode: GhostMode,
    pub target: TilePos,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameStats {
    pub phase: RoomPhase,
    pub total_pellets: usize,
    pub alive_players: usize,
    pub total_players: usize,
    pub max_players: usize,
    pub victory: bool,
    pub game_tick: u64,
    /// Aggregate score of everyone who has played in this room
    pub score: u32,
    /// Longest power timer currently running
    pub power_remaining: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_input_message() {
        let msg: ClientMsg =
            serde_json::from_str(r#"{"type":"input","key":"UP","action":"press"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMsg::Input {
                key: InputKey::Up,
                action: KeyAction::Press
            }
        );
    }

    #[test]
    fn rejects_unknown_key_and_missing_type() {
        assert!(serde_json::from_str::<ClientMsg>(
            r#"{"type":"input","key":"JUMP","action":"press"}"#
        )
        .is_err());
        assert!(serde_json::from_str::<ClientMsg>(r#"{"key":"UP","action":"press"}"#).is_err());
        assert!(serde_json::from_str::<ClientMsg>("not json").is_err());
    }

    #[test]
    fn room_assignment_wire_shape() {
        let msg = ServerMsg::RoomAssignment {
            room_id: "ABCDEF".to_string(),
            message: "Assigned to room ABCDEF".to_string(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "room_assignment");
        assert_eq!(value["room_id"], "ABCDEF");
    }

    #[test]
    fn error_wire_shape() {
        let value = serde_json::to_value(ServerMsg::error("room_full", "Room is full")).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["code"], "room_full");
    }
}

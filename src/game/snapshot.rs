//! Snapshot building and encoding

use std::sync::Arc;

use crate::ws::protocol::{GameStats, GhostSnapshot, PlayerSnapshot, ServerMsg, StateSnapshot};

use super::room::{Room, RoomPhase, MAX_PLAYERS};

/// Builds full-state snapshots for network transmission.
///
/// A snapshot is encoded once per tick and the same `Arc<str>` is handed to every
/// connection in the room.
#[derive(Debug, Default)]
pub struct SnapshotBuilder {
    stats: SnapshotStats,
}

impl SnapshotBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture the current room state
    pub fn build(&self, room: &Room) -> StateSnapshot {
        let players = room
            .players()
            .iter()
            .map(|p| PlayerSnapshot {
                id: p.id.to_string(),
                name: format!("Player {}", p.slot + 1),
                x: p.motion.x,
                y: p.motion.y,
                direction: p.facing,
                score: p.score,
                power: p.power,
                alive: p.alive,
            })
            .collect();

        let ghosts = room
            .ghosts()
            .iter()
            .map(|g| GhostSnapshot {
                personality: g.personality,
                x: g.motion.x,
                y: g.motion.y,
                direction: g.motion.heading,
                mode: g.mode,
                target: g.target,
            })
            .collect();

        let game_stats = GameStats {
            phase: room.phase(),
            total_pellets: room.pellets_left(),
            alive_players: room.players().iter().filter(|p| p.alive).count(),
            total_players: room.player_count(),
            max_players: MAX_PLAYERS,
            victory: room.phase() == RoomPhase::Victory,
            game_tick: room.tick_count(),
            score: room.score(),
            power_remaining: room.players().iter().map(|p| p.power).max().unwrap_or(0),
        };

        StateSnapshot {
            room_id: room.id().to_string(),
            players,
            ghosts,
            maze: room.maze().clone(),
            game_stats,
        }
    }

    /// Build and serialize a `state` frame
    pub fn encode(&mut self, room: &Room) -> Result<Arc<str>, serde_json::Error> {
        let json = serde_json::to_string(&ServerMsg::State(self.build(room)))?;
        self.stats.record(room.player_count(), json.len());
        Ok(Arc::from(json))
    }

    pub fn stats(&self) -> &SnapshotStats {
        &self.stats
    }
}

/// Snapshot size stats for debugging
#[derive(Debug, Default, Clone)]
pub struct SnapshotStats {
    pub total_snapshots: u64,
    pub total_bytes: u64,
    pub avg_players_per_snapshot: f32,
}

impl SnapshotStats {
    pub fn record(&mut self, player_count: usize, bytes: usize) {
        self.total_snapshots += 1;
        self.total_bytes += bytes as u64;

        // Running average
        let n = self.total_snapshots as f32;
        self.avg_players_per_snapshot =
            self.avg_players_per_snapshot * ((n - 1.0) / n) + (player_count as f32 / n);
    }

    pub fn avg_bytes(&self) -> u64 {
        self.total_bytes.checked_div(self.total_snapshots).unwrap_or(0)
    }
}

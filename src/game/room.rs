//! Room state and the authoritative per-tick simulation

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::util::time::secs_to_ticks;
use crate::ws::protocol::{InputKey, KeyAction};

use super::ghost::{target_tile, Ghost, GhostMode, ModeSchedule, Personality, Quarry, TargetContext};
use super::maze::{Direction, GridMotion, Maze, Tile, TilePos, SPAWN_TILES};

/// Players per room
pub const MAX_PLAYERS: usize = 2;

/// Player speed in tiles per tick
pub const PLAYER_SPEED: f32 = 0.2;

/// How long a power pellet lasts
pub const POWER_TICKS: u32 = secs_to_ticks(10);

/// Delay before a caught player comes back
pub const RESPAWN_TICKS: u32 = secs_to_ticks(2);

pub const PELLET_POINTS: u32 = 10;
pub const POWER_PELLET_POINTS: u32 = 50;
pub const GHOST_POINTS: u32 = 200;

/// Player and ghost touch when their centers are closer than this
const COLLISION_DISTANCE: f32 = 0.8;

pub type ConnectionId = Uuid;

/// Room lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoomPhase {
    /// Nobody here; simulation paused
    Waiting,
    /// At least one player, ticking
    Active,
    /// Board cleared; frozen until someone presses RESTART
    Victory,
}

/// Returned by [`Room::join`] when both slots are taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("room is full")]
pub struct RoomFull;

/// Something notable that happened during a tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomEvent {
    PelletEaten { player: ConnectionId, power: bool },
    GhostEaten { player: ConnectionId, ghost: Personality },
    PlayerCaught { player: ConnectionId, ghost: Personality },
    Respawned { player: ConnectionId },
    Victory,
}

/// Player state (authoritative)
#[derive(Debug, Clone)]
pub struct Player {
    pub id: ConnectionId,
    pub slot: usize,
    pub motion: GridMotion,
    /// Last direction actually moved in
    pub facing: Option<Direction>,
    /// Held direction keys, oldest first
    held: Vec<Direction>,
    pub power: u32,
    pub alive: bool,
    pub respawn_in: u32,
    pub score: u32,
}

impl Player {
    fn new(id: ConnectionId, slot: usize) -> Self {
        Self {
            id,
            slot,
            motion: GridMotion::at(spawn_tile(slot)),
            facing: None,
            held: Vec::new(),
            power: 0,
            alive: true,
            respawn_in: 0,
            score: 0,
        }
    }

    /// Most recently pressed key still held
    pub fn desired(&self) -> Option<Direction> {
        self.held.last().copied()
    }

    fn press(&mut self, dir: Direction) {
        self.held.retain(|d| *d != dir);
        self.held.push(dir);
    }

    fn release(&mut self, dir: Direction) {
        self.held.retain(|d| *d != dir);
    }

    fn respawn(&mut self) {
        self.motion = GridMotion::at(spawn_tile(self.slot));
        self.facing = None;
        self.alive = true;
        self.respawn_in = 0;
        self.power = 0;
    }

    fn die(&mut self) {
        self.alive = false;
        self.respawn_in = RESPAWN_TICKS;
        self.power = 0;
        self.motion.heading = None;
    }
}

fn spawn_tile(slot: usize) -> TilePos {
    SPAWN_TILES[slot % SPAWN_TILES.len()]
}

/// One match: maze, up to two players and four ghosts.
///
/// Fully deterministic: the same maze and the same input sequence always produce
/// the same states, so dropping intermediate snapshots never loses information.
#[derive(Debug, Clone)]
pub struct Room {
    id: String,
    initial_maze: Maze,
    maze: Maze,
    pellets_left: usize,
    phase: RoomPhase,
    tick: u64,
    players: Vec<Player>,
    ghosts: Vec<Ghost>,
    schedule: ModeSchedule,
    score: u32,
}

impl Room {
    /// New room with a maze generated from `seed`
    pub fn new(id: impl Into<String>, seed: u64) -> Self {
        Self::with_maze(id, Maze::generate(seed))
    }

    pub fn with_maze(id: impl Into<String>, maze: Maze) -> Self {
        let ghosts = Personality::ALL
            .into_iter()
            .map(|p| Ghost::spawn(p, &maze))
            .collect();
        Self {
            id: id.into(),
            pellets_left: maze.pellets_remaining(),
            initial_maze: maze.clone(),
            maze,
            phase: RoomPhase::Waiting,
            tick: 0,
            players: Vec::with_capacity(MAX_PLAYERS),
            ghosts,
            schedule: ModeSchedule::default(),
            score: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn phase(&self) -> RoomPhase {
        self.phase
    }

    pub fn tick_count(&self) -> u64 {
        self.tick
    }

    pub fn score(&self) -> u32 {
        self.score
    }

    pub fn maze(&self) -> &Maze {
        &self.maze
    }

    pub fn pellets_left(&self) -> usize {
        self.pellets_left
    }

    pub fn players(&self) -> &[Player] {
        &self.players
    }

    pub fn ghosts(&self) -> &[Ghost] {
        &self.ghosts
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn is_full(&self) -> bool {
        self.players.len() >= MAX_PLAYERS
    }

    /// Seat a player in the first free slot. Joining twice returns the existing slot.
    pub fn join(&mut self, player: ConnectionId) -> Result<usize, RoomFull> {
        if let Some(existing) = self.players.iter().find(|p| p.id == player) {
            return Ok(existing.slot);
        }
        if self.is_full() {
            return Err(RoomFull);
        }

        let slot = (0..MAX_PLAYERS)
            .find(|s| self.players.iter().all(|p| p.slot != *s))
            .ok_or(RoomFull)?;
        self.players.push(Player::new(player, slot));
        self.players.sort_by_key(|p| p.slot);

        if self.phase == RoomPhase::Waiting {
            self.phase = RoomPhase::Active;
        }
        Ok(slot)
    }

    /// Remove a player. Returns false if they were not here.
    pub fn leave(&mut self, player: ConnectionId) -> bool {
        let before = self.players.len();
        self.players.retain(|p| p.id != player);
        let removed = self.players.len() != before;

        if self.players.is_empty() && self.phase == RoomPhase::Active {
            self.phase = RoomPhase::Waiting;
        }
        removed
    }

    /// Record a key press or release; takes effect on the next tick.
    /// Returns false for unknown players.
    pub fn handle_input(&mut self, player: ConnectionId, key: InputKey, action: KeyAction) -> bool {
        let Some(index) = self.players.iter().position(|p| p.id == player) else {
            return false;
        };

        match (key.direction(), action) {
            (Some(dir), KeyAction::Press) => self.players[index].press(dir),
            (Some(dir), KeyAction::Release) => self.players[index].release(dir),
            (None, KeyAction::Press) => self.restart(index),
            (None, KeyAction::Release) => {}
        }
        true
    }

    fn restart(&mut self, index: usize) {
        if self.phase == RoomPhase::Victory {
            self.reset();
        } else if !self.players[index].alive {
            self.players[index].respawn();
        }
    }

    /// Fresh board for everyone currently in the room
    fn reset(&mut self) {
        self.maze = self.initial_maze.clone();
        self.pellets_left = self.maze.pellets_remaining();
        self.ghosts = Personality::ALL
            .into_iter()
            .map(|p| Ghost::spawn(p, &self.maze))
            .collect();
        self.schedule = ModeSchedule::default();
        self.score = 0;
        for player in &mut self.players {
            player.respawn();
            player.score = 0;
            player.held.clear();
        }
        self.phase = if self.players.is_empty() {
            RoomPhase::Waiting
        } else {
            RoomPhase::Active
        };
    }

    /// Advance the simulation by exactly one step
    pub fn tick(&mut self) -> Vec<RoomEvent> {
        let mut events = Vec::new();
        if self.phase != RoomPhase::Active {
            return events;
        }
        self.tick += 1;

        self.update_timers(&mut events);
        self.move_players(&mut events);
        self.move_ghosts();
        self.resolve_collisions(&mut events);

        if self.pellets_left == 0 {
            self.phase = RoomPhase::Victory;
            events.push(RoomEvent::Victory);
        }
        events
    }

    fn update_timers(&mut self, events: &mut Vec<RoomEvent>) {
        for player in &mut self.players {
            player.power = player.power.saturating_sub(1);
            if !player.alive {
                player.respawn_in = player.respawn_in.saturating_sub(1);
                if player.respawn_in == 0 {
                    player.respawn();
                    events.push(RoomEvent::Respawned { player: player.id });
                }
            }
        }
    }

    fn move_players(&mut self, events: &mut Vec<RoomEvent>) {
        let maze = &mut self.maze;
        for player in self.players.iter_mut().filter(|p| p.alive) {
            let desired = player.desired();

            // Reversing is allowed mid-tile
            if let (Some(want), Some(heading)) = (desired, player.motion.heading) {
                if want == heading.reverse() {
                    player.motion.heading = Some(want);
                }
            }

            let grid: &Maze = maze;
            player.motion.advance(grid, PLAYER_SPEED, |here, heading| {
                let want = desired?;
                if grid.neighbor(here, want).is_some() {
                    Some(want)
                } else {
                    heading.filter(|h| grid.neighbor(here, *h).is_some())
                }
            });
            if player.motion.heading.is_some() {
                player.facing = player.motion.heading;
            }

            let points = match maze.consume(player.motion.tile()) {
                Some(Tile::PowerPellet) => {
                    player.power = POWER_TICKS;
                    POWER_PELLET_POINTS
                }
                Some(_) => PELLET_POINTS,
                None => continue,
            };
            self.pellets_left = self.pellets_left.saturating_sub(1);
            player.score += points;
            self.score += points;
            events.push(RoomEvent::PelletEaten {
                player: player.id,
                power: points == POWER_PELLET_POINTS,
            });
        }
    }

    fn move_ghosts(&mut self) {
        let frightened = self.players.iter().any(|p| p.alive && p.power > 0);
        let mode = self.schedule.advance(frightened);
        let blinky = self
            .ghosts
            .iter()
            .find(|g| g.personality == Personality::Blinky)
            .map(|g| g.tile())
            .unwrap_or_else(|| Personality::Blinky.scatter_corner());

        for ghost in &mut self.ghosts {
            let here = ghost.tile();
            let ctx = TargetContext {
                ghost: here,
                blinky,
                quarry: nearest_quarry(&self.players, here),
            };
            ghost.mode = mode;
            ghost.target = target_tile(ghost.personality, mode, &ctx);
            ghost.advance(&self.maze);
        }
    }

    fn resolve_collisions(&mut self, events: &mut Vec<RoomEvent>) {
        for player in self.players.iter_mut().filter(|p| p.alive) {
            for ghost in &mut self.ghosts {
                let dx = player.motion.x - ghost.motion.x;
                let dy = player.motion.y - ghost.motion.y;
                if (dx * dx + dy * dy).sqrt() >= COLLISION_DISTANCE {
                    continue;
                }

                if ghost.mode == GhostMode::Frightened {
                    ghost.send_home();
                    player.score += GHOST_POINTS;
                    self.score += GHOST_POINTS;
                    events.push(RoomEvent::GhostEaten {
                        player: player.id,
                        ghost: ghost.personality,
                    });
                } else {
                    player.die();
                    events.push(RoomEvent::PlayerCaught {
                        player: player.id,
                        ghost: ghost.personality,
                    });
                    break;
                }
            }
        }
    }
}

/// Closest living player to `from` (ties go to the lower slot)
fn nearest_quarry(players: &[Player], from: TilePos) -> Option<Quarry> {
    players
        .iter()
        .filter(|p| p.alive)
        .min_by_key(|p| p.motion.tile().distance_sq(from))
        .map(|p| Quarry {
            tile: p.motion.tile(),
            facing: p.facing,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::maze::{COLS, ROWS};

    /// Top corridor for players, a sealed pen in the middle for ghosts
    fn test_maze(pellets: &[(i32, i32, u8)]) -> Maze {
        let mut rows = vec![vec![1u8; COLS]; ROWS];
        for x in 1..COLS - 1 {
            rows[1][x] = 0;
        }
        for y in 8..=9 {
            for x in 7..=11 {
                rows[y][x] = 0;
            }
        }
        rows[13][17] = 0;
        for &(x, y, code) in pellets {
            rows[y as usize][x as usize] = code;
        }
        Maze::from_rows(&rows).unwrap()
    }

    fn room_with(pellets: &[(i32, i32, u8)]) -> (Room, ConnectionId) {
        let mut room = Room::with_maze("TEST", test_maze(pellets));
        let player = Uuid::new_v4();
        room.join(player).unwrap();
        (room, player)
    }

    #[test]
    fn join_caps_at_two_players() {
        let mut room = Room::new("R", 1);
        assert_eq!(room.phase(), RoomPhase::Waiting);

        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        assert_eq!(room.join(a), Ok(0));
        assert_eq!(room.phase(), RoomPhase::Active);
        assert_eq!(room.join(b), Ok(1));
        assert_eq!(room.join(c), Err(RoomFull));
        assert_eq!(room.join(a), Ok(0));

        assert!(room.leave(a));
        assert_eq!(room.join(c), Ok(0));
        assert_eq!(room.player_count(), 2);
    }

    #[test]
    fn empty_room_waits_and_does_not_tick() {
        let mut room = Room::new("R", 1);
        let id = Uuid::new_v4();
        room.join(id).unwrap();
        room.tick();
        assert_eq!(room.tick_count(), 1);

        room.leave(id);
        assert_eq!(room.phase(), RoomPhase::Waiting);
        assert!(room.tick().is_empty());
        assert_eq!(room.tick_count(), 1);
    }

    #[test]
    fn held_key_moves_player_and_eats_pellet() {
        let (mut room, player) = room_with(&[(2, 1, 2), (9, 1, 2)]);
        assert!(room.handle_input(player, InputKey::Right, KeyAction::Press));

        let mut events = Vec::new();
        for _ in 0..5 {
            events.extend(room.tick());
        }

        assert_eq!(room.players()[0].motion.tile(), TilePos::new(2, 1));
        assert_eq!(room.players()[0].facing, Some(Direction::Right));
        assert_eq!(room.players()[0].score, PELLET_POINTS);
        assert_eq!(room.score(), PELLET_POINTS);
        assert!(events.contains(&RoomEvent::PelletEaten {
            player,
            power: false
        }));
    }

    #[test]
    fn most_recent_key_wins() {
        let (mut room, player) = room_with(&[(9, 1, 2)]);
        room.handle_input(player, InputKey::Right, KeyAction::Press);
        room.handle_input(player, InputKey::Down, KeyAction::Press);
        assert_eq!(room.players()[0].desired(), Some(Direction::Down));
        room.handle_input(player, InputKey::Down, KeyAction::Release);
        assert_eq!(room.players()[0].desired(), Some(Direction::Right));
    }

    #[test]
    fn walls_stop_the_player() {
        let (mut room, player) = room_with(&[(9, 1, 2)]);
        room.handle_input(player, InputKey::Up, KeyAction::Press);
        for _ in 0..10 {
            room.tick();
        }
        assert_eq!(room.players()[0].motion.tile(), TilePos::new(1, 1));
        assert!(room.players()[0].motion.is_centered());
    }

    #[test]
    fn power_pellet_frightens_ghosts() {
        let (mut room, player) = room_with(&[(2, 1, 3), (9, 1, 2)]);
        room.handle_input(player, InputKey::Right, KeyAction::Press);
        for _ in 0..5 {
            room.tick();
        }
        assert_eq!(room.players()[0].score, POWER_PELLET_POINTS);
        assert!(room.players()[0].power > 0);

        room.tick();
        assert!(room.ghosts().iter().all(|g| g.mode == GhostMode::Frightened));
    }

    #[test]
    fn ghost_catches_player_who_respawns_later() {
        let (mut room, player) = room_with(&[(9, 1, 2)]);
        room.ghosts[0].motion = GridMotion::at(TilePos::new(1, 1));

        let events = room.tick();
        assert!(events.contains(&RoomEvent::PlayerCaught {
            player,
            ghost: Personality::Blinky
        }));
        assert!(!room.players()[0].alive);
        room.ghosts[0].send_home();

        for _ in 0..RESPAWN_TICKS - 1 {
            room.tick();
        }
        assert!(!room.players()[0].alive);
        room.tick();
        assert!(room.players()[0].alive);
        assert_eq!(room.players()[0].motion.tile(), SPAWN_TILES[0]);
    }

    #[test]
    fn restart_respawns_dead_player_immediately() {
        let (mut room, player) = room_with(&[(9, 1, 2)]);
        room.ghosts[0].motion = GridMotion::at(TilePos::new(1, 1));
        room.tick();
        assert!(!room.players()[0].alive);

        room.handle_input(player, InputKey::Restart, KeyAction::Press);
        assert!(room.players()[0].alive);
    }

    #[test]
    fn powered_player_eats_ghost() {
        let (mut room, player) = room_with(&[(9, 1, 2)]);
        room.players[0].power = 100;
        room.ghosts[1].motion = GridMotion::at(TilePos::new(1, 1));

        let events = room.tick();
        assert!(events.contains(&RoomEvent::GhostEaten {
            player,
            ghost: Personality::Pinky
        }));
        assert!(room.players()[0].alive);
        assert_eq!(room.score(), GHOST_POINTS);
        assert_eq!(room.ghosts()[1].tile(), room.ghosts()[1].home);
    }

    #[test]
    fn clearing_the_board_is_victory_until_restart() {
        let (mut room, player) = room_with(&[(2, 1, 2)]);
        room.handle_input(player, InputKey::Right, KeyAction::Press);
        let mut events = Vec::new();
        for _ in 0..5 {
            events.extend(room.tick());
        }
        assert!(events.contains(&RoomEvent::Victory));
        assert_eq!(room.phase(), RoomPhase::Victory);

        let frozen = room.tick_count();
        room.tick();
        assert_eq!(room.tick_count(), frozen);

        room.handle_input(player, InputKey::Restart, KeyAction::Press);
        assert_eq!(room.phase(), RoomPhase::Active);
        assert_eq!(room.pellets_left(), 1);
        assert_eq!(room.score(), 0);
        assert_eq!(room.players()[0].motion.tile(), SPAWN_TILES[0]);
    }

    #[test]
    fn input_from_stranger_is_ignored() {
        let (mut room, _) = room_with(&[(9, 1, 2)]);
        assert!(!room.handle_input(Uuid::new_v4(), InputKey::Left, KeyAction::Press));
    }

    #[test]
    fn same_inputs_give_same_states() {
        let a = Uuid::new_v4();
        let mut first = Room::new("D", 77);
        let mut second = Room::new("D", 77);
        first.join(a).unwrap();
        second.join(a).unwrap();

        let script = [
            (3, InputKey::Right),
            (20, InputKey::Down),
            (45, InputKey::Left),
            (80, InputKey::Up),
        ];
        for t in 0..200 {
            for (at, key) in script {
                if at == t {
                    first.handle_input(a, key, KeyAction::Press);
                    second.handle_input(a, key, KeyAction::Press);
                }
            }
            first.tick();
            second.tick();
        }

        assert_eq!(first.tick_count(), second.tick_count());
        assert_eq!(first.score(), second.score());
        assert_eq!(first.maze(), second.maze());
        assert_eq!(first.ghosts(), second.ghosts());
        assert_eq!(first.players()[0].motion, second.players()[0].motion);
    }
}

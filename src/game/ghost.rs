//! Ghost personalities, targeting and the scatter/chase schedule

use serde::{Deserialize, Serialize};

use crate::util::time::secs_to_ticks;

use super::maze::{Direction, GridMotion, Maze, TilePos, COLS, ROWS};

/// Ticks spent in scatter before switching to chase
pub const SCATTER_TICKS: u32 = secs_to_ticks(5);
/// Ticks spent in chase before switching back to scatter
pub const CHASE_TICKS: u32 = secs_to_ticks(7);

/// PINKY aims this many tiles ahead of the player
pub const PINKY_LOOKAHEAD: i32 = 4;
/// INKY's pivot point is this many tiles ahead of the player
pub const INKY_LOOKAHEAD: i32 = 2;
/// CLYDE chases only while farther than this (in tiles)
pub const CLYDE_SHY_DISTANCE: i32 = 8;

/// Ghost movement speeds in tiles per tick
pub const GHOST_SPEED: f32 = 0.18;
pub const FRIGHTENED_SPEED: f32 = 0.12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Personality {
    Blinky,
    Pinky,
    Inky,
    Clyde,
}

impl Personality {
    pub const ALL: [Personality; 4] = [
        Personality::Blinky,
        Personality::Pinky,
        Personality::Inky,
        Personality::Clyde,
    ];

    /// Corner this ghost retreats to in scatter mode
    pub fn scatter_corner(self) -> TilePos {
        let right = COLS as i32 - 2;
        let bottom = ROWS as i32 - 2;
        match self {
            Personality::Blinky => TilePos::new(right, 1),
            Personality::Pinky => TilePos::new(1, 1),
            Personality::Inky => TilePos::new(right, bottom),
            Personality::Clyde => TilePos::new(1, bottom),
        }
    }

    /// Preferred spawn near the middle of the maze
    fn spawn_hint(self) -> TilePos {
        match self {
            Personality::Blinky => TilePos::new(9, 7),
            Personality::Pinky => TilePos::new(8, 9),
            Personality::Inky => TilePos::new(10, 9),
            Personality::Clyde => TilePos::new(9, 8),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GhostMode {
    Scatter,
    Chase,
    Frightened,
}

/// Room-wide scatter/chase alternation. Paused while ghosts are frightened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeSchedule {
    mode: GhostMode,
    elapsed: u32,
}

impl Default for ModeSchedule {
    fn default() -> Self {
        Self {
            mode: GhostMode::Scatter,
            elapsed: 0,
        }
    }
}

impl ModeSchedule {
    /// Advance one tick and return the mode ghosts should use this tick
    pub fn advance(&mut self, frightened: bool) -> GhostMode {
        if frightened {
            return GhostMode::Frightened;
        }
        self.elapsed += 1;
        let limit = match self.mode {
            GhostMode::Chase => CHASE_TICKS,
            _ => SCATTER_TICKS,
        };
        if self.elapsed >= limit {
            self.mode = match self.mode {
                GhostMode::Chase => GhostMode::Scatter,
                _ => GhostMode::Chase,
            };
            self.elapsed = 0;
        }
        self.mode
    }

    pub fn mode(&self) -> GhostMode {
        self.mode
    }
}

/// The player a ghost is reacting to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quarry {
    pub tile: TilePos,
    pub facing: Option<Direction>,
}

/// Everything a personality needs to pick its target
#[derive(Debug, Clone, Copy)]
pub struct TargetContext {
    pub ghost: TilePos,
    pub blinky: TilePos,
    /// Nearest living player, if any
    pub quarry: Option<Quarry>,
}

/// Target tile for a ghost. Pure function of its personality, mode and surroundings.
pub fn target_tile(personality: Personality, mode: GhostMode, ctx: &TargetContext) -> TilePos {
    let Some(quarry) = ctx.quarry else {
        return personality.scatter_corner();
    };

    match mode {
        GhostMode::Scatter => personality.scatter_corner(),
        GhostMode::Frightened => {
            // Point on the far side of the ghost, away from the player
            TilePos::new(
                ctx.ghost.x + 2 * (ctx.ghost.x - quarry.tile.x),
                ctx.ghost.y + 2 * (ctx.ghost.y - quarry.tile.y),
            )
        }
        GhostMode::Chase => match personality {
            Personality::Blinky => quarry.tile,
            Personality::Pinky => ahead_of(quarry, PINKY_LOOKAHEAD),
            Personality::Inky => {
                let pivot = ahead_of(quarry, INKY_LOOKAHEAD);
                TilePos::new(
                    ctx.blinky.x + 2 * (pivot.x - ctx.blinky.x),
                    ctx.blinky.y + 2 * (pivot.y - ctx.blinky.y),
                )
            }
            Personality::Clyde => {
                let shy = CLYDE_SHY_DISTANCE * CLYDE_SHY_DISTANCE;
                if ctx.ghost.distance_sq(quarry.tile) > shy {
                    quarry.tile
                } else {
                    personality.scatter_corner()
                }
            }
        },
    }
}

fn ahead_of(quarry: Quarry, tiles: i32) -> TilePos {
    match quarry.facing {
        Some(facing) => quarry.tile.offset(facing, tiles),
        None => quarry.tile,
    }
}

/// Direction to leave `at` in, heading for `target`.
///
/// Picks the legal neighbor closest to the target (ties go to [`Direction::ALL`]
/// order). Reversing is only allowed when it is the sole way out.
pub fn choose_direction(
    maze: &Maze,
    at: TilePos,
    heading: Option<Direction>,
    target: TilePos,
) -> Option<Direction> {
    let reverse = heading.map(Direction::reverse);
    let best = |allow_reverse: bool| {
        maze.legal_directions(at)
            .filter(|&dir| allow_reverse || Some(dir) != reverse)
            .filter_map(|dir| maze.neighbor(at, dir).map(|next| (dir, next)))
            .min_by_key(|(_, next)| next.distance_sq(target))
            .map(|(dir, _)| dir)
    };
    best(false).or_else(|| best(true))
}

/// One of the four ghosts in a room
#[derive(Debug, Clone, PartialEq)]
pub struct Ghost {
    pub personality: Personality,
    pub motion: GridMotion,
    pub mode: GhostMode,
    pub target: TilePos,
    pub home: TilePos,
}

impl Ghost {
    /// Place a ghost on the walkable tile nearest its spawn hint
    pub fn spawn(personality: Personality, maze: &Maze) -> Self {
        let hint = personality.spawn_hint();
        let home = maze.nearest_walkable(hint, 6).unwrap_or(hint);
        Self {
            personality,
            motion: GridMotion::at(home),
            mode: GhostMode::Scatter,
            target: personality.scatter_corner(),
            home,
        }
    }

    pub fn tile(&self) -> TilePos {
        self.motion.tile()
    }

    /// Send the ghost back to its home tile (after being eaten)
    pub fn send_home(&mut self) {
        self.motion = GridMotion::at(self.home);
    }

    /// Move one tick toward the current target
    pub fn advance(&mut self, maze: &Maze) {
        let speed = match self.mode {
            GhostMode::Frightened => FRIGHTENED_SPEED,
            _ => GHOST_SPEED,
        };
        let target = self.target;
        self.motion.advance(maze, speed, |here, heading| {
            choose_direction(maze, here, heading, target)
        });
    }
}

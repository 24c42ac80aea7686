//! Maze grid, tile geometry and grid-locked movement

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// Grid width in tiles
pub const COLS: usize = 19;
/// Grid height in tiles
pub const ROWS: usize = 15;

/// Positions closer than this to a tile center count as on it
const CENTER_EPSILON: f32 = 1e-3;

/// Cardinal movement direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl Direction {
    /// Fixed preference order used to break distance ties
    pub const ALL: [Direction; 4] = [
        Direction::Up,
        Direction::Left,
        Direction::Down,
        Direction::Right,
    ];

    pub fn delta(self) -> (i32, i32) {
        match self {
            Direction::Up => (0, -1),
            Direction::Down => (0, 1),
            Direction::Left => (-1, 0),
            Direction::Right => (1, 0),
        }
    }

    pub fn reverse(self) -> Self {
        match self {
            Direction::Up => Direction::Down,
            Direction::Down => Direction::Up,
            Direction::Left => Direction::Right,
            Direction::Right => Direction::Left,
        }
    }

    pub fn is_horizontal(self) -> bool {
        matches!(self, Direction::Left | Direction::Right)
    }
}

/// Integer tile coordinate (x = column, y = row). May lie outside the grid when
/// used as a ghost target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TilePos {
    pub x: i32,
    pub y: i32,
}

impl TilePos {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Tile containing a continuous position
    pub fn containing(x: f32, y: f32) -> Self {
        Self::new(x.round() as i32, y.round() as i32)
    }

    pub fn offset(self, direction: Direction, tiles: i32) -> Self {
        let (dx, dy) = direction.delta();
        Self::new(self.x + dx * tiles, self.y + dy * tiles)
    }

    pub fn distance_sq(self, other: TilePos) -> i32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx * dx + dy * dy
    }

    pub fn center(self) -> (f32, f32) {
        (self.x as f32, self.y as f32)
    }
}

/// Maze cell contents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tile {
    Wall,
    Empty,
    Pellet,
    PowerPellet,
}

impl Tile {
    /// Wire encoding used in snapshots
    pub fn code(self) -> u8 {
        match self {
            Tile::Empty => 0,
            Tile::Wall => 1,
            Tile::Pellet => 2,
            Tile::PowerPellet => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Tile::Empty),
            1 => Some(Tile::Wall),
            2 => Some(Tile::Pellet),
            3 => Some(Tile::PowerPellet),
            _ => None,
        }
    }

    pub fn is_pellet(self) -> bool {
        matches!(self, Tile::Pellet | Tile::PowerPellet)
    }
}

/// Player spawn tiles, by slot
pub const SPAWN_TILES: [TilePos; 2] = [TilePos::new(1, 1), TilePos::new(17, 13)];

/// Power pellet locations (odd cells, always carved)
const POWER_PELLET_TILES: [TilePos; 4] = [
    TilePos::new(1, 3),
    TilePos::new(17, 3),
    TilePos::new(1, 11),
    TilePos::new(17, 11),
];

/// Row holding the wrap-around tunnel
pub const TUNNEL_ROW: i32 = (ROWS / 2) as i32;

/// Room maze grid (row-major)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Maze {
    tiles: Vec<Tile>,
}

impl Maze {
    /// Build a perfect maze from `seed`. The same seed always yields the same maze.
    ///
    /// Passages are carved between odd cells with an iterative depth-first walk, so
    /// every odd cell is reachable. Spawn tiles stay free of pellets, the middle row
    /// gets a wrap tunnel and four power pellets are placed near the corners.
    pub fn generate(seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut maze = Self {
            tiles: vec![Tile::Wall; ROWS * COLS],
        };

        let start = TilePos::new(
            rng.gen_range(0..COLS / 2) as i32 * 2 + 1,
            rng.gen_range(0..ROWS / 2) as i32 * 2 + 1,
        );
        maze.set(start, Tile::Empty);
        let mut stack = vec![start];

        while let Some(&cell) = stack.last() {
            let mut dirs = Direction::ALL;
            dirs.shuffle(&mut rng);

            let next = dirs.into_iter().find_map(|dir| {
                let target = cell.offset(dir, 2);
                let inside = target.x >= 1
                    && target.x < COLS as i32 - 1
                    && target.y >= 1
                    && target.y < ROWS as i32 - 1;
                (inside && maze.tile(target) == Tile::Wall).then_some((dir, target))
            });

            match next {
                Some((dir, target)) => {
                    maze.set(cell.offset(dir, 1), Tile::Empty);
                    maze.set(target, Tile::Empty);
                    stack.push(target);
                }
                None => {
                    stack.pop();
                }
            }
        }

        maze.set(TilePos::new(0, TUNNEL_ROW), Tile::Empty);
        maze.set(TilePos::new(COLS as i32 - 1, TUNNEL_ROW), Tile::Empty);

        for tile in maze.tiles.iter_mut() {
            if *tile == Tile::Empty {
                *tile = Tile::Pellet;
            }
        }
        for spawn in SPAWN_TILES {
            maze.set(spawn, Tile::Empty);
        }
        for power in POWER_PELLET_TILES {
            if maze.is_walkable(power) {
                maze.set(power, Tile::PowerPellet);
            }
        }

        maze
    }

    /// Build a maze from wire-encoded rows
    pub fn from_rows(rows: &[Vec<u8>]) -> Option<Self> {
        if rows.len() != ROWS || rows.iter().any(|r| r.len() != COLS) {
            return None;
        }
        let tiles = rows
            .iter()
            .flatten()
            .map(|&code| Tile::from_code(code))
            .collect::<Option<Vec<_>>>()?;
        Some(Self { tiles })
    }

    fn index(pos: TilePos) -> Option<usize> {
        let in_bounds = pos.x >= 0 && pos.y >= 0 && pos.x < COLS as i32 && pos.y < ROWS as i32;
        in_bounds.then(|| pos.y as usize * COLS + pos.x as usize)
    }

    /// Tile at `pos`; everything outside the grid is wall
    pub fn tile(&self, pos: TilePos) -> Tile {
        Self::index(pos).map_or(Tile::Wall, |i| self.tiles[i])
    }

    pub fn set(&mut self, pos: TilePos, tile: Tile) {
        if let Some(i) = Self::index(pos) {
            self.tiles[i] = tile;
        }
    }

    pub fn is_walkable(&self, pos: TilePos) -> bool {
        self.tile(pos) != Tile::Wall
    }

    /// The walkable tile reached by one step from `pos`, wrapping through the
    /// tunnel at the grid's left and right edges.
    pub fn neighbor(&self, pos: TilePos, direction: Direction) -> Option<TilePos> {
        let mut next = pos.offset(direction, 1);
        if next.x < 0 {
            next.x = COLS as i32 - 1;
        } else if next.x >= COLS as i32 {
            next.x = 0;
        }
        self.is_walkable(next).then_some(next)
    }

    /// Directions with a walkable neighbor, in [`Direction::ALL`] order
    pub fn legal_directions(&self, pos: TilePos) -> impl Iterator<Item = Direction> + '_ {
        Direction::ALL
            .into_iter()
            .filter(move |&dir| self.neighbor(pos, dir).is_some())
    }

    /// Remove and return the pellet at `pos`, if any
    pub fn consume(&mut self, pos: TilePos) -> Option<Tile> {
        let tile = self.tile(pos);
        if tile.is_pellet() {
            self.set(pos, Tile::Empty);
            Some(tile)
        } else {
            None
        }
    }

    pub fn pellets_remaining(&self) -> usize {
        self.tiles.iter().filter(|t| t.is_pellet()).count()
    }

    /// Closest walkable tile to `pos` within a square of `max_radius`
    pub fn nearest_walkable(&self, pos: TilePos, max_radius: i32) -> Option<TilePos> {
        if self.is_walkable(pos) {
            return Some(pos);
        }
        (1..=max_radius).find_map(|r| {
            let mut ring: Vec<TilePos> = (-r..=r)
                .flat_map(|dy| (-r..=r).map(move |dx| TilePos::new(pos.x + dx, pos.y + dy)))
                .filter(|p| self.is_walkable(*p))
                .collect();
            ring.sort_by_key(|p| (p.distance_sq(pos), p.y, p.x));
            ring.first().copied()
        })
    }

    pub fn rows(&self) -> impl Iterator<Item = &[Tile]> {
        self.tiles.chunks(COLS)
    }
}

impl Serialize for Maze {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let rows: Vec<Vec<u8>> = self
            .rows()
            .map(|row| row.iter().map(|t| t.code()).collect())
            .collect();
        rows.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Maze {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let rows = Vec::<Vec<u8>>::deserialize(deserializer)?;
        Maze::from_rows(&rows).ok_or_else(|| de::Error::custom("invalid maze grid"))
    }
}

fn at_center(v: f32) -> bool {
    (v - v.round()).abs() < CENTER_EPSILON
}

/// Distance along `direction` to the next tile center ahead of `v`
fn distance_to_next_center(v: f32, positive: bool) -> f32 {
    if at_center(v) {
        1.0
    } else if positive {
        v.ceil() - v
    } else {
        v - v.floor()
    }
}

/// Something that moves along the grid: a continuous position plus the direction
/// it is travelling in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridMotion {
    pub x: f32,
    pub y: f32,
    pub heading: Option<Direction>,
}

impl GridMotion {
    pub fn at(tile: TilePos) -> Self {
        let (x, y) = tile.center();
        Self {
            x,
            y,
            heading: None,
        }
    }

    pub fn tile(&self) -> TilePos {
        TilePos::containing(self.x, self.y)
    }

    pub fn is_centered(&self) -> bool {
        at_center(self.x) && at_center(self.y)
    }

    /// Advance up to `speed` tiles. At every tile center reached (including the
    /// starting one) `steer` picks the next heading; it must only return
    /// directions with a walkable neighbor. Returning `None` stops the mover on
    /// that center.
    pub fn advance(
        &mut self,
        maze: &Maze,
        speed: f32,
        mut steer: impl FnMut(TilePos, Option<Direction>) -> Option<Direction>,
    ) {
        let mut budget = speed;

        while budget > CENTER_EPSILON {
            if self.is_centered() {
                let here = self.tile();
                (self.x, self.y) = here.center();
                self.heading = steer(here, self.heading);

                let Some(dir) = self.heading else { break };
                let Some(next) = maze.neighbor(here, dir) else {
                    self.heading = None;
                    break;
                };

                // Tunnel: jump straight to the far edge
                if (next.x - here.x).abs() > 1 {
                    (self.x, self.y) = next.center();
                    budget -= 1.0;
                    continue;
                }
            }

            let Some(dir) = self.heading else { break };
            let (dx, dy) = dir.delta();
            let dist = if dir.is_horizontal() {
                distance_to_next_center(self.x, dx > 0)
            } else {
                distance_to_next_center(self.y, dy > 0)
            };
            let step = dist.min(budget);
            self.x += dx as f32 * step;
            self.y += dy as f32 * step;
            budget -= step;

            if step >= dist - CENTER_EPSILON {
                let tile = self.tile();
                (self.x, self.y) = tile.center();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 5x3 corridor surrounded by walls, embedded in a full-size grid
    fn corridor() -> Maze {
        let mut rows = vec![vec![1u8; COLS]; ROWS];
        for x in 1..6 {
            rows[1][x] = 0;
        }
        rows[2][3] = 0;
        Maze::from_rows(&rows).unwrap()
    }

    #[test]
    fn generation_is_seed_deterministic() {
        assert_eq!(Maze::generate(42), Maze::generate(42));
        assert_ne!(Maze::generate(42), Maze::generate(43));
    }

    #[test]
    fn generated_maze_has_open_spawns_and_tunnel() {
        let maze = Maze::generate(7);
        for spawn in SPAWN_TILES {
            assert_eq!(maze.tile(spawn), Tile::Empty);
        }
        assert!(maze.is_walkable(TilePos::new(0, TUNNEL_ROW)));
        assert_eq!(
            maze.neighbor(TilePos::new(0, TUNNEL_ROW), Direction::Left),
            Some(TilePos::new(COLS as i32 - 1, TUNNEL_ROW))
        );
        let powers = maze
            .rows()
            .flatten()
            .filter(|t| **t == Tile::PowerPellet)
            .count();
        assert_eq!(powers, 4);
        assert!(maze.pellets_remaining() > 40);
    }

    #[test]
    fn every_open_tile_is_reachable_from_spawn() {
        let maze = Maze::generate(99);
        let mut seen = std::collections::HashSet::new();
        let mut queue = std::collections::VecDeque::from([SPAWN_TILES[0]]);
        seen.insert(SPAWN_TILES[0]);
        while let Some(pos) = queue.pop_front() {
            for dir in maze.legal_directions(pos) {
                let next = maze.neighbor(pos, dir).unwrap();
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        let open = maze.rows().flatten().filter(|t| **t != Tile::Wall).count();
        assert_eq!(seen.len(), open);
    }

    #[test]
    fn consume_empties_pellet_once() {
        let mut maze = Maze::generate(1);
        let pellet = TilePos::new(1, 3);
        assert_eq!(maze.consume(pellet), Some(Tile::PowerPellet));
        assert_eq!(maze.consume(pellet), None);
    }

    #[test]
    fn motion_stops_at_walls() {
        let maze = corridor();
        let mut mover = GridMotion::at(TilePos::new(1, 1));

        for _ in 0..100 {
            mover.advance(&maze, 0.2, |here, _| {
                maze.neighbor(here, Direction::Right).map(|_| Direction::Right)
            });
            if mover.heading.is_none() {
                break;
            }
        }

        assert_eq!(mover.tile(), TilePos::new(5, 1));
        assert!(mover.is_centered());
    }

    #[test]
    fn motion_turns_only_at_centers() {
        let maze = corridor();
        let mut mover = GridMotion::at(TilePos::new(1, 1));
        let mut turned_at = None;

        for _ in 0..40 {
            mover.advance(&maze, 0.3, |here, heading| {
                if maze.neighbor(here, Direction::Down).is_some() {
                    turned_at = Some(here);
                    Some(Direction::Down)
                } else if heading == Some(Direction::Down) {
                    None
                } else {
                    Some(Direction::Right)
                }
            });
        }

        assert_eq!(turned_at, Some(TilePos::new(3, 1)));
        assert_eq!(mover.tile(), TilePos::new(3, 2));
    }

    #[test]
    fn maze_wire_round_trip_keeps_codes() {
        let maze = Maze::generate(5);
        let json = serde_json::to_value(&maze).unwrap();
        assert_eq!(json.as_array().unwrap().len(), ROWS);
        assert_eq!(json[1][1], 0);
        let back: Maze = serde_json::from_value(json).unwrap();
        assert_eq!(back, maze);
    }
}

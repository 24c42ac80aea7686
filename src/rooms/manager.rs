//! Room manager: places connections into rooms, routes their input and reclaims
//! rooms that stay empty

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info};
use uuid::Uuid;

use crate::game::{ConnectionId, Room, RoomCommand, RoomHandle, RoomPhase, RoomTask, MAX_PLAYERS};
use crate::util::coalesce::SnapshotPublisher;
use crate::util::rate_limit::{AdmissionLimits, InputAdmission};
use crate::ws::protocol::ClientMsg;

use super::token::RoutingToken;

/// How long an empty room is kept for players to come back
pub const DEFAULT_ROOM_GRACE: Duration = Duration::from_secs(30);

/// How often the sweeper looks for expired rooms
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Floor for the sweep period; `interval_at` rejects zero
const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
pub struct RoomManagerConfig {
    pub grace: Duration,
    pub sweep_interval: Duration,
    pub admission: AdmissionLimits,
}

impl Default for RoomManagerConfig {
    fn default() -> Self {
        Self {
            grace: DEFAULT_ROOM_GRACE,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            admission: AdmissionLimits::default(),
        }
    }
}

/// Why a connection could not be placed
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RoomError {
    #[error("Room is full")]
    RoomFull,

    #[error("Room not found")]
    RoomNotFound,

    #[error("Invalid room token")]
    InvalidToken,

    #[error("Room is shutting down")]
    RoomClosed,
}

impl RoomError {
    /// Wire code for error frames
    pub fn code(&self) -> &'static str {
        match self {
            RoomError::RoomFull => "room_full",
            RoomError::RoomNotFound => "room_not_found",
            RoomError::InvalidToken => "invalid_token",
            RoomError::RoomClosed => "room_closed",
        }
    }
}

/// Why an input did not reach its room
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("Input rate exceeded")]
    RateLimited,

    #[error("Connection is not in a room")]
    NotAssigned,

    #[error("Room is gone")]
    RoomClosed,

    #[error("Room input queue is full")]
    Backlogged,
}

/// Where a connection asked to go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinRequest {
    /// Any open public room
    Auto,
    /// A named room
    Token {
        token: String,
        create_if_missing: bool,
    },
    /// A brand-new named room with a generated token
    Create,
}

/// Result of a successful placement
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Assignment {
    pub room_id: String,
    pub instance: Uuid,
    pub created: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomKind {
    /// Filled by auto-assignment
    Auto,
    /// Only reachable by token
    Token,
}

struct RoomEntry {
    handle: RoomHandle,
    kind: RoomKind,
    members: HashSet<ConnectionId>,
    empty_since: Option<Instant>,
    seq: u64,
}

#[derive(Default)]
struct RoomTable {
    rooms: HashMap<String, RoomEntry>,
    next_seq: u64,
}

impl RoomTable {
    fn insert(&mut self, id: String, seed: u64, kind: RoomKind) -> &mut RoomEntry {
        let handle = RoomTask::spawn(Room::new(id.clone(), seed));
        let seq = self.next_seq;
        self.next_seq += 1;
        info!(room_id = %id, kind = ?kind, instance = %handle.instance, "Created room");
        self.rooms.entry(id).or_insert(RoomEntry {
            handle,
            kind,
            members: HashSet::new(),
            empty_since: None,
            seq,
        })
    }

    fn unused_id(&self) -> String {
        loop {
            let id = RoutingToken::generate().to_string();
            if !self.rooms.contains_key(&id) {
                return id;
            }
        }
    }
}

struct ConnectionRoute {
    room_id: String,
    instance: Uuid,
    commands: mpsc::Sender<RoomCommand>,
    admission: InputAdmission,
}

/// Summary of one room for the HTTP endpoints
#[derive(Debug, Clone, Serialize)]
pub struct RoomSummary {
    pub room_id: String,
    pub kind: RoomKind,
    pub players: usize,
    pub phase: RoomPhase,
    pub tick: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    pub rooms: usize,
    pub players: usize,
    pub connections: usize,
    pub details: Vec<RoomSummary>,
}

/// Per-process registry of rooms and connection routes
pub struct RoomManager {
    config: RoomManagerConfig,
    table: Mutex<RoomTable>,
    routes: DashMap<ConnectionId, ConnectionRoute>,
}

impl RoomManager {
    pub fn new(config: RoomManagerConfig) -> Self {
        Self {
            config,
            table: Mutex::new(RoomTable::default()),
            routes: DashMap::new(),
        }
    }

    pub fn config(&self) -> &RoomManagerConfig {
        &self.config
    }

    /// Place a connection according to its request
    pub async fn place(
        &self,
        connection: ConnectionId,
        request: JoinRequest,
        outbox: SnapshotPublisher<Arc<str>>,
    ) -> Result<Assignment, RoomError> {
        match request {
            JoinRequest::Auto => self.assign(connection, outbox).await,
            JoinRequest::Token {
                token,
                create_if_missing,
            } => {
                self.assign_token(connection, &token, create_if_missing, outbox)
                    .await
            }
            JoinRequest::Create => {
                let token = RoutingToken::generate();
                self.assign_token(connection, token.as_str(), true, outbox)
                    .await
            }
        }
    }

    /// Seat a connection in the oldest open public room, creating one if needed
    pub async fn assign(
        &self,
        connection: ConnectionId,
        outbox: SnapshotPublisher<Arc<str>>,
    ) -> Result<Assignment, RoomError> {
        let (assignment, commands) = {
            let mut table = self.table.lock();
            let open = table
                .rooms
                .iter()
                .filter(|(_, e)| {
                    e.kind == RoomKind::Auto
                        && e.members.len() < MAX_PLAYERS
                        && e.handle.status.phase() != RoomPhase::Victory
                })
                .min_by_key(|(_, e)| e.seq)
                .map(|(id, _)| id.clone());

            let (room_id, created) = match open {
                Some(id) => (id, false),
                None => {
                    let id = table.unused_id();
                    table.insert(id.clone(), rand::random(), RoomKind::Auto);
                    (id, true)
                }
            };
            let entry = table
                .rooms
                .get_mut(&room_id)
                .ok_or(RoomError::RoomClosed)?;
            Self::seat(entry, connection, created)
        };

        self.finish_join(connection, assignment, commands, outbox)
            .await
    }

    /// Seat a connection in the room named by `token`
    pub async fn assign_token(
        &self,
        connection: ConnectionId,
        token: &str,
        create_if_missing: bool,
        outbox: SnapshotPublisher<Arc<str>>,
    ) -> Result<Assignment, RoomError> {
        let token = RoutingToken::parse(token).map_err(|_| RoomError::InvalidToken)?;

        let (assignment, commands) = {
            let mut table = self.table.lock();
            let created = !table.rooms.contains_key(token.as_str());
            if created {
                if !create_if_missing {
                    return Err(RoomError::RoomNotFound);
                }
                table.insert(token.to_string(), token.seed(), RoomKind::Token);
            }
            let entry = table
                .rooms
                .get_mut(token.as_str())
                .ok_or(RoomError::RoomClosed)?;
            if entry.members.len() >= MAX_PLAYERS {
                return Err(RoomError::RoomFull);
            }
            Self::seat(entry, connection, created)
        };

        self.finish_join(connection, assignment, commands, outbox)
            .await
    }

    fn seat(
        entry: &mut RoomEntry,
        connection: ConnectionId,
        created: bool,
    ) -> (Assignment, mpsc::Sender<RoomCommand>) {
        entry.members.insert(connection);
        entry.empty_since = None;
        let assignment = Assignment {
            room_id: entry.handle.id.clone(),
            instance: entry.handle.instance,
            created,
        };
        (assignment, entry.handle.commands.clone())
    }

    async fn finish_join(
        &self,
        connection: ConnectionId,
        assignment: Assignment,
        commands: mpsc::Sender<RoomCommand>,
        outbox: SnapshotPublisher<Arc<str>>,
    ) -> Result<Assignment, RoomError> {
        if commands
            .send(RoomCommand::Join { connection, outbox })
            .await
            .is_err()
        {
            self.release_member(&assignment.room_id, assignment.instance, connection);
            return Err(RoomError::RoomClosed);
        }

        self.routes.insert(
            connection,
            ConnectionRoute {
                room_id: assignment.room_id.clone(),
                instance: assignment.instance,
                commands,
                admission: InputAdmission::new(self.config.admission),
            },
        );

        info!(
            connection = %connection,
            room_id = %assignment.room_id,
            created = assignment.created,
            "Connection assigned to room"
        );
        Ok(assignment)
    }

    /// Take a connection out of its room. If the room is left empty it is
    /// reclaimed once the grace period passes without anyone rejoining.
    pub async fn remove(self: &Arc<Self>, connection: ConnectionId) {
        let Some((_, route)) = self.routes.remove(&connection) else {
            return;
        };

        // Leave is queued before the slot is freed so a newcomer's Join lands after it
        let _ = route
            .commands
            .send(RoomCommand::Leave { connection })
            .await;

        if self.release_member(&route.room_id, route.instance, connection) {
            let manager = Arc::clone(self);
            let grace = self.config.grace;
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                manager.purge_expired();
            });
        }

        info!(connection = %connection, room_id = %route.room_id, "Connection removed from room");
    }

    /// Returns true if the room became empty
    fn release_member(&self, room_id: &str, instance: Uuid, connection: ConnectionId) -> bool {
        let mut table = self.table.lock();
        let Some(entry) = table.rooms.get_mut(room_id) else {
            return false;
        };
        if entry.handle.instance != instance || !entry.members.remove(&connection) {
            return false;
        }
        if entry.members.is_empty() {
            entry.empty_since = Some(Instant::now());
            debug!(room_id = %room_id, "Room is empty, grace period started");
            true
        } else {
            false
        }
    }

    /// Forward one client message to the connection's room, subject to admission
    pub fn route_input(&self, connection: ConnectionId, msg: ClientMsg) -> Result<(), RouteError> {
        let route = self
            .routes
            .get(&connection)
            .ok_or(RouteError::NotAssigned)?;

        if !route.admission.try_admit() {
            return Err(RouteError::RateLimited);
        }

        let ClientMsg::Input { key, action } = msg;
        route
            .commands
            .try_send(RoomCommand::Input {
                connection,
                key,
                action,
            })
            .map_err(|e| match e {
                TrySendError::Full(_) => RouteError::Backlogged,
                TrySendError::Closed(_) => RouteError::RoomClosed,
            })
    }

    /// Drop every room that has been empty for at least the grace period.
    /// Safe to call any number of times. Returns how many rooms were removed.
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    fn purge_expired_at(&self, now: Instant) -> usize {
        let grace = self.config.grace;
        let mut table = self.table.lock();
        let before = table.rooms.len();
        table.rooms.retain(|id, entry| {
            let expired = entry.members.is_empty()
                && entry
                    .empty_since
                    .is_some_and(|since| now.saturating_duration_since(since) >= grace);
            if expired {
                info!(room_id = %id, instance = %entry.handle.instance, "Reclaimed empty room");
            }
            !expired
        });
        before - table.rooms.len()
    }

    /// Periodic safety net behind the per-room cleanup timers
    pub async fn run_sweeper(self: Arc<Self>) {
        let period = self.config.sweep_interval.max(MIN_SWEEP_INTERVAL);
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            ticker.tick().await;
            let purged = self.purge_expired();
            if purged > 0 {
                info!(purged, "Room sweep finished");
            }
        }
    }

    /// Room a connection is currently routed to
    pub fn room_of(&self, connection: ConnectionId) -> Option<String> {
        self.routes.get(&connection).map(|r| r.room_id.clone())
    }

    /// Current instance of a room, if it exists
    pub fn instance_of(&self, room_id: &str) -> Option<Uuid> {
        self.table
            .lock()
            .rooms
            .get(room_id)
            .map(|e| e.handle.instance)
    }

    pub fn stats(&self) -> ManagerStats {
        let table = self.table.lock();
        let mut details: Vec<RoomSummary> = table
            .rooms
            .iter()
            .map(|(id, e)| RoomSummary {
                room_id: id.clone(),
                kind: e.kind,
                players: e.members.len(),
                phase: e.handle.status.phase(),
                tick: e.handle.status.tick(),
            })
            .collect();
        details.sort_by(|a, b| a.room_id.cmp(&b.room_id));

        ManagerStats {
            rooms: details.len(),
            players: details.iter().map(|d| d.players).sum(),
            connections: self.routes.len(),
            details,
        }
    }
}

impl Default for RoomManager {
    fn default() -> Self {
        Self::new(RoomManagerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::maze::{Direction, Maze, SPAWN_TILES};
    use crate::util::coalesce::slot;
    use crate::ws::protocol::{InputKey, KeyAction};
    use tokio_test::{assert_err, assert_ok};

    fn manager(grace_secs: u64) -> Arc<RoomManager> {
        Arc::new(RoomManager::new(RoomManagerConfig {
            grace: Duration::from_secs(grace_secs),
            sweep_interval: Duration::from_secs(60),
            admission: AdmissionLimits { rps: 10, burst: 5 },
        }))
    }

    fn outbox() -> SnapshotPublisher<Arc<str>> {
        // The subscriber is dropped; the room prunes the outbox on first publish
        slot().0
    }

    fn press() -> ClientMsg {
        ClientMsg::Input {
            key: InputKey::Up,
            action: KeyAction::Press,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn auto_assignment_pairs_players() {
        let rooms = manager(30);
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        let first = rooms.assign(a, outbox()).await.unwrap();
        let second = rooms.assign(b, outbox()).await.unwrap();
        let third = rooms.assign(c, outbox()).await.unwrap();

        assert!(first.created);
        assert_eq!(first.room_id, second.room_id);
        assert!(!second.created);
        assert_ne!(third.room_id, first.room_id);
        assert_eq!(rooms.stats().rooms, 2);
        assert_eq!(rooms.stats().players, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn token_room_holds_two_then_rejects() {
        let rooms = manager(30);
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        let created = assert_ok!(rooms.assign_token(a, "ABCDEF", true, outbox()).await);
        assert_eq!(created.room_id, "ABCDEF");
        assert!(created.created);

        let joined = assert_ok!(rooms.assign_token(b, "ABCDEF", false, outbox()).await);
        assert_eq!(joined.instance, created.instance);

        let full = assert_err!(rooms.assign_token(c, "ABCDEF", false, outbox()).await);
        assert_eq!(full, RoomError::RoomFull);
    }

    #[tokio::test(start_paused = true)]
    async fn token_errors() {
        let rooms = manager(30);
        let a = Uuid::new_v4();
        assert_eq!(
            rooms.assign_token(a, "NOPE", false, outbox()).await,
            Err(RoomError::RoomNotFound)
        );
        assert_eq!(
            rooms.assign_token(a, "bad token!", true, outbox()).await,
            Err(RoomError::InvalidToken)
        );
        assert_eq!(rooms.stats().rooms, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn token_rooms_are_not_auto_filled() {
        let rooms = manager(30);
        let token_room = rooms
            .assign_token(Uuid::new_v4(), "PRIVATE", true, outbox())
            .await
            .unwrap();
        let auto = rooms.assign(Uuid::new_v4(), outbox()).await.unwrap();
        assert_ne!(auto.room_id, token_room.room_id);
    }

    #[tokio::test(start_paused = true)]
    async fn create_without_token_mints_one() {
        let rooms = manager(30);
        let placed = rooms
            .place(Uuid::new_v4(), JoinRequest::Create, outbox())
            .await
            .unwrap();
        assert!(placed.created);
        assert!(RoutingToken::parse(&placed.room_id).is_ok());

        let friend = rooms
            .place(
                Uuid::new_v4(),
                JoinRequest::Token {
                    token: placed.room_id.clone(),
                    create_if_missing: false,
                },
                outbox(),
            )
            .await
            .unwrap();
        assert_eq!(friend.instance, placed.instance);
    }

    fn state_of(frame: &str) -> (serde_json::Value, u64) {
        let value: serde_json::Value = serde_json::from_str(frame).unwrap();
        assert_eq!(value["type"], "state");
        let score = value["game_stats"]["score"].as_u64().unwrap();
        (value["maze"].clone(), score)
    }

    #[tokio::test(start_paused = true)]
    async fn rejoin_within_grace_keeps_instance() {
        let rooms = manager(30);
        let a = Uuid::new_v4();
        let (tx, mut rx) = slot();
        let first = rooms.assign_token(a, "BACK", true, tx).await.unwrap();

        // Walk out of the spawn corner so some pellets get eaten
        let maze = Maze::generate(RoutingToken::parse("BACK").unwrap().seed());
        let key = match maze.legal_directions(SPAWN_TILES[0]).next().unwrap() {
            Direction::Up => InputKey::Up,
            Direction::Down => InputKey::Down,
            Direction::Left => InputKey::Left,
            Direction::Right => InputKey::Right,
        };
        rooms
            .route_input(
                a,
                ClientMsg::Input {
                    key,
                    action: KeyAction::Press,
                },
            )
            .unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        let (maze_before, score_before) = state_of(&rx.next().await.unwrap());
        assert!(score_before > 0);
        rooms.remove(a).await;

        tokio::time::sleep(Duration::from_secs(10)).await;
        let b = Uuid::new_v4();
        let (tx, mut rx) = slot();
        let again = rooms.assign_token(b, "BACK", false, tx).await.unwrap();
        assert_eq!(again.instance, first.instance);
        assert!(!again.created);

        // Same room, same progress
        let (maze_after, score_after) = state_of(&rx.next().await.unwrap());
        assert_eq!(maze_after, maze_before);
        assert_eq!(score_after, score_before);

        // The first cleanup timer must not reclaim the now-occupied room
        tokio::time::sleep(Duration::from_secs(40)).await;
        assert_eq!(rooms.instance_of("BACK"), Some(first.instance));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_room_reclaimed_after_grace() {
        let rooms = manager(30);
        let a = Uuid::new_v4();
        let first = rooms.assign_token(a, "GONE", true, outbox()).await.unwrap();
        rooms.remove(a).await;

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(rooms.instance_of("GONE"), None);
        assert_eq!(rooms.purge_expired(), 0);

        let again = rooms
            .assign_token(Uuid::new_v4(), "GONE", true, outbox())
            .await
            .unwrap();
        assert!(again.created);
        assert_ne!(again.instance, first.instance);
    }

    #[tokio::test(start_paused = true)]
    async fn purge_is_idempotent() {
        let rooms = manager(5);
        let a = Uuid::new_v4();
        rooms.assign(a, outbox()).await.unwrap();
        rooms.remove(a).await;
        rooms.remove(a).await;

        let later = Instant::now() + Duration::from_secs(6);
        assert_eq!(rooms.purge_expired_at(later), 1);
        assert_eq!(rooms.purge_expired_at(later), 0);
        assert_eq!(rooms.purge_expired(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_inputs_is_admitted_up_to_bucket() {
        let rooms = manager(30);
        let a = Uuid::new_v4();
        rooms.assign(a, outbox()).await.unwrap();

        let results: Vec<_> = (0..100).map(|_| rooms.route_input(a, press())).collect();
        let admitted = results.iter().filter(|r| r.is_ok()).count();
        let limited = results
            .iter()
            .filter(|r| **r == Err(RouteError::RateLimited))
            .count();

        assert_eq!(admitted, 5);
        assert_eq!(limited, 95);
        // Still routed after being throttled
        assert!(rooms.room_of(a).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_survives_zero_interval() {
        let rooms = Arc::new(RoomManager::new(RoomManagerConfig {
            sweep_interval: Duration::ZERO,
            ..RoomManagerConfig::default()
        }));

        let sweeper = tokio::spawn(rooms.clone().run_sweeper());
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert!(!sweeper.is_finished());
        sweeper.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn input_without_room_is_rejected() {
        let rooms = manager(30);
        assert_eq!(
            rooms.route_input(Uuid::new_v4(), press()),
            Err(RouteError::NotAssigned)
        );
    }
}

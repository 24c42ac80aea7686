//! Per-room task: owns a [`Room`] and drives it at the simulation rate

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::util::coalesce::SnapshotPublisher;
use crate::util::time::tick_duration;
use crate::ws::protocol::{InputKey, KeyAction};

use super::room::{ConnectionId, Room, RoomEvent, RoomPhase};
use super::snapshot::SnapshotBuilder;

/// Bound on queued commands per room
pub const ROOM_COMMAND_CAPACITY: usize = 256;

/// Messages from connections to their room
#[derive(Debug)]
pub enum RoomCommand {
    Join {
        connection: ConnectionId,
        outbox: SnapshotPublisher<Arc<str>>,
    },
    Leave {
        connection: ConnectionId,
    },
    Input {
        connection: ConnectionId,
        key: InputKey,
        action: KeyAction,
    },
}

/// Live counters published by the room task for the outside world
#[derive(Debug, Default)]
pub struct RoomStatus {
    phase: AtomicU8,
    tick: AtomicU64,
    players: AtomicUsize,
}

impl RoomStatus {
    fn update(&self, room: &Room) {
        let phase = match room.phase() {
            RoomPhase::Waiting => 0,
            RoomPhase::Active => 1,
            RoomPhase::Victory => 2,
        };
        self.phase.store(phase, Ordering::Relaxed);
        self.tick.store(room.tick_count(), Ordering::Relaxed);
        self.players.store(room.player_count(), Ordering::Relaxed);
    }

    pub fn phase(&self) -> RoomPhase {
        match self.phase.load(Ordering::Relaxed) {
            1 => RoomPhase::Active,
            2 => RoomPhase::Victory,
            _ => RoomPhase::Waiting,
        }
    }

    pub fn tick(&self) -> u64 {
        self.tick.load(Ordering::Relaxed)
    }

    pub fn players(&self) -> usize {
        self.players.load(Ordering::Relaxed)
    }
}

/// Handle to a running room
#[derive(Debug, Clone)]
pub struct RoomHandle {
    pub id: String,
    /// Distinguishes this room from a later one created under the same id
    pub instance: Uuid,
    pub commands: mpsc::Sender<RoomCommand>,
    pub status: Arc<RoomStatus>,
}

/// The authoritative room loop
pub struct RoomTask {
    room: Room,
    instance: Uuid,
    commands: mpsc::Receiver<RoomCommand>,
    outboxes: HashMap<ConnectionId, SnapshotPublisher<Arc<str>>>,
    snapshots: SnapshotBuilder,
    status: Arc<RoomStatus>,
}

impl RoomTask {
    pub fn new(room: Room) -> (Self, RoomHandle) {
        let (tx, rx) = mpsc::channel(ROOM_COMMAND_CAPACITY);
        let status = Arc::new(RoomStatus::default());
        status.update(&room);
        let instance = Uuid::new_v4();

        let handle = RoomHandle {
            id: room.id().to_string(),
            instance,
            commands: tx,
            status: status.clone(),
        };
        let task = Self {
            room,
            instance,
            commands: rx,
            outboxes: HashMap::new(),
            snapshots: SnapshotBuilder::new(),
            status,
        };
        (task, handle)
    }

    /// Create a room and start its loop on the runtime
    pub fn spawn(room: Room) -> RoomHandle {
        let (task, handle) = Self::new(room);
        tokio::spawn(task.run());
        handle
    }

    /// Run until every command sender is gone
    pub async fn run(mut self) {
        info!(room_id = %self.room.id(), instance = %self.instance, "Room started");

        let mut ticker = interval(tick_duration());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;

            if !self.process_commands() {
                break;
            }

            for event in self.room.tick() {
                self.log_event(&event);
            }
            self.status.update(&self.room);
            self.broadcast();
        }

        info!(
            room_id = %self.room.id(),
            instance = %self.instance,
            ticks = self.room.tick_count(),
            avg_snapshot_bytes = self.snapshots.stats().avg_bytes(),
            "Room stopped"
        );
    }

    /// Drain queued commands. Returns false once the channel is closed.
    fn process_commands(&mut self) -> bool {
        loop {
            match self.commands.try_recv() {
                Ok(RoomCommand::Join { connection, outbox }) => {
                    match self.room.join(connection) {
                        Ok(slot) => {
                            self.outboxes.insert(connection, outbox);
                            debug!(room_id = %self.room.id(), connection = %connection, slot, "Player seated");
                        }
                        Err(err) => {
                            warn!(room_id = %self.room.id(), connection = %connection, "Join rejected: {}", err);
                        }
                    }
                }
                Ok(RoomCommand::Leave { connection }) => {
                    self.outboxes.remove(&connection);
                    if self.room.leave(connection) {
                        debug!(room_id = %self.room.id(), connection = %connection, "Player left");
                    }
                }
                Ok(RoomCommand::Input {
                    connection,
                    key,
                    action,
                }) => {
                    self.room.handle_input(connection, key, action);
                }
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }

    fn broadcast(&mut self) {
        if self.outboxes.is_empty() {
            return;
        }

        let frame = match self.snapshots.encode(&self.room) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(room_id = %self.room.id(), "Failed to encode snapshot: {}", e);
                return;
            }
        };

        // Writers that have gone away are pruned here
        self.outboxes
            .retain(|_, outbox| outbox.publish(frame.clone()));
    }

    fn log_event(&self, event: &RoomEvent) {
        match event {
            RoomEvent::Victory => {
                info!(room_id = %self.room.id(), score = self.room.score(), "Board cleared");
            }
            RoomEvent::PlayerCaught { player, ghost } => {
                debug!(room_id = %self.room.id(), connection = %player, ghost = ?ghost, "Player caught");
            }
            RoomEvent::GhostEaten { player, ghost } => {
                debug!(room_id = %self.room.id(), connection = %player, ghost = ?ghost, "Ghost eaten");
            }
            RoomEvent::PelletEaten { .. } | RoomEvent::Respawned { .. } => {}
        }
    }
}

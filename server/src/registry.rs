//! Room registry: the process-wide directory of rooms and players.
//!
//! This module owns the three structures the rest of the server routes
//! through:
//! - the room map (always containing the main room, created at startup with
//!   a generated code),
//! - the player→room index giving O(1) player lookup,
//! - the background sweepers that reclaim idle rooms and expired players.
//!
//! Locking discipline: registry lock, then player-index lock, then a room's
//! lock; no path acquires in the reverse order. Room mutations commit before
//! index mutations, and readers that catch the index pointing at a room that
//! no longer holds the player treat the room as truth and repair the index.

use crate::player::{Player, PlayerSnapshot};
use log::{debug, info, warn};
use rand::Rng;
use serde::Serialize;
use shared::{
    CLEANUP_INTERVAL, INACTIVE_ROOM_TIMEOUT, MAX_PLAYERS_PER_ROOM, MAX_ROOM_ID_LEN,
    PLAYER_SWEEP_INTERVAL, ROOM_CODE_CHARS, ROOM_CODE_LENGTH,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;

/// Errors surfaced by admission and join-path validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The literal message is part of the HTTP contract; existing clients
    /// match on it.
    #[error("room {0} is full")]
    RoomFull(String),
    #[error("invalid room id")]
    InvalidRoomId,
    #[error("room {0} not found")]
    RoomNotFound(String),
}

/// A named bounded set of players sharing one broadcast domain.
#[derive(Debug)]
pub struct Room {
    pub id: String,
    pub created_at: Instant,
    state: RwLock<RoomState>,
}

#[derive(Debug)]
struct RoomState {
    players: HashMap<String, Arc<Player>>,
    last_activity: Instant,
}

impl Room {
    fn new(id: impl Into<String>) -> Self {
        let now = Instant::now();
        Self {
            id: id.into(),
            created_at: now,
            state: RwLock::new(RoomState {
                players: HashMap::new(),
                last_activity: now,
            }),
        }
    }

    pub async fn player_count(&self) -> usize {
        self.state.read().await.players.len()
    }

    pub async fn contains(&self, player_id: &str) -> bool {
        self.state.read().await.players.contains_key(player_id)
    }

    pub async fn get(&self, player_id: &str) -> Option<Arc<Player>> {
        self.state.read().await.players.get(player_id).cloned()
    }

    /// Member ids other than `exclude`, snapshotted under the read lock.
    pub async fn member_ids_excluding(&self, exclude: &str) -> Vec<String> {
        self.state
            .read()
            .await
            .players
            .keys()
            .filter(|id| id.as_str() != exclude)
            .cloned()
            .collect()
    }

    /// Copies of every member's state, taken without nesting player locks
    /// inside the room lock.
    pub async fn snapshot_players(&self) -> Vec<PlayerSnapshot> {
        let members: Vec<Arc<Player>> =
            self.state.read().await.players.values().cloned().collect();
        let mut snapshots = Vec::with_capacity(members.len());
        for player in members {
            snapshots.push(player.snapshot().await);
        }
        snapshots
    }

    /// Advances the activity timestamp.
    pub async fn touch(&self) {
        self.state.write().await.last_activity = Instant::now();
    }

    async fn is_reclaimable(&self) -> bool {
        let state = self.state.read().await;
        state.players.is_empty() && state.last_activity.elapsed() > INACTIVE_ROOM_TIMEOUT
    }

    #[cfg(test)]
    pub(crate) async fn set_last_activity(&self, at: Instant) {
        self.state.write().await.last_activity = at;
    }
}

/// Counters reported by [`RoomRegistry::manager_stats`].
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    pub total_rooms_created: u64,
    pub total_players_served: u64,
    pub current_active_rooms: usize,
    pub current_active_players: usize,
    pub cleanup_operations: u64,
}

#[derive(Debug, Default)]
struct StatsCounters {
    rooms_created: u64,
    players_served: u64,
    cleanup_operations: u64,
}

/// Process-wide directory of rooms, plus the cleanup scheduler.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    main_room_id: String,
    player_to_room: RwLock<HashMap<String, String>>,
    stats: Mutex<StatsCounters>,
    shutdown_tx: watch::Sender<bool>,
    sweepers: Mutex<Vec<JoinHandle<()>>>,
}

/// Draws a room code from `[A-Z0-9]`. The generator is seeded once by the
/// OS, not per call.
fn generate_room_code() -> String {
    let mut rng = rand::thread_rng();
    (0..ROOM_CODE_LENGTH)
        .map(|_| ROOM_CODE_CHARS[rng.gen_range(0..ROOM_CODE_CHARS.len())] as char)
        .collect()
}

impl RoomRegistry {
    /// Creates the registry with its main room. Sweepers are not running
    /// until [`start_sweepers`](Self::start_sweepers) is called.
    pub fn new() -> Arc<Self> {
        let main_room_id = generate_room_code();
        let main_room = Arc::new(Room::new(main_room_id.clone()));
        let mut rooms = HashMap::new();
        rooms.insert(main_room_id.clone(), main_room);

        let (shutdown_tx, _) = watch::channel(false);
        info!("Room registry initialized with main room: {}", main_room_id);

        Arc::new(Self {
            rooms: RwLock::new(rooms),
            main_room_id,
            player_to_room: RwLock::new(HashMap::new()),
            stats: Mutex::new(StatsCounters::default()),
            shutdown_tx,
            sweepers: Mutex::new(Vec::new()),
        })
    }

    pub fn main_room_id(&self) -> &str {
        &self.main_room_id
    }

    pub async fn main_room(&self) -> Arc<Room> {
        self.rooms
            .read()
            .await
            .get(&self.main_room_id)
            .cloned()
            .expect("main room is never destroyed")
    }

    async fn room_by_id(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    async fn indexed_room_id(&self, player_id: &str) -> Option<String> {
        self.player_to_room.read().await.get(player_id).cloned()
    }

    async fn drop_index_entry(&self, player_id: &str) {
        self.player_to_room.write().await.remove(player_id);
    }

    /// Admits `player_id` into the main room. Re-admission to the main room
    /// is a no-op returning the room unchanged; a player resident elsewhere
    /// is moved.
    pub async fn add_player(&self, player_id: &str) -> Result<Arc<Room>, RegistryError> {
        if let Some(current) = self.indexed_room_id(player_id).await {
            if current == self.main_room_id {
                debug!("Player {} already in main room", player_id);
                return Ok(self.main_room().await);
            }
            self.remove_player(player_id).await;
        }
        self.admit(player_id, &self.main_room_id).await
    }

    /// Admits `player_id` into `room_id`, creating the room on first join.
    pub async fn add_player_to_room(
        &self,
        player_id: &str,
        room_id: &str,
    ) -> Result<Arc<Room>, RegistryError> {
        if room_id.is_empty() || room_id.len() > MAX_ROOM_ID_LEN {
            return Err(RegistryError::InvalidRoomId);
        }

        match self.indexed_room_id(player_id).await {
            Some(current) if current == room_id => {
                debug!("Player {} already in room {}", player_id, room_id);
                if let Some(room) = self.room_by_id(room_id).await {
                    return Ok(room);
                }
                // Index pointed at a vanished room; fall through and rebuild.
                self.drop_index_entry(player_id).await;
            }
            Some(_) => self.remove_player(player_id).await,
            None => {}
        }

        // Create the room if it does not exist yet.
        {
            let mut rooms = self.rooms.write().await;
            if !rooms.contains_key(room_id) {
                info!("Creating room {} on first join", room_id);
                rooms.insert(room_id.to_string(), Arc::new(Room::new(room_id)));
                self.stats.lock().await.rooms_created += 1;
            }
        }

        self.admit(player_id, room_id).await
    }

    /// Inserts a fresh player record into an existing room, checking
    /// capacity optimistically first and again under the write lock.
    async fn admit(&self, player_id: &str, room_id: &str) -> Result<Arc<Room>, RegistryError> {
        let room = self
            .room_by_id(room_id)
            .await
            .ok_or_else(|| RegistryError::RoomNotFound(room_id.to_string()))?;

        // Fast reject without blocking writers.
        if room.state.read().await.players.len() >= MAX_PLAYERS_PER_ROOM {
            warn!("Room {} is full, cannot add player {}", room_id, player_id);
            return Err(RegistryError::RoomFull(room_id.to_string()));
        }

        let player = Arc::new(Player::new(player_id));

        {
            let mut state = room.state.write().await;
            if state.players.len() >= MAX_PLAYERS_PER_ROOM {
                return Err(RegistryError::RoomFull(room_id.to_string()));
            }
            state.players.insert(player_id.to_string(), player);
            state.last_activity = Instant::now();
        }

        // Index is updated only after the room insertion committed.
        self.player_to_room
            .write()
            .await
            .insert(player_id.to_string(), room_id.to_string());
        self.stats.lock().await.players_served += 1;

        info!("Added player {} to room {}", player_id, room_id);
        Ok(room)
    }

    /// Removes a player wherever it is. Idempotent; a second call is a no-op.
    pub async fn remove_player(&self, player_id: &str) {
        let Some(room_id) = self.indexed_room_id(player_id).await else {
            return;
        };

        let Some(room) = self.room_by_id(&room_id).await else {
            self.drop_index_entry(player_id).await;
            return;
        };

        {
            let mut state = room.state.write().await;
            if let Some(player) = state.players.remove(player_id) {
                player.mark_disconnected().await;
                state.last_activity = Instant::now();
                info!(
                    "Removed player {} from room {}. Remaining players: {}",
                    player_id,
                    room.id,
                    state.players.len()
                );
            }
        }

        self.drop_index_entry(player_id).await;
    }

    /// O(1) player lookup. If the index points at a room that no longer
    /// holds the player, the stale entry is deleted and the player is
    /// reported absent.
    pub async fn get_player(&self, player_id: &str) -> Option<Arc<Player>> {
        let room_id = self.indexed_room_id(player_id).await?;
        let Some(room) = self.room_by_id(&room_id).await else {
            self.drop_index_entry(player_id).await;
            return None;
        };
        match room.get(player_id).await {
            Some(player) => Some(player),
            None => {
                self.drop_index_entry(player_id).await;
                None
            }
        }
    }

    /// O(1) room lookup for a player, with the same repair rule as
    /// [`get_player`](Self::get_player).
    pub async fn get_player_room(&self, player_id: &str) -> Option<Arc<Room>> {
        let room_id = self.indexed_room_id(player_id).await?;
        let Some(room) = self.room_by_id(&room_id).await else {
            self.drop_index_entry(player_id).await;
            return None;
        };
        if !room.contains(player_id).await {
            self.drop_index_entry(player_id).await;
            return None;
        }
        Some(room)
    }

    /// Applies an accepted position update and returns the room it should be
    /// fanned out to, or `None` when the player is not in any room.
    pub async fn handle_position_update(
        &self,
        player_id: &str,
        position: shared::Position,
        username: &str,
    ) -> Option<Arc<Room>> {
        let room = self.get_player_room(player_id).await?;
        let player = room.get(player_id).await?;
        player.update_position(position, username).await;
        room.touch().await;
        Some(room)
    }

    /// Member count per room id.
    pub async fn room_stats(&self) -> HashMap<String, usize> {
        let rooms: Vec<Arc<Room>> = self.rooms.read().await.values().cloned().collect();
        let mut stats = HashMap::with_capacity(rooms.len());
        for room in rooms {
            stats.insert(room.id.clone(), room.player_count().await);
        }
        stats
    }

    pub async fn manager_stats(&self) -> ManagerStats {
        let counters = self.stats.lock().await;
        let current_active_rooms = self.rooms.read().await.len();
        let current_active_players = self.player_to_room.read().await.len();
        ManagerStats {
            total_rooms_created: counters.rooms_created,
            total_players_served: counters.players_served,
            current_active_rooms,
            current_active_players,
            cleanup_operations: counters.cleanup_operations,
        }
    }

    /// Deletes rooms that are empty and past the inactivity timeout. The
    /// main room is never deleted. Returns the removed room ids.
    pub async fn sweep_rooms_once(&self) -> Vec<String> {
        self.stats.lock().await.cleanup_operations += 1;

        let mut candidates = Vec::new();
        {
            let rooms = self.rooms.read().await;
            for (room_id, room) in rooms.iter() {
                if *room_id == self.main_room_id {
                    continue;
                }
                if room.is_reclaimable().await {
                    candidates.push(room_id.clone());
                }
            }
        }

        if candidates.is_empty() {
            return candidates;
        }

        let mut removed = Vec::with_capacity(candidates.len());
        {
            let mut rooms = self.rooms.write().await;
            for room_id in candidates {
                // A player may have joined between the scan and this lock;
                // only delete rooms that are still reclaimable.
                let still_reclaimable = match rooms.get(&room_id) {
                    Some(room) => room.is_reclaimable().await,
                    None => false,
                };
                if still_reclaimable {
                    rooms.remove(&room_id);
                    info!("Cleaned up empty room: {}", room_id);
                    removed.push(room_id);
                }
            }
        }

        if !removed.is_empty() {
            info!("Cleanup completed: removed {} empty rooms", removed.len());
        }
        removed
    }

    /// Removes players whose grace period has lapsed, plus index entries
    /// whose room no longer exists. Returns the removed player ids.
    pub async fn sweep_players_once(&self) -> Vec<String> {
        let index: Vec<(String, String)> = self
            .player_to_room
            .read()
            .await
            .iter()
            .map(|(p, r)| (p.clone(), r.clone()))
            .collect();

        let mut expired = Vec::new();
        for (player_id, room_id) in index {
            match self.room_by_id(&room_id).await {
                None => expired.push(player_id),
                Some(room) => {
                    if let Some(player) = room.get(&player_id).await {
                        if player.is_expired().await {
                            expired.push(player_id);
                        }
                    }
                }
            }
        }

        for player_id in &expired {
            self.remove_player(player_id).await;
            info!("Cleaned up inactive player: {}", player_id);
        }

        if !expired.is_empty() {
            info!(
                "Cleanup completed: removed {} inactive players",
                expired.len()
            );
        }
        expired
    }

    /// Starts the room and player sweepers. Call once after construction.
    pub async fn start_sweepers(self: &Arc<Self>) {
        let mut sweepers = self.sweepers.lock().await;

        let registry = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        sweepers.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(
                tokio::time::Instant::now() + CLEANUP_INTERVAL,
                CLEANUP_INTERVAL,
            );
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        registry.sweep_rooms_once().await;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        }));

        let registry = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        sweepers.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(
                tokio::time::Instant::now() + PLAYER_SWEEP_INTERVAL,
                PLAYER_SWEEP_INTERVAL,
            );
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        registry.sweep_players_once().await;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        }));

        info!("Room cleanup sweepers started");
    }

    /// Cancels both sweepers and waits for them to exit. In-flight sweeps
    /// run to completion; live connections are not drained.
    pub async fn shutdown(&self) {
        info!("Shutting down room registry...");
        self.shutdown_tx.send_replace(true);
        let handles: Vec<JoinHandle<()>> = self.sweepers.lock().await.drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        info!("Room registry shutdown complete");
    }
}

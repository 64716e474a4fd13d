//! Player records and their lock-guarded mutable state.
//!
//! A player is created on room admission and shared as an `Arc` between the
//! owning room and whoever resolved it through the registry. All mutable
//! fields live behind the player's own lock; the connection pool, not the
//! player, is the authority for transport liveness.

use serde::Serialize;
use shared::{Position, DISCONNECTED_PLAYER_TTL};
use std::time::Instant;
use tokio::sync::RwLock;

/// A player admitted to a room.
#[derive(Debug)]
pub struct Player {
    /// Opaque identity presented at join time; unique per process.
    pub id: String,
    state: RwLock<PlayerState>,
}

#[derive(Debug)]
struct PlayerState {
    username: String,
    position: Position,
    is_active: bool,
    last_seen: Instant,
}

/// Point-in-time copy of a player's mutable state, taken for room snapshots
/// and HTTP responses without holding the player's lock.
#[derive(Debug, Clone, Serialize)]
pub struct PlayerSnapshot {
    pub id: String,
    pub username: String,
    pub position: Position,
    pub is_active: bool,
}

impl Player {
    /// Creates a freshly admitted player: empty username, origin position,
    /// active, seen now.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: RwLock::new(PlayerState {
                username: String::new(),
                position: Position::default(),
                is_active: true,
                last_seen: Instant::now(),
            }),
        }
    }

    /// Records a position update. A non-empty username also updates the
    /// display name; an empty one leaves it untouched.
    pub async fn update_position(&self, position: Position, username: &str) {
        let mut state = self.state.write().await;
        state.position = position;
        state.last_seen = Instant::now();
        if !username.is_empty() {
            state.username = username.to_string();
        }
    }

    pub async fn position(&self) -> Position {
        self.state.read().await.position
    }

    pub async fn is_active(&self) -> bool {
        self.state.read().await.is_active
    }

    /// Marks the player live again, e.g. when a connection (re)attaches
    /// within the grace period.
    pub async fn mark_active(&self) {
        let mut state = self.state.write().await;
        state.is_active = true;
        state.last_seen = Instant::now();
    }

    /// Marks the player disconnected and starts the reconnection grace
    /// period.
    pub async fn mark_disconnected(&self) {
        let mut state = self.state.write().await;
        state.is_active = false;
        state.last_seen = Instant::now();
    }

    /// Whether the record may still be reclaimed by a reconnect: live, or
    /// disconnected for less than the grace period.
    pub async fn grace_period_active(&self) -> bool {
        let state = self.state.read().await;
        state.is_active || state.last_seen.elapsed() < DISCONNECTED_PLAYER_TTL
    }

    /// Sweep predicate: disconnected and past the grace period.
    pub async fn is_expired(&self) -> bool {
        let state = self.state.read().await;
        !state.is_active && state.last_seen.elapsed() > DISCONNECTED_PLAYER_TTL
    }

    pub async fn snapshot(&self) -> PlayerSnapshot {
        let state = self.state.read().await;
        PlayerSnapshot {
            id: self.id.clone(),
            username: state.username.clone(),
            position: state.position,
            is_active: state.is_active,
        }
    }

    #[cfg(test)]
    pub(crate) async fn set_last_seen(&self, at: Instant) {
        self.state.write().await.last_seen = at;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_new_player_defaults() {
        let player = Player::new("alice");
        let snap = player.snapshot().await;
        assert_eq!(snap.id, "alice");
        assert!(snap.username.is_empty());
        assert_eq!(snap.position, Position::default());
        assert!(snap.is_active);
    }

    #[tokio::test]
    async fn test_position_update_sets_username_when_present() {
        let player = Player::new("alice");
        player.update_position(Position::new(3.0, -1.5), "A").await;
        let snap = player.snapshot().await;
        assert_eq!(snap.position, Position::new(3.0, -1.5));
        assert_eq!(snap.username, "A");

        // Empty username must not erase the existing one.
        player.update_position(Position::new(4.0, 4.0), "").await;
        let snap = player.snapshot().await;
        assert_eq!(snap.position, Position::new(4.0, 4.0));
        assert_eq!(snap.username, "A");
    }

    #[tokio::test]
    async fn test_disconnect_and_reactivate() {
        let player = Player::new("alice");
        player.mark_disconnected().await;
        assert!(!player.is_active().await);
        assert!(player.grace_period_active().await);
        assert!(!player.is_expired().await);

        player.mark_active().await;
        assert!(player.is_active().await);
    }

    #[tokio::test]
    async fn test_expiry_after_grace_period() {
        let player = Player::new("alice");
        player.mark_disconnected().await;
        player
            .set_last_seen(Instant::now() - DISCONNECTED_PLAYER_TTL - Duration::from_secs(1))
            .await;
        assert!(!player.grace_period_active().await);
        assert!(player.is_expired().await);
    }

    #[tokio::test]
    async fn test_active_player_never_expires() {
        let player = Player::new("alice");
        player
            .set_last_seen(Instant::now() - DISCONNECTED_PLAYER_TTL - Duration::from_secs(1))
            .await;
        assert!(!player.is_expired().await);
        assert!(player.grace_period_active().await);
    }
}

//! Process-wide pool of live WebSocket connections, keyed by player id.
//!
//! The pool is the single owner of [`Connection`]s and the authority for
//! transport liveness: broadcasts resolve their targets here, never through
//! player records. It enforces the hard connection cap and the
//! one-connection-per-player rule, preempting the previous connection when
//! the same player upgrades again.

use crate::connection::Connection;
use log::info;
use serde::Serialize;
use shared::MAX_CONCURRENT_CONNECTIONS;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Snapshot of pool occupancy for the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub active_connections: usize,
    pub max_connections: usize,
    pub utilization_percent: f64,
}

#[derive(Default)]
pub struct ConnectionPool {
    connections: RwLock<HashMap<String, Arc<Connection>>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether another connection may be admitted.
    pub async fn can_accept(&self) -> bool {
        self.connections.read().await.len() < MAX_CONCURRENT_CONNECTIONS
    }

    /// Registers a connection, preempting any previous connection held by
    /// the same player: the old one is cancelled and its pumps tear down on
    /// their own.
    pub async fn add(&self, conn: Arc<Connection>) {
        let mut connections = self.connections.write().await;
        if let Some(existing) = connections.insert(conn.player_id.clone(), conn) {
            existing.cancel();
        }
        info!(
            "Connection pool: {}/{} connections",
            connections.len(),
            MAX_CONCURRENT_CONNECTIONS
        );
    }

    /// Deregisters `conn`, cancelling it. The removal is identity-guarded:
    /// a superseded connection tearing itself down must not evict the
    /// replacement that took its slot.
    pub async fn remove(&self, conn: &Arc<Connection>) -> bool {
        let mut connections = self.connections.write().await;
        let is_current = connections
            .get(&conn.player_id)
            .map(|held| Arc::ptr_eq(held, conn))
            .unwrap_or(false);
        if is_current {
            connections.remove(&conn.player_id);
            conn.cancel();
            info!(
                "Connection pool: {}/{} connections",
                connections.len(),
                MAX_CONCURRENT_CONNECTIONS
            );
        }
        is_current
    }

    /// Whether `conn` is still the pool's connection for its player.
    pub async fn is_current(&self, conn: &Arc<Connection>) -> bool {
        self.connections
            .read()
            .await
            .get(&conn.player_id)
            .map(|held| Arc::ptr_eq(held, conn))
            .unwrap_or(false)
    }

    pub async fn get(&self, player_id: &str) -> Option<Arc<Connection>> {
        self.connections.read().await.get(player_id).cloned()
    }

    pub async fn count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn stats(&self) -> ConnectionStats {
        let active = self.connections.read().await.len();
        ConnectionStats {
            active_connections: active,
            max_connections: MAX_CONCURRENT_CONNECTIONS,
            utilization_percent: active as f64 / MAX_CONCURRENT_CONNECTIONS as f64 * 100.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_and_get() {
        let pool = ConnectionPool::new();
        let (conn, _rx) = Connection::new("alice", "ROOM");
        pool.add(conn.clone()).await;

        assert_eq!(pool.count().await, 1);
        let found = pool.get("alice").await.unwrap();
        assert!(Arc::ptr_eq(&found, &conn));
        assert!(pool.get("bob").await.is_none());
    }

    #[tokio::test]
    async fn test_same_player_preempts_previous() {
        let pool = ConnectionPool::new();
        let (first, _rx1) = Connection::new("alice", "ROOM");
        let (second, _rx2) = Connection::new("alice", "ROOM");

        pool.add(first.clone()).await;
        pool.add(second.clone()).await;

        assert_eq!(pool.count().await, 1);
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert!(pool.is_current(&second).await);
        assert!(!pool.is_current(&first).await);
    }

    #[tokio::test]
    async fn test_superseded_connection_cannot_evict_replacement() {
        let pool = ConnectionPool::new();
        let (first, _rx1) = Connection::new("alice", "ROOM");
        let (second, _rx2) = Connection::new("alice", "ROOM");

        pool.add(first.clone()).await;
        pool.add(second.clone()).await;

        // The old connection's cleanup path must be a no-op now.
        assert!(!pool.remove(&first).await);
        assert_eq!(pool.count().await, 1);
        assert!(pool.is_current(&second).await);
        assert!(!second.is_cancelled());

        assert!(pool.remove(&second).await);
        assert_eq!(pool.count().await, 0);
        assert!(second.is_cancelled());
    }

    #[tokio::test]
    async fn test_remove_cancels() {
        let pool = ConnectionPool::new();
        let (conn, _rx) = Connection::new("alice", "ROOM");
        pool.add(conn.clone()).await;

        assert!(pool.remove(&conn).await);
        assert!(conn.is_cancelled());
        assert!(pool.get("alice").await.is_none());
    }

    #[tokio::test]
    async fn test_stats_utilization() {
        let pool = ConnectionPool::new();
        assert!(pool.can_accept().await);

        let (conn, _rx) = Connection::new("alice", "ROOM");
        pool.add(conn).await;

        let stats = pool.stats().await;
        assert_eq!(stats.active_connections, 1);
        assert_eq!(stats.max_connections, MAX_CONCURRENT_CONNECTIONS);
        assert!(stats.utilization_percent > 0.0);
    }
}

//! # Presence Server Library
//!
//! Authoritative realtime presence and messaging server. Authenticated
//! clients join a named room over HTTP, upgrade to a WebSocket, announce
//! their 2D position at interactive rates, exchange room-scoped chat, and
//! exchange direct player-to-player messages. This crate owns the room
//! directory, the liveness of every transport, and the fan-out of state
//! changes to the right audience.
//!
//! ## Core Responsibilities
//!
//! ### Room Directory
//! The [`registry`] module maintains the authoritative set of rooms, the
//! membership of each, and a player→room index for O(1) lookup. Two
//! background sweepers reclaim idle rooms and players whose reconnection
//! grace period has lapsed.
//!
//! ### Connection Ownership
//! The [`pool`] module owns every live connection, enforces the hard
//! concurrent-connection cap, and preempts the previous connection when a
//! player upgrades twice. The [`connection`] module runs the two pumps per
//! socket: a write pump draining a bounded outbound queue under write
//! deadlines with keepalive pings, and a read pump enforcing the idle
//! deadline and dispatching decoded frames.
//!
//! ### Message Routing
//! The [`broadcast`] module serializes each logical message once and offers
//! it, without ever blocking, to every relevant connection: room-scoped
//! fan-out excludes the sender; direct messages resolve their target
//! through the pool and synthesize sent/error frames back to the sender.
//!
//! ## Concurrency Model
//!
//! Many lightweight tasks on the tokio runtime: two long-running pumps per
//! connection, two periodic sweepers owned by the registry, and short-lived
//! fan-out tasks. Lock acquisition order is registry → player-index → room;
//! no room lock is ever held across a channel send. Every producer uses
//! non-blocking offers, so backpressure surfaces as per-target frame drops
//! rather than stalls.
//!
//! ## Module Organization
//!
//! - [`config`]: environment configuration (`PORT`, `DATABASE_URL`)
//! - [`player`]: player records and their guarded state
//! - [`registry`]: rooms, the player index, sweepers, statistics
//! - [`pool`]: the connection pool
//! - [`connection`]: per-connection state, pumps, frame dispatch
//! - [`broadcast`]: fan-out and direct routing
//! - [`routes`]: the HTTP surface and WebSocket upgrade
//! - [`persistence`]: bounded fire-and-forget queue toward the profile
//!   store collaborator

pub mod broadcast;
pub mod config;
pub mod connection;
pub mod persistence;
pub mod player;
pub mod pool;
pub mod registry;
pub mod routes;

use persistence::PersistenceQueue;
use pool::ConnectionPool;
use registry::RoomRegistry;
use std::sync::Arc;

/// Shared handles injected into every handler and pump.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RoomRegistry>,
    pub pool: Arc<ConnectionPool>,
    pub persistence: PersistenceQueue,
}

impl AppState {
    /// Wires up a complete server state. Sweepers are started by the
    /// caller, which also owns shutdown ordering.
    pub fn new(database_url: Option<String>) -> Self {
        Self {
            registry: RoomRegistry::new(),
            pool: Arc::new(ConnectionPool::new()),
            persistence: PersistenceQueue::start(database_url),
        }
    }
}

//! Per-client connection state and the two pumps that drive it.
//!
//! Every upgraded socket is owned by exactly one [`Connection`]: a bounded
//! outbound queue drained by the write pump, a cancellation signal observed
//! by both pumps, and the private-message rate limiter. Producers enqueue
//! with non-blocking offers only; a full queue drops the frame for that
//! target and nothing upstream ever blocks.
//!
//! The write pump owns the sink half of the socket: it forwards queued
//! frames under a write deadline, emits keepalive pings, and sends a close
//! frame on the way out. The read pump owns the stream half: it enforces the
//! idle deadline, decodes one JSON frame at a time, and dispatches by type.

use crate::broadcast::{broadcast_to_room, send_private_message};
use crate::AppState;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::Deserialize;
use shared::{
    ClientFrame, ServerFrame, now_millis, MAX_PRIVATE_MESSAGE_LEN, OUTBOUND_QUEUE_DEPTH,
    PING_PERIOD, PRIVATE_MESSAGE_RATE_LIMIT, READ_TIMEOUT, WRITE_TIMEOUT,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{interval_at, timeout};

/// Sliding one-minute counter for chat-class messages.
///
/// Only the owning connection's read pump calls [`allow`](Self::allow), so
/// the state never sees concurrent writers; the mutex on the connection
/// guards it anyway.
#[derive(Debug, Default)]
pub struct RateLimiter {
    message_count: u32,
    window_start: Option<Instant>,
}

impl RateLimiter {
    /// Counts one message and reports whether it may pass. The window
    /// resets when the current minute rolls over.
    pub fn allow(&mut self) -> bool {
        self.allow_at(Instant::now())
    }

    fn allow_at(&mut self, now: Instant) -> bool {
        match self.window_start {
            Some(start) if now.duration_since(start) < Duration::from_secs(60) => {
                self.message_count += 1;
                self.message_count <= PRIVATE_MESSAGE_RATE_LIMIT
            }
            _ => {
                self.message_count = 1;
                self.window_start = Some(now);
                true
            }
        }
    }
}

/// One live client connection.
pub struct Connection {
    pub player_id: String,
    pub room_id: String,
    outbound: mpsc::Sender<String>,
    cancel_tx: watch::Sender<bool>,
    limiter: Mutex<RateLimiter>,
}

impl Connection {
    /// Creates the connection and hands back the receiving end of its
    /// outbound queue for the write pump.
    pub fn new(
        player_id: impl Into<String>,
        room_id: impl Into<String>,
    ) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let (cancel_tx, _) = watch::channel(false);
        let conn = Arc::new(Self {
            player_id: player_id.into(),
            room_id: room_id.into(),
            outbound,
            cancel_tx,
            limiter: Mutex::new(RateLimiter::default()),
        });
        (conn, outbound_rx)
    }

    /// Non-blocking enqueue of a pre-serialized frame. A full or closed
    /// queue drops the frame for this target only.
    pub fn offer(&self, frame: String) -> bool {
        match self.outbound.try_send(frame) {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    "Send channel full for player {}, dropping message",
                    self.player_id
                );
                false
            }
        }
    }

    /// Serializes and offers a frame.
    pub fn offer_frame(&self, frame: &ServerFrame) -> bool {
        match serde_json::to_string(frame) {
            Ok(payload) => self.offer(payload),
            Err(err) => {
                warn!("Error serializing frame for {}: {}", self.player_id, err);
                false
            }
        }
    }

    /// Signals both pumps to exit at their next suspension point.
    /// Idempotent, and effective even before any pump subscribed.
    pub fn cancel(&self) {
        self.cancel_tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    pub fn cancelled(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }

    /// Counts a private message against this connection's limiter.
    pub async fn allow_private_message(&self) -> bool {
        self.limiter.lock().await.allow()
    }
}

/// Drains the outbound queue into the socket.
///
/// Each write runs under [`WRITE_TIMEOUT`]; a keepalive ping goes out every
/// [`PING_PERIOD`]. Exits on cancellation, queue closure, or any write
/// failure, then cancels the connection so the read pump follows.
pub async fn write_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<String>,
    conn: Arc<Connection>,
) {
    let mut cancelled = conn.cancelled();
    let mut ping = interval_at(tokio::time::Instant::now() + PING_PERIOD, PING_PERIOD);

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                match frame {
                    Some(text) => {
                        match timeout(WRITE_TIMEOUT, sink.send(Message::Text(text))).await {
                            Ok(Ok(())) => {}
                            Ok(Err(err)) => {
                                debug!("Write error for player {}: {}", conn.player_id, err);
                                break;
                            }
                            Err(_) => {
                                warn!("Write timed out for player {}", conn.player_id);
                                break;
                            }
                        }
                    }
                    None => {
                        let _ = timeout(WRITE_TIMEOUT, sink.send(Message::Close(None))).await;
                        break;
                    }
                }
            }
            _ = ping.tick() => {
                if timeout(WRITE_TIMEOUT, sink.send(Message::Ping(Vec::new())))
                    .await
                    .map(|res| res.is_err())
                    .unwrap_or(true)
                {
                    break;
                }
            }
            _ = cancelled.changed() => {
                if *cancelled.borrow() {
                    let _ = timeout(WRITE_TIMEOUT, sink.send(Message::Close(None))).await;
                    break;
                }
            }
        }
    }

    conn.cancel();
    let _ = sink.close().await;
}

/// Reads, decodes, and dispatches inbound frames until the connection dies.
///
/// The idle deadline is refreshed by any inbound message, pongs included.
/// Runs disconnect cleanup on the way out.
pub async fn read_pump(mut stream: SplitStream<WebSocket>, conn: Arc<Connection>, state: AppState) {
    let mut cancelled = conn.cancelled();

    loop {
        let next = tokio::select! {
            _ = cancelled.changed() => {
                if *cancelled.borrow() {
                    break;
                }
                continue;
            }
            next = timeout(READ_TIMEOUT, stream.next()) => next,
        };

        match next {
            Err(_) => {
                info!("Read deadline expired for player {}", conn.player_id);
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(err))) => {
                debug!("WebSocket error for player {}: {}", conn.player_id, err);
                break;
            }
            Ok(Some(Ok(Message::Text(text)))) => {
                // Malformed JSON ends the connection; well-formed frames of
                // an unknown shape are only logged and skipped.
                let value = match serde_json::from_str::<serde_json::Value>(&text) {
                    Ok(value) => value,
                    Err(err) => {
                        warn!("Invalid JSON from player {}: {}", conn.player_id, err);
                        break;
                    }
                };
                match ClientFrame::deserialize(value) {
                    Ok(frame) => dispatch(&conn, &state, frame).await,
                    Err(err) => {
                        warn!(
                            "Unhandled frame from player {}: {} ({})",
                            conn.player_id, err, text
                        );
                    }
                }
            }
            Ok(Some(Ok(Message::Close(_)))) => break,
            // Pings are answered by the transport layer; pongs and binary
            // frames only refresh the deadline.
            Ok(Some(Ok(_))) => {}
        }
    }

    handle_disconnect(&conn, &state).await;
}

/// Routes one decoded frame to the registry, the router, or teardown.
async fn dispatch(conn: &Arc<Connection>, state: &AppState, frame: ClientFrame) {
    match frame {
        ClientFrame::PositionUpdate { position, username } => {
            let Some(room) = state
                .registry
                .handle_position_update(&conn.player_id, position, &username)
                .await
            else {
                debug!(
                    "Player {} not found in any room for position update",
                    conn.player_id
                );
                return;
            };
            let update = ServerFrame::PositionUpdate {
                player_id: conn.player_id.clone(),
                position,
                username,
                timestamp: now_millis(),
            };
            tokio::spawn(broadcast_to_room(
                room,
                state.pool.clone(),
                conn.player_id.clone(),
                update,
            ));
        }
        ClientFrame::ChatMessage { text, username } => {
            let Some(room) = state.registry.get_player_room(&conn.player_id).await else {
                debug!(
                    "Player {} not found in any room for chat message",
                    conn.player_id
                );
                return;
            };
            // The sender identity always comes from the connection, never
            // from the client payload.
            let chat = ServerFrame::ChatMessage {
                player_id: conn.player_id.clone(),
                text,
                username,
                timestamp: now_millis(),
            };
            tokio::spawn(broadcast_to_room(
                room,
                state.pool.clone(),
                conn.player_id.clone(),
                chat,
            ));
        }
        ClientFrame::PrivateMessage {
            target_player_id,
            text,
            username,
        } => {
            handle_private_message(conn, state, target_player_id, text, username).await;
        }
        ClientFrame::LeaveRoom => {
            state.registry.remove_player(&conn.player_id).await;
            conn.cancel();
        }
    }
}

/// Validates and routes a direct message. Rate-limit and validation
/// failures are silent toward the sender; only an offline target produces
/// an error frame.
async fn handle_private_message(
    conn: &Arc<Connection>,
    state: &AppState,
    target_player_id: String,
    text: String,
    username: String,
) {
    if !conn.allow_private_message().await {
        info!("Rate limit exceeded for player {}", conn.player_id);
        return;
    }

    if text.len() > MAX_PRIVATE_MESSAGE_LEN {
        info!(
            "Private message from {} too long ({} bytes)",
            conn.player_id,
            text.len()
        );
        return;
    }

    if text.trim().is_empty() {
        info!(
            "Private message from {} is empty or whitespace only",
            conn.player_id
        );
        return;
    }

    if target_player_id.is_empty() {
        info!(
            "Private message from {} missing target player id",
            conn.player_id
        );
        return;
    }

    if target_player_id == conn.player_id {
        info!(
            "Player {} tried to send a private message to themselves",
            conn.player_id
        );
        return;
    }

    send_private_message(&state.pool, conn, &target_player_id, text, username).await;
}

/// Teardown after the read pump exits.
///
/// For the pool's current connection: the player is marked disconnected and
/// retained for the reconnection grace period, peers get `player_left`, and
/// the connection leaves the pool (cancelling the write pump). A superseded
/// connection skips all of it so it cannot disturb its replacement.
pub async fn handle_disconnect(conn: &Arc<Connection>, state: &AppState) {
    if !state.pool.is_current(conn).await {
        conn.cancel();
        return;
    }

    if let Some(room) = state.registry.get_player_room(&conn.player_id).await {
        if let Some(player) = room.get(&conn.player_id).await {
            player.mark_disconnected().await;
        }
        let left = ServerFrame::PlayerLeft {
            player_id: conn.player_id.clone(),
            timestamp: now_millis(),
        };
        tokio::spawn(broadcast_to_room(
            room,
            state.pool.clone(),
            conn.player_id.clone(),
            left,
        ));
    }

    state.pool.remove(conn).await;
    info!("Connection closed for player {}", conn.player_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limiter_allows_up_to_limit() {
        let mut limiter = RateLimiter::default();
        let start = Instant::now();

        let mut allowed = 0;
        for i in 0..25 {
            if limiter.allow_at(start + Duration::from_millis(i * 100)) {
                allowed += 1;
            }
        }
        assert_eq!(allowed, PRIVATE_MESSAGE_RATE_LIMIT);
    }

    #[test]
    fn test_rate_limiter_window_rollover() {
        let mut limiter = RateLimiter::default();
        let start = Instant::now();

        for _ in 0..PRIVATE_MESSAGE_RATE_LIMIT {
            assert!(limiter.allow_at(start));
        }
        assert!(!limiter.allow_at(start + Duration::from_secs(59)));

        // A fresh minute resets the counter.
        assert!(limiter.allow_at(start + Duration::from_secs(61)));
        assert_eq!(limiter.message_count, 1);
    }

    #[test]
    fn test_rate_limiter_exactly_one_minute_rolls() {
        let mut limiter = RateLimiter::default();
        let start = Instant::now();
        for _ in 0..PRIVATE_MESSAGE_RATE_LIMIT {
            assert!(limiter.allow_at(start));
        }
        assert!(limiter.allow_at(start + Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_offer_drops_on_full_queue() {
        let (conn, _rx) = Connection::new("alice", "ROOM");
        for _ in 0..OUTBOUND_QUEUE_DEPTH {
            assert!(conn.offer("x".to_string()));
        }
        // Queue is full; the offer must not block, only report the drop.
        assert!(!conn.offer("overflow".to_string()));
    }

    #[tokio::test]
    async fn test_offer_delivers_in_order() {
        let (conn, mut rx) = Connection::new("alice", "ROOM");
        assert!(conn.offer("first".to_string()));
        assert!(conn.offer_frame(&ServerFrame::PlayerLeft {
            player_id: "bob".to_string(),
            timestamp: 7,
        }));

        assert_eq!(rx.recv().await.unwrap(), "first");
        let second = rx.recv().await.unwrap();
        assert!(second.contains("\"player_left\""));
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_and_observable() {
        let (conn, _rx) = Connection::new("alice", "ROOM");
        assert!(!conn.is_cancelled());

        conn.cancel();
        conn.cancel();
        assert!(conn.is_cancelled());

        // A receiver subscribed after the fact still observes the signal.
        let mut cancelled = conn.cancelled();
        cancelled.wait_for(|stop| *stop).await.unwrap();
    }
}

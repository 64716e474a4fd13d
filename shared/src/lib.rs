//! # Shared Protocol Library
//!
//! Wire-level types shared by the presence server, the bundled test client,
//! and the integration tests. Everything that crosses the WebSocket boundary
//! is defined here so both sides agree on one source of truth.
//!
//! ## Core Components
//!
//! ### Protocol Constants
//! Tuning parameters for rooms, connections, and timeouts. These are part of
//! the external contract (capacity rejections, rate limits, grace periods)
//! and must not drift between server and clients.
//!
//! ### Wire Frames
//! All frames are UTF-8 JSON text messages tagged by a `type` field:
//! - [`ClientFrame`]: everything a client may send after the upgrade
//! - [`ServerFrame`]: everything the server emits, including the initial
//!   `batch` snapshot
//!
//! Fields that are omitted on the wire when empty (`username`) are skipped
//! during serialization rather than sent as `""`.
//!
//! ## Serialization
//!
//! Frames derive `Serialize`/`Deserialize` and are exchanged as JSON via
//! `serde_json`. Unknown inbound `type` values fail to decode; the server
//! logs and ignores such frames instead of disconnecting the client.

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Maximum number of players a single room will admit.
///
/// The 21st admission attempt fails with a room-full error; the check is
/// performed again under the room's write lock before insertion.
pub const MAX_PLAYERS_PER_ROOM: usize = 20;

/// Hard cap on concurrent WebSocket connections for the whole process.
///
/// Upgrades beyond this are refused with HTTP 503 before any socket work.
pub const MAX_CONCURRENT_CONNECTIONS: usize = 1000;

/// Read buffer size for the upgraded transport, in bytes.
pub const READ_BUFFER_SIZE: usize = 8192;

/// Write buffer size for the upgraded transport, in bytes.
pub const WRITE_BUFFER_SIZE: usize = 8192;

/// Interval between keepalive pings emitted by the write pump.
///
/// Must be shorter than [`READ_TIMEOUT`] on the peer so an idle but healthy
/// connection never trips the idle deadline.
pub const PING_PERIOD: Duration = Duration::from_secs(54);

/// Idle deadline for the read pump; refreshed by any inbound frame.
pub const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Deadline extension granted when a pong arrives.
pub const PONG_TIMEOUT: Duration = Duration::from_secs(60);

/// Upper bound on a single transport write.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// How often the room sweeper looks for reclaimable rooms.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// A non-main room is deleted once it has been empty and inactive this long.
pub const INACTIVE_ROOM_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Grace period during which a disconnected player's record is retained so
/// a reconnect finds the player still in its room.
pub const DISCONNECTED_PLAYER_TTL: Duration = Duration::from_secs(80);

/// How often the player sweeper checks for expired disconnected players.
pub const PLAYER_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Length of the generated main-room code.
pub const ROOM_CODE_LENGTH: usize = 6;

/// Alphabet the room code is drawn from.
pub const ROOM_CODE_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Longest room id accepted on the join-by-code path.
pub const MAX_ROOM_ID_LEN: usize = 10;

/// Depth of each connection's outbound frame queue. Producers never block:
/// when the queue is full the frame is dropped for that target only.
pub const OUTBOUND_QUEUE_DEPTH: usize = 256;

/// Depth of the fire-and-forget persistence queue.
pub const PERSISTENCE_QUEUE_DEPTH: usize = 1000;

/// Private messages allowed per connection per minute.
pub const PRIVATE_MESSAGE_RATE_LIMIT: u32 = 20;

/// Longest accepted private-message text, in bytes.
pub const MAX_PRIVATE_MESSAGE_LEN: usize = 500;

/// Synthetic sender id used for server-generated frames.
pub const SYSTEM_SENDER: &str = "system";

/// A 2D position reported by a client.
///
/// No server-side clamping or validation is applied; positions are relayed
/// as received.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Frames a client may send over an established connection.
///
/// Dispatched by the read pump. The client-supplied sender identity is never
/// trusted: the connection's authenticated player id is substituted wherever
/// a sender id appears in the resulting broadcasts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Latest position for this player; relayed to the rest of the room.
    PositionUpdate {
        position: Position,
        #[serde(default)]
        username: String,
    },
    /// Room-scoped chat line.
    ChatMessage {
        #[serde(default)]
        text: String,
        #[serde(default)]
        username: String,
    },
    /// Direct message to one other player. Rate-limited and validated
    /// before routing.
    PrivateMessage {
        #[serde(default)]
        target_player_id: String,
        #[serde(default)]
        text: String,
        #[serde(default)]
        username: String,
    },
    /// Leave the current room and close the connection.
    LeaveRoom,
}

/// Frames the server emits to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// A player entered the room (also used inside the initial snapshot).
    PlayerJoined {
        player_id: String,
        position: Position,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        username: String,
        timestamp: i64,
    },
    /// A player left the room or its connection dropped.
    PlayerLeft { player_id: String, timestamp: i64 },
    /// A peer moved.
    PositionUpdate {
        player_id: String,
        position: Position,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        username: String,
        timestamp: i64,
    },
    /// Room-scoped chat from a peer.
    ChatMessage {
        player_id: String,
        text: String,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        username: String,
        timestamp: i64,
    },
    /// Direct message delivered to its target.
    PrivateMessage {
        player_id: String,
        target_player_id: String,
        text: String,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        username: String,
        timestamp: i64,
    },
    /// Delivery confirmation returned to the sender of a private message.
    PrivateMessageSent {
        player_id: String,
        target_player_id: String,
        text: String,
        timestamp: i64,
    },
    /// Returned to the sender when the private-message target is offline.
    PrivateMessageError {
        player_id: String,
        text: String,
        timestamp: i64,
    },
    /// Several frames delivered as one message; used for the initial
    /// room snapshot.
    Batch {
        messages: Vec<ServerFrame>,
        count: usize,
    },
}

impl ServerFrame {
    /// Confirmation frame for a successfully routed private message.
    pub fn private_message_sent(target_player_id: impl Into<String>) -> Self {
        ServerFrame::PrivateMessageSent {
            player_id: SYSTEM_SENDER.to_string(),
            target_player_id: target_player_id.into(),
            text: "Message sent successfully".to_string(),
            timestamp: now_millis(),
        }
    }

    /// Error frame for a private message whose target is offline.
    pub fn private_message_error() -> Self {
        ServerFrame::PrivateMessageError {
            player_id: SYSTEM_SENDER.to_string(),
            text: "Player not found or offline".to_string(),
            timestamp: now_millis(),
        }
    }

    /// Wraps a set of frames into a single `batch` frame.
    pub fn batch(messages: Vec<ServerFrame>) -> Self {
        let count = messages.len();
        ServerFrame::Batch { messages, count }
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis();
    millis.min(i64::MAX as u128) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn test_position_update_decodes() {
        let raw = r#"{"type":"position_update","position":{"x":3.0,"y":-1.5},"username":"A"}"#;
        let frame: ClientFrame = serde_json::from_str(raw).unwrap();
        match frame {
            ClientFrame::PositionUpdate { position, username } => {
                assert_eq!(position.x, 3.0);
                assert_eq!(position.y, -1.5);
                assert_eq!(username, "A");
            }
            _ => panic!("Wrong frame type after decode"),
        }
    }

    #[test]
    fn test_position_update_username_optional() {
        let raw = r#"{"type":"position_update","position":{"x":0.0,"y":0.0}}"#;
        let frame: ClientFrame = serde_json::from_str(raw).unwrap();
        match frame {
            ClientFrame::PositionUpdate { username, .. } => assert!(username.is_empty()),
            _ => panic!("Wrong frame type after decode"),
        }
    }

    #[test]
    fn test_private_message_missing_target_decodes_empty() {
        // Missing target must survive decode so validation can reject it.
        let raw = r#"{"type":"private_message","text":"hi","username":"A"}"#;
        let frame: ClientFrame = serde_json::from_str(raw).unwrap();
        match frame {
            ClientFrame::PrivateMessage {
                target_player_id, ..
            } => assert!(target_player_id.is_empty()),
            _ => panic!("Wrong frame type after decode"),
        }
    }

    #[test]
    fn test_leave_room_decodes() {
        let frame: ClientFrame = serde_json::from_str(r#"{"type":"leave_room"}"#).unwrap();
        assert!(matches!(frame, ClientFrame::LeaveRoom));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let result: Result<ClientFrame, _> =
            serde_json::from_str(r#"{"type":"teleport","x":1.0}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_position_update_requires_position() {
        let result: Result<ClientFrame, _> =
            serde_json::from_str(r#"{"type":"position_update","username":"A"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_server_frame_tag_is_snake_case() {
        let frame = ServerFrame::PlayerJoined {
            player_id: "alice".to_string(),
            position: Position::new(1.0, 2.0),
            username: "A".to_string(),
            timestamp: 1234,
        };
        let value: Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "player_joined");
        assert_eq!(value["player_id"], "alice");
        assert_eq!(value["position"]["x"], 1.0);
        assert_eq!(value["timestamp"], 1234);
    }

    #[test]
    fn test_empty_username_omitted() {
        let frame = ServerFrame::PositionUpdate {
            player_id: "alice".to_string(),
            position: Position::default(),
            username: String::new(),
            timestamp: 1,
        };
        let value: Value = serde_json::to_value(&frame).unwrap();
        assert!(value.get("username").is_none());

        let frame = ServerFrame::PositionUpdate {
            player_id: "alice".to_string(),
            position: Position::default(),
            username: "A".to_string(),
            timestamp: 1,
        };
        let value: Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["username"], "A");
    }

    #[test]
    fn test_player_left_shape() {
        let frame = ServerFrame::PlayerLeft {
            player_id: "bob".to_string(),
            timestamp: 99,
        };
        let value: Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            value,
            json!({"type":"player_left","player_id":"bob","timestamp":99})
        );
    }

    #[test]
    fn test_batch_wraps_count() {
        let frames = vec![
            ServerFrame::PlayerLeft {
                player_id: "a".to_string(),
                timestamp: 1,
            },
            ServerFrame::PlayerLeft {
                player_id: "b".to_string(),
                timestamp: 2,
            },
        ];
        let batch = ServerFrame::batch(frames);
        let value: Value = serde_json::to_value(&batch).unwrap();
        assert_eq!(value["type"], "batch");
        assert_eq!(value["count"], 2);
        assert_eq!(value["messages"].as_array().unwrap().len(), 2);
        assert_eq!(value["messages"][0]["type"], "player_left");
    }

    #[test]
    fn test_system_frames() {
        let sent = ServerFrame::private_message_sent("bob");
        match sent {
            ServerFrame::PrivateMessageSent {
                player_id,
                target_player_id,
                text,
                ..
            } => {
                assert_eq!(player_id, SYSTEM_SENDER);
                assert_eq!(target_player_id, "bob");
                assert_eq!(text, "Message sent successfully");
            }
            _ => panic!("Wrong frame type"),
        }

        let err = ServerFrame::private_message_error();
        match err {
            ServerFrame::PrivateMessageError {
                player_id, text, ..
            } => {
                assert_eq!(player_id, SYSTEM_SENDER);
                assert_eq!(text, "Player not found or offline");
            }
            _ => panic!("Wrong frame type"),
        }
    }

    #[test]
    fn test_now_millis_monotonic_enough() {
        let first = now_millis();
        std::thread::sleep(Duration::from_millis(2));
        let second = now_millis();
        assert!(second > first);
        assert!(first > 1_500_000_000_000); // sanity: after 2017
    }

    #[test]
    fn test_constants_contract() {
        assert_eq!(MAX_PLAYERS_PER_ROOM, 20);
        assert_eq!(MAX_CONCURRENT_CONNECTIONS, 1000);
        assert_eq!(READ_BUFFER_SIZE, 8192);
        assert_eq!(WRITE_BUFFER_SIZE, 8192);
        assert_eq!(PING_PERIOD, Duration::from_secs(54));
        assert_eq!(READ_TIMEOUT, Duration::from_secs(60));
        assert_eq!(WRITE_TIMEOUT, Duration::from_secs(10));
        assert_eq!(CLEANUP_INTERVAL, Duration::from_secs(300));
        assert_eq!(INACTIVE_ROOM_TIMEOUT, Duration::from_secs(1800));
        assert_eq!(DISCONNECTED_PLAYER_TTL, Duration::from_secs(80));
        assert_eq!(ROOM_CODE_LENGTH, 6);
        assert_eq!(ROOM_CODE_CHARS.len(), 36);
        assert_eq!(OUTBOUND_QUEUE_DEPTH, 256);
        assert_eq!(PERSISTENCE_QUEUE_DEPTH, 1000);
        assert_eq!(PRIVATE_MESSAGE_RATE_LIMIT, 20);
        assert_eq!(MAX_PRIVATE_MESSAGE_LEN, 500);
        assert_eq!(MAX_ROOM_ID_LEN, 10);
    }
}

//! Room fan-out and direct player-to-player routing.
//!
//! One serialization per logical message, then a non-blocking offer per
//! target. Target connections are resolved through the pool: the pool, not
//! the player record, decides who is reachable. The room lock is only held
//! long enough to snapshot the member list; no send happens under it.

use crate::connection::Connection;
use crate::pool::ConnectionPool;
use crate::registry::Room;
use futures_util::future::join_all;
use log::{debug, warn};
use shared::{now_millis, ServerFrame};
use std::sync::Arc;

/// Delivers `frame` to every room member except `exclude`.
///
/// The frame is serialized once. Targets whose queues are full simply miss
/// this frame; the offers are fanned out concurrently and the call returns
/// once every offer has been attempted.
pub async fn broadcast_to_room(
    room: Arc<Room>,
    pool: Arc<ConnectionPool>,
    exclude: String,
    frame: ServerFrame,
) {
    let payload = match serde_json::to_string(&frame) {
        Ok(payload) => payload,
        Err(err) => {
            warn!("Error serializing broadcast frame: {}", err);
            return;
        }
    };

    let targets = room.member_ids_excluding(&exclude).await;
    if targets.is_empty() {
        return;
    }

    let offers = targets.into_iter().map(|player_id| {
        let pool = pool.clone();
        let payload = payload.clone();
        async move {
            if let Some(conn) = pool.get(&player_id).await {
                conn.offer(payload);
            }
        }
    });
    join_all(offers).await;
}

/// Routes a validated direct message.
///
/// An unreachable target synthesizes a `private_message_error` back to the
/// sender; a reachable one gets the message while the sender gets a
/// `private_message_sent` confirmation. All offers are non-blocking.
pub async fn send_private_message(
    pool: &ConnectionPool,
    sender: &Connection,
    target_player_id: &str,
    text: String,
    username: String,
) {
    let Some(target) = pool.get(target_player_id).await else {
        debug!(
            "Target player {} not connected for private message from {}",
            target_player_id, sender.player_id
        );
        sender.offer_frame(&ServerFrame::private_message_error());
        return;
    };

    let message = ServerFrame::PrivateMessage {
        player_id: sender.player_id.clone(),
        target_player_id: target_player_id.to_string(),
        text,
        username,
        timestamp: now_millis(),
    };
    target.offer_frame(&message);
    sender.offer_frame(&ServerFrame::private_message_sent(target_player_id));
    debug!(
        "Private message sent from {} to {}",
        sender.player_id, target_player_id
    );
}

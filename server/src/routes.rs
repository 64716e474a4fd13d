//! HTTP surface: join endpoints, the WebSocket upgrade, and stats.
//!
//! Join-room must precede the upgrade: the upgrade handler authenticates
//! the token, gates on pool capacity, and then only attaches a transport to
//! a player the registry already knows. Admission errors map onto the
//! status codes existing clients expect, including the legacy 500 with a
//! literal `room {id} is full` body.

use crate::broadcast::broadcast_to_room;
use crate::connection::{read_pump, write_pump, Connection};
use crate::pool::ConnectionStats;
use crate::registry::{ManagerStats, RegistryError, Room};
use crate::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::StreamExt;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use shared::{now_millis, Position, ServerFrame, WRITE_BUFFER_SIZE};
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

/// Builds the full application router with permissive CORS.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(home))
        .route("/player/join-room", post(join_room))
        .route("/player/join-specific-room", post(join_specific_room))
        .route("/player/leave-room", post(leave_room))
        .route("/player/ws", get(ws_handler))
        .route("/player/stats", get(stats))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn home() -> &'static str {
    "Welcome to the Home Page"
}

#[derive(Debug, Serialize)]
struct PlayerInfo {
    id: String,
    position: Position,
}

#[derive(Debug, Serialize)]
struct JoinResponse {
    room_id: String,
    players: Vec<PlayerInfo>,
}

#[derive(Debug, Deserialize)]
struct JoinSpecificRequest {
    #[serde(default)]
    room_id: String,
}

#[derive(Debug, Serialize)]
struct LeaveResponse {
    success: bool,
    message: String,
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    rooms: HashMap<String, usize>,
    manager: ManagerStats,
    connections: ConnectionStats,
}

/// The opaque player id arrives in the Authorization header and is trusted
/// as-is; issuing it is someone else's job.
fn player_id_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()
        .map(str::to_string)
        .filter(|token| !token.is_empty())
}

fn registry_error_response(err: RegistryError) -> Response {
    match err {
        // Legacy wire contract: capacity rejections are 500 with the
        // literal room-is-full text.
        RegistryError::RoomFull(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
        RegistryError::InvalidRoomId => {
            (StatusCode::BAD_REQUEST, err.to_string()).into_response()
        }
        RegistryError::RoomNotFound(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

async fn join_response(room: &Room) -> JoinResponse {
    let players = room
        .snapshot_players()
        .await
        .into_iter()
        .map(|snap| PlayerInfo {
            id: snap.id,
            position: snap.position,
        })
        .collect();
    JoinResponse {
        room_id: room.id.clone(),
        players,
    }
}

async fn join_room(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(player_id) = player_id_from_headers(&headers) else {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    };

    match state.registry.add_player(&player_id).await {
        Ok(room) => {
            state.persistence.record_last_room(&player_id, &room.id);
            Json(join_response(&room).await).into_response()
        }
        Err(err) => registry_error_response(err),
    }
}

async fn join_specific_room(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<JoinSpecificRequest>,
) -> Response {
    let Some(player_id) = player_id_from_headers(&headers) else {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    };

    match state
        .registry
        .add_player_to_room(&player_id, &request.room_id)
        .await
    {
        Ok(room) => {
            state.persistence.record_last_room(&player_id, &room.id);
            Json(join_response(&room).await).into_response()
        }
        Err(err) => registry_error_response(err),
    }
}

async fn leave_room(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(player_id) = player_id_from_headers(&headers) else {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    };

    state.registry.remove_player(&player_id).await;
    Json(LeaveResponse {
        success: true,
        message: "Successfully left the room".to_string(),
    })
    .into_response()
}

async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        rooms: state.registry.room_stats().await,
        manager: state.registry.manager_stats().await,
        connections: state.pool.stats().await,
    })
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    #[serde(default)]
    token: String,
}

/// Authenticates and admits the upgrade, then hands the socket to the
/// connection layer.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    if query.token.is_empty() {
        warn!("WebSocket connection rejected: no token provided");
        return (
            StatusCode::UNAUTHORIZED,
            "Unauthorized - No token provided",
        )
            .into_response();
    }

    if !state.pool.can_accept().await {
        warn!(
            "Connection rejected for player {}: server at capacity",
            query.token
        );
        return (StatusCode::SERVICE_UNAVAILABLE, "Server at capacity").into_response();
    }

    ws.write_buffer_size(WRITE_BUFFER_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, state, query.token))
}

/// Runs one upgraded connection to completion.
async fn handle_socket(mut socket: WebSocket, state: AppState, player_id: String) {
    // Join-room must have happened first; an unknown player gets the
    // transport closed right back.
    let Some(player) = state.registry.get_player(&player_id).await else {
        info!(
            "Player {} not found in any room for WebSocket connection",
            player_id
        );
        let _ = socket.send(Message::Close(None)).await;
        return;
    };
    let Some(room) = state.registry.get_player_room(&player_id).await else {
        info!("Room not found for player {}", player_id);
        let _ = socket.send(Message::Close(None)).await;
        return;
    };

    let (conn, outbound_rx) = Connection::new(player_id.clone(), room.id.clone());
    state.pool.add(conn.clone()).await;
    player.mark_active().await;

    info!(
        "WebSocket connected for player {} in room {}",
        player_id, room.id
    );

    send_initial_room_state(&conn, &room, &state, &player_id).await;

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_pump(sink, outbound_rx, conn.clone()));
    let reader = tokio::spawn(read_pump(stream, conn, state));

    // The read pump performs disconnect cleanup and, through the pool,
    // cancels the write pump; wait for both so nothing leaks.
    let _ = reader.await;
    let _ = writer.await;
}

/// Sends the newcomer one `batch` of everyone already present, then tells
/// the room about the newcomer.
async fn send_initial_room_state(
    conn: &Arc<Connection>,
    room: &Arc<Room>,
    state: &AppState,
    player_id: &str,
) {
    let mut own_snapshot = None;
    let mut messages = Vec::new();
    for snap in room.snapshot_players().await {
        if snap.id == player_id {
            own_snapshot = Some(snap);
            continue;
        }
        messages.push(ServerFrame::PlayerJoined {
            player_id: snap.id,
            position: snap.position,
            username: snap.username,
            timestamp: now_millis(),
        });
    }
    if !messages.is_empty() {
        conn.offer_frame(&ServerFrame::batch(messages));
    }

    let (position, username) = own_snapshot
        .map(|snap| (snap.position, snap.username))
        .unwrap_or_default();
    let joined = ServerFrame::PlayerJoined {
        player_id: player_id.to_string(),
        position,
        username,
        timestamp: now_millis(),
    };
    tokio::spawn(broadcast_to_room(
        room.clone(),
        state.pool.clone(),
        player_id.to_string(),
        joined,
    ));
}

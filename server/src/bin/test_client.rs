//! Scripted WebSocket smoke client.
//!
//! Joins the main room over HTTP, upgrades to a WebSocket, announces a
//! position and a chat line, then prints whatever the server pushes for a
//! few seconds. Useful for poking at a running server by hand:
//!
//! ```bash
//! RUST_LOG=info cargo run --bin test_client -- --player alice
//! ```

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server host:port
    #[clap(short, long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Player id to present as the token
    #[clap(short, long, default_value = "test-player")]
    player: String,

    /// Optional room code to join instead of the main room
    #[clap(short, long)]
    room: Option<String>,

    /// How long to listen for pushed frames, in seconds
    #[clap(short, long, default_value = "10")]
    listen_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let http = reqwest::Client::new();

    // Join before upgrading; the upgrade only attaches a transport.
    let join_url = match &args.room {
        Some(_) => format!("http://{}/player/join-specific-room", args.server),
        None => format!("http://{}/player/join-room", args.server),
    };
    let mut request = http
        .post(&join_url)
        .header("Authorization", &args.player);
    if let Some(room) = &args.room {
        request = request.json(&json!({ "room_id": room }));
    }
    let response = request.send().await?;
    let status = response.status();
    let body = response.text().await?;
    println!("join -> {} {}", status, body);
    if !status.is_success() {
        return Err(format!("join failed: {}", body).into());
    }

    let ws_url = format!("ws://{}/player/ws?token={}", args.server, args.player);
    let (mut socket, _) = connect_async(&ws_url).await?;
    println!("connected to {}", ws_url);

    let position = json!({
        "type": "position_update",
        "position": { "x": 1.0, "y": 2.0 },
        "username": args.player,
    });
    socket.send(Message::Text(position.to_string())).await?;

    let chat = json!({
        "type": "chat_message",
        "text": "hello from test_client",
        "username": args.player,
    });
    socket.send(Message::Text(chat.to_string())).await?;

    let deadline = tokio::time::sleep(Duration::from_secs(args.listen_secs));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            frame = socket.next() => match frame {
                Some(Ok(Message::Text(text))) => println!("recv: {}", text),
                Some(Ok(Message::Ping(_))) => println!("recv: ping"),
                Some(Ok(Message::Close(_))) | None => {
                    println!("server closed the connection");
                    return Ok(());
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    println!("read error: {}", err);
                    return Ok(());
                }
            },
        }
    }

    socket
        .send(Message::Text(json!({ "type": "leave_room" }).to_string()))
        .await?;
    println!("left the room");
    Ok(())
}

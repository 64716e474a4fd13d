//! Server entry point: configuration, wiring, and graceful shutdown.

use clap::Parser;
use log::{error, info};
use server::{config::Config, routes, AppState};
use tokio::net::TcpListener;

/// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server IP address to bind to
    #[clap(short = 'H', long, default_value = "0.0.0.0")]
    host: String,

    /// Server port to listen on (PORT env wins over the default)
    #[clap(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Warning: RUST_LOG environment variable not set. Set it to display logs!");
        eprintln!("Recommended: RUST_LOG=info cargo run");
    }

    let args = Args::parse();
    let config = Config::from_env();
    let port = args.port.unwrap_or(config.port);
    let addr = format!("{}:{}", args.host, port);

    let state = AppState::new(config.database_url.clone());
    state.registry.start_sweepers().await;

    let registry = state.registry.clone();
    let persistence = state.persistence.clone();

    let app = routes::app(state);
    let listener = TcpListener::bind(&addr).await?;
    info!("Server starting on {}", addr);

    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("Server error: {}", err);
    }

    info!("Shutting down server...");
    registry.shutdown().await;
    persistence.shutdown().await;
    info!("Graceful shutdown completed");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", err);
    }
}

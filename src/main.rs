//! Messenger Server - Entry Point
//!
//! Starts the ChatServer actor, the WebSocket listener and the HTTP listener.

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use messenger_server::{build_router, handle_connection, ChatServer, Config, HttpState, MessageStore};

/// Channel buffer size for server commands
const CHANNEL_BUFFER_SIZE: usize = 256;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Use RUST_LOG to override, e.g. RUST_LOG=messenger_server=debug
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("messenger_server=info")),
        )
        .init();

    let config = Config::parse();

    let (cmd_tx, cmd_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
    let server = ChatServer::new(cmd_rx, MessageStore::new(config.profile.capacity()));
    tokio::spawn(server.run());

    info!(
        "ChatServer actor started ({:?} profile, {} messages per conversation)",
        config.profile,
        config.profile.capacity()
    );

    if !config.no_http {
        let http_listener = TcpListener::bind(config.http_addr).await?;
        info!("HTTP API listening on {}", config.http_addr);

        let router = build_router(HttpState {
            cmd_tx: cmd_tx.clone(),
            poll_timeout: config.poll_timeout(),
        });
        tokio::spawn(async move {
            if let Err(e) = axum::serve(http_listener, router).await {
                error!("HTTP server error: {}", e);
            }
        });
    }

    let listener = TcpListener::bind(config.ws_addr).await?;
    info!("WebSocket server listening on {}", config.ws_addr);

    // Connection accept loop
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("New connection from {}", addr);
                let cmd_tx = cmd_tx.clone();

                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, cmd_tx).await {
                        error!("Connection handler error: {}", e);
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

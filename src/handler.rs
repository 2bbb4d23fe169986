//! WebSocket connection handler
//!
//! Handles individual client connections: WebSocket handshake,
//! event parsing, and bidirectional communication with the ChatServer.

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::error::AppError;
use crate::message::{ClientMessage, ServerMessage};
use crate::server::ServerCommand;
use crate::types::ConnectionId;

/// Outbound buffer per connection; events beyond this are dropped
const OUTBOUND_BUFFER_SIZE: usize = 64;

/// Handle a new TCP connection
///
/// Performs WebSocket handshake, sets up bidirectional communication,
/// and manages the connection lifecycle.
pub async fn handle_connection(
    stream: TcpStream,
    cmd_tx: mpsc::Sender<ServerCommand>,
) -> Result<(), AppError> {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    debug!("New TCP connection from {}", peer_addr);

    // WebSocket handshake
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let connection_id = ConnectionId::new();
    info!("Connection {} established from {}", connection_id, peer_addr);

    // Server -> client events
    let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_BUFFER_SIZE);

    if cmd_tx
        .send(ServerCommand::Connect {
            connection_id,
            sender: msg_tx.clone(),
        })
        .await
        .is_err()
    {
        error!("Failed to register {} - server closed", connection_id);
        return Err(AppError::ChannelSend);
    }

    let connected = ServerMessage::Connected { connection_id };
    let json = serde_json::to_string(&connected)?;
    ws_sender.send(Message::Text(json.into())).await?;

    let cmd_tx_read = cmd_tx.clone();

    // Read task (WebSocket -> ServerCommand)
    let read_task = tokio::spawn(async move {
        while let Some(msg_result) = ws_receiver.next().await {
            match msg_result {
                Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(client_msg) => {
                        let cmd = client_message_to_command(connection_id, client_msg);
                        if cmd_tx_read.send(cmd).await.is_err() {
                            debug!("Server closed, ending read task for {}", connection_id);
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Invalid event from {}: {}", connection_id, e);
                        // Malformed frames only affect the sender
                        let _ = msg_tx.try_send(AppError::Json(e).into());
                    }
                },
                Ok(Message::Close(_)) => {
                    debug!("Connection {} sent close frame", connection_id);
                    break;
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                    // Pong replies are handled by tungstenite
                }
                Ok(_) => {
                    // Binary frames are not part of the protocol
                }
                Err(e) => {
                    error!("WebSocket error for {}: {}", connection_id, e);
                    break;
                }
            }
        }
        debug!("Read task ended for {}", connection_id);
    });

    // Write task (ServerMessage -> WebSocket)
    let write_task = tokio::spawn(async move {
        while let Some(msg) = msg_rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json.into())).await.is_err() {
                        debug!("WebSocket send failed, ending write task");
                        break;
                    }
                }
                Err(e) => {
                    error!("Failed to serialize event: {}", e);
                }
            }
        }
        debug!("Write task ended for {}", connection_id);

        let _ = ws_sender.close().await;
    });

    // Wait for either task to complete
    tokio::select! {
        _ = read_task => {
            debug!("Read task completed for {}", connection_id);
        }
        _ = write_task => {
            debug!("Write task completed for {}", connection_id);
        }
    }

    let _ = cmd_tx
        .send(ServerCommand::Disconnect { connection_id })
        .await;

    info!("Connection {} closed", connection_id);

    Ok(())
}

/// Convert a ClientMessage to a ServerCommand
pub(crate) fn client_message_to_command(
    connection_id: ConnectionId,
    msg: ClientMessage,
) -> ServerCommand {
    match msg {
        ClientMessage::Authenticate {
            username,
            password,
            is_new_user,
            user,
        } => ServerCommand::Authenticate {
            connection_id,
            username,
            password,
            is_new_user,
            user,
        },
        ClientMessage::ChangePassword {
            current_password,
            new_password,
        } => ServerCommand::ChangePassword {
            connection_id,
            current_password,
            new_password,
        },
        ClientMessage::Join { conversation_id } => ServerCommand::Join {
            connection_id,
            conversation_id,
        },
        ClientMessage::JoinByInvite { invite_code } => ServerCommand::JoinByInvite {
            connection_id,
            invite_code,
        },
        ClientMessage::Leave { conversation_id } => ServerCommand::Leave {
            connection_id,
            conversation_id,
        },
        ClientMessage::CreateConversation { name, kind } => ServerCommand::CreateConversation {
            connection_id,
            name,
            kind,
        },
        ClientMessage::Send {
            conversation_id,
            content,
            kind,
        } => ServerCommand::Send {
            connection_id,
            conversation_id,
            content,
            kind,
        },
        ClientMessage::SendPrivate {
            recipient_id,
            content,
        } => ServerCommand::SendPrivate {
            connection_id,
            recipient_id,
            content,
        },
        ClientMessage::PrivateHistory { user_id } => ServerCommand::PrivateHistory {
            connection_id,
            user_id,
        },
        ClientMessage::Clear { conversation_id } => ServerCommand::Clear {
            connection_id,
            conversation_id,
        },
        ClientMessage::ListConversations => ServerCommand::ListConversations { connection_id },
        ClientMessage::Logout => ServerCommand::Logout { connection_id },
    }
}

//! Client struct definition
//!
//! Represents one live transport connection and its outbound channel.
//! Who the connection belongs to is tracked by the session registry.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::error::SendError;
use crate::message::ServerMessage;
use crate::types::ConnectionId;

/// Connected client information
#[derive(Debug)]
pub struct Client {
    /// Unique identifier for this connection
    pub id: ConnectionId,
    /// Server → Client message channel
    pub sender: mpsc::Sender<ServerMessage>,
}

impl Client {
    /// Create a new client with the given ID and sender channel
    pub fn new(id: ConnectionId, sender: mpsc::Sender<ServerMessage>) -> Self {
        Self { id, sender }
    }

    /// Queue a message for this client without waiting
    ///
    /// Returns an error if the channel is closed (client disconnected)
    /// or its buffer is full.
    pub fn send(&self, msg: ServerMessage) -> Result<(), SendError> {
        self.sender.try_send(msg).map_err(|e| match e {
            TrySendError::Full(_) => SendError::ChannelFull,
            TrySendError::Closed(_) => SendError::ChannelClosed,
        })
    }
}

//! Real-time Messenger Server Library
//!
//! A conversation server built with tokio-tungstenite and axum, using the
//! Actor pattern for state management.
//!
//! # Features
//! - Registration and login with salted PBKDF2 password hashes
//! - Public conversations and invite-gated private conversations
//! - Broadcast messages, direct messages and live participant presence
//! - Bounded per-conversation history
//! - REST endpoints with an HTTP long-poll fallback
//!
//! # Architecture
//! Uses the Actor pattern with `mpsc` channels:
//! - `ChatServer` is the central actor managing all state
//! - Each WebSocket connection has a `handler` task communicating with the server
//! - HTTP routes send commands carrying a `oneshot` reply
//! - No locks needed - all state access goes through message passing
//!
//! # Example
//! ```ignore
//! use tokio::net::TcpListener;
//! use tokio::sync::mpsc;
//! use messenger_server::{handle_connection, ChatServer, MessageStore, LIVE_FEED_CAPACITY};
//!
//! #[tokio::main]
//! async fn main() {
//!     let listener = TcpListener::bind("127.0.0.1:3001").await.unwrap();
//!     let (cmd_tx, cmd_rx) = mpsc::channel(256);
//!
//!     tokio::spawn(ChatServer::new(cmd_rx, MessageStore::new(LIVE_FEED_CAPACITY)).run());
//!
//!     while let Ok((stream, _)) = listener.accept().await {
//!         let cmd_tx = cmd_tx.clone();
//!         tokio::spawn(handle_connection(stream, cmd_tx));
//!     }
//! }
//! ```

pub mod client;
pub mod config;
pub mod conversation;
pub mod credentials;
pub mod error;
pub mod handler;
pub mod http;
pub mod message;
pub mod poll;
pub mod room;
pub mod server;
pub mod session;
pub mod store;
pub mod types;

// Re-export main types for convenience
pub use client::Client;
pub use config::{Config, Profile};
pub use conversation::{Conversation, ConversationKind, ConversationRegistry};
pub use credentials::CredentialStore;
pub use error::{AppError, CredentialError, SendError};
pub use handler::handle_connection;
pub use http::{build_router, HttpState};
pub use message::{ClientMessage, ErrorCode, ServerMessage};
pub use poll::LongPollBridge;
pub use room::Rooms;
pub use server::{ChatServer, ServerCommand, ServerStats};
pub use session::{SessionRegistry, User};
pub use store::{Message, MessageKind, MessageStore, LIVE_FEED_CAPACITY, REST_FEED_CAPACITY};
pub use types::{ConnectionId, ConversationId, InviteCode, PairKey, UserId};

//! ChatServer Actor implementation
//!
//! The central actor that owns all state: connections, sessions, credentials,
//! conversations, message logs, broadcast groups and parked long-polls.
//! Uses the Actor pattern with mpsc channels for message passing, so every
//! intent is handled to completion before the next one starts.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::client::Client;
use crate::conversation::{ConversationKind, ConversationRegistry};
use crate::credentials::CredentialStore;
use crate::error::{AppError, CredentialError};
use crate::message::{ServerMessage, UserPayload};
use crate::poll::{LongPollBridge, PollReply};
use crate::room::Rooms;
use crate::session::{SessionRegistry, User};
use crate::store::{Message, MessageKind, MessageStore, JOIN_HISTORY_LIMIT};
use crate::types::{ConnectionId, ConversationId, InviteCode, PairKey, UserId};

/// Commands sent from connection handlers and HTTP routes to the ChatServer actor
#[derive(Debug)]
pub enum ServerCommand {
    /// New transport connection
    Connect {
        connection_id: ConnectionId,
        sender: mpsc::Sender<ServerMessage>,
    },
    /// Transport connection closed
    Disconnect { connection_id: ConnectionId },
    /// Log in or register
    Authenticate {
        connection_id: ConnectionId,
        username: String,
        password: String,
        is_new_user: bool,
        user: Option<UserPayload>,
    },
    ChangePassword {
        connection_id: ConnectionId,
        current_password: String,
        new_password: String,
    },
    Join {
        connection_id: ConnectionId,
        conversation_id: ConversationId,
    },
    JoinByInvite {
        connection_id: ConnectionId,
        invite_code: String,
    },
    Leave {
        connection_id: ConnectionId,
        conversation_id: ConversationId,
    },
    CreateConversation {
        connection_id: ConnectionId,
        name: String,
        kind: ConversationKind,
    },
    /// Post to a conversation
    Send {
        connection_id: ConnectionId,
        conversation_id: ConversationId,
        content: String,
        kind: MessageKind,
    },
    /// Direct message to one user
    SendPrivate {
        connection_id: ConnectionId,
        recipient_id: UserId,
        content: String,
    },
    PrivateHistory {
        connection_id: ConnectionId,
        user_id: UserId,
    },
    Clear {
        connection_id: ConnectionId,
        conversation_id: ConversationId,
    },
    ListConversations { connection_id: ConnectionId },
    Logout { connection_id: ConnectionId },
    /// REST: stored messages, all or newer than `since`
    FetchMessages {
        conversation_id: ConversationId,
        since: Option<DateTime<Utc>>,
        reply: oneshot::Sender<Result<Vec<Message>, AppError>>,
    },
    /// REST: post a message on behalf of a user
    PostMessage {
        conversation_id: ConversationId,
        user_id: UserId,
        username: String,
        text: String,
        reply: oneshot::Sender<Result<Message, AppError>>,
    },
    /// REST: answer now if newer messages exist, otherwise park
    Poll {
        conversation_id: ConversationId,
        since: Option<DateTime<Utc>>,
        reply: PollReply,
    },
    /// REST: online users
    ListUsers { reply: oneshot::Sender<Vec<User>> },
    /// REST: counters for the health endpoint
    Stats { reply: oneshot::Sender<ServerStats> },
}

/// Live counters reported by the health endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerStats {
    pub users: usize,
    pub conversations: usize,
}

/// The main ChatServer actor
///
/// Owns every registry and processes commands one at a time.
pub struct ChatServer {
    /// All live transport connections: ConnectionId -> Client
    clients: HashMap<ConnectionId, Client>,
    credentials: CredentialStore,
    sessions: SessionRegistry,
    conversations: ConversationRegistry,
    store: MessageStore,
    /// Broadcast groups: ConversationId -> subscribed connections
    rooms: Rooms,
    polls: LongPollBridge,
    /// Command receiver channel
    receiver: mpsc::Receiver<ServerCommand>,
}

impl ChatServer {
    /// Create a ChatServer with fresh registries and the given message store
    pub fn new(receiver: mpsc::Receiver<ServerCommand>, mut store: MessageStore) -> Self {
        store.open(&ConversationId::public());

        Self {
            clients: HashMap::new(),
            credentials: CredentialStore::new(),
            sessions: SessionRegistry::new(),
            conversations: ConversationRegistry::new(),
            store,
            rooms: Rooms::new(),
            polls: LongPollBridge::new(),
            receiver,
        }
    }

    /// Run the ChatServer event loop
    ///
    /// Continuously receives and processes commands until all senders are dropped.
    pub async fn run(mut self) {
        info!("ChatServer started");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        info!("ChatServer shutting down");
    }

    /// Process a single command
    fn handle_command(&mut self, cmd: ServerCommand) {
        match cmd {
            ServerCommand::Connect {
                connection_id,
                sender,
            } => self.handle_connect(connection_id, sender),
            ServerCommand::Disconnect { connection_id } => self.handle_disconnect(connection_id),
            ServerCommand::Authenticate {
                connection_id,
                username,
                password,
                is_new_user,
                user,
            } => self.handle_authenticate(connection_id, username, password, is_new_user, user),
            ServerCommand::ChangePassword {
                connection_id,
                current_password,
                new_password,
            } => {
                let result =
                    self.handle_change_password(connection_id, &current_password, &new_password);
                self.reply_error(connection_id, result);
            }
            ServerCommand::Join {
                connection_id,
                conversation_id,
            } => {
                let result = self.handle_join(connection_id, conversation_id);
                self.reply_error(connection_id, result);
            }
            ServerCommand::JoinByInvite {
                connection_id,
                invite_code,
            } => {
                let result = self.handle_join_by_invite(connection_id, &invite_code);
                self.reply_error(connection_id, result);
            }
            ServerCommand::Leave {
                connection_id,
                conversation_id,
            } => {
                let result = self.handle_leave(connection_id, &conversation_id);
                self.reply_error(connection_id, result);
            }
            ServerCommand::CreateConversation {
                connection_id,
                name,
                kind,
            } => {
                let result = self.handle_create_conversation(connection_id, name, kind);
                self.reply_error(connection_id, result);
            }
            ServerCommand::Send {
                connection_id,
                conversation_id,
                content,
                kind,
            } => {
                let result = self.handle_send(connection_id, conversation_id, content, kind);
                self.reply_error(connection_id, result);
            }
            ServerCommand::SendPrivate {
                connection_id,
                recipient_id,
                content,
            } => {
                let result = self.handle_send_private(connection_id, recipient_id, content);
                self.reply_error(connection_id, result);
            }
            ServerCommand::PrivateHistory {
                connection_id,
                user_id,
            } => {
                let result = self.handle_private_history(connection_id, &user_id);
                self.reply_error(connection_id, result);
            }
            ServerCommand::Clear {
                connection_id,
                conversation_id,
            } => {
                let result = self.handle_clear(connection_id, &conversation_id);
                self.reply_error(connection_id, result);
            }
            ServerCommand::ListConversations { connection_id } => {
                let result = self.handle_list_conversations(connection_id);
                self.reply_error(connection_id, result);
            }
            ServerCommand::Logout { connection_id } => {
                let result = self.handle_logout(connection_id);
                self.reply_error(connection_id, result);
            }
            ServerCommand::FetchMessages {
                conversation_id,
                since,
                reply,
            } => {
                let _ = reply.send(self.fetch_messages(&conversation_id, since));
            }
            ServerCommand::PostMessage {
                conversation_id,
                user_id,
                username,
                text,
                reply,
            } => {
                let _ = reply.send(self.post_message(conversation_id, user_id, username, text));
            }
            ServerCommand::Poll {
                conversation_id,
                since,
                reply,
            } => self.handle_poll(conversation_id, since, reply),
            ServerCommand::ListUsers { reply } => {
                let _ = reply.send(self.sessions.online_users());
            }
            ServerCommand::Stats { reply } => {
                let _ = reply.send(ServerStats {
                    users: self.sessions.len(),
                    conversations: self.conversations.len(),
                });
            }
        }
    }

    /// Handle new client connection
    fn handle_connect(&mut self, connection_id: ConnectionId, sender: mpsc::Sender<ServerMessage>) {
        info!("Connection {} opened", connection_id);
        self.clients
            .insert(connection_id, Client::new(connection_id, sender));
        debug!(
            "Total connections: {}, Total conversations: {}",
            self.clients.len(),
            self.conversations.len()
        );
    }

    /// Handle transport disconnection
    ///
    /// Membership is kept; the user just drops out of every participant list.
    fn handle_disconnect(&mut self, connection_id: ConnectionId) {
        info!("Connection {} closed", connection_id);

        self.clients.remove(&connection_id);
        self.rooms.unsubscribe_all(connection_id);

        if let Some(user) = self.sessions.unbind(connection_id) {
            for conversation_id in self.conversations.conversations_of(&user.id) {
                self.broadcast_participants(&conversation_id);
            }
        }

        debug!(
            "Total connections: {}, Online users: {}",
            self.clients.len(),
            self.sessions.len()
        );
    }

    /// Handle login / registration
    fn handle_authenticate(
        &mut self,
        connection_id: ConnectionId,
        username: String,
        password: String,
        is_new_user: bool,
        user: Option<UserPayload>,
    ) {
        if self.sessions.authenticated(connection_id).is_some() {
            self.deliver(
                connection_id,
                ServerMessage::AuthFailed {
                    message: "Already authenticated".to_string(),
                },
            );
            return;
        }

        let username = username.trim().to_string();
        if username.is_empty() || password.is_empty() {
            self.deliver(
                connection_id,
                ServerMessage::AuthFailed {
                    message: "Username and password are required".to_string(),
                },
            );
            return;
        }

        let UserPayload { id, email } = user.unwrap_or_default();

        // A supplied id must not belong to another account
        if let Some(claimed) = &id {
            if let Some(owner) = self.credentials.owner_of(claimed) {
                if owner != username {
                    warn!(
                        "Connection {} ('{}') claimed user id {} of another account",
                        connection_id, username, claimed
                    );
                    self.deliver(
                        connection_id,
                        ServerMessage::AuthFailed {
                            message: CredentialError::IdentityTaken.to_string(),
                        },
                    );
                    return;
                }
            }
        }

        let outcome = if is_new_user {
            let user_id = id.unwrap_or_else(UserId::generate);
            self.credentials
                .register(&username, &password, user_id.clone())
                .map(|()| user_id)
                .map_err(|e| e.to_string())
        } else {
            self.credentials
                .login(&username, &password)
                .cloned()
                .ok_or_else(|| "Invalid username or password".to_string())
        };

        let user_id = match outcome {
            Ok(user_id) => user_id,
            Err(message) => {
                info!("Authentication failed for '{}' on {}", username, connection_id);
                self.deliver(connection_id, ServerMessage::AuthFailed { message });
                return;
            }
        };

        let user = User::authenticated(user_id, username, email);
        info!(
            "Connection {} authenticated as '{}' ({})",
            connection_id, user.username, user.id
        );

        self.sessions.bind(connection_id, user.clone());
        self.deliver(connection_id, ServerMessage::AuthSuccess { user });
    }

    /// Handle password rotation
    fn handle_change_password(
        &mut self,
        connection_id: ConnectionId,
        current_password: &str,
        new_password: &str,
    ) -> Result<(), AppError> {
        let user = self.require_user(connection_id)?;

        let reply = if new_password.is_empty() {
            ServerMessage::PasswordChangeFailed {
                message: "New password is required".to_string(),
            }
        } else {
            match self
                .credentials
                .change_password(&user.username, current_password, new_password)
            {
                Ok(()) => {
                    info!("User '{}' changed password", user.username);
                    ServerMessage::PasswordChanged
                }
                Err(e) => ServerMessage::PasswordChangeFailed {
                    message: e.to_string(),
                },
            }
        };

        self.deliver(connection_id, reply);
        Ok(())
    }

    /// Handle conversation joining
    fn handle_join(
        &mut self,
        connection_id: ConnectionId,
        conversation_id: ConversationId,
    ) -> Result<(), AppError> {
        let user = self.require_user(connection_id)?;
        self.conversations.get_or_fail(&conversation_id)?;

        self.conversations
            .add_participant(&conversation_id, &user.id);
        self.rooms.subscribe(&conversation_id, connection_id);
        self.store.open(&conversation_id);

        info!("User '{}' joined conversation {}", user.username, conversation_id);

        let conversation = self.conversations.get_or_fail(&conversation_id)?.clone();
        let messages = self.store.history(&conversation_id, JOIN_HISTORY_LIMIT);
        self.deliver(
            connection_id,
            ServerMessage::ConversationHistory {
                conversation,
                messages,
            },
        );

        self.broadcast_participants(&conversation_id);
        self.publish(Message::system(
            conversation_id,
            format!("{} joined the conversation", user.username),
        ));
        Ok(())
    }

    /// Handle joining through an invite code
    fn handle_join_by_invite(
        &mut self,
        connection_id: ConnectionId,
        invite_code: &str,
    ) -> Result<(), AppError> {
        self.require_user(connection_id)?;

        let code = InviteCode::from_string(invite_code);
        let conversation_id = self
            .conversations
            .find_by_invite_code(&code)
            .map(|c| c.id.clone())
            .ok_or_else(|| AppError::InvalidInviteCode(code.to_string()))?;

        self.handle_join(connection_id, conversation_id)
    }

    /// Handle voluntary leaving of one conversation
    fn handle_leave(
        &mut self,
        connection_id: ConnectionId,
        conversation_id: &ConversationId,
    ) -> Result<(), AppError> {
        let user = self.require_user(connection_id)?;

        self.rooms.unsubscribe(conversation_id, connection_id);
        if !self.conversations.remove_participant(conversation_id, &user.id) {
            return Ok(());
        }

        info!("User '{}' left conversation {}", user.username, conversation_id);

        self.publish(Message::system(
            conversation_id.clone(),
            format!("{} left the conversation", user.username),
        ));
        self.broadcast_participants(conversation_id);
        Ok(())
    }

    /// Handle conversation creation
    fn handle_create_conversation(
        &mut self,
        connection_id: ConnectionId,
        name: String,
        kind: ConversationKind,
    ) -> Result<(), AppError> {
        let user = self.require_user(connection_id)?;

        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(AppError::Validation(
                "Conversation name is required".to_string(),
            ));
        }

        let conversation = self.conversations.create(name, kind, user.id).clone();
        self.store.open(&conversation.id);
        self.rooms.subscribe(&conversation.id, connection_id);

        info!(
            "Conversation '{}' ({}) created by '{}'",
            conversation.name, conversation.id, user.username
        );

        self.deliver(connection_id, ServerMessage::Created(conversation));
        Ok(())
    }

    /// Handle a message to a conversation
    ///
    /// Unknown conversations and non-participants are dropped silently.
    fn handle_send(
        &mut self,
        connection_id: ConnectionId,
        conversation_id: ConversationId,
        content: String,
        kind: MessageKind,
    ) -> Result<(), AppError> {
        let user = self.require_user(connection_id)?;

        if content.trim().is_empty() {
            return Err(AppError::Validation(
                "Message content is required".to_string(),
            ));
        }

        let Some(conversation) = self.conversations.get(&conversation_id) else {
            debug!("Dropping message to unknown conversation {}", conversation_id);
            return Ok(());
        };
        if !conversation.has_participant(&user.id) {
            debug!(
                "Dropping message from '{}' to {} (not a participant)",
                user.username, conversation_id
            );
            return Ok(());
        }

        // system and private are server-assigned
        let kind = match kind {
            MessageKind::Emoji => MessageKind::Emoji,
            _ => MessageKind::Text,
        };

        self.publish(Message::new(
            conversation_id,
            user.id,
            user.username,
            content,
            kind,
        ));
        Ok(())
    }

    /// Handle a direct message
    fn handle_send_private(
        &mut self,
        connection_id: ConnectionId,
        recipient_id: UserId,
        content: String,
    ) -> Result<(), AppError> {
        let sender = self.require_user(connection_id)?;

        if content.trim().is_empty() {
            return Err(AppError::Validation(
                "Message content is required".to_string(),
            ));
        }

        let key = PairKey::new(&sender.id, &recipient_id);
        let message = Message::private(sender.id, sender.username.clone(), recipient_id.clone(), content);
        self.store.append_private(&key, message.clone());

        self.deliver(connection_id, ServerMessage::NewPrivateMessage(message.clone()));
        if let Some(recipient_connection) = self.sessions.lookup_connection_for(&recipient_id) {
            if recipient_connection != connection_id {
                self.deliver(recipient_connection, ServerMessage::NewPrivateMessage(message));
            }
        }

        debug!("Private message from '{}' to {}", sender.username, recipient_id);
        Ok(())
    }

    /// Handle a request for a direct-message thread
    fn handle_private_history(
        &mut self,
        connection_id: ConnectionId,
        other: &UserId,
    ) -> Result<(), AppError> {
        let user = self.require_user(connection_id)?;
        let pair_key = PairKey::new(&user.id, other);
        let messages = self.store.history_private(&pair_key);
        self.deliver(
            connection_id,
            ServerMessage::PrivateHistory { pair_key, messages },
        );
        Ok(())
    }

    /// Handle clearing a conversation log
    fn handle_clear(
        &mut self,
        connection_id: ConnectionId,
        conversation_id: &ConversationId,
    ) -> Result<(), AppError> {
        let user = self.require_user(connection_id)?;

        let Some(conversation) = self.conversations.get(conversation_id) else {
            return Ok(());
        };
        if !conversation.can_clear(&user.id) {
            return Err(AppError::PermissionDenied);
        }
        if !self.store.clear(conversation_id) {
            return Ok(());
        }

        info!("Conversation {} cleared by '{}'", conversation_id, user.username);

        self.broadcast(
            conversation_id,
            ServerMessage::Cleared {
                conversation_id: conversation_id.clone(),
            },
        );
        self.publish(Message::system(
            conversation_id.clone(),
            format!("Chat cleared by {}", user.username),
        ));
        Ok(())
    }

    fn handle_list_conversations(&mut self, connection_id: ConnectionId) -> Result<(), AppError> {
        let user = self.require_user(connection_id)?;
        let list = self.conversations.list_visible_to(&user.id);
        self.deliver(connection_id, ServerMessage::ConversationList(list));
        Ok(())
    }

    /// Handle logout: leave every conversation, then drop the session
    fn handle_logout(&mut self, connection_id: ConnectionId) -> Result<(), AppError> {
        let user = self.require_user(connection_id)?;

        for conversation_id in self.conversations.conversations_of(&user.id) {
            self.conversations
                .remove_participant(&conversation_id, &user.id);
            self.publish(Message::system(
                conversation_id.clone(),
                format!("{} left the conversation", user.username),
            ));
            self.broadcast_participants(&conversation_id);
        }

        self.rooms.unsubscribe_all(connection_id);
        self.sessions.unbind(connection_id);

        info!("User '{}' logged out", user.username);
        Ok(())
    }

    fn fetch_messages(
        &self,
        conversation_id: &ConversationId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>, AppError> {
        self.conversations.get_or_fail(conversation_id)?;
        Ok(match since {
            Some(since) => self.store.since(conversation_id, since),
            None => self.store.history(conversation_id, self.store.capacity()),
        })
    }

    /// REST equivalent of `Send`: append and fan out
    fn post_message(
        &mut self,
        conversation_id: ConversationId,
        user_id: UserId,
        username: String,
        text: String,
    ) -> Result<Message, AppError> {
        self.conversations.get_or_fail(&conversation_id)?;

        let message = Message::new(conversation_id, user_id, username, text, MessageKind::Text);
        self.publish(message.clone());
        Ok(message)
    }

    fn handle_poll(
        &mut self,
        conversation_id: ConversationId,
        since: Option<DateTime<Utc>>,
        reply: PollReply,
    ) {
        if let Err(e) = self.conversations.get_or_fail(&conversation_id) {
            let _ = reply.send(Err(e));
            return;
        }

        if let Some(since) = since {
            let pending = self.store.since(&conversation_id, since);
            if !pending.is_empty() {
                let _ = reply.send(Ok(pending));
                return;
            }
        }

        self.polls.park(conversation_id, reply);
    }

    /// Helper: Authenticated user bound to a connection
    fn require_user(&self, connection_id: ConnectionId) -> Result<User, AppError> {
        self.sessions
            .authenticated(connection_id)
            .cloned()
            .ok_or(AppError::AuthenticationRequired)
    }

    /// Helper: Append to the log, fan out to the room and wake parked polls
    fn publish(&mut self, message: Message) {
        let conversation_id = message.conversation_id.clone();
        if !self.store.append(&conversation_id, message.clone()) {
            return;
        }
        self.polls.notify(&message);
        self.broadcast(&conversation_id, ServerMessage::NewMessage(message));
    }

    /// Helper: Send the online participant list to a conversation's room
    fn broadcast_participants(&self, conversation_id: &ConversationId) {
        let users = self
            .conversations
            .resolve_participant_users(conversation_id, &self.sessions);
        self.broadcast(conversation_id, ServerMessage::Participants(users));
    }

    /// Helper: Deliver to every connection subscribed to a conversation
    fn broadcast(&self, conversation_id: &ConversationId, msg: ServerMessage) {
        for connection_id in self.rooms.members(conversation_id) {
            self.deliver(connection_id, msg.clone());
        }
    }

    /// Helper: Deliver to a single connection
    fn deliver(&self, connection_id: ConnectionId, msg: ServerMessage) {
        let Some(client) = self.clients.get(&connection_id) else {
            return;
        };
        if let Err(e) = client.send(msg) {
            warn!("Dropped event for {}: {}", client.id, e);
        }
    }

    /// Helper: Report a failed intent to its caller only
    fn reply_error(&self, connection_id: ConnectionId, result: Result<(), AppError>) {
        if let Err(err) = result {
            debug!("Intent from {} rejected: {}", connection_id, err);
            self.deliver(connection_id, err.into());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LIVE_FEED_CAPACITY;
    use crate::message::ErrorCode;

    fn server() -> ChatServer {
        let (_tx, rx) = mpsc::channel(8);
        ChatServer::new(rx, MessageStore::new(LIVE_FEED_CAPACITY))
    }

    fn connect(server: &mut ChatServer) -> (ConnectionId, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(256);
        let connection_id = ConnectionId::new();
        server.handle_command(ServerCommand::Connect {
            connection_id,
            sender: tx,
        });
        (connection_id, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn authenticate(
        server: &mut ChatServer,
        connection_id: ConnectionId,
        name: &str,
        password: &str,
        is_new_user: bool,
    ) {
        server.handle_command(ServerCommand::Authenticate {
            connection_id,
            username: name.to_string(),
            password: password.to_string(),
            is_new_user,
            user: Some(UserPayload {
                id: Some(UserId::from(name)),
                email: None,
            }),
        });
    }

    /// Connect, register and drain the auth reply
    fn sign_up(server: &mut ChatServer, name: &str) -> (ConnectionId, mpsc::Receiver<ServerMessage>) {
        let (connection_id, mut rx) = connect(server);
        authenticate(server, connection_id, name, "secret", true);
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [ServerMessage::AuthSuccess { .. }]
        ));
        (connection_id, rx)
    }

    fn join(server: &mut ChatServer, connection_id: ConnectionId, conversation_id: &ConversationId) {
        server.handle_command(ServerCommand::Join {
            connection_id,
            conversation_id: conversation_id.clone(),
        });
    }

    fn send(server: &mut ChatServer, connection_id: ConnectionId, conversation_id: &ConversationId, content: &str) {
        server.handle_command(ServerCommand::Send {
            connection_id,
            conversation_id: conversation_id.clone(),
            content: content.to_string(),
            kind: MessageKind::Text,
        });
    }

    fn new_messages(events: &[ServerMessage]) -> Vec<&Message> {
        events
            .iter()
            .filter_map(|e| match e {
                ServerMessage::NewMessage(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    fn last_participants(events: &[ServerMessage]) -> Vec<String> {
        events
            .iter()
            .rev()
            .find_map(|e| match e {
                ServerMessage::Participants(users) => {
                    Some(users.iter().map(|u| u.username.clone()).collect())
                }
                _ => None,
            })
            .unwrap_or_default()
    }

    #[test]
    fn test_register_logout_login() {
        let mut server = server();
        let (conn, mut rx) = sign_up(&mut server, "alice");

        server.handle_command(ServerCommand::Logout { connection_id: conn });
        drain(&mut rx);
        assert!(server.sessions.authenticated(conn).is_none());

        authenticate(&mut server, conn, "alice", "secret", false);
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [ServerMessage::AuthSuccess { .. }]
        ));

        let (other, mut other_rx) = connect(&mut server);
        authenticate(&mut server, other, "alice", "wrong", false);
        assert!(matches!(
            drain(&mut other_rx).as_slice(),
            [ServerMessage::AuthFailed { .. }]
        ));
        assert!(server.sessions.authenticated(other).is_none());
    }

    #[test]
    fn test_register_taken_username() {
        let mut server = server();
        sign_up(&mut server, "alice");

        let (conn, mut rx) = connect(&mut server);
        authenticate(&mut server, conn, "alice", "other", true);
        match drain(&mut rx).as_slice() {
            [ServerMessage::AuthFailed { message }] => assert_eq!(message, "Username already taken"),
            other => panic!("unexpected events: {:?}", other),
        }
    }

    #[test]
    fn test_reauthenticate_rejected() {
        let mut server = server();
        let (conn, mut rx) = sign_up(&mut server, "alice");

        authenticate(&mut server, conn, "alice", "secret", false);
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [ServerMessage::AuthFailed { .. }]
        ));
    }

    #[test]
    fn test_claiming_another_accounts_id_is_refused() {
        let mut server = server();
        let (alice, mut alice_rx) = sign_up(&mut server, "alice");
        server.handle_command(ServerCommand::CreateConversation {
            connection_id: alice,
            name: "Secret".to_string(),
            kind: ConversationKind::Private,
        });
        let secret = match drain(&mut alice_rx).as_slice() {
            [ServerMessage::Created(c)] => c.clone(),
            other => panic!("unexpected events: {:?}", other),
        };

        // Registering under alice's id
        let (mallory, mut mallory_rx) = connect(&mut server);
        server.handle_command(ServerCommand::Authenticate {
            connection_id: mallory,
            username: "mallory".to_string(),
            password: "secret".to_string(),
            is_new_user: true,
            user: Some(UserPayload {
                id: Some(UserId::from("alice")),
                email: None,
            }),
        });
        match drain(&mut mallory_rx).as_slice() {
            [ServerMessage::AuthFailed { message }] => {
                assert_eq!(message, "User id belongs to another account")
            }
            other => panic!("unexpected events: {:?}", other),
        }
        assert!(server.sessions.authenticated(mallory).is_none());
        assert!(!server.credentials.contains("mallory"));

        // Logging in to an own account while claiming alice's id
        authenticate(&mut server, mallory, "mallory", "pw", true);
        drain(&mut mallory_rx);
        server.handle_command(ServerCommand::Logout { connection_id: mallory });
        server.handle_command(ServerCommand::Authenticate {
            connection_id: mallory,
            username: "mallory".to_string(),
            password: "pw".to_string(),
            is_new_user: false,
            user: Some(UserPayload {
                id: Some(UserId::from("alice")),
                email: None,
            }),
        });
        assert!(matches!(
            drain(&mut mallory_rx).as_slice(),
            [ServerMessage::AuthFailed { .. }]
        ));

        // alice keeps her conversation and her direct messages
        assert_eq!(
            server.sessions.lookup_connection_for(&UserId::from("alice")),
            Some(alice)
        );
        assert!(!server.conversations.get(&secret.id).unwrap().has_participant(&UserId::from("mallory")));
    }

    #[test]
    fn test_login_uses_registered_id() {
        let mut server = server();
        let (alice, mut rx) = sign_up(&mut server, "alice");
        server.handle_command(ServerCommand::Logout { connection_id: alice });

        // Login without an id, or with an unused one, gets the registered id
        server.handle_command(ServerCommand::Authenticate {
            connection_id: alice,
            username: "alice".to_string(),
            password: "secret".to_string(),
            is_new_user: false,
            user: Some(UserPayload {
                id: Some(UserId::from("fresh-browser-id")),
                email: None,
            }),
        });
        match drain(&mut rx).as_slice() {
            [ServerMessage::AuthSuccess { user }] => assert_eq!(user.id, UserId::from("alice")),
            other => panic!("unexpected events: {:?}", other),
        }
    }

    #[test]
    fn test_unauthenticated_join_fails() {
        let mut server = server();
        let (conn, mut rx) = connect(&mut server);

        join(&mut server, conn, &ConversationId::public());
        match drain(&mut rx).as_slice() {
            [ServerMessage::Error { code, .. }] => {
                assert_eq!(*code, ErrorCode::AuthenticationRequired)
            }
            other => panic!("unexpected events: {:?}", other),
        }
        assert!(server
            .conversations
            .get(&ConversationId::public())
            .unwrap()
            .participants
            .is_empty());
    }

    #[test]
    fn test_join_sends_history_participants_and_notice() {
        let mut server = server();
        let public = ConversationId::public();
        let (alice, mut alice_rx) = sign_up(&mut server, "alice");

        join(&mut server, alice, &public);
        let events = drain(&mut alice_rx);

        assert!(matches!(&events[0], ServerMessage::ConversationHistory { messages, .. } if messages.is_empty()));
        assert_eq!(last_participants(&events), vec!["alice"]);
        let notices = new_messages(&events);
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].content, "alice joined the conversation");
        assert_eq!(notices[0].kind, MessageKind::System);
    }

    #[test]
    fn test_join_unknown_conversation() {
        let mut server = server();
        let (alice, mut rx) = sign_up(&mut server, "alice");

        join(&mut server, alice, &ConversationId::from("nope"));
        match drain(&mut rx).as_slice() {
            [ServerMessage::Error { message, .. }] => assert_eq!(message, "Conversation not found"),
            other => panic!("unexpected events: {:?}", other),
        }
    }

    #[test]
    fn test_join_twice_keeps_membership() {
        let mut server = server();
        let public = ConversationId::public();
        let (alice, _rx) = sign_up(&mut server, "alice");

        join(&mut server, alice, &public);
        join(&mut server, alice, &public);

        assert_eq!(server.conversations.get(&public).unwrap().participants.len(), 1);
    }

    #[test]
    fn test_private_conversation_invite_flow() {
        let mut server = server();
        let (alice, mut alice_rx) = sign_up(&mut server, "alice");
        let (bob, mut bob_rx) = sign_up(&mut server, "bob");

        server.handle_command(ServerCommand::CreateConversation {
            connection_id: alice,
            name: "Team".to_string(),
            kind: ConversationKind::Private,
        });
        let conversation = match drain(&mut alice_rx).as_slice() {
            [ServerMessage::Created(c)] => c.clone(),
            other => panic!("unexpected events: {:?}", other),
        };
        let code = conversation.invite_code.clone().unwrap();
        assert!(!code.0.is_empty());

        // Codes are case-insensitive
        server.handle_command(ServerCommand::JoinByInvite {
            connection_id: bob,
            invite_code: code.0.to_lowercase(),
        });
        let events = drain(&mut bob_rx);
        match &events[0] {
            ServerMessage::ConversationHistory { conversation: c, .. } => {
                assert_eq!(c.id, conversation.id)
            }
            other => panic!("unexpected event: {:?}", other),
        }

        let mut names = last_participants(&events);
        names.sort();
        assert_eq!(names, vec!["alice", "bob"]);

        // Creator's connection is in the room too
        let alice_events = drain(&mut alice_rx);
        assert_eq!(new_messages(&alice_events)[0].content, "bob joined the conversation");
    }

    #[test]
    fn test_invalid_invite_code() {
        let mut server = server();
        let (bob, mut rx) = sign_up(&mut server, "bob");

        server.handle_command(ServerCommand::JoinByInvite {
            connection_id: bob,
            invite_code: "NOPE1234".to_string(),
        });
        match drain(&mut rx).as_slice() {
            [ServerMessage::Error { code, message }] => {
                assert_eq!(*code, ErrorCode::InvalidInviteCode);
                assert_eq!(message, "Invalid invite code");
            }
            other => panic!("unexpected events: {:?}", other),
        }
    }

    #[test]
    fn test_broadcast_reaches_only_members() {
        let mut server = server();
        let public = ConversationId::public();
        let (alice, mut alice_rx) = sign_up(&mut server, "alice");
        let (bob, mut bob_rx) = sign_up(&mut server, "bob");
        let (_carol, mut carol_rx) = sign_up(&mut server, "carol");

        join(&mut server, alice, &public);
        join(&mut server, bob, &public);
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        send(&mut server, alice, &public, "hello");

        let bob_events = drain(&mut bob_rx);
        let received = new_messages(&bob_events);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].content, "hello");
        assert_eq!(received[0].kind, MessageKind::Text);
        assert_eq!(received[0].username, "alice");

        assert_eq!(new_messages(&drain(&mut alice_rx)).len(), 1);
        assert!(drain(&mut carol_rx).is_empty());
    }

    #[test]
    fn test_send_without_membership_is_dropped() {
        let mut server = server();
        let public = ConversationId::public();
        let (alice, mut alice_rx) = sign_up(&mut server, "alice");
        let (bob, mut bob_rx) = sign_up(&mut server, "bob");
        join(&mut server, alice, &public);
        drain(&mut alice_rx);

        send(&mut server, bob, &public, "sneaky");
        send(&mut server, bob, &ConversationId::from("unknown"), "lost");

        assert!(drain(&mut bob_rx).is_empty());
        assert!(drain(&mut alice_rx).is_empty());
        assert_eq!(server.store.log_len(&public), 1);
    }

    #[test]
    fn test_client_cannot_forge_system_messages() {
        let mut server = server();
        let public = ConversationId::public();
        let (alice, mut rx) = sign_up(&mut server, "alice");
        join(&mut server, alice, &public);
        drain(&mut rx);

        server.handle_command(ServerCommand::Send {
            connection_id: alice,
            conversation_id: public.clone(),
            content: "I am the system".to_string(),
            kind: MessageKind::System,
        });
        let events = drain(&mut rx);
        assert_eq!(new_messages(&events)[0].kind, MessageKind::Text);
    }

    #[test]
    fn test_private_message_delivery() {
        let mut server = server();
        let (alice, mut alice_rx) = sign_up(&mut server, "alice");
        let (_bob, mut bob_rx) = sign_up(&mut server, "bob");
        let (_eve, mut eve_rx) = sign_up(&mut server, "eve");

        server.handle_command(ServerCommand::SendPrivate {
            connection_id: alice,
            recipient_id: UserId::from("bob"),
            content: "psst".to_string(),
        });

        for rx in [&mut alice_rx, &mut bob_rx] {
            match drain(rx).as_slice() {
                [ServerMessage::NewPrivateMessage(m)] => {
                    assert_eq!(m.content, "psst");
                    assert_eq!(m.kind, MessageKind::Private);
                    assert_eq!(m.recipient_id, Some(UserId::from("bob")));
                }
                other => panic!("unexpected events: {:?}", other),
            }
        }
        assert!(drain(&mut eve_rx).is_empty());

        let key = PairKey::new(&UserId::from("bob"), &UserId::from("alice"));
        assert_eq!(server.store.history_private(&key).len(), 1);
    }

    #[test]
    fn test_private_message_to_offline_user_is_stored() {
        let mut server = server();
        let (alice, mut alice_rx) = sign_up(&mut server, "alice");

        server.handle_command(ServerCommand::SendPrivate {
            connection_id: alice,
            recipient_id: UserId::from("ghost"),
            content: "hello?".to_string(),
        });
        assert_eq!(drain(&mut alice_rx).len(), 1);

        server.handle_command(ServerCommand::PrivateHistory {
            connection_id: alice,
            user_id: UserId::from("ghost"),
        });
        match drain(&mut alice_rx).as_slice() {
            [ServerMessage::PrivateHistory { pair_key, messages }] => {
                assert_eq!(pair_key.0, "private_alice_ghost");
                assert_eq!(messages.len(), 1);
            }
            other => panic!("unexpected events: {:?}", other),
        }
    }

    #[test]
    fn test_clear_public_conversation() {
        let mut server = server();
        let public = ConversationId::public();
        let (alice, mut alice_rx) = sign_up(&mut server, "alice");
        let (bob, mut bob_rx) = sign_up(&mut server, "bob");
        join(&mut server, alice, &public);
        join(&mut server, bob, &public);
        send(&mut server, bob, &public, "one");
        send(&mut server, bob, &public, "two");
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        server.handle_command(ServerCommand::Clear {
            connection_id: alice,
            conversation_id: public.clone(),
        });

        assert_eq!(server.store.log_len(&public), 1);
        for rx in [&mut alice_rx, &mut bob_rx] {
            match drain(rx).as_slice() {
                [ServerMessage::Cleared { conversation_id }, ServerMessage::NewMessage(m)] => {
                    assert_eq!(conversation_id, &public);
                    assert_eq!(m.content, "Chat cleared by alice");
                    assert_eq!(m.kind, MessageKind::System);
                }
                other => panic!("unexpected events: {:?}", other),
            }
        }
    }

    #[test]
    fn test_clear_private_requires_creator() {
        let mut server = server();
        let (alice, mut alice_rx) = sign_up(&mut server, "alice");
        let (bob, mut bob_rx) = sign_up(&mut server, "bob");

        server.handle_command(ServerCommand::CreateConversation {
            connection_id: alice,
            name: "Team".to_string(),
            kind: ConversationKind::Private,
        });
        let conversation = match drain(&mut alice_rx).as_slice() {
            [ServerMessage::Created(c)] => c.clone(),
            other => panic!("unexpected events: {:?}", other),
        };
        join(&mut server, bob, &conversation.id);
        send(&mut server, bob, &conversation.id, "keep me");
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        server.handle_command(ServerCommand::Clear {
            connection_id: bob,
            conversation_id: conversation.id.clone(),
        });
        match drain(&mut bob_rx).as_slice() {
            [ServerMessage::Error { message, .. }] => assert_eq!(message, "Permission denied"),
            other => panic!("unexpected events: {:?}", other),
        }
        assert!(drain(&mut alice_rx).is_empty());
        assert_eq!(server.store.log_len(&conversation.id), 2);

        // Unknown conversation is a silent no-op
        server.handle_command(ServerCommand::Clear {
            connection_id: bob,
            conversation_id: ConversationId::from("missing"),
        });
        assert!(drain(&mut bob_rx).is_empty());
    }

    #[test]
    fn test_list_conversations_visibility() {
        let mut server = server();
        let (alice, mut alice_rx) = sign_up(&mut server, "alice");
        let (bob, mut bob_rx) = sign_up(&mut server, "bob");

        server.handle_command(ServerCommand::CreateConversation {
            connection_id: alice,
            name: "Secret".to_string(),
            kind: ConversationKind::Private,
        });
        drain(&mut alice_rx);

        server.handle_command(ServerCommand::ListConversations { connection_id: alice });
        server.handle_command(ServerCommand::ListConversations { connection_id: bob });

        match drain(&mut alice_rx).as_slice() {
            [ServerMessage::ConversationList(list)] => assert_eq!(list.len(), 2),
            other => panic!("unexpected events: {:?}", other),
        }
        match drain(&mut bob_rx).as_slice() {
            [ServerMessage::ConversationList(list)] => {
                assert_eq!(list.len(), 1);
                assert!(list[0].id.is_public());
            }
            other => panic!("unexpected events: {:?}", other),
        }
    }

    #[test]
    fn test_create_requires_name() {
        let mut server = server();
        let (alice, mut rx) = sign_up(&mut server, "alice");

        server.handle_command(ServerCommand::CreateConversation {
            connection_id: alice,
            name: "   ".to_string(),
            kind: ConversationKind::Public,
        });
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [ServerMessage::Error { code: ErrorCode::ValidationError, .. }]
        ));
    }

    #[test]
    fn test_leave_conversation() {
        let mut server = server();
        let public = ConversationId::public();
        let (alice, mut alice_rx) = sign_up(&mut server, "alice");
        let (bob, mut bob_rx) = sign_up(&mut server, "bob");
        join(&mut server, alice, &public);
        join(&mut server, bob, &public);
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        server.handle_command(ServerCommand::Leave {
            connection_id: alice,
            conversation_id: public.clone(),
        });

        assert!(drain(&mut alice_rx).is_empty());
        let events = drain(&mut bob_rx);
        assert_eq!(new_messages(&events)[0].content, "alice left the conversation");
        assert_eq!(last_participants(&events), vec!["bob"]);
        assert!(!server.conversations.get(&public).unwrap().has_participant(&UserId::from("alice")));
    }

    #[test]
    fn test_logout_cascade() {
        let mut server = server();
        let public = ConversationId::public();
        let (alice, _alice_rx) = sign_up(&mut server, "alice");
        let (bob, mut bob_rx) = sign_up(&mut server, "bob");
        join(&mut server, alice, &public);
        join(&mut server, bob, &public);
        drain(&mut bob_rx);

        server.handle_command(ServerCommand::Logout { connection_id: alice });

        let events = drain(&mut bob_rx);
        assert_eq!(new_messages(&events)[0].content, "alice left the conversation");
        assert_eq!(last_participants(&events), vec!["bob"]);
        assert!(server.sessions.lookup_connection_for(&UserId::from("alice")).is_none());
        assert!(!server.rooms.contains(&public, alice));

        // Disconnect after logout sends nothing further
        server.handle_command(ServerCommand::Disconnect { connection_id: alice });
        assert!(drain(&mut bob_rx).is_empty());
    }

    #[test]
    fn test_disconnect_updates_presence() {
        let mut server = server();
        let public = ConversationId::public();
        let (alice, _alice_rx) = sign_up(&mut server, "alice");
        let (bob, mut bob_rx) = sign_up(&mut server, "bob");
        join(&mut server, alice, &public);
        join(&mut server, bob, &public);
        drain(&mut bob_rx);

        server.handle_command(ServerCommand::Disconnect { connection_id: alice });

        match drain(&mut bob_rx).as_slice() {
            [ServerMessage::Participants(users)] => {
                assert_eq!(users.len(), 1);
                assert_eq!(users[0].username, "bob");
            }
            other => panic!("unexpected events: {:?}", other),
        }
        // Membership survives the disconnect
        assert!(server.conversations.get(&public).unwrap().has_participant(&UserId::from("alice")));
        assert!(!server.clients.contains_key(&alice));
    }

    #[test]
    fn test_change_password() {
        let mut server = server();
        let (alice, mut rx) = sign_up(&mut server, "alice");

        server.handle_command(ServerCommand::ChangePassword {
            connection_id: alice,
            current_password: "wrong".to_string(),
            new_password: "next".to_string(),
        });
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [ServerMessage::PasswordChangeFailed { .. }]
        ));

        server.handle_command(ServerCommand::ChangePassword {
            connection_id: alice,
            current_password: "secret".to_string(),
            new_password: "next".to_string(),
        });
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [ServerMessage::PasswordChanged]
        ));
        assert!(server.credentials.verify("alice", "next"));
    }

    #[tokio::test]
    async fn test_post_message_resolves_parked_poll() {
        let mut server = server();
        let public = ConversationId::public();
        let (alice, mut alice_rx) = sign_up(&mut server, "alice");
        join(&mut server, alice, &public);
        drain(&mut alice_rx);

        let (poll_tx, poll_rx) = oneshot::channel();
        server.handle_command(ServerCommand::Poll {
            conversation_id: public.clone(),
            since: Some(Utc::now()),
            reply: poll_tx,
        });

        let (post_tx, post_rx) = oneshot::channel();
        server.handle_command(ServerCommand::PostMessage {
            conversation_id: public.clone(),
            user_id: UserId::from("rest-user"),
            username: "rest".to_string(),
            text: "over http".to_string(),
            reply: post_tx,
        });

        let posted = post_rx.await.unwrap().unwrap();
        let polled = poll_rx.await.unwrap().unwrap();
        assert_eq!(polled, vec![posted.clone()]);

        // Socket members see the REST message too
        let events = drain(&mut alice_rx);
        assert_eq!(new_messages(&events)[0].id, posted.id);
    }

    #[tokio::test]
    async fn test_poll_returns_backlog_immediately() {
        let mut server = server();
        let public = ConversationId::public();
        let before = Utc::now() - chrono::Duration::seconds(1);

        let (post_tx, _post_rx) = oneshot::channel();
        server.handle_command(ServerCommand::PostMessage {
            conversation_id: public.clone(),
            user_id: UserId::from("u"),
            username: "u".to_string(),
            text: "earlier".to_string(),
            reply: post_tx,
        });

        let (poll_tx, poll_rx) = oneshot::channel();
        server.handle_command(ServerCommand::Poll {
            conversation_id: public,
            since: Some(before),
            reply: poll_tx,
        });
        let messages = poll_rx.await.unwrap().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "earlier");
        assert_eq!(server.polls.waiting(), 0);
    }

    #[tokio::test]
    async fn test_rest_unknown_conversation() {
        let mut server = server();

        let (tx, rx) = oneshot::channel();
        server.handle_command(ServerCommand::FetchMessages {
            conversation_id: ConversationId::from("nope"),
            since: None,
            reply: tx,
        });
        assert!(matches!(
            rx.await.unwrap(),
            Err(AppError::ConversationNotFound(_))
        ));

        let (tx, rx) = oneshot::channel();
        server.handle_command(ServerCommand::Poll {
            conversation_id: ConversationId::from("nope"),
            since: None,
            reply: tx,
        });
        assert!(matches!(
            rx.await.unwrap(),
            Err(AppError::ConversationNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_run_loop_answers_queries() {
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(ChatServer::new(rx, MessageStore::new(LIVE_FEED_CAPACITY)).run());

        let (reply, stats) = oneshot::channel();
        tx.send(ServerCommand::Stats { reply }).await.unwrap();
        assert_eq!(
            stats.await.unwrap(),
            ServerStats {
                users: 0,
                conversations: 1
            }
        );

        let (reply, users) = oneshot::channel();
        tx.send(ServerCommand::ListUsers { reply }).await.unwrap();
        assert!(users.await.unwrap().is_empty());
    }
}

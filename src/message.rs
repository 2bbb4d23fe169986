//! Message protocol definitions
//!
//! JSON-based bidirectional event protocol. Every frame is
//! `{"event": "<name>", "data": <payload>}`, modelled as adjacently tagged
//! Serde enums so each event name has one fixed payload schema.

use serde::{Deserialize, Serialize};

use crate::conversation::{Conversation, ConversationKind};
use crate::error::AppError;
use crate::session::User;
use crate::store::{Message, MessageKind};
use crate::types::{ConnectionId, ConversationId, PairKey, UserId};

/// Identity fields a client may attach when authenticating
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPayload {
    pub id: Option<UserId>,
    pub email: Option<String>,
}

/// Client → Server message
#[derive(Debug, Deserialize)]
#[serde(tag = "event", content = "data", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Log in, or register first when `is_new_user` is set
    #[serde(rename = "user:authenticate")]
    Authenticate {
        username: String,
        password: String,
        #[serde(default)]
        is_new_user: bool,
        #[serde(default)]
        user: Option<UserPayload>,
    },
    #[serde(rename = "user:change-password")]
    ChangePassword {
        current_password: String,
        new_password: String,
    },
    #[serde(rename = "conversation:join")]
    Join { conversation_id: ConversationId },
    #[serde(rename = "conversation:join-by-invite")]
    JoinByInvite { invite_code: String },
    #[serde(rename = "conversation:leave")]
    Leave { conversation_id: ConversationId },
    #[serde(rename = "conversation:create")]
    CreateConversation {
        name: String,
        #[serde(rename = "type")]
        kind: ConversationKind,
    },
    /// Post to a conversation; `type` defaults to text
    #[serde(rename = "message:send")]
    Send {
        conversation_id: ConversationId,
        content: String,
        #[serde(default, rename = "type")]
        kind: MessageKind,
    },
    #[serde(rename = "message:private")]
    SendPrivate { recipient_id: UserId, content: String },
    #[serde(rename = "message:private:history")]
    PrivateHistory { user_id: UserId },
    #[serde(rename = "conversation:clear")]
    Clear { conversation_id: ConversationId },
    #[serde(rename = "conversations:list")]
    ListConversations,
    #[serde(rename = "user:logout")]
    Logout,
}

/// Server → Client message
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Transport connected, connection ID issued
    #[serde(rename = "connected")]
    Connected { connection_id: ConnectionId },
    #[serde(rename = "auth:success")]
    AuthSuccess { user: User },
    #[serde(rename = "auth:failed")]
    AuthFailed { message: String },
    #[serde(rename = "password:changed")]
    PasswordChanged,
    #[serde(rename = "password:change-failed")]
    PasswordChangeFailed { message: String },
    /// Sent to a joiner: the conversation and its recent messages
    #[serde(rename = "conversation:history")]
    ConversationHistory {
        conversation: Conversation,
        messages: Vec<Message>,
    },
    #[serde(rename = "message:new")]
    NewMessage(Message),
    #[serde(rename = "message:private:new")]
    NewPrivateMessage(Message),
    #[serde(rename = "message:private:history")]
    PrivateHistory {
        pair_key: PairKey,
        messages: Vec<Message>,
    },
    /// Online participants of a conversation
    #[serde(rename = "conversation:participants")]
    Participants(Vec<User>),
    #[serde(rename = "conversations:list")]
    ConversationList(Vec<Conversation>),
    #[serde(rename = "conversation:cleared")]
    Cleared { conversation_id: ConversationId },
    #[serde(rename = "conversation:created")]
    Created(Conversation),
    #[serde(rename = "error")]
    Error { code: ErrorCode, message: String },
}

/// Error codes for ServerMessage::Error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Unknown conversation id
    ConversationNotFound,
    /// Unknown invite code
    InvalidInviteCode,
    /// Not allowed to act on this conversation
    PermissionDenied,
    /// Action attempted before authenticating
    AuthenticationRequired,
    /// Bad username/password
    InvalidCredentials,
    /// Missing or malformed field
    ValidationError,
    /// Invalid message format
    InvalidMessage,
    /// Unexpected server fault
    Internal,
}

/// Convert AppError to ServerMessage for client notification
impl From<AppError> for ServerMessage {
    fn from(err: AppError) -> Self {
        let (code, message) = match &err {
            AppError::ConversationNotFound(_) => {
                (ErrorCode::ConversationNotFound, "Conversation not found".to_string())
            }
            AppError::InvalidInviteCode(_) => {
                (ErrorCode::InvalidInviteCode, "Invalid invite code".to_string())
            }
            AppError::PermissionDenied => {
                (ErrorCode::PermissionDenied, "Permission denied".to_string())
            }
            AppError::AuthenticationRequired => {
                (ErrorCode::AuthenticationRequired, "Authentication required".to_string())
            }
            AppError::InvalidCredentials(e) => (ErrorCode::InvalidCredentials, e.to_string()),
            AppError::Validation(reason) => (ErrorCode::ValidationError, reason.clone()),
            AppError::Json(e) => {
                (ErrorCode::InvalidMessage, format!("Invalid message format: {}", e))
            }
            // Fatal errors are not typically converted (connection closes)
            _ => (ErrorCode::Internal, "Internal error".to_string()),
        };
        ServerMessage::Error { code, message }
    }
}

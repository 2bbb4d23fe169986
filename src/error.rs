//! Error types for the messenger server
//!
//! Defines application-level errors, credential errors and message send errors.
//! Uses thiserror for ergonomic error definitions.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

/// Application-level errors
///
/// Covers both fatal errors (connection termination) and
/// business errors (error event or 4xx sent to the caller only).
#[derive(Debug, Error)]
pub enum AppError {
    /// WebSocket protocol error (fatal)
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error (fatal)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send error (fatal - internal channel broken)
    #[error("Channel send error")]
    ChannelSend,

    /// No conversation with the given id
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    /// No active private conversation with the given invite code
    #[error("Invalid invite code: {0}")]
    InvalidInviteCode(String),

    /// Caller may not perform this action on the conversation
    #[error("Permission denied")]
    PermissionDenied,

    /// Action attempted before authenticating
    #[error("Authentication required")]
    AuthenticationRequired,

    /// Wrong password, unknown user, or username already taken
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(#[from] CredentialError),

    /// Missing or malformed field in a request
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Credential store errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialError {
    #[error("Username already taken")]
    UsernameTaken,

    #[error("Current password is incorrect")]
    WrongPassword,

    #[error("Unknown user")]
    UnknownUser,

    #[error("User id belongs to another account")]
    IdentityTaken,
}

/// Message send errors
///
/// Occurs when attempting to deliver an event to a connection that
/// cannot take it.
#[derive(Debug, Error)]
pub enum SendError {
    /// The receiving end of the channel has been closed
    #[error("Channel closed")]
    ChannelClosed,

    /// The connection's outbound buffer is full
    #[error("Channel full")]
    ChannelFull,
}

impl AppError {
    /// HTTP status used when this error reaches the REST surface
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::ConversationNotFound(_) | AppError::InvalidInviteCode(_) => {
                StatusCode::NOT_FOUND
            }
            AppError::Validation(_) | AppError::Json(_) => StatusCode::BAD_REQUEST,
            AppError::AuthenticationRequired | AppError::InvalidCredentials(_) => {
                StatusCode::UNAUTHORIZED
            }
            AppError::PermissionDenied => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("Request failed: {}", self);
            "Internal error".to_string()
        } else {
            self.to_string()
        };
        (
            status,
            Json(serde_json::json!({ "success": false, "error": message })),
        )
            .into_response()
    }
}

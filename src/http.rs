//! REST and long-poll routes
//!
//! Lets clients without a WebSocket read, post and wait for messages.
//! Every route forwards to the ChatServer actor and awaits a oneshot reply.

use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::AppError;
use crate::server::ServerCommand;
use crate::session::User;
use crate::store::Message;
use crate::types::{ConversationId, UserId};

#[derive(Clone)]
pub struct HttpState {
    pub cmd_tx: mpsc::Sender<ServerCommand>,
    pub poll_timeout: Duration,
}

pub fn build_router(state: HttpState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/users", get(list_users))
        .route(
            "/api/messages/{conversation_id}",
            get(fetch_messages).post(post_message),
        )
        .route("/api/poll/{conversation_id}", get(poll_messages))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct SinceQuery {
    since: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostMessageRequest {
    user_id: Option<String>,
    username: Option<String>,
    text: Option<String>,
}

#[derive(Serialize)]
struct MessagesResponse {
    messages: Vec<Message>,
    timestamp: DateTime<Utc>,
}

#[derive(Serialize)]
struct PostMessageResponse {
    success: bool,
    message: Message,
}

#[derive(Serialize)]
struct UsersResponse {
    users: Vec<User>,
    timestamp: DateTime<Utc>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    users: usize,
    conversations: usize,
    timestamp: DateTime<Utc>,
}

/// Send a command to the actor and wait for its reply
async fn ask<T>(
    state: &HttpState,
    make: impl FnOnce(oneshot::Sender<T>) -> ServerCommand,
) -> Result<T, AppError> {
    let (reply, rx) = oneshot::channel();
    state
        .cmd_tx
        .send(make(reply))
        .await
        .map_err(|_| AppError::ChannelSend)?;
    rx.await.map_err(|_| AppError::ChannelSend)
}

fn required(field: Option<String>, name: &str) -> Result<String, AppError> {
    field
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| AppError::Validation(format!("Missing required field: {}", name)))
}

async fn health(State(state): State<HttpState>) -> Result<Json<HealthResponse>, AppError> {
    let stats = ask(&state, |reply| ServerCommand::Stats { reply }).await?;
    Ok(Json(HealthResponse {
        status: "OK",
        users: stats.users,
        conversations: stats.conversations,
        timestamp: Utc::now(),
    }))
}

async fn list_users(State(state): State<HttpState>) -> Result<Json<UsersResponse>, AppError> {
    let users = ask(&state, |reply| ServerCommand::ListUsers { reply }).await?;
    Ok(Json(UsersResponse {
        users,
        timestamp: Utc::now(),
    }))
}

async fn fetch_messages(
    State(state): State<HttpState>,
    Path(conversation_id): Path<String>,
    Query(query): Query<SinceQuery>,
) -> Result<Json<MessagesResponse>, AppError> {
    let messages = ask(&state, |reply| ServerCommand::FetchMessages {
        conversation_id: ConversationId(conversation_id),
        since: query.since,
        reply,
    })
    .await??;

    Ok(Json(MessagesResponse {
        messages,
        timestamp: Utc::now(),
    }))
}

async fn post_message(
    State(state): State<HttpState>,
    Path(conversation_id): Path<String>,
    body: Result<Json<PostMessageRequest>, JsonRejection>,
) -> Result<Json<PostMessageResponse>, AppError> {
    // Unreadable bodies get the same JSON error shape as missing fields
    let Json(body) = body.map_err(|rejection| AppError::Validation(rejection.body_text()))?;
    let user_id = required(body.user_id, "userId")?;
    let username = required(body.username, "username")?;
    let text = required(body.text, "text")?;

    let message = ask(&state, |reply| ServerCommand::PostMessage {
        conversation_id: ConversationId(conversation_id),
        user_id: UserId(user_id),
        username,
        text,
        reply,
    })
    .await??;

    Ok(Json(PostMessageResponse {
        success: true,
        message,
    }))
}

/// Hold the request until a message arrives or the poll timeout elapses
async fn poll_messages(
    State(state): State<HttpState>,
    Path(conversation_id): Path<String>,
    Query(query): Query<SinceQuery>,
) -> Result<Json<MessagesResponse>, AppError> {
    let (reply, rx) = oneshot::channel();
    state
        .cmd_tx
        .send(ServerCommand::Poll {
            conversation_id: ConversationId(conversation_id.clone()),
            since: query.since,
            reply,
        })
        .await
        .map_err(|_| AppError::ChannelSend)?;

    // Dropping `rx` on timeout marks the parked waiter closed
    let messages = match tokio::time::timeout(state.poll_timeout, rx).await {
        Ok(Ok(result)) => result?,
        Ok(Err(_)) => return Err(AppError::ChannelSend),
        Err(_) => {
            debug!("Poll on {} timed out", conversation_id);
            Vec::new()
        }
    };

    Ok(Json(MessagesResponse {
        messages,
        timestamp: Utc::now(),
    }))
}

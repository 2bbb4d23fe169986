//! Message store
//!
//! Per-conversation bounded logs plus direct-message threads keyed by
//! `PairKey`. Logs evict their oldest entry once the retention cap is hit.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{ConversationId, PairKey, UserId};

/// Retention cap of the live chat feed profile
pub const LIVE_FEED_CAPACITY: usize = 100;

/// Retention cap of the REST / long-poll profile
pub const REST_FEED_CAPACITY: usize = 1000;

/// Number of messages sent to a client when it joins
pub const JOIN_HISTORY_LIMIT: usize = 50;

/// Display name used for server-generated messages
pub const SYSTEM_USERNAME: &str = "System";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Text,
    Emoji,
    System,
    Private,
}

/// A chat message; immutable once created
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub username: String,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<UserId>,
}

impl Message {
    /// A message authored by a user in a conversation
    pub fn new(
        conversation_id: ConversationId,
        user_id: UserId,
        username: String,
        content: String,
        kind: MessageKind,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            user_id,
            username,
            content,
            kind,
            timestamp: Utc::now(),
            recipient_id: None,
        }
    }

    /// A server-generated notice
    pub fn system(conversation_id: ConversationId, content: String) -> Self {
        Self::new(
            conversation_id,
            UserId::system(),
            SYSTEM_USERNAME.to_string(),
            content,
            MessageKind::System,
        )
    }

    /// A direct message, filed under the pair's thread key
    pub fn private(sender_id: UserId, sender_name: String, recipient_id: UserId, content: String) -> Self {
        let key = PairKey::new(&sender_id, &recipient_id);
        let mut message = Self::new(
            ConversationId(key.0),
            sender_id,
            sender_name,
            content,
            MessageKind::Private,
        );
        message.recipient_id = Some(recipient_id);
        message
    }
}

/// Append-only log holding at most `capacity` recent messages
#[derive(Debug)]
pub struct MessageLog {
    messages: VecDeque<Message>,
    capacity: usize,
}

impl MessageLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            messages: VecDeque::new(),
            capacity,
        }
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push_back(message);
        while self.messages.len() > self.capacity {
            self.messages.pop_front();
        }
    }

    /// Most recent `limit` messages, oldest first
    pub fn recent(&self, limit: usize) -> Vec<Message> {
        let skip = self.messages.len().saturating_sub(limit);
        self.messages.iter().skip(skip).cloned().collect()
    }

    /// Messages strictly newer than `since`
    pub fn since(&self, since: DateTime<Utc>) -> Vec<Message> {
        self.messages
            .iter()
            .filter(|m| m.timestamp > since)
            .cloned()
            .collect()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// All conversation logs and private threads
#[derive(Debug)]
pub struct MessageStore {
    logs: HashMap<ConversationId, MessageLog>,
    threads: HashMap<PairKey, MessageLog>,
    capacity: usize,
}

impl MessageStore {
    /// Create a store whose logs retain at most `capacity` messages each
    pub fn new(capacity: usize) -> Self {
        Self {
            logs: HashMap::new(),
            threads: HashMap::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Start an empty log for a conversation (keeps an existing one)
    pub fn open(&mut self, conversation_id: &ConversationId) {
        let capacity = self.capacity;
        self.logs
            .entry(conversation_id.clone())
            .or_insert_with(|| MessageLog::new(capacity));
    }

    pub fn has_log(&self, conversation_id: &ConversationId) -> bool {
        self.logs.contains_key(conversation_id)
    }

    /// Append to a conversation log
    ///
    /// Returns false if the conversation has no log.
    pub fn append(&mut self, conversation_id: &ConversationId, message: Message) -> bool {
        match self.logs.get_mut(conversation_id) {
            Some(log) => {
                log.push(message);
                true
            }
            None => false,
        }
    }

    pub fn history(&self, conversation_id: &ConversationId, limit: usize) -> Vec<Message> {
        self.logs
            .get(conversation_id)
            .map(|log| log.recent(limit))
            .unwrap_or_default()
    }

    pub fn since(&self, conversation_id: &ConversationId, since: DateTime<Utc>) -> Vec<Message> {
        self.logs
            .get(conversation_id)
            .map(|log| log.since(since))
            .unwrap_or_default()
    }

    /// Truncate a conversation log; returns false if it has no log
    pub fn clear(&mut self, conversation_id: &ConversationId) -> bool {
        match self.logs.get_mut(conversation_id) {
            Some(log) => {
                log.clear();
                true
            }
            None => false,
        }
    }

    pub fn log_len(&self, conversation_id: &ConversationId) -> usize {
        self.logs.get(conversation_id).map_or(0, MessageLog::len)
    }

    pub fn append_private(&mut self, key: &PairKey, message: Message) {
        let capacity = self.capacity;
        self.threads
            .entry(key.clone())
            .or_insert_with(|| MessageLog::new(capacity))
            .push(message);
    }

    pub fn history_private(&self, key: &PairKey) -> Vec<Message> {
        self.threads
            .get(key)
            .map(|log| log.recent(self.capacity))
            .unwrap_or_default()
    }
}

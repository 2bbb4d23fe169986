//! Conversation registry
//!
//! Owns every conversation's metadata: kind, creator, invite code and
//! participant membership. The public conversation exists from startup
//! and is never removed.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::session::{SessionRegistry, User};
use crate::types::{ConversationId, InviteCode, UserId};

/// Name of the conversation every process starts with
pub const PUBLIC_CONVERSATION_NAME: &str = "General Chat";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Public,
    Private,
}

/// A named room holding participants
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ConversationKind,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub participants: Vec<UserId>,
    pub is_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invite_code: Option<InviteCode>,
}

impl Conversation {
    fn new(
        id: ConversationId,
        name: String,
        kind: ConversationKind,
        created_by: UserId,
        invite_code: Option<InviteCode>,
    ) -> Self {
        Self {
            id,
            name,
            kind,
            created_by,
            created_at: Utc::now(),
            participants: Vec::new(),
            is_active: true,
            invite_code,
        }
    }

    pub fn is_private(&self) -> bool {
        self.kind == ConversationKind::Private
    }

    pub fn has_participant(&self, user_id: &UserId) -> bool {
        self.participants.contains(user_id)
    }

    /// Whether `user_id` may clear this conversation's log
    ///
    /// Any participant may clear a public conversation; only the creator
    /// may clear a private one.
    pub fn can_clear(&self, user_id: &UserId) -> bool {
        if !self.has_participant(user_id) {
            return false;
        }
        match self.kind {
            ConversationKind::Public => true,
            ConversationKind::Private => &self.created_by == user_id,
        }
    }
}

/// All conversations, kept in creation order
#[derive(Debug)]
pub struct ConversationRegistry {
    conversations: HashMap<ConversationId, Conversation>,
    order: Vec<ConversationId>,
}

impl Default for ConversationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationRegistry {
    /// Create a registry holding only the public conversation
    pub fn new() -> Self {
        let public = Conversation::new(
            ConversationId::public(),
            PUBLIC_CONVERSATION_NAME.to_string(),
            ConversationKind::Public,
            UserId::system(),
            None,
        );
        let mut registry = Self {
            conversations: HashMap::new(),
            order: Vec::new(),
        };
        registry.insert(public);
        registry
    }

    fn insert(&mut self, conversation: Conversation) {
        self.order.push(conversation.id.clone());
        self.conversations.insert(conversation.id.clone(), conversation);
    }

    pub fn get(&self, id: &ConversationId) -> Option<&Conversation> {
        self.conversations.get(id)
    }

    pub fn get_or_fail(&self, id: &ConversationId) -> Result<&Conversation, AppError> {
        self.get(id)
            .ok_or_else(|| AppError::ConversationNotFound(id.to_string()))
    }

    /// Create a conversation with the creator as its first participant
    pub fn create(&mut self, name: String, kind: ConversationKind, creator: UserId) -> &Conversation {
        let id = loop {
            let id = ConversationId::generate();
            if !self.conversations.contains_key(&id) {
                break id;
            }
        };

        let invite_code = match kind {
            ConversationKind::Private => Some(self.unique_invite_code()),
            ConversationKind::Public => None,
        };

        let mut conversation = Conversation::new(id.clone(), name, kind, creator.clone(), invite_code);
        conversation.participants.push(creator);
        self.insert(conversation);

        &self.conversations[&id]
    }

    /// Generate an invite code unused by any active conversation
    fn unique_invite_code(&self) -> InviteCode {
        loop {
            let code = InviteCode::generate();
            if self.find_by_invite_code(&code).is_none() {
                break code;
            }
        }
    }

    /// Active private conversation carrying this invite code
    pub fn find_by_invite_code(&self, code: &InviteCode) -> Option<&Conversation> {
        self.conversations.values().find(|c| {
            c.is_active && c.is_private() && c.invite_code.as_ref() == Some(code)
        })
    }

    /// Add a participant; joining twice is a no-op
    ///
    /// Returns false if the conversation does not exist.
    pub fn add_participant(&mut self, id: &ConversationId, user_id: &UserId) -> bool {
        let Some(conversation) = self.conversations.get_mut(id) else {
            return false;
        };
        if !conversation.has_participant(user_id) {
            conversation.participants.push(user_id.clone());
        }
        true
    }

    /// Remove a participant; no-op if absent
    ///
    /// Returns true if the user was a participant.
    pub fn remove_participant(&mut self, id: &ConversationId, user_id: &UserId) -> bool {
        let Some(conversation) = self.conversations.get_mut(id) else {
            return false;
        };
        let before = conversation.participants.len();
        conversation.participants.retain(|p| p != user_id);
        conversation.participants.len() != before
    }

    /// Public conversations plus private ones the user belongs to
    pub fn list_visible_to(&self, user_id: &UserId) -> Vec<Conversation> {
        self.iter()
            .filter(|c| !c.is_private() || c.has_participant(user_id))
            .cloned()
            .collect()
    }

    /// Ids of every conversation the user participates in, in creation order
    pub fn conversations_of(&self, user_id: &UserId) -> Vec<ConversationId> {
        self.iter()
            .filter(|c| c.has_participant(user_id))
            .map(|c| c.id.clone())
            .collect()
    }

    /// Online participants of a conversation
    ///
    /// Participants without a live session are left out.
    pub fn resolve_participant_users(
        &self,
        id: &ConversationId,
        sessions: &SessionRegistry,
    ) -> Vec<User> {
        self.get(id)
            .map(|c| {
                c.participants
                    .iter()
                    .filter_map(|user_id| sessions.user(user_id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn iter(&self) -> impl Iterator<Item = &Conversation> {
        self.order.iter().filter_map(|id| self.conversations.get(id))
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }
}

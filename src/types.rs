//! Basic type definitions for the messenger server
//!
//! Provides newtype wrappers for type safety:
//! - `ConnectionId`: UUID-based identifier of one live transport connection
//! - `UserId`: client-generated user identifier
//! - `ConversationId`: conversation key (`"public"` or a UUID)
//! - `InviteCode`: 8-character alphanumeric code for private conversations
//! - `PairKey`: canonical key of a direct-message thread

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Length of generated invite codes
pub const INVITE_CODE_LEN: usize = 8;

/// Unique connection identifier (newtype pattern)
///
/// Wraps a UUID v4 for type-safe connection identification.
/// Implements Hash and Eq for use as HashMap keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    /// Create a new random connection ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// User identifier, supplied by the client when it authenticates
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    /// Reserved author id of server-generated messages
    pub fn system() -> Self {
        Self("system".to_string())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Conversation identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub String);

impl ConversationId {
    /// Id of the conversation every process starts with
    pub const PUBLIC: &'static str = "public";

    pub fn public() -> Self {
        Self(Self::PUBLIC.to_string())
    }

    /// Generate a fresh random conversation id
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn is_public(&self) -> bool {
        self.0 == Self::PUBLIC
    }
}

impl From<&str> for ConversationId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Invite code (8-character uppercase alphanumeric)
///
/// Grants join access to a private conversation.
/// Generated randomly or parsed from user input.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InviteCode(pub String);

impl InviteCode {
    /// Generate a new random invite code
    pub fn generate() -> Self {
        use rand::Rng;
        let code: String = rand::thread_rng()
            .sample_iter(&rand::distributions::Alphanumeric)
            .take(INVITE_CODE_LEN)
            .map(char::from)
            .collect::<String>()
            .to_uppercase();
        Self(code)
    }

    /// Create an InviteCode from user input (trimmed, converted to uppercase)
    pub fn from_string(code: &str) -> Self {
        Self(code.trim().to_uppercase())
    }
}

impl std::fmt::Display for InviteCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key of a direct-message thread between two users
///
/// Built from both user ids in sorted order, so the key is the same
/// whichever side sends.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PairKey(pub String);

impl PairKey {
    pub fn new(a: &UserId, b: &UserId) -> Self {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("private_{}_{}", first, second))
    }
}

impl std::fmt::Display for PairKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_unique() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_invite_code_length() {
        let code = InviteCode::generate();
        assert_eq!(code.0.len(), INVITE_CODE_LEN);
        assert_eq!(code.0, code.0.to_uppercase());
    }

    #[test]
    fn test_invite_code_normalized() {
        let code = InviteCode::from_string(" abc123xy ");
        assert_eq!(code.0, "ABC123XY");
    }

    #[test]
    fn test_pair_key_is_order_independent() {
        let alice = UserId::from("alice-id");
        let bob = UserId::from("bob-id");
        assert_eq!(PairKey::new(&alice, &bob), PairKey::new(&bob, &alice));
        assert_eq!(PairKey::new(&alice, &bob).0, "private_alice-id_bob-id");
    }

    #[test]
    fn test_public_conversation_id() {
        assert!(ConversationId::public().is_public());
        assert!(!ConversationId::generate().is_public());
    }
}

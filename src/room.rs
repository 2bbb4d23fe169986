//! Broadcast groups
//!
//! Tracks which connections receive a conversation's fanout, independent
//! of the transport. A connection subscribes when it joins a conversation
//! and is dropped on leave, logout or disconnect.

use std::collections::{HashMap, HashSet};

use crate::types::{ConnectionId, ConversationId};

/// conversation -> subscribed connections
#[derive(Debug, Default)]
pub struct Rooms {
    members: HashMap<ConversationId, HashSet<ConnectionId>>,
}

impl Rooms {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a connection; returns false if it already was
    pub fn subscribe(&mut self, conversation_id: &ConversationId, connection_id: ConnectionId) -> bool {
        self.members
            .entry(conversation_id.clone())
            .or_default()
            .insert(connection_id)
    }

    pub fn unsubscribe(&mut self, conversation_id: &ConversationId, connection_id: ConnectionId) {
        if let Some(members) = self.members.get_mut(conversation_id) {
            members.remove(&connection_id);
            if members.is_empty() {
                self.members.remove(conversation_id);
            }
        }
    }

    /// Remove a connection from every group, returning the groups it was in
    pub fn unsubscribe_all(&mut self, connection_id: ConnectionId) -> Vec<ConversationId> {
        let mut left = Vec::new();
        self.members.retain(|conversation_id, members| {
            if members.remove(&connection_id) {
                left.push(conversation_id.clone());
            }
            !members.is_empty()
        });
        left
    }

    /// Connections subscribed to a conversation
    pub fn members(&self, conversation_id: &ConversationId) -> Vec<ConnectionId> {
        self.members
            .get(conversation_id)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, conversation_id: &ConversationId, connection_id: ConnectionId) -> bool {
        self.members
            .get(conversation_id)
            .is_some_and(|members| members.contains(&connection_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_and_members() {
        let mut rooms = Rooms::new();
        let public = ConversationId::public();
        let a = ConnectionId::new();
        let b = ConnectionId::new();

        assert!(rooms.subscribe(&public, a));
        assert!(!rooms.subscribe(&public, a));
        rooms.subscribe(&public, b);

        let members = rooms.members(&public);
        assert_eq!(members.len(), 2);
        assert!(rooms.contains(&public, a));
        assert!(rooms.contains(&public, b));
    }

    #[test]
    fn test_unsubscribe() {
        let mut rooms = Rooms::new();
        let public = ConversationId::public();
        let a = ConnectionId::new();
        rooms.subscribe(&public, a);
        rooms.unsubscribe(&public, a);

        assert!(!rooms.contains(&public, a));
        assert!(rooms.members(&public).is_empty());

        // Unknown group is a no-op
        rooms.unsubscribe(&ConversationId::from("other"), a);
    }

    #[test]
    fn test_unsubscribe_all() {
        let mut rooms = Rooms::new();
        let public = ConversationId::public();
        let team = ConversationId::from("team");
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        rooms.subscribe(&public, a);
        rooms.subscribe(&team, a);
        rooms.subscribe(&public, b);

        let mut left = rooms.unsubscribe_all(a);
        left.sort_by(|x, y| x.0.cmp(&y.0));
        assert_eq!(left, vec![public.clone(), team.clone()]);
        assert_eq!(rooms.members(&public), vec![b]);
        assert!(rooms.members(&team).is_empty());
    }
}

//! Session registry
//!
//! Binds live connections to authenticated users, in both directions.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::types::{ConnectionId, UserId};

/// A user as seen by other participants
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub is_online: bool,
    pub joined_at: DateTime<Utc>,
    pub is_authenticated: bool,
}

impl User {
    /// A freshly authenticated user
    pub fn authenticated(id: UserId, username: String, email: Option<String>) -> Self {
        Self {
            id,
            username,
            email,
            is_online: true,
            joined_at: Utc::now(),
            is_authenticated: true,
        }
    }
}

/// Bidirectional connection <-> user mapping
///
/// The same user may bind a newer connection without unbinding the old
/// one; the newest binding wins for direct delivery.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    by_connection: HashMap<ConnectionId, User>,
    by_user: HashMap<UserId, ConnectionId>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a connection to a user and mark the user online
    pub fn bind(&mut self, connection_id: ConnectionId, mut user: User) {
        user.is_online = true;
        self.by_user.insert(user.id.clone(), connection_id);
        self.by_connection.insert(connection_id, user);
    }

    pub fn lookup_by_connection(&self, connection_id: ConnectionId) -> Option<&User> {
        self.by_connection.get(&connection_id)
    }

    /// Authenticated user bound to the connection, if any
    pub fn authenticated(&self, connection_id: ConnectionId) -> Option<&User> {
        self.lookup_by_connection(connection_id)
            .filter(|user| user.is_authenticated)
    }

    pub fn lookup_connection_for(&self, user_id: &UserId) -> Option<ConnectionId> {
        self.by_user.get(user_id).copied()
    }

    /// Online user with the given id
    pub fn user(&self, user_id: &UserId) -> Option<&User> {
        self.lookup_connection_for(user_id)
            .and_then(|connection_id| self.by_connection.get(&connection_id))
    }

    /// Remove the binding of a connection, returning the user it held
    ///
    /// The user -> connection direction is only cleared when it still
    /// points at this connection.
    pub fn unbind(&mut self, connection_id: ConnectionId) -> Option<User> {
        let mut user = self.by_connection.remove(&connection_id)?;
        if self.by_user.get(&user.id) == Some(&connection_id) {
            self.by_user.remove(&user.id);
        }
        user.is_online = false;
        Some(user)
    }

    /// All users with a live binding
    pub fn online_users(&self) -> Vec<User> {
        self.by_user
            .values()
            .filter_map(|connection_id| self.by_connection.get(connection_id))
            .cloned()
            .collect()
    }

    /// Number of distinct online users
    pub fn len(&self) -> usize {
        self.by_user.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_user.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str, name: &str) -> User {
        User::authenticated(UserId::from(id), name.to_string(), None)
    }

    #[test]
    fn test_bind_and_lookup() {
        let mut sessions = SessionRegistry::new();
        let conn = ConnectionId::new();
        sessions.bind(conn, user("u1", "alice"));

        assert_eq!(sessions.lookup_by_connection(conn).unwrap().username, "alice");
        assert_eq!(sessions.lookup_connection_for(&UserId::from("u1")), Some(conn));
        assert!(sessions.authenticated(conn).is_some());
        assert_eq!(sessions.len(), 1);
    }

    #[test]
    fn test_unbind_removes_both_directions() {
        let mut sessions = SessionRegistry::new();
        let conn = ConnectionId::new();
        sessions.bind(conn, user("u1", "alice"));

        let removed = sessions.unbind(conn).unwrap();
        assert!(!removed.is_online);
        assert!(sessions.lookup_by_connection(conn).is_none());
        assert!(sessions.lookup_connection_for(&UserId::from("u1")).is_none());
        assert!(sessions.is_empty());
        assert!(sessions.unbind(conn).is_none());
    }

    #[test]
    fn test_last_connection_wins() {
        let mut sessions = SessionRegistry::new();
        let old = ConnectionId::new();
        let new = ConnectionId::new();
        sessions.bind(old, user("u1", "alice"));
        sessions.bind(new, user("u1", "alice"));

        assert_eq!(sessions.lookup_connection_for(&UserId::from("u1")), Some(new));

        // Dropping the stale connection keeps the newer binding
        sessions.unbind(old);
        assert_eq!(sessions.lookup_connection_for(&UserId::from("u1")), Some(new));
        assert_eq!(sessions.online_users().len(), 1);
    }

    #[test]
    fn test_unauthenticated_user_is_not_authenticated() {
        let mut sessions = SessionRegistry::new();
        let conn = ConnectionId::new();
        let mut guest = user("u2", "guest");
        guest.is_authenticated = false;
        sessions.bind(conn, guest);

        assert!(sessions.lookup_by_connection(conn).is_some());
        assert!(sessions.authenticated(conn).is_none());
    }
}

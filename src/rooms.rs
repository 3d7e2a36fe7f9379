//! In-memory room table.
//!
//! Rooms are keyed by their canonical (lowercased) name, auto-created on
//! first join and deleted on last leave, so a room in the table always
//! has at least one member. All views come back sorted so listings are
//! stable on the wire.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::resc::Room;

#[derive(Clone, Default)]
pub struct RoomManager {
    rooms: Arc<RwLock<HashMap<String, Room>>>,
}

impl RoomManager {
    pub fn new() -> Self {
        RoomManager::default()
    }

    /// Add a user, auto-creating the room with the user as creator.
    /// Returns false iff the user is already a member.
    pub async fn join(&self, room: &str, user: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        let entry = rooms
            .entry(room.to_string())
            .or_insert_with(|| Room::new(room, user));
        entry.members.insert(user.to_string())
    }

    /// Remove a user; deletes the room once its member set is empty.
    /// Returns false when the room is absent or the user is not a member.
    pub async fn leave(&self, room: &str, user: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        let entry = match rooms.get_mut(room) {
            Some(entry) => entry,
            None => return false,
        };
        if !entry.members.remove(user) {
            return false;
        }
        if entry.members.is_empty() {
            rooms.remove(room);
        }
        true
    }

    pub async fn exists(&self, room: &str) -> bool {
        self.rooms.read().await.contains_key(room)
    }

    pub async fn is_in(&self, room: &str, user: &str) -> bool {
        match self.rooms.read().await.get(room) {
            Some(entry) => entry.members.contains(user),
            None => false,
        }
    }

    pub async fn members(&self, room: &str) -> Vec<String> {
        let rooms = self.rooms.read().await;
        let mut members: Vec<String> = match rooms.get(room) {
            Some(entry) => entry.members.iter().cloned().collect(),
            None => return Vec::new(),
        };
        members.sort();
        members
    }

    pub async fn members_except(&self, room: &str, user: &str) -> Vec<String> {
        let rooms = self.rooms.read().await;
        let mut members: Vec<String> = match rooms.get(room) {
            Some(entry) => entry.members.iter().filter(|m| *m != user).cloned().collect(),
            None => return Vec::new(),
        };
        members.sort();
        members
    }

    pub async fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.rooms.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Disconnect sweep: drop the user everywhere and return the rooms
    /// they belonged to. Emptied rooms are deleted.
    pub async fn remove_user_from_all(&self, user: &str) -> Vec<String> {
        let mut rooms = self.rooms.write().await;
        let mut left = Vec::new();
        rooms.retain(|name, room| {
            if room.members.remove(user) {
                left.push(name.clone());
                !room.members.is_empty()
            } else {
                true
            }
        });
        left.sort();
        left
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn join_auto_creates_and_rejoining_fails() {
        let rooms = RoomManager::new();
        assert!(rooms.join("#lobby", "alice").await);
        assert!(rooms.exists("#lobby").await);
        assert!(!rooms.join("#lobby", "alice").await);
        assert_eq!(rooms.members("#lobby").await, vec!["alice"]);
    }

    #[tokio::test]
    async fn last_leave_deletes_the_room() {
        let rooms = RoomManager::new();
        rooms.join("#lobby", "alice").await;
        rooms.join("#lobby", "bob").await;
        assert!(rooms.leave("#lobby", "alice").await);
        assert!(rooms.exists("#lobby").await);
        assert!(rooms.leave("#lobby", "bob").await);
        assert!(!rooms.exists("#lobby").await);
    }

    #[tokio::test]
    async fn leave_without_membership_fails() {
        let rooms = RoomManager::new();
        assert!(!rooms.leave("#lobby", "alice").await);
        rooms.join("#lobby", "alice").await;
        assert!(!rooms.leave("#lobby", "bob").await);
        assert!(rooms.exists("#lobby").await);
    }

    #[tokio::test]
    async fn views_are_sorted() {
        let rooms = RoomManager::new();
        rooms.join("#zoo", "carol").await;
        rooms.join("#zoo", "alice").await;
        rooms.join("#zoo", "bob").await;
        rooms.join("#ant", "alice").await;
        assert_eq!(rooms.members("#zoo").await, vec!["alice", "bob", "carol"]);
        assert_eq!(rooms.members_except("#zoo", "bob").await, vec!["alice", "carol"]);
        assert_eq!(rooms.list().await, vec!["#ant", "#zoo"]);
    }

    #[tokio::test]
    async fn remove_user_from_all_sweeps_and_deletes_empties() {
        let rooms = RoomManager::new();
        rooms.join("#lobby", "alice").await;
        rooms.join("#lobby", "bob").await;
        rooms.join("#chat", "alice").await;
        rooms.join("#other", "bob").await;

        let left = rooms.remove_user_from_all("alice").await;
        assert_eq!(left, vec!["#chat", "#lobby"]);
        assert!(!rooms.exists("#chat").await);
        assert!(rooms.is_in("#lobby", "bob").await);
        assert!(!rooms.is_in("#lobby", "alice").await);

        assert!(rooms.remove_user_from_all("nobody").await.is_empty());
    }
}

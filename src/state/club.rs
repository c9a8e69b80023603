//! Club state.
//!
//! A club is the long-lived parent session that players gather in before a
//! game room is spun off from it. Member order is join order; the first
//! member hosts, and hosting passes to the next member when the host leaves.

use serde::Serialize;
use thiserror::Error;

/// Default maximum members per club.
pub const MAX_CLUB_MEMBERS: usize = 12;

/// A member of a club.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClubMember {
    pub user_id: String,

    /// Display name
    pub name: String,

    pub is_connected: bool,

    pub joined_at: chrono::DateTime<chrono::Utc>,
}

impl ClubMember {
    pub fn new(user_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            name: name.into(),
            is_connected: true,
            joined_at: chrono::Utc::now(),
        }
    }
}

/// Club errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClubError {
    #[error("club is full")]
    Full,

    #[error("already a member of this club")]
    AlreadyMember,

    #[error("not a member of this club")]
    NotMember,
}

/// Club state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Club {
    pub id: String,

    /// Members in join order
    members: Vec<ClubMember>,

    pub host_user_id: Option<String>,

    pub max_members: usize,

    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Club {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            members: Vec::new(),
            host_user_id: None,
            max_members: MAX_CLUB_MEMBERS,
            created_at: chrono::Utc::now(),
        }
    }

    pub fn with_max_members(mut self, max_members: usize) -> Self {
        self.max_members = max_members;
        self
    }

    /// Add a member. The first member becomes host.
    pub fn add_member(&mut self, member: ClubMember) -> Result<(), ClubError> {
        if self.has_member(&member.user_id) {
            return Err(ClubError::AlreadyMember);
        }
        if self.is_full() {
            return Err(ClubError::Full);
        }
        if self.host_user_id.is_none() {
            self.host_user_id = Some(member.user_id.clone());
        }
        self.members.push(member);
        Ok(())
    }

    /// Remove a member, passing hosting on if needed.
    pub fn remove_member(&mut self, user_id: &str) -> Option<ClubMember> {
        let position = self.members.iter().position(|m| m.user_id == user_id)?;
        let member = self.members.remove(position);

        if self.host_user_id.as_deref() == Some(user_id) {
            self.host_user_id = self.members.first().map(|m| m.user_id.clone());
        }

        Some(member)
    }

    pub fn member(&self, user_id: &str) -> Option<&ClubMember> {
        self.members.iter().find(|m| m.user_id == user_id)
    }

    pub fn has_member(&self, user_id: &str) -> bool {
        self.member(user_id).is_some()
    }

    pub fn is_host(&self, user_id: &str) -> bool {
        self.host_user_id.as_deref() == Some(user_id)
    }

    pub fn set_connected(&mut self, user_id: &str, connected: bool) -> Result<(), ClubError> {
        let member = self
            .members
            .iter_mut()
            .find(|m| m.user_id == user_id)
            .ok_or(ClubError::NotMember)?;
        member.is_connected = connected;
        Ok(())
    }

    pub fn transfer_host(&mut self, user_id: &str) -> Result<(), ClubError> {
        if !self.has_member(user_id) {
            return Err(ClubError::NotMember);
        }
        self.host_user_id = Some(user_id.to_string());
        Ok(())
    }

    /// Members in join order.
    pub fn members(&self) -> &[ClubMember] {
        &self.members
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn connected_count(&self) -> usize {
        self.members.iter().filter(|m| m.is_connected).count()
    }

    pub fn is_full(&self) -> bool {
        self.members.len() >= self.max_members
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "clubId": self.id,
            "players": self.members,
            "hostUserId": self.host_user_id,
            "maxMembers": self.max_members
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_club_new() {
        let club = Club::new("club-1");
        assert!(club.is_empty());
        assert!(!club.is_full());
        assert_eq!(club.host_user_id, None);
    }

    #[test]
    fn test_club_members_keep_join_order() {
        let mut club = Club::new("club-1");
        club.add_member(ClubMember::new("u1", "Alice")).unwrap();
        club.add_member(ClubMember::new("u2", "Bob")).unwrap();
        club.add_member(ClubMember::new("u3", "Cleo")).unwrap();

        let order: Vec<&str> = club.members().iter().map(|m| m.user_id.as_str()).collect();
        assert_eq!(order, vec!["u1", "u2", "u3"]);
        assert!(club.is_host("u1")); // First member becomes host
        assert!(!club.is_host("u2"));
    }

    #[test]
    fn test_club_duplicate_member() {
        let mut club = Club::new("club-1");
        club.add_member(ClubMember::new("u1", "Alice")).unwrap();
        assert_eq!(
            club.add_member(ClubMember::new("u1", "Alice again")),
            Err(ClubError::AlreadyMember)
        );
    }

    #[test]
    fn test_club_host_transfer_on_leave() {
        let mut club = Club::new("club-1");
        club.add_member(ClubMember::new("u1", "Alice")).unwrap();
        club.add_member(ClubMember::new("u2", "Bob")).unwrap();

        club.remove_member("u1");
        assert!(club.is_host("u2"));

        club.remove_member("u2");
        assert_eq!(club.host_user_id, None);
    }

    #[test]
    fn test_club_full() {
        let mut club = Club::new("club-1").with_max_members(2);
        club.add_member(ClubMember::new("u1", "Alice")).unwrap();
        club.add_member(ClubMember::new("u2", "Bob")).unwrap();

        assert!(club.is_full());
        assert_eq!(club.add_member(ClubMember::new("u3", "Cleo")), Err(ClubError::Full));
    }

    #[test]
    fn test_club_connected() {
        let mut club = Club::new("club-1");
        club.add_member(ClubMember::new("u1", "Alice")).unwrap();
        club.set_connected("u1", false).unwrap();

        assert_eq!(club.connected_count(), 0);
        assert_eq!(club.set_connected("nobody", true), Err(ClubError::NotMember));
    }

    #[test]
    fn test_club_json() {
        let mut club = Club::new("club-1");
        club.add_member(ClubMember::new("u1", "Alice")).unwrap();

        let json = club.to_json();
        assert_eq!(json["clubId"], "club-1");
        assert_eq!(json["hostUserId"], "u1");
        assert_eq!(json["players"][0]["name"], "Alice");
        assert_eq!(json["players"][0]["isConnected"], true);
    }
}

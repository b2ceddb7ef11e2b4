use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::TagColor;

// ============================================================================
// Collections
// ============================================================================

/// Named record collections of the remote store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Lists,
    Todos,
    Tags,
    TodoTags,
    ListShares,
    InviteTokens,
    Profiles,
}

impl Collection {
    pub const ALL: [Collection; 7] = [
        Collection::Lists,
        Collection::Todos,
        Collection::Tags,
        Collection::TodoTags,
        Collection::ListShares,
        Collection::InviteTokens,
        Collection::Profiles,
    ];

    /// Table name on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Lists => "lists",
            Collection::Todos => "todos",
            Collection::Tags => "tags",
            Collection::TodoTags => "todo_tags",
            Collection::ListShares => "list_shares",
            Collection::InviteTokens => "invite_tokens",
            Collection::Profiles => "profiles",
        }
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Stored rows
// ============================================================================

/// A named todo list. Owned by one user, optionally shared with others.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct List {
    pub id: Uuid,
    #[serde(rename = "user_id")]
    pub owner_id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// A single task inside a list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Todo {
    pub id: Uuid,
    pub list_id: Uuid,
    pub text: String,
    #[serde(default)]
    pub completed: bool,
    pub created_at: DateTime<Utc>,
}

/// A coloured label scoped to one list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub id: Uuid,
    pub list_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub color: TagColor,
    pub created_at: DateTime<Utc>,
}

/// Join row between a todo and a tag of the same list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TodoTagLink {
    pub todo_id: Uuid,
    pub tag_id: Uuid,
}

/// Grants a non-owner access to a list's todos and tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListShare {
    pub list_id: Uuid,
    pub user_id: Uuid,
}

/// Capability token that lets another user join a list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InviteToken {
    pub id: Uuid,
    pub list_id: Uuid,
    pub token: String,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_active: bool,
}

impl InviteToken {
    /// Whether the token can still be redeemed at `now`
    pub fn is_redeemable(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.expires_at > now
    }
}

/// Human-readable identity of a user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: Uuid,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// RPC results
// ============================================================================

/// Row returned by `get_list_members`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListMember {
    pub user_id: Uuid,
    pub email: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub is_owner: bool,
}

impl ListMember {
    /// Display name when set, email otherwise
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.email)
    }
}

/// Row returned by `get_invite_info`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InviteInfo {
    pub list_id: Uuid,
    pub list_name: String,
}

// ============================================================================
// Insert payloads
// ============================================================================

/// Payload for creating a list; the store fills `id` and `created_at`
#[derive(Debug, Clone, Serialize)]
pub struct NewList {
    pub name: String,
    pub user_id: Uuid,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewTodo {
    pub list_id: Uuid,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewTag {
    pub list_id: Uuid,
    pub name: String,
    pub color: TagColor,
}

/// Payload for creating an invite; the store fills token and expiry
#[derive(Debug, Clone, Serialize)]
pub struct NewInvite {
    pub list_id: Uuid,
    pub created_by: Uuid,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProfileUpsert {
    pub id: Uuid,
    pub display_name: String,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_owner_uses_user_id_on_the_wire() {
        let owner = Uuid::new_v4();
        let list = List {
            id: Uuid::new_v4(),
            owner_id: owner,
            name: "Groceries".to_string(),
            created_at: Utc::now(),
        };
        let json = serde_json::to_value(&list).unwrap();
        assert_eq!(json["user_id"], owner.to_string());
        assert!(json.get("owner_id").is_none());
    }

    #[test]
    fn test_todo_parses_store_row() {
        let json = r#"{"id":"6f1c2a4e-3c1b-4b7e-9a43-0d1f6a6b2c11","list_id":"0b3a3b56-9f3c-4f6e-8d0e-8c4a5b2f7e90","text":"Buy milk","completed":true,"created_at":"2024-05-01T10:00:00.123456+00:00"}"#;
        let todo: Todo = serde_json::from_str(json).unwrap();
        assert_eq!(todo.text, "Buy milk");
        assert!(todo.completed);
    }

    #[test]
    fn test_tag_color_defaults_when_missing() {
        let json = serde_json::json!({
            "id": Uuid::new_v4(),
            "list_id": Uuid::new_v4(),
            "name": "Later",
            "created_at": "2024-05-01T10:00:00Z",
        });
        let tag: Tag = serde_json::from_value(json).unwrap();
        assert_eq!(tag.color, TagColor::Blue);
    }

    #[test]
    fn test_invite_redeemable() {
        let now = Utc::now();
        let mut invite = InviteToken {
            id: Uuid::new_v4(),
            list_id: Uuid::new_v4(),
            token: "abc".to_string(),
            created_by: Uuid::new_v4(),
            created_at: now,
            expires_at: now + chrono::Duration::days(7),
            is_active: true,
        };
        assert!(invite.is_redeemable(now));

        invite.is_active = false;
        assert!(!invite.is_redeemable(now));

        invite.is_active = true;
        invite.expires_at = now - chrono::Duration::seconds(1);
        assert!(!invite.is_redeemable(now));
    }

    #[test]
    fn test_member_label_falls_back_to_email() {
        let mut member = ListMember {
            user_id: Uuid::new_v4(),
            email: "b@example.com".to_string(),
            display_name: None,
            is_owner: false,
        };
        assert_eq!(member.label(), "b@example.com");
        member.display_name = Some("Bea".to_string());
        assert_eq!(member.label(), "Bea");
    }

    #[test]
    fn test_collection_wire_names() {
        assert_eq!(Collection::TodoTags.as_str(), "todo_tags");
        let json = serde_json::to_string(&Collection::InviteTokens).unwrap();
        assert_eq!(json, "\"invite_tokens\"");
        for collection in Collection::ALL {
            assert_eq!(collection.to_string(), collection.as_str());
        }
    }
}

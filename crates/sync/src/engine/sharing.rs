//! Invites, members and profile.

use chrono::Utc;
use serde_json::{json, Value};
use shared::{Collection, InviteInfo, InviteToken, List, ListMember, NewInvite, Profile, ProfileUpsert};
use uuid::Uuid;

use super::{lists_query, SyncEngine};
use crate::error::{InviteRejection, Result, SyncError};
use crate::store::{call_rpc, fetch, insert_row, Direction, Filter, Query};

pub const DISPLAY_NAME_MAX_CHARS: usize = 30;

impl SyncEngine {
    // ========================================================================
    // Invites (owner side)
    // ========================================================================

    /// Create an invite link for an owned list. The store fills token and expiry.
    pub async fn create_invite(&mut self, list_id: Uuid) -> Result<InviteToken> {
        self.owned_list(list_id)?;
        let created_by = self.require_user()?;
        let store = self.store.clone();
        let invite: InviteToken = insert_row(
            store.as_ref(),
            Collection::InviteTokens,
            NewInvite {
                list_id,
                created_by,
            },
        )
        .await
        .map_err(SyncError::RemoteWrite)?;

        tracing::info!("Created invite for list {}", list_id);
        Ok(invite)
    }

    /// Invites that can still be redeemed, newest first
    pub async fn active_invites(&self, list_id: Uuid) -> Result<Vec<InviteToken>> {
        self.owned_list(list_id)?;
        let store = self.store.clone();
        fetch(
            store.as_ref(),
            Collection::InviteTokens,
            Query::new()
                .filter(Filter::eq("list_id", list_id))
                .filter(Filter::eq("is_active", true))
                .filter(Filter::gt("expires_at", Utc::now()))
                .order_by("created_at", Direction::Desc),
        )
        .await
        .map_err(SyncError::RemoteFetch)
    }

    pub async fn deactivate_invite(&mut self, invite_id: Uuid) -> Result<()> {
        let store = self.store.clone();
        store
            .update(
                Collection::InviteTokens,
                vec![Filter::eq("id", invite_id)],
                json!({ "is_active": false }),
            )
            .await
            .map_err(SyncError::RemoteWrite)
    }

    // ========================================================================
    // Members
    // ========================================================================

    pub async fn list_members(&self, list_id: Uuid) -> Result<Vec<ListMember>> {
        self.owned_list(list_id)?;
        let store = self.store.clone();
        call_rpc(
            store.as_ref(),
            "get_list_members",
            json!({ "_list_id": list_id }),
        )
        .await
        .map_err(SyncError::RemoteFetch)
    }

    pub async fn remove_member(&mut self, list_id: Uuid, user_id: Uuid) -> Result<()> {
        let owner = self.owned_list(list_id)?.owner_id;
        if user_id == owner {
            return Err(SyncError::InvalidInput(
                "The owner cannot be removed from their list".to_string(),
            ));
        }
        let store = self.store.clone();
        store
            .delete(
                Collection::ListShares,
                vec![Filter::eq("list_id", list_id), Filter::eq("user_id", user_id)],
            )
            .await
            .map_err(SyncError::RemoteWrite)?;

        tracing::info!("Removed member {} from list {}", user_id, list_id);
        Ok(())
    }

    // ========================================================================
    // Invites (guest side)
    // ========================================================================

    /// Name of the list an invite points at
    pub async fn invite_info(&self, token: &str) -> Result<InviteInfo> {
        let store = self.store.clone();
        let info: Option<InviteInfo> =
            call_rpc(store.as_ref(), "get_invite_info", json!({ "_token": token }))
                .await
                .map_err(|e| {
                    tracing::debug!("Invite lookup failed: {}", e);
                    InviteRejection::InvalidOrExpired
                })?;
        info.ok_or(SyncError::Invite(InviteRejection::InvalidOrExpired))
    }

    /// Join the list behind `token`, then reload lists and select it
    pub async fn accept_invite(&mut self, token: &str) -> Result<Uuid> {
        self.require_user()?;
        let store = self.store.clone();
        let joined = store
            .rpc("accept_invite", json!({ "_token": token }))
            .await
            .map_err(|e| InviteRejection::classify(&e))?;
        let lists: Vec<List> = fetch(store.as_ref(), Collection::Lists, lists_query())
            .await
            .map_err(SyncError::RemoteFetch)?;

        let list_id = match &joined {
            Value::String(s) => Uuid::parse_str(s).ok(),
            _ => None,
        }
        .ok_or_else(|| {
            SyncError::Invite(InviteRejection::Failed(format!(
                "unexpected accept_invite result: {}",
                joined
            )))
        })?;

        tracing::info!("Joined list {}", list_id);
        self.lists_generation += 1;
        self.repo.load_lists(lists);
        if self.repo.lists().contains(list_id) {
            if self.selection.list_id() != Some(list_id) {
                self.enter_scope(Some(list_id));
            }
        } else if self
            .selection
            .list_id()
            .map_or(true, |id| !self.repo.lists().contains(id))
        {
            self.fall_back();
        }
        Ok(list_id)
    }

    // ========================================================================
    // Profile
    // ========================================================================

    /// The current user's profile, `None` until one was saved
    pub async fn profile(&self) -> Result<Option<Profile>> {
        let user_id = self.require_user()?;
        let store = self.store.clone();
        let mut profiles: Vec<Profile> = fetch(
            store.as_ref(),
            Collection::Profiles,
            Query::new().filter(Filter::eq("id", user_id)).limit(1),
        )
        .await
        .map_err(SyncError::RemoteFetch)?;
        Ok(profiles.pop())
    }

    pub async fn save_profile(&mut self, display_name: &str) -> Result<Profile> {
        let user_id = self.require_user()?;
        let display_name = display_name.trim();
        let len = display_name.chars().count();
        if len == 0 || len > DISPLAY_NAME_MAX_CHARS {
            return Err(SyncError::InvalidInput(format!(
                "Display name must be 1 to {} characters",
                DISPLAY_NAME_MAX_CHARS
            )));
        }
        let store = self.store.clone();
        let row = serde_json::to_value(ProfileUpsert {
            id: user_id,
            display_name: display_name.to_string(),
        })
        .map_err(|e| SyncError::RemoteWrite(e.into()))?;
        let saved = store
            .upsert(Collection::Profiles, row)
            .await
            .map_err(SyncError::RemoteWrite)?;
        serde_json::from_value(saved).map_err(|e| SyncError::RemoteWrite(e.into()))
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::*;
    use super::*;
    use crate::store::{MemoryBackend, RemoteStore};
    use crate::Update;

    #[tokio::test]
    async fn test_invite_lifecycle() {
        let backend = MemoryBackend::new();
        let alice = backend.add_user("alice@example.com");
        let list_id = seed_list(&backend, alice, "Trip");
        let mut owner = started(&backend, alice).await;

        let first = owner.create_invite(list_id).await.unwrap();
        let second = owner.create_invite(list_id).await.unwrap();
        assert!(first.is_redeemable(Utc::now()));

        let active = owner.active_invites(list_id).await.unwrap();
        let ids: Vec<_> = active.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![second.id, first.id]);

        owner.deactivate_invite(first.id).await.unwrap();
        let active = owner.active_invites(list_id).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, second.id);
    }

    #[tokio::test]
    async fn test_sharing_is_owner_only() {
        let backend = MemoryBackend::new();
        let alice = backend.add_user("alice@example.com");
        let bob = backend.add_user("bob@example.com");
        let list_id = seed_list(&backend, alice, "Trip");
        share(&backend, list_id, bob);
        let mut guest = started(&backend, bob).await;

        assert!(matches!(guest.create_invite(list_id).await, Err(SyncError::NotOwner)));
        assert!(matches!(guest.list_members(list_id).await, Err(SyncError::NotOwner)));
        assert!(matches!(
            guest.remove_member(list_id, bob).await,
            Err(SyncError::NotOwner)
        ));
    }

    #[tokio::test]
    async fn test_accept_invite_joins_and_selects() {
        let backend = MemoryBackend::new();
        let alice = backend.add_user("alice@example.com");
        let bob = backend.add_user("bob@example.com");
        let trip = seed_list(&backend, alice, "Trip");
        seed_list(&backend, bob, "Bob's own");
        let mut owner = started(&backend, alice).await;
        let invite = owner.create_invite(trip).await.unwrap();

        let mut guest = started(&backend, bob).await;
        let info = guest.invite_info(&invite.token).await.unwrap();
        assert_eq!(info.list_name, "Trip");

        assert_eq!(guest.accept_invite(&invite.token).await.unwrap(), trip);
        assert_eq!(guest.selection().list_id(), Some(trip));
        assert_eq!(guest.lists().len(), 2);
        assert!(!guest.is_owner(trip));

        let updates = settle(&mut guest).await;
        assert!(updates.contains(&Update::Loaded(trip)));

        let members = owner.list_members(trip).await.unwrap();
        let emails: Vec<_> = members.iter().map(|m| m.email.as_str()).collect();
        assert_eq!(emails, ["alice@example.com", "bob@example.com"]);
    }

    #[tokio::test]
    async fn test_invite_rejections() {
        let backend = MemoryBackend::new();
        let alice = backend.add_user("alice@example.com");
        let list_id = seed_list(&backend, alice, "Trip");
        let mut owner = started(&backend, alice).await;
        let invite = owner.create_invite(list_id).await.unwrap();

        assert!(matches!(
            owner.accept_invite(&invite.token).await,
            Err(SyncError::Invite(InviteRejection::AlreadyOwner))
        ));
        assert!(matches!(
            owner.accept_invite("bogus").await,
            Err(SyncError::Invite(InviteRejection::InvalidOrExpired))
        ));
        assert!(matches!(
            owner.invite_info("bogus").await,
            Err(SyncError::Invite(InviteRejection::InvalidOrExpired))
        ));

        owner.deactivate_invite(invite.id).await.unwrap();
        assert!(matches!(
            owner.invite_info(&invite.token).await,
            Err(SyncError::Invite(InviteRejection::InvalidOrExpired))
        ));
    }

    #[tokio::test]
    async fn test_removed_member_loses_the_list() {
        let backend = MemoryBackend::new();
        let alice = backend.add_user("alice@example.com");
        let bob = backend.add_user("bob@example.com");
        let list_id = seed_list(&backend, alice, "Trip");
        share(&backend, list_id, bob);
        let mut owner = started(&backend, alice).await;
        let mut guest = started(&backend, bob).await;
        assert_eq!(guest.selection().list_id(), Some(list_id));

        assert!(matches!(
            owner.remove_member(list_id, alice).await,
            Err(SyncError::InvalidInput(_))
        ));
        owner.remove_member(list_id, bob).await.unwrap();

        settle(&mut guest).await;
        assert!(guest.lists().is_empty());
        assert_eq!(guest.selection().list_id(), None);
    }

    #[tokio::test]
    async fn test_failed_lists_refetch_keeps_cache() {
        let backend = MemoryBackend::new();
        let alice = backend.add_user("alice@example.com");
        let bob = backend.add_user("bob@example.com");
        let trip = seed_list(&backend, alice, "Trip");
        let camp = seed_list(&backend, alice, "Camp");
        let mut owner = started(&backend, alice).await;
        let mut guest = started(&backend, bob).await;
        let joiner = backend.session(bob);

        let first = owner.create_invite(trip).await.unwrap();
        backend.fail_next_query(Collection::Lists);
        joiner
            .rpc("accept_invite", json!({ "_token": first.token }))
            .await
            .unwrap();
        let updates = settle(&mut guest).await;
        assert!(updates.contains(&Update::Fetching));
        assert!(!updates.contains(&Update::Lists));
        assert!(guest.lists().is_empty());

        // The next share event re-fetches both lists
        let second = owner.create_invite(camp).await.unwrap();
        joiner
            .rpc("accept_invite", json!({ "_token": second.token }))
            .await
            .unwrap();
        settle(&mut guest).await;
        assert_eq!(guest.lists().len(), 2);
        assert_eq!(guest.selection().list_id(), Some(trip));
    }

    #[tokio::test]
    async fn test_profile_roundtrip_and_validation() {
        let backend = MemoryBackend::new();
        let alice = backend.add_user("alice@example.com");
        let mut engine = started(&backend, alice).await;

        assert_eq!(engine.profile().await.unwrap(), None);
        assert!(matches!(
            engine.save_profile("   ").await,
            Err(SyncError::InvalidInput(_))
        ));
        assert!(matches!(
            engine.save_profile(&"x".repeat(31)).await,
            Err(SyncError::InvalidInput(_))
        ));

        engine.save_profile("  Alice ").await.unwrap();
        let saved = engine.save_profile("Ally").await.unwrap();
        assert_eq!(saved.display_name, "Ally");
        assert_eq!(
            engine.profile().await.unwrap().map(|p| p.display_name),
            Some("Ally".to_string())
        );
        assert_eq!(backend.rows(Collection::Profiles).len(), 1);
    }
}

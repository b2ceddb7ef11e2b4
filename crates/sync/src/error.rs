use thiserror::Error;
use uuid::Uuid;

use crate::store::StoreError;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// The remote refused or failed a write; caches were left untouched
    #[error("Remote write failed: {0}")]
    RemoteWrite(StoreError),
    #[error("Remote fetch failed: {0}")]
    RemoteFetch(StoreError),
    #[error("Not signed in")]
    NotSignedIn,
    #[error("No list selected")]
    NoListSelected,
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Unknown list: {0}")]
    UnknownList(Uuid),
    #[error("Unknown todo: {0}")]
    UnknownTodo(Uuid),
    #[error("Unknown tag: {0}")]
    UnknownTag(Uuid),
    #[error("Only the list owner can do that")]
    NotOwner,
    #[error("Todo and tag belong to different lists")]
    CrossListLink,
    #[error(transparent)]
    Invite(#[from] InviteRejection),
}

/// Why an invite could not be used. Each variant has its own user-facing text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InviteRejection {
    #[error("This invite link is invalid or has expired")]
    InvalidOrExpired,
    #[error("You already own this list")]
    AlreadyOwner,
    #[error("Failed to join list: {0}")]
    Failed(String),
}

impl InviteRejection {
    /// Map a store error raised by the invite RPCs onto a rejection
    pub fn classify(err: &StoreError) -> Self {
        let message = match err {
            StoreError::Rejected { message, .. } => message.clone(),
            other => other.to_string(),
        };
        if message.contains("already own") {
            InviteRejection::AlreadyOwner
        } else if message.contains("Invalid or expired") {
            InviteRejection::InvalidOrExpired
        } else {
            InviteRejection::Failed(message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_invite_errors() {
        let expired = StoreError::rejected("Invalid or expired invite");
        assert_eq!(
            InviteRejection::classify(&expired),
            InviteRejection::InvalidOrExpired
        );

        let owner = StoreError::rejected("You already own this list");
        assert_eq!(InviteRejection::classify(&owner), InviteRejection::AlreadyOwner);

        let other = StoreError::Transport("connection reset".to_string());
        assert_eq!(
            InviteRejection::classify(&other),
            InviteRejection::Failed("transport error: connection reset".to_string())
        );
    }

    #[test]
    fn test_rejections_have_distinct_messages() {
        let messages: Vec<String> = [
            InviteRejection::InvalidOrExpired,
            InviteRejection::AlreadyOwner,
            InviteRejection::Failed("boom".to_string()),
        ]
        .iter()
        .map(|r| SyncError::from(r.clone()).to_string())
        .collect();
        assert_eq!(messages[1], "You already own this list");
        assert_ne!(messages[0], messages[1]);
        assert!(messages[2].contains("boom"));
    }
}

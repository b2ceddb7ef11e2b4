//! Client-side synchronization layer for shared todo lists.
//!
//! [`SyncEngine`] keeps lists, todos, tags and todo-tag links of the signed-in
//! user consistent with a [`RemoteStore`] that changes through local actions
//! and through realtime events from other clients.

pub mod cache;
pub mod engine;
pub mod error;
pub mod prefs;
pub mod repository;
pub mod resolver;
pub mod selection;
pub mod store;
#[cfg(any(test, feature = "test-support"))]
#[doc(hidden)]
pub mod testing;

pub use engine::{Phase, SyncEngine, Update};
pub use error::{InviteRejection, Result, SyncError};
pub use prefs::{MemoryPreferences, Preferences};
pub use repository::TodoItem;
pub use store::{
    ChangeFeed, Direction, Filter, MemoryBackend, MemorySession, Query, RemoteStore, StoreError,
    Subscription,
};

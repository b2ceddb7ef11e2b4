//! Helpers for driving engines against a [`MemoryBackend`] in tests.

use serde_json::json;
use shared::Collection;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::{MemoryBackend, MemoryPreferences, SyncEngine, Update};

pub fn engine_for(backend: &MemoryBackend, user_id: Uuid) -> SyncEngine {
    SyncEngine::new(
        Arc::new(backend.session(user_id)),
        Box::new(MemoryPreferences::default()),
    )
}

pub async fn started(backend: &MemoryBackend, user_id: Uuid) -> SyncEngine {
    let mut engine = engine_for(backend, user_id);
    engine.start().await.unwrap();
    settle(&mut engine).await;
    engine
}

/// Step until nothing arrives for a short while
pub async fn settle(engine: &mut SyncEngine) -> Vec<Update> {
    let mut updates = Vec::new();
    while let Ok(update) = tokio::time::timeout(Duration::from_millis(50), engine.step()).await {
        updates.push(update);
    }
    updates
}

pub fn seed_list(backend: &MemoryBackend, owner: Uuid, name: &str) -> Uuid {
    let row = backend.seed(Collection::Lists, json!({ "name": name, "user_id": owner }));
    serde_json::from_value(row["id"].clone()).unwrap()
}

pub fn share(backend: &MemoryBackend, list_id: Uuid, user_id: Uuid) {
    backend.seed(
        Collection::ListShares,
        json!({ "list_id": list_id, "user_id": user_id }),
    );
}

//! [`RemoteStore`] backed by a hosted Postgres platform (REST + realtime).

mod realtime;
mod rest;

use anyhow::{Context, Result};
use async_trait::async_trait;
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::Deserialize;
use serde_json::Value;
use shared::Collection;
use std::sync::atomic::{AtomicU64, Ordering};
use tasklist_sync::{Filter, Query, RemoteStore, StoreError, Subscription};
use uuid::Uuid;

use crate::config::RemoteConfig;
use realtime::RealtimeClient;
use rest::RestClient;

#[derive(Debug, Deserialize)]
struct Claims {
    sub: Uuid,
}

/// User id carried in the `sub` claim of an access token.
///
/// The signature is not checked here; the platform verifies it on every
/// request.
pub fn user_id_from_token(token: &str) -> Result<Uuid> {
    let mut validation = Validation::default();
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    let data = decode::<Claims>(token, &DecodingKey::from_secret(&[]), &validation)
        .context("Access token is not a valid JWT")?;
    Ok(data.claims.sub)
}

pub struct HostedStore {
    rest: RestClient,
    realtime: RealtimeClient,
    user_id: Option<Uuid>,
    next_subscription: AtomicU64,
}

impl HostedStore {
    /// Must be called inside a tokio runtime (spawns the realtime socket)
    pub fn connect(config: &RemoteConfig) -> Result<Self> {
        let url = config
            .url
            .as_deref()
            .context("No platform URL configured. Run: tasklists config set url <URL>")?;
        let anon_key = config
            .anon_key
            .as_deref()
            .context("No anon key configured. Run: tasklists config set anon_key <KEY>")?;

        let user_id = match config.token.as_deref() {
            Some(token) => Some(user_id_from_token(token)?),
            None => None,
        };
        let access_token = config.token.clone().unwrap_or_else(|| anon_key.to_string());

        tracing::info!("Using hosted store at {}", url);
        Ok(Self {
            rest: RestClient::new(url, anon_key, config.token.clone()),
            realtime: RealtimeClient::spawn(url, anon_key, access_token),
            user_id,
            next_subscription: AtomicU64::new(1),
        })
    }
}

fn single(mut rows: Vec<Value>, collection: Collection) -> Result<Value, StoreError> {
    if rows.is_empty() {
        return Err(StoreError::Decode(format!("{} write returned no row", collection)));
    }
    Ok(rows.swap_remove(0))
}

#[async_trait]
impl RemoteStore for HostedStore {
    async fn query(&self, collection: Collection, query: Query) -> Result<Vec<Value>, StoreError> {
        self.rest.select(collection, &query).await
    }

    async fn insert(&self, collection: Collection, row: Value) -> Result<Value, StoreError> {
        let rows = self.rest.insert(collection, row, false).await?;
        single(rows, collection)
    }

    async fn insert_many(
        &self,
        collection: Collection,
        rows: Vec<Value>,
    ) -> Result<Vec<Value>, StoreError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        self.rest.insert(collection, Value::Array(rows), false).await
    }

    async fn upsert(&self, collection: Collection, row: Value) -> Result<Value, StoreError> {
        let rows = self.rest.insert(collection, row, true).await?;
        single(rows, collection)
    }

    async fn update(
        &self,
        collection: Collection,
        filters: Vec<Filter>,
        patch: Value,
    ) -> Result<(), StoreError> {
        self.rest.update(collection, &filters, patch).await
    }

    async fn delete(&self, collection: Collection, filters: Vec<Filter>) -> Result<(), StoreError> {
        self.rest.delete(collection, &filters).await
    }

    async fn subscribe(
        &self,
        collection: Collection,
        filter: Option<Filter>,
    ) -> Result<Subscription, StoreError> {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.realtime.subscribe(id, collection, filter.as_ref()).await
    }

    async fn current_user_id(&self) -> Option<Uuid> {
        self.user_id
    }

    async fn rpc(&self, name: &str, args: Value) -> Result<Value, StoreError> {
        self.rest.rpc(name, args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    #[test]
    fn test_user_id_from_token() {
        let user_id = Uuid::new_v4();
        let token = encode(
            &Header::default(),
            &json!({ "sub": user_id, "role": "authenticated", "exp": 1 }),
            &EncodingKey::from_secret(b"platform-secret"),
        )
        .unwrap();

        assert_eq!(user_id_from_token(&token).unwrap(), user_id);
        assert!(user_id_from_token("not-a-token").is_err());
    }

    #[tokio::test]
    async fn test_connect_requires_url_and_key() {
        let config = RemoteConfig::default();
        assert!(HostedStore::connect(&config).is_err());

        let config = RemoteConfig {
            url: Some("http://127.0.0.1:9".to_string()),
            anon_key: Some("key".to_string()),
            token: None,
        };
        let store = HostedStore::connect(&config).unwrap();
        assert_eq!(store.current_user_id().await, None);
    }

    #[test]
    fn test_single_requires_a_row() {
        assert!(single(Vec::new(), Collection::Lists).is_err());
        assert_eq!(single(vec![json!(1), json!(2)], Collection::Lists).unwrap(), json!(1));
    }
}

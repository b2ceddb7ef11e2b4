//! Remote store capability.
//!
//! The engine never talks to a concrete backend. It is handed an
//! `Arc<dyn RemoteStore>` which provides filtered queries, writes, RPCs and
//! realtime subscriptions over named collections. Rows travel as
//! `serde_json::Value` and are decoded at the edge with [`fetch`] and
//! [`ChangeFeed`].

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use shared::{Change, Collection, RawChange};
use std::cmp::Ordering;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

pub mod memory;

pub use memory::{MemoryBackend, MemorySession};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    /// The store refused the request (row-level security, constraint, RPC raise)
    #[error("{message}")]
    Rejected {
        code: Option<String>,
        message: String,
    },
    #[error("not signed in")]
    Unauthenticated,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("malformed response: {0}")]
    Decode(String),
}

impl StoreError {
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            code: None,
            message: message.into(),
        }
    }

    pub fn rejected_with_code(code: &str, message: impl Into<String>) -> Self {
        Self::Rejected {
            code: Some(code.to_string()),
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

// ============================================================================
// Query predicates
// ============================================================================

/// Predicate over one named field of a row
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    Gt(String, Value),
    In(String, Vec<Value>),
}

fn to_json(value: impl Serialize) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

impl Filter {
    pub fn eq(field: &str, value: impl Serialize) -> Self {
        Self::Eq(field.to_string(), to_json(value))
    }

    pub fn gt(field: &str, value: impl Serialize) -> Self {
        Self::Gt(field.to_string(), to_json(value))
    }

    pub fn is_in<V: Serialize>(field: &str, values: impl IntoIterator<Item = V>) -> Self {
        Self::In(field.to_string(), values.into_iter().map(to_json).collect())
    }

    pub fn field(&self) -> &str {
        match self {
            Filter::Eq(field, _) | Filter::Gt(field, _) | Filter::In(field, _) => field,
        }
    }

    pub fn matches(&self, row: &Value) -> bool {
        let actual = row.get(self.field()).unwrap_or(&Value::Null);
        match self {
            Filter::Eq(_, expected) => compare_values(actual, expected) == Ordering::Equal,
            Filter::Gt(_, bound) => {
                !actual.is_null() && compare_values(actual, bound) == Ordering::Greater
            }
            Filter::In(_, candidates) => candidates
                .iter()
                .any(|c| compare_values(actual, c) == Ordering::Equal),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub field: String,
    pub direction: Direction,
}

/// Filters, ordering and limit for [`RemoteStore::query`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filters: Vec<Filter>,
    pub order: Option<Order>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_by(mut self, field: &str, direction: Direction) -> Self {
        self.order = Some(Order {
            field: field.to_string(),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, row: &Value) -> bool {
        self.filters.iter().all(|f| f.matches(row))
    }
}

fn as_timestamp(value: &Value) -> Option<DateTime<FixedOffset>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
}

/// Total order over JSON scalars as the store compares them.
///
/// RFC 3339 strings compare as instants so that differing fractional
/// precision does not affect ordering.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => match (as_timestamp(a), as_timestamp(b)) {
            (Some(tx), Some(ty)) => tx.cmp(&ty),
            _ => x.cmp(y),
        },
        _ => a.to_string().cmp(&b.to_string()),
    }
}

// ============================================================================
// Subscriptions
// ============================================================================

/// Live change feed for one collection.
///
/// Dropping the subscription (or calling [`Subscription::unsubscribe`])
/// releases it on the store side.
pub struct Subscription {
    id: u64,
    collection: Collection,
    events: UnboundedReceiverStream<RawChange>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(id: u64, collection: Collection, rx: mpsc::UnboundedReceiver<RawChange>) -> Self {
        Self {
            id,
            collection,
            events: UnboundedReceiverStream::new(rx),
            release: None,
        }
    }

    /// Run `release` once when this subscription is dropped
    pub fn on_release(mut self, release: impl FnOnce() + Send + 'static) -> Self {
        self.release = Some(Box::new(release));
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn collection(&self) -> Collection {
        self.collection
    }

    pub fn typed<T: DeserializeOwned>(self) -> ChangeFeed<T> {
        ChangeFeed {
            inner: self,
            _marker: PhantomData,
        }
    }

    pub fn unsubscribe(self) {}
}

impl Stream for Subscription {
    type Item = RawChange;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.events).poll_next(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("collection", &self.collection)
            .finish()
    }
}

/// Typed view over a [`Subscription`]. Rows that fail to decode are skipped.
#[derive(Debug)]
pub struct ChangeFeed<T> {
    inner: Subscription,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> ChangeFeed<T> {
    /// Next decoded change, or `None` once the store closed the feed.
    ///
    /// Cancel-safe: the only await point is the channel receive.
    pub async fn next(&mut self) -> Option<Change<T>> {
        loop {
            let raw = self.inner.next().await?;
            match raw.decode::<T>() {
                Ok(change) => return Some(change),
                Err(e) => {
                    tracing::warn!(
                        "Skipping malformed {} change on {}: {}",
                        self.inner.collection(),
                        self.inner.id(),
                        e
                    );
                }
            }
        }
    }

    pub fn collection(&self) -> Collection {
        self.inner.collection()
    }
}

// ============================================================================
// Capability
// ============================================================================

#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn query(&self, collection: Collection, query: Query) -> Result<Vec<Value>, StoreError>;

    /// Insert one row and return it as stored (with generated columns)
    async fn insert(&self, collection: Collection, row: Value) -> Result<Value, StoreError>;

    async fn insert_many(
        &self,
        collection: Collection,
        rows: Vec<Value>,
    ) -> Result<Vec<Value>, StoreError>;

    /// Insert, or merge into the row with the same primary key
    async fn upsert(&self, collection: Collection, row: Value) -> Result<Value, StoreError>;

    async fn update(
        &self,
        collection: Collection,
        filters: Vec<Filter>,
        patch: Value,
    ) -> Result<(), StoreError>;

    async fn delete(&self, collection: Collection, filters: Vec<Filter>) -> Result<(), StoreError>;

    async fn subscribe(
        &self,
        collection: Collection,
        filter: Option<Filter>,
    ) -> Result<Subscription, StoreError>;

    async fn current_user_id(&self) -> Option<Uuid>;

    async fn rpc(&self, name: &str, args: Value) -> Result<Value, StoreError>;
}

// ============================================================================
// Typed helpers
// ============================================================================

pub async fn fetch<T: DeserializeOwned>(
    store: &dyn RemoteStore,
    collection: Collection,
    query: Query,
) -> Result<Vec<T>, StoreError> {
    let rows = store.query(collection, query).await?;
    rows.into_iter()
        .map(|row| serde_json::from_value(row).map_err(StoreError::from))
        .collect()
}

pub async fn insert_row<T: DeserializeOwned>(
    store: &dyn RemoteStore,
    collection: Collection,
    row: impl Serialize,
) -> Result<T, StoreError> {
    let stored = store.insert(collection, serde_json::to_value(row)?).await?;
    Ok(serde_json::from_value(stored)?)
}

pub async fn call_rpc<T: DeserializeOwned>(
    store: &dyn RemoteStore,
    name: &str,
    args: Value,
) -> Result<T, StoreError> {
    let value = store.rpc(name, args).await?;
    Ok(serde_json::from_value(value)?)
}

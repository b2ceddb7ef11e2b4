//! In-process reference implementation of [`RemoteStore`].
//!
//! A [`MemoryBackend`] holds every collection plus the realtime subscribers.
//! Each signed-in user talks to it through a [`MemorySession`], which applies
//! the same visibility rules the hosted store enforces with row-level
//! security. Used by the offline mode of the client and by tests.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::{json, Map, Value};
use shared::{Collection, RawChange};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{compare_values, Direction, Filter, Query, RemoteStore, StoreError, Subscription};

const INVITE_LIFETIME_DAYS: i64 = 7;
const PERMISSION_DENIED: &str = "42501";
const UNIQUE_VIOLATION: &str = "23505";
const FOREIGN_KEY_VIOLATION: &str = "23503";

struct Subscriber {
    id: u64,
    user_id: Option<Uuid>,
    collection: Collection,
    filter: Option<Filter>,
    tx: mpsc::UnboundedSender<RawChange>,
}

#[derive(Default)]
struct Inner {
    tables: HashMap<Collection, Vec<Value>>,
    emails: HashMap<Uuid, String>,
    subscribers: Vec<Subscriber>,
    next_subscription: u64,
    clock: Option<DateTime<Utc>>,
    pending_failures: Vec<Collection>,
    failing_queries: Vec<Collection>,
    query_delay: Option<Duration>,
}

fn uuid_field(row: &Value, field: &str) -> Option<Uuid> {
    row.get(field)
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
}

fn primary_key(collection: Collection) -> &'static [&'static str] {
    match collection {
        Collection::TodoTags => &["todo_id", "tag_id"],
        Collection::ListShares => &["list_id", "user_id"],
        _ => &["id"],
    }
}

fn key_of(collection: Collection, row: &Value) -> Value {
    let mut key = Map::new();
    for field in primary_key(collection) {
        key.insert(
            field.to_string(),
            row.get(*field).cloned().unwrap_or(Value::Null),
        );
    }
    Value::Object(key)
}

fn same_key(collection: Collection, a: &Value, b: &Value) -> bool {
    primary_key(collection)
        .iter()
        .all(|field| a.get(*field).is_some() && a.get(*field) == b.get(*field))
}

fn permission_denied(collection: Collection) -> StoreError {
    StoreError::rejected_with_code(
        PERMISSION_DENIED,
        format!("permission denied for table {}", collection),
    )
}

impl Inner {
    fn rows(&self, collection: Collection) -> &[Value] {
        self.tables
            .get(&collection)
            .map(|rows| rows.as_slice())
            .unwrap_or(&[])
    }

    fn rows_mut(&mut self, collection: Collection) -> &mut Vec<Value> {
        self.tables.entry(collection).or_default()
    }

    /// Strictly increasing timestamps so creation order is total
    fn now(&mut self) -> DateTime<Utc> {
        let mut now = Utc::now();
        if let Some(last) = self.clock {
            if now <= last {
                now = last + ChronoDuration::microseconds(1);
            }
        }
        self.clock = Some(now);
        now
    }

    fn take_failure(&mut self, collection: Collection) -> Result<(), StoreError> {
        if let Some(pos) = self.pending_failures.iter().position(|c| *c == collection) {
            self.pending_failures.remove(pos);
            return Err(StoreError::rejected(format!(
                "write to {} failed (injected)",
                collection
            )));
        }
        Ok(())
    }

    fn find(&self, collection: Collection, id: Uuid) -> Option<&Value> {
        self.rows(collection)
            .iter()
            .find(|row| uuid_field(row, "id") == Some(id))
    }

    fn list_owner(&self, list_id: Uuid) -> Option<Uuid> {
        self.find(Collection::Lists, list_id)
            .and_then(|list| uuid_field(list, "user_id"))
    }

    fn has_share(&self, list_id: Uuid, user_id: Uuid) -> bool {
        self.rows(Collection::ListShares).iter().any(|share| {
            uuid_field(share, "list_id") == Some(list_id)
                && uuid_field(share, "user_id") == Some(user_id)
        })
    }

    fn can_see_list(&self, user: Uuid, list_id: Uuid) -> bool {
        match self.list_owner(list_id) {
            Some(owner) => owner == user || self.has_share(list_id, user),
            None => false,
        }
    }

    fn visible(&self, user: Option<Uuid>, collection: Collection, row: &Value) -> bool {
        let Some(user) = user else {
            return false;
        };
        let list_of = |field: &str| uuid_field(row, field);
        match collection {
            Collection::Lists => list_of("id").is_some_and(|id| self.can_see_list(user, id)),
            Collection::Todos | Collection::Tags => {
                list_of("list_id").is_some_and(|id| self.can_see_list(user, id))
            }
            Collection::TodoTags => uuid_field(row, "todo_id")
                .and_then(|todo_id| self.find(Collection::Todos, todo_id))
                .and_then(|todo| uuid_field(todo, "list_id"))
                .is_some_and(|id| self.can_see_list(user, id)),
            Collection::ListShares => {
                uuid_field(row, "user_id") == Some(user)
                    || list_of("list_id").and_then(|id| self.list_owner(id)) == Some(user)
            }
            Collection::InviteTokens => {
                list_of("list_id").and_then(|id| self.list_owner(id)) == Some(user)
            }
            Collection::Profiles => true,
        }
    }

    fn can_write(&self, user: Uuid, collection: Collection, row: &Value) -> bool {
        match collection {
            Collection::Lists => uuid_field(row, "user_id") == Some(user),
            Collection::InviteTokens => {
                uuid_field(row, "list_id").and_then(|id| self.list_owner(id)) == Some(user)
            }
            Collection::Profiles => uuid_field(row, "id") == Some(user),
            _ => self.visible(Some(user), collection, row),
        }
    }

    fn check_insert(&self, user: Uuid, collection: Collection, row: &Value) -> Result<(), StoreError> {
        let missing_parent = |what: &str| {
            StoreError::rejected_with_code(
                FOREIGN_KEY_VIOLATION,
                format!("insert on {} references a missing {}", collection, what),
            )
        };
        match collection {
            Collection::Lists => {
                if uuid_field(row, "user_id") != Some(user) {
                    return Err(permission_denied(collection));
                }
            }
            Collection::Todos | Collection::Tags => {
                let list_id = uuid_field(row, "list_id").ok_or_else(|| missing_parent("list"))?;
                if self.find(Collection::Lists, list_id).is_none() {
                    return Err(missing_parent("list"));
                }
                if !self.can_see_list(user, list_id) {
                    return Err(permission_denied(collection));
                }
            }
            Collection::TodoTags => {
                let todo = uuid_field(row, "todo_id").and_then(|id| self.find(Collection::Todos, id));
                let tag = uuid_field(row, "tag_id").and_then(|id| self.find(Collection::Tags, id));
                if todo.is_none() {
                    return Err(missing_parent("todo"));
                }
                if tag.is_none() {
                    return Err(missing_parent("tag"));
                }
                if !self.visible(Some(user), collection, row) {
                    return Err(permission_denied(collection));
                }
            }
            Collection::ListShares => {
                let list_id = uuid_field(row, "list_id").ok_or_else(|| missing_parent("list"))?;
                if self.list_owner(list_id) != Some(user) {
                    return Err(permission_denied(collection));
                }
            }
            Collection::InviteTokens => {
                if uuid_field(row, "created_by") != Some(user) || !self.can_write(user, collection, row) {
                    return Err(permission_denied(collection));
                }
            }
            Collection::Profiles => {
                if !self.can_write(user, collection, row) {
                    return Err(permission_denied(collection));
                }
            }
        }
        if self.rows(collection).iter().any(|existing| same_key(collection, existing, row)) {
            return Err(StoreError::rejected_with_code(
                UNIQUE_VIOLATION,
                format!("duplicate key value violates unique constraint on {}", collection),
            ));
        }
        Ok(())
    }

    fn fill_defaults(&mut self, collection: Collection, row: &mut Map<String, Value>) {
        if !matches!(
            collection,
            Collection::TodoTags | Collection::ListShares | Collection::Profiles
        ) {
            row.entry("id").or_insert_with(|| json!(Uuid::new_v4()));
        }
        if !matches!(collection, Collection::TodoTags | Collection::ListShares) {
            let now = self.now();
            row.entry("created_at").or_insert_with(|| json!(now));
        }
        match collection {
            Collection::Todos => {
                row.entry("completed").or_insert(Value::Bool(false));
            }
            Collection::Tags => {
                row.entry("color").or_insert_with(|| json!("blue"));
            }
            Collection::InviteTokens => {
                let now = self.now();
                row.entry("token")
                    .or_insert_with(|| json!(Uuid::new_v4().simple().to_string()));
                row.entry("expires_at")
                    .or_insert_with(|| json!(now + ChronoDuration::days(INVITE_LIFETIME_DAYS)));
                row.entry("is_active").or_insert(Value::Bool(true));
            }
            _ => {}
        }
    }

    fn recipients(&self, collection: Collection, row: &Value) -> Vec<usize> {
        self.subscribers
            .iter()
            .enumerate()
            .filter(|(_, sub)| {
                sub.collection == collection
                    && sub.filter.as_ref().map_or(true, |f| f.matches(row))
                    && self.visible(sub.user_id, collection, row)
            })
            .map(|(i, _)| i)
            .collect()
    }

    fn send(&self, recipients: &[usize], change: &RawChange) {
        for &i in recipients {
            if let Some(sub) = self.subscribers.get(i) {
                if sub.tx.send(change.clone()).is_err() {
                    tracing::debug!("Subscriber {} already gone", sub.id);
                }
            }
        }
    }

    fn publish(&self, collection: Collection, change: RawChange) {
        let recipients = self.recipients(collection, &change.record);
        self.send(&recipients, &change);
    }

    /// Drop rows whose parent disappeared. The hosted store cascades the same
    /// way and does not promise change events for the children.
    fn prune_orphans(&mut self) {
        let lists: Vec<Uuid> = self
            .rows(Collection::Lists)
            .iter()
            .filter_map(|r| uuid_field(r, "id"))
            .collect();
        for collection in [
            Collection::Todos,
            Collection::Tags,
            Collection::ListShares,
            Collection::InviteTokens,
        ] {
            self.rows_mut(collection)
                .retain(|r| uuid_field(r, "list_id").is_some_and(|id| lists.contains(&id)));
        }
        let todos: Vec<Uuid> = self
            .rows(Collection::Todos)
            .iter()
            .filter_map(|r| uuid_field(r, "id"))
            .collect();
        let tags: Vec<Uuid> = self
            .rows(Collection::Tags)
            .iter()
            .filter_map(|r| uuid_field(r, "id"))
            .collect();
        self.rows_mut(Collection::TodoTags).retain(|r| {
            uuid_field(r, "todo_id").is_some_and(|id| todos.contains(&id))
                && uuid_field(r, "tag_id").is_some_and(|id| tags.contains(&id))
        });
    }

    fn valid_invite(&self, token: &str) -> Option<Value> {
        let now = json!(Utc::now());
        self.rows(Collection::InviteTokens)
            .iter()
            .find(|invite| {
                invite.get("token").and_then(Value::as_str) == Some(token)
                    && invite.get("is_active") == Some(&Value::Bool(true))
                    && invite
                        .get("expires_at")
                        .is_some_and(|at| compare_values(at, &now).is_gt())
            })
            .cloned()
    }

    fn member_row(&self, user_id: Uuid, is_owner: bool) -> Value {
        let display_name = self
            .find(Collection::Profiles, user_id)
            .and_then(|p| p.get("display_name").cloned())
            .unwrap_or(Value::Null);
        json!({
            "user_id": user_id,
            "email": self.emails.get(&user_id).cloned().unwrap_or_default(),
            "display_name": display_name,
            "is_owner": is_owner,
        })
    }
}

/// Shared state of the in-memory store
#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a user account and return its id
    pub fn add_user(&self, email: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.lock().emails.insert(id, email.to_string());
        id
    }

    pub fn session(&self, user_id: Uuid) -> MemorySession {
        MemorySession {
            backend: self.clone(),
            user_id: Some(user_id),
        }
    }

    pub fn anonymous(&self) -> MemorySession {
        MemorySession {
            backend: self.clone(),
            user_id: None,
        }
    }

    /// Make the next write to `collection` fail
    pub fn fail_next_write(&self, collection: Collection) {
        self.lock().pending_failures.push(collection);
    }

    /// Make the next query of `collection` fail with a transport error
    pub fn fail_next_query(&self, collection: Collection) {
        self.lock().failing_queries.push(collection);
    }

    /// Delay every query by `delay` before it reads the tables
    pub fn set_query_delay(&self, delay: Option<Duration>) {
        self.lock().query_delay = delay;
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Raw rows of a collection, bypassing visibility
    pub fn rows(&self, collection: Collection) -> Vec<Value> {
        self.lock().rows(collection).to_vec()
    }

    /// Insert a row without permission checks or change events
    pub fn seed(&self, collection: Collection, row: Value) -> Value {
        let mut inner = self.lock();
        let mut row = match row {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        inner.fill_defaults(collection, &mut row);
        let row = Value::Object(row);
        inner.rows_mut(collection).push(row.clone());
        row
    }
}

/// One user's view of a [`MemoryBackend`]
#[derive(Clone)]
pub struct MemorySession {
    backend: MemoryBackend,
    user_id: Option<Uuid>,
}

impl MemorySession {
    pub fn backend(&self) -> &MemoryBackend {
        &self.backend
    }

    fn require_user(&self) -> Result<Uuid, StoreError> {
        self.user_id.ok_or(StoreError::Unauthenticated)
    }

    fn insert_rows(
        &self,
        inner: &mut Inner,
        collection: Collection,
        rows: Vec<Value>,
    ) -> Result<Vec<Value>, StoreError> {
        let user = self.require_user()?;
        let mut prepared = Vec::with_capacity(rows.len());
        for row in rows {
            let Value::Object(mut map) = row else {
                return Err(StoreError::Decode(format!(
                    "insert into {} expects an object",
                    collection
                )));
            };
            inner.fill_defaults(collection, &mut map);
            let row = Value::Object(map);
            inner.check_insert(user, collection, &row)?;
            if prepared.iter().any(|p| same_key(collection, p, &row)) {
                return Err(StoreError::rejected_with_code(
                    UNIQUE_VIOLATION,
                    format!("duplicate key value violates unique constraint on {}", collection),
                ));
            }
            prepared.push(row);
        }
        inner.rows_mut(collection).extend(prepared.iter().cloned());
        for row in &prepared {
            inner.publish(collection, RawChange::insert(row.clone()));
        }
        Ok(prepared)
    }

    fn matching(&self, inner: &Inner, collection: Collection, filters: &[Filter]) -> Vec<usize> {
        inner
            .rows(collection)
            .iter()
            .enumerate()
            .filter(|(_, row)| {
                filters.iter().all(|f| f.matches(row)) && inner.visible(self.user_id, collection, row)
            })
            .map(|(i, _)| i)
            .collect()
    }

    fn rpc_get_invite_info(&self, inner: &Inner, args: &Value) -> Result<Value, StoreError> {
        let token = args.get("_token").and_then(Value::as_str).unwrap_or_default();
        let invite = inner
            .valid_invite(token)
            .ok_or_else(|| StoreError::rejected("Invalid or expired invite"))?;
        let list_id = uuid_field(&invite, "list_id")
            .ok_or_else(|| StoreError::rejected("Invalid or expired invite"))?;
        let list_name = inner
            .find(Collection::Lists, list_id)
            .and_then(|list| list.get("name").cloned())
            .unwrap_or(Value::Null);
        Ok(json!({ "list_id": list_id, "list_name": list_name }))
    }

    fn rpc_accept_invite(&self, inner: &mut Inner, args: &Value) -> Result<Value, StoreError> {
        let user = self.require_user()?;
        let token = args.get("_token").and_then(Value::as_str).unwrap_or_default();
        let invite = inner
            .valid_invite(token)
            .ok_or_else(|| StoreError::rejected("Invalid or expired invite"))?;
        let list_id = uuid_field(&invite, "list_id")
            .ok_or_else(|| StoreError::rejected("Invalid or expired invite"))?;
        if inner.list_owner(list_id) == Some(user) {
            return Err(StoreError::rejected("You already own this list"));
        }
        if !inner.has_share(list_id, user) {
            let share = json!({ "list_id": list_id, "user_id": user });
            inner.rows_mut(Collection::ListShares).push(share.clone());
            inner.publish(Collection::ListShares, RawChange::insert(share));
        }
        Ok(json!(list_id))
    }

    fn rpc_get_list_members(&self, inner: &Inner, args: &Value) -> Result<Value, StoreError> {
        let user = self.require_user()?;
        let list_id = args
            .get("_list_id")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| StoreError::rejected("List not found"))?;
        if inner.list_owner(list_id) != Some(user) {
            return Err(StoreError::rejected("Only the list owner can view members"));
        }
        let mut members = vec![inner.member_row(user, true)];
        members.extend(
            inner
                .rows(Collection::ListShares)
                .iter()
                .filter(|share| uuid_field(share, "list_id") == Some(list_id))
                .filter_map(|share| uuid_field(share, "user_id"))
                .map(|member| inner.member_row(member, false)),
        );
        Ok(Value::Array(members))
    }
}

#[async_trait]
impl RemoteStore for MemorySession {
    async fn query(&self, collection: Collection, query: Query) -> Result<Vec<Value>, StoreError> {
        let delay = self.backend.lock().query_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.backend.lock();
        if let Some(pos) = inner.failing_queries.iter().position(|c| *c == collection) {
            inner.failing_queries.remove(pos);
            return Err(StoreError::Transport(format!(
                "query of {} failed (injected)",
                collection
            )));
        }
        let mut rows: Vec<Value> = inner
            .rows(collection)
            .iter()
            .filter(|row| query.matches(row) && inner.visible(self.user_id, collection, row))
            .cloned()
            .collect();
        if let Some(order) = &query.order {
            rows.sort_by(|a, b| {
                let ord = compare_values(
                    a.get(&order.field).unwrap_or(&Value::Null),
                    b.get(&order.field).unwrap_or(&Value::Null),
                );
                match order.direction {
                    Direction::Asc => ord,
                    Direction::Desc => ord.reverse(),
                }
            });
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn insert(&self, collection: Collection, row: Value) -> Result<Value, StoreError> {
        let mut rows = self.insert_many(collection, vec![row]).await?;
        rows.pop()
            .ok_or_else(|| StoreError::Decode("insert returned no row".to_string()))
    }

    async fn insert_many(
        &self,
        collection: Collection,
        rows: Vec<Value>,
    ) -> Result<Vec<Value>, StoreError> {
        let mut inner = self.backend.lock();
        inner.take_failure(collection)?;
        self.insert_rows(&mut inner, collection, rows)
    }

    async fn upsert(&self, collection: Collection, row: Value) -> Result<Value, StoreError> {
        let user = self.require_user()?;
        let mut inner = self.backend.lock();
        inner.take_failure(collection)?;

        let existing = inner
            .rows(collection)
            .iter()
            .position(|r| same_key(collection, r, &row));
        let Some(index) = existing else {
            let mut rows = self.insert_rows(&mut inner, collection, vec![row])?;
            return rows
                .pop()
                .ok_or_else(|| StoreError::Decode("upsert returned no row".to_string()));
        };

        if !inner.can_write(user, collection, &inner.rows(collection)[index]) {
            return Err(permission_denied(collection));
        }
        let merged = {
            let target = &mut inner.rows_mut(collection)[index];
            if let (Value::Object(target), Value::Object(patch)) = (target, &row) {
                for (k, v) in patch {
                    target.insert(k.clone(), v.clone());
                }
            }
            inner.rows(collection)[index].clone()
        };
        inner.publish(collection, RawChange::update(merged.clone()));
        Ok(merged)
    }

    async fn update(
        &self,
        collection: Collection,
        filters: Vec<Filter>,
        patch: Value,
    ) -> Result<(), StoreError> {
        let user = self.require_user()?;
        let mut inner = self.backend.lock();
        inner.take_failure(collection)?;

        let matched = self.matching(&inner, collection, &filters);
        if matched
            .iter()
            .any(|&i| !inner.can_write(user, collection, &inner.rows(collection)[i]))
        {
            return Err(permission_denied(collection));
        }
        let Value::Object(patch) = patch else {
            return Err(StoreError::Decode("update patch must be an object".to_string()));
        };

        let mut updated = Vec::with_capacity(matched.len());
        for i in matched {
            if let Value::Object(row) = &mut inner.rows_mut(collection)[i] {
                for (k, v) in &patch {
                    row.insert(k.clone(), v.clone());
                }
            }
            updated.push(inner.rows(collection)[i].clone());
        }
        for row in updated {
            inner.publish(collection, RawChange::update(row));
        }
        Ok(())
    }

    async fn delete(&self, collection: Collection, filters: Vec<Filter>) -> Result<(), StoreError> {
        let user = self.require_user()?;
        let mut inner = self.backend.lock();
        inner.take_failure(collection)?;

        let matched = self.matching(&inner, collection, &filters);
        if matched
            .iter()
            .any(|&i| !inner.can_write(user, collection, &inner.rows(collection)[i]))
        {
            return Err(permission_denied(collection));
        }

        // Recipients are resolved before removal, while the row is still visible
        let notices: Vec<(Vec<usize>, RawChange)> = matched
            .iter()
            .map(|&i| {
                let row = &inner.rows(collection)[i];
                (
                    inner.recipients(collection, row),
                    RawChange::delete(key_of(collection, row)),
                )
            })
            .collect();

        let rows = inner.rows_mut(collection);
        for &i in matched.iter().rev() {
            rows.remove(i);
        }
        inner.prune_orphans();

        for (recipients, change) in &notices {
            inner.send(recipients, change);
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        collection: Collection,
        filter: Option<Filter>,
    ) -> Result<Subscription, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut inner = self.backend.lock();
            inner.next_subscription += 1;
            let id = inner.next_subscription;
            inner.subscribers.push(Subscriber {
                id,
                user_id: self.user_id,
                collection,
                filter,
                tx,
            });
            id
        };

        let weak: Weak<Mutex<Inner>> = Arc::downgrade(&self.backend.inner);
        Ok(Subscription::new(id, collection, rx).on_release(move || {
            if let Some(inner) = weak.upgrade() {
                let mut inner = inner.lock().unwrap_or_else(PoisonError::into_inner);
                inner.subscribers.retain(|s| s.id != id);
            }
        }))
    }

    async fn current_user_id(&self) -> Option<Uuid> {
        self.user_id
    }

    async fn rpc(&self, name: &str, args: Value) -> Result<Value, StoreError> {
        let mut inner = self.backend.lock();
        match name {
            "get_invite_info" => self.rpc_get_invite_info(&inner, &args),
            "accept_invite" => self.rpc_accept_invite(&mut inner, &args),
            "get_list_members" => self.rpc_get_list_members(&inner, &args),
            _ => Err(StoreError::rejected_with_code(
                "PGRST202",
                format!("Could not find the function {}", name),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    async fn new_list(session: &MemorySession, owner: Uuid, name: &str) -> Value {
        session
            .insert(Collection::Lists, json!({ "name": name, "user_id": owner }))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_insert_fills_generated_columns() {
        let backend = MemoryBackend::new();
        let alice = backend.add_user("alice@example.com");
        let session = backend.session(alice);

        let list = new_list(&session, alice, "Groceries").await;
        assert!(uuid_field(&list, "id").is_some());
        assert!(list.get("created_at").is_some());

        let todo = session
            .insert(
                Collection::Todos,
                json!({ "list_id": list["id"], "text": "Buy milk" }),
            )
            .await
            .unwrap();
        assert_eq!(todo["completed"], false);
    }

    #[tokio::test]
    async fn test_created_at_is_strictly_increasing() {
        let backend = MemoryBackend::new();
        let alice = backend.add_user("alice@example.com");
        let session = backend.session(alice);

        let first = new_list(&session, alice, "a").await;
        let second = new_list(&session, alice, "b").await;
        assert!(compare_values(&second["created_at"], &first["created_at"]).is_gt());
    }

    #[tokio::test]
    async fn test_lists_are_private_until_shared() {
        let backend = MemoryBackend::new();
        let alice = backend.add_user("alice@example.com");
        let bob = backend.add_user("bob@example.com");
        let list = new_list(&backend.session(alice), alice, "Private").await;

        let seen = backend
            .session(bob)
            .query(Collection::Lists, Query::new())
            .await
            .unwrap();
        assert!(seen.is_empty());

        backend.seed(
            Collection::ListShares,
            json!({ "list_id": list["id"], "user_id": bob }),
        );
        let seen = backend
            .session(bob)
            .query(Collection::Lists, Query::new())
            .await
            .unwrap();
        assert_eq!(seen.len(), 1);
    }

    #[tokio::test]
    async fn test_non_owner_cannot_delete_list() {
        let backend = MemoryBackend::new();
        let alice = backend.add_user("alice@example.com");
        let bob = backend.add_user("bob@example.com");
        let list = new_list(&backend.session(alice), alice, "Shared").await;
        backend.seed(
            Collection::ListShares,
            json!({ "list_id": list["id"], "user_id": bob }),
        );

        let err = backend
            .session(bob)
            .delete(Collection::Lists, vec![Filter::eq("id", &list["id"])])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Rejected { code: Some(ref c), .. } if c == PERMISSION_DENIED));
        assert_eq!(backend.rows(Collection::Lists).len(), 1);
    }

    #[tokio::test]
    async fn test_list_delete_cascades_without_child_events() {
        let backend = MemoryBackend::new();
        let alice = backend.add_user("alice@example.com");
        let session = backend.session(alice);
        let list = new_list(&session, alice, "Doomed").await;
        session
            .insert(Collection::Todos, json!({ "list_id": list["id"], "text": "x" }))
            .await
            .unwrap();

        let mut todos = session.subscribe(Collection::Todos, None).await.unwrap();
        let mut lists = session.subscribe(Collection::Lists, None).await.unwrap();
        session
            .delete(Collection::Lists, vec![Filter::eq("id", &list["id"])])
            .await
            .unwrap();

        assert!(backend.rows(Collection::Todos).is_empty());
        let change = lists.next().await.unwrap();
        assert_eq!(change.kind, shared::ChangeKind::Delete);
        assert_eq!(change.record, json!({ "id": list["id"] }));
        assert!(
            tokio::time::timeout(Duration::from_millis(20), todos.next())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_subscription_filter_and_release() {
        let backend = MemoryBackend::new();
        let alice = backend.add_user("alice@example.com");
        let session = backend.session(alice);
        let a = new_list(&session, alice, "a").await;
        let b = new_list(&session, alice, "b").await;

        let mut feed = session
            .subscribe(Collection::Todos, Some(Filter::eq("list_id", &a["id"])))
            .await
            .unwrap();
        assert_eq!(backend.subscriber_count(), 1);

        session
            .insert(Collection::Todos, json!({ "list_id": b["id"], "text": "other" }))
            .await
            .unwrap();
        session
            .insert(Collection::Todos, json!({ "list_id": a["id"], "text": "mine" }))
            .await
            .unwrap();
        let change = feed.next().await.unwrap();
        assert_eq!(change.record["text"], "mine");

        drop(feed);
        assert_eq!(backend.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_injected_failure_leaves_tables_untouched() {
        let backend = MemoryBackend::new();
        let alice = backend.add_user("alice@example.com");
        let session = backend.session(alice);
        backend.fail_next_write(Collection::Lists);

        assert!(session
            .insert(Collection::Lists, json!({ "name": "x", "user_id": alice }))
            .await
            .is_err());
        assert!(backend.rows(Collection::Lists).is_empty());
        assert!(session
            .insert(Collection::Lists, json!({ "name": "x", "user_id": alice }))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_injected_query_failure_is_one_shot() {
        let backend = MemoryBackend::new();
        let alice = backend.add_user("alice@example.com");
        let session = backend.session(alice);
        new_list(&session, alice, "Inbox").await;
        backend.fail_next_query(Collection::Lists);

        assert!(matches!(
            session.query(Collection::Lists, Query::new()).await,
            Err(StoreError::Transport(_))
        ));
        assert_eq!(session.query(Collection::Lists, Query::new()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_accept_invite_rules() {
        let backend = MemoryBackend::new();
        let alice = backend.add_user("alice@example.com");
        let bob = backend.add_user("bob@example.com");
        let owner = backend.session(alice);
        let list = new_list(&owner, alice, "Trip").await;
        let invite = owner
            .insert(
                Collection::InviteTokens,
                json!({ "list_id": list["id"], "created_by": alice }),
            )
            .await
            .unwrap();
        let args = json!({ "_token": invite["token"] });

        let err = owner.rpc("accept_invite", args.clone()).await.unwrap_err();
        assert_eq!(err.to_string(), "You already own this list");

        let joined = backend.session(bob).rpc("accept_invite", args.clone()).await.unwrap();
        assert_eq!(joined, list["id"]);
        // Accepting twice is harmless
        backend.session(bob).rpc("accept_invite", args).await.unwrap();
        assert_eq!(backend.rows(Collection::ListShares).len(), 1);

        let err = backend
            .session(bob)
            .rpc("accept_invite", json!({ "_token": "nope" }))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Invalid or expired invite");
    }

    #[tokio::test]
    async fn test_expired_invite_is_rejected() {
        let backend = MemoryBackend::new();
        let alice = backend.add_user("alice@example.com");
        let bob = backend.add_user("bob@example.com");
        let list = new_list(&backend.session(alice), alice, "Old").await;
        backend.seed(
            Collection::InviteTokens,
            json!({
                "list_id": list["id"],
                "created_by": alice,
                "token": "stale",
                "expires_at": Utc::now() - ChronoDuration::hours(1),
            }),
        );

        let err = backend
            .session(bob)
            .rpc("get_invite_info", json!({ "_token": "stale" }))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Invalid or expired invite");
    }

    #[tokio::test]
    async fn test_members_listing_is_owner_only() {
        let backend = MemoryBackend::new();
        let alice = backend.add_user("alice@example.com");
        let bob = backend.add_user("bob@example.com");
        let list = new_list(&backend.session(alice), alice, "Team").await;
        backend.seed(
            Collection::ListShares,
            json!({ "list_id": list["id"], "user_id": bob }),
        );
        backend.seed(
            Collection::Profiles,
            json!({ "id": bob, "display_name": "Bob" }),
        );
        let args = json!({ "_list_id": list["id"] });

        let members = backend.session(alice).rpc("get_list_members", args.clone()).await.unwrap();
        let members = members.as_array().unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0]["is_owner"], true);
        assert_eq!(members[1]["display_name"], "Bob");

        assert!(backend.session(bob).rpc("get_list_members", args).await.is_err());
    }

    #[tokio::test]
    async fn test_anonymous_session_sees_nothing() {
        let backend = MemoryBackend::new();
        let alice = backend.add_user("alice@example.com");
        new_list(&backend.session(alice), alice, "Mine").await;

        let anon = backend.anonymous();
        assert!(anon.query(Collection::Lists, Query::new()).await.unwrap().is_empty());
        assert_eq!(anon.current_user_id().await, None);
        assert_eq!(
            anon.insert(Collection::Lists, json!({ "name": "x" })).await.unwrap_err(),
            StoreError::Unauthenticated
        );
    }
}

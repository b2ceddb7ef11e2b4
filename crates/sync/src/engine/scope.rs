//! Selected-list scope: loading, remote events and local edits of todos,
//! tags and links.

use serde_json::json;
use shared::{Change, Collection, NewTag, NewTodo, Tag, TagColor, Todo, TodoTagLink};
use std::sync::Arc;
use uuid::Uuid;

use super::{Completion, Phase, ScopeFeeds, ScopeSnapshot, SyncEngine, Update};
use crate::error::{Result, SyncError};
use crate::store::{fetch, insert_row, Direction, Filter, Query, RemoteStore, StoreError};

/// Subscribe first, then fetch, so no change between the two is lost.
/// Events that arrive meanwhile wait in the feeds and are applied after the
/// snapshot is installed.
async fn load_scope(
    store: Arc<dyn RemoteStore>,
    list_id: Uuid,
) -> std::result::Result<(ScopeFeeds, ScopeSnapshot), StoreError> {
    let in_list = Filter::eq("list_id", list_id);
    let todos_feed = store
        .subscribe(Collection::Todos, Some(in_list.clone()))
        .await?
        .typed();
    let tags_feed = store
        .subscribe(Collection::Tags, Some(in_list.clone()))
        .await?
        .typed();
    let links_feed = store.subscribe(Collection::TodoTags, None).await?.typed();

    let (todos, tags) = tokio::try_join!(
        fetch::<Todo>(
            store.as_ref(),
            Collection::Todos,
            Query::new()
                .filter(in_list.clone())
                .order_by("created_at", Direction::Desc),
        ),
        fetch::<Tag>(
            store.as_ref(),
            Collection::Tags,
            Query::new()
                .filter(in_list)
                .order_by("created_at", Direction::Asc),
        ),
    )?;

    let links = if todos.is_empty() {
        Vec::new()
    } else {
        fetch::<TodoTagLink>(
            store.as_ref(),
            Collection::TodoTags,
            Query::new().filter(Filter::is_in("todo_id", todos.iter().map(|t| t.id))),
        )
        .await?
    };

    Ok((
        ScopeFeeds {
            list_id,
            todos: Some(todos_feed),
            tags: Some(tags_feed),
            links: Some(links_feed),
        },
        ScopeSnapshot { todos, tags, links },
    ))
}

fn non_blank(value: &str, what: &str) -> Result<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(SyncError::InvalidInput(format!("{} cannot be empty", what)));
    }
    Ok(value.to_string())
}

impl SyncEngine {
    // ========================================================================
    // Scope transitions
    // ========================================================================

    /// Select a list, or none. Persisted through the preferences.
    ///
    /// Selecting the current list again reloads it when its last load failed.
    pub fn select_list(&mut self, list_id: Option<Uuid>) -> Result<Update> {
        if let Some(id) = list_id {
            self.list(id)?;
        }
        if list_id == self.selection.list_id() && !self.needs_reload() {
            return Ok(Update::Ignored);
        }
        self.enter_scope(list_id);
        Ok(Update::Selected(list_id))
    }

    /// Tear down the current scope and start loading `list_id`
    pub(super) fn enter_scope(&mut self, list_id: Option<Uuid>) {
        self.scope_generation += 1;
        self.scope = None;
        self.link_fetches.clear();
        self.repo.clear_scope();
        self.selection.set_list(list_id);
        self.prefs.set_selected_list(list_id);

        let Some(list_id) = list_id else {
            tracing::info!("No list selected");
            self.phase = Phase::Detached;
            return;
        };

        self.phase = Phase::Loading;
        let generation = self.scope_generation;
        tracing::info!("Loading list {} (generation {})", list_id, generation);

        let store = self.store.clone();
        let done_tx = self.done_tx.clone();
        tokio::spawn(async move {
            let result = load_scope(store, list_id).await;
            let _ = done_tx.send(Completion::ScopeLoaded {
                generation,
                list_id,
                result,
            });
        });
    }

    pub(super) fn finish_scope_load(
        &mut self,
        generation: u64,
        list_id: Uuid,
        result: std::result::Result<(ScopeFeeds, ScopeSnapshot), StoreError>,
    ) -> Update {
        if generation != self.scope_generation {
            tracing::debug!(
                "Discarding stale snapshot of list {} (generation {})",
                list_id,
                generation
            );
            return Update::Stale;
        }

        self.phase = Phase::Ready;
        match result {
            Ok((feeds, snapshot)) => {
                tracing::info!(
                    "List {} ready: {} todos, {} tags",
                    list_id,
                    snapshot.todos.len(),
                    snapshot.tags.len()
                );
                self.scope = Some(feeds);
                self.repo
                    .install_scope(snapshot.todos, snapshot.tags, snapshot.links);
                Update::Loaded(list_id)
            }
            Err(e) => {
                tracing::warn!("Failed to load list {}: {}", list_id, e);
                self.repo.clear_scope();
                Update::LoadFailed(list_id)
            }
        }
    }

    /// A list is selected and loaded, but without live feeds
    fn needs_reload(&self) -> bool {
        self.selection.list_id().is_some() && self.phase == Phase::Ready && self.scope.is_none()
    }

    fn scope_list(&self) -> Option<Uuid> {
        self.scope.as_ref().map(|scope| scope.list_id)
    }

    // ========================================================================
    // Remote events
    // ========================================================================

    pub(super) fn apply_todo_change(&mut self, change: Change<Todo>) -> Update {
        let Some(list_id) = self.scope_list() else {
            return Update::Ignored;
        };
        let changed = match change {
            Change::Insert(todo) => {
                let todo_id = todo.id;
                let added = todo.list_id == list_id && self.repo.insert_todo(todo);
                // Its link events may have been dropped before the todo was cached
                if added {
                    self.refetch_links(todo_id);
                }
                added
            }
            Change::Update(todo) => todo.list_id == list_id && self.repo.update_todo(todo),
            Change::Delete(row) => row
                .id()
                .and_then(|id| self.repo.remove_todo(id))
                .is_some(),
        };
        if changed {
            Update::Todos
        } else {
            Update::Ignored
        }
    }

    pub(super) fn apply_tag_change(&mut self, change: Change<Tag>) -> Update {
        let Some(list_id) = self.scope_list() else {
            return Update::Ignored;
        };
        let changed = match change {
            Change::Insert(tag) => tag.list_id == list_id && self.repo.insert_tag(tag),
            Change::Update(tag) => tag.list_id == list_id && self.repo.update_tag(tag),
            Change::Delete(row) => match row.id() {
                Some(tag_id) => {
                    self.selection.forget_tag(tag_id);
                    self.repo.remove_tag(tag_id).is_some()
                }
                None => false,
            },
        };
        if changed {
            Update::Tags
        } else {
            Update::Ignored
        }
    }

    /// Link events are not filtered by the store; only those touching a
    /// cached todo matter, and they trigger a re-fetch of that todo's links.
    pub(super) fn apply_link_change(&mut self, change: Change<TodoTagLink>) -> Update {
        let todo_id = match &change {
            Change::Insert(link) | Change::Update(link) => Some(link.todo_id),
            Change::Delete(row) => row.uuid_field("todo_id"),
        };
        match todo_id.filter(|id| self.repo.todo(*id).is_some()) {
            Some(todo_id) => {
                self.refetch_links(todo_id);
                Update::Fetching
            }
            None => {
                tracing::debug!("Ignoring link event outside the selected list");
                Update::Ignored
            }
        }
    }

    fn refetch_links(&mut self, todo_id: Uuid) {
        self.link_seq += 1;
        let seq = self.link_seq;
        self.link_fetches.insert(todo_id, seq);

        let generation = self.scope_generation;
        let store = self.store.clone();
        let done_tx = self.done_tx.clone();
        tokio::spawn(async move {
            let result = fetch(
                store.as_ref(),
                Collection::TodoTags,
                Query::new().filter(Filter::eq("todo_id", todo_id)),
            )
            .await;
            let _ = done_tx.send(Completion::LinksFetched {
                generation,
                seq,
                todo_id,
                result,
            });
        });
    }

    pub(super) fn finish_links_fetch(
        &mut self,
        generation: u64,
        seq: u64,
        todo_id: Uuid,
        result: std::result::Result<Vec<TodoTagLink>, StoreError>,
    ) -> Update {
        // A newer fetch for the same todo supersedes this one
        if generation != self.scope_generation || self.link_fetches.get(&todo_id) != Some(&seq) {
            tracing::debug!("Discarding stale links of todo {}", todo_id);
            return Update::Stale;
        }
        self.link_fetches.remove(&todo_id);
        match result {
            Ok(links) => {
                if self.repo.set_links(todo_id, links) {
                    Update::Todos
                } else {
                    Update::Ignored
                }
            }
            Err(e) => {
                tracing::warn!("Failed to fetch links of todo {}: {}", todo_id, e);
                Update::Ignored
            }
        }
    }

    // ========================================================================
    // Todos
    // ========================================================================

    fn require_scope(&self) -> Result<Uuid> {
        self.selection.list_id().ok_or(SyncError::NoListSelected)
    }

    fn require_todo(&self, todo_id: Uuid) -> Result<&Todo> {
        self.repo
            .todo(todo_id)
            .map(|item| &item.todo)
            .ok_or(SyncError::UnknownTodo(todo_id))
    }

    fn require_tag(&self, tag_id: Uuid) -> Result<&Tag> {
        self.repo.tag(tag_id).ok_or(SyncError::UnknownTag(tag_id))
    }

    /// Add a todo to the selected list and attach the pending tags to it
    pub async fn add_todo(&mut self, text: &str) -> Result<Todo> {
        let list_id = self.require_scope()?;
        let text = non_blank(text, "Todo text")?;
        let store = self.store.clone();

        let todo: Todo = insert_row(store.as_ref(), Collection::Todos, NewTodo { list_id, text })
            .await
            .map_err(SyncError::RemoteWrite)?;

        let links: Vec<TodoTagLink> = self
            .selection
            .pending()
            .iter()
            .filter(|tag_id| self.repo.tag(**tag_id).is_some())
            .map(|tag_id| TodoTagLink {
                todo_id: todo.id,
                tag_id: *tag_id,
            })
            .collect();
        let linked = if links.is_empty() {
            Ok(Vec::new())
        } else {
            let rows = links
                .iter()
                .map(serde_json::to_value)
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(StoreError::from)
                .map_err(SyncError::RemoteWrite)?;
            store
                .insert_many(Collection::TodoTags, rows)
                .await
                .map_err(SyncError::RemoteWrite)
        };

        self.repo.insert_todo(todo.clone());
        match linked {
            Ok(_) => {
                self.repo.add_links(&links);
                self.selection.clear_pending();
                Ok(todo)
            }
            Err(e) => {
                tracing::warn!("Todo {} created but tagging failed: {}", todo.id, e);
                Err(e)
            }
        }
    }

    /// Flip the completed flag; returns the new value
    pub async fn toggle_todo(&mut self, todo_id: Uuid) -> Result<bool> {
        let mut todo = self.require_todo(todo_id)?.clone();
        let completed = !todo.completed;
        let store = self.store.clone();
        store
            .update(
                Collection::Todos,
                vec![Filter::eq("id", todo_id)],
                json!({ "completed": completed }),
            )
            .await
            .map_err(SyncError::RemoteWrite)?;

        todo.completed = completed;
        self.repo.update_todo(todo);
        Ok(completed)
    }

    pub async fn delete_todo(&mut self, todo_id: Uuid) -> Result<()> {
        self.require_todo(todo_id)?;
        let store = self.store.clone();
        store
            .delete(Collection::Todos, vec![Filter::eq("id", todo_id)])
            .await
            .map_err(SyncError::RemoteWrite)?;

        self.repo.remove_todo(todo_id);
        Ok(())
    }

    /// Delete every completed todo of the selected list in one call
    pub async fn clear_completed(&mut self) -> Result<usize> {
        let list_id = self.require_scope()?;
        let completed: Vec<Uuid> = self
            .repo
            .todos()
            .iter()
            .filter(|item| item.todo.completed)
            .map(|item| item.todo.id)
            .collect();
        if completed.is_empty() {
            return Ok(0);
        }

        let store = self.store.clone();
        store
            .delete(
                Collection::Todos,
                vec![Filter::eq("list_id", list_id), Filter::eq("completed", true)],
            )
            .await
            .map_err(SyncError::RemoteWrite)?;

        for todo_id in &completed {
            self.repo.remove_todo(*todo_id);
        }
        tracing::info!("Cleared {} completed todos", completed.len());
        Ok(completed.len())
    }

    // ========================================================================
    // Tags
    // ========================================================================

    pub async fn create_tag(&mut self, name: &str, color: TagColor) -> Result<Tag> {
        let list_id = self.require_scope()?;
        let name = non_blank(name, "Tag name")?;
        let store = self.store.clone();
        let tag: Tag = insert_row(
            store.as_ref(),
            Collection::Tags,
            NewTag {
                list_id,
                name,
                color,
            },
        )
        .await
        .map_err(SyncError::RemoteWrite)?;

        self.repo.insert_tag(tag.clone());
        Ok(tag)
    }

    pub async fn update_tag(&mut self, tag_id: Uuid, name: &str, color: TagColor) -> Result<Tag> {
        let name = non_blank(name, "Tag name")?;
        let mut tag = self.require_tag(tag_id)?.clone();
        let store = self.store.clone();
        store
            .update(
                Collection::Tags,
                vec![Filter::eq("id", tag_id)],
                json!({ "name": name, "color": color }),
            )
            .await
            .map_err(SyncError::RemoteWrite)?;

        tag.name = name;
        tag.color = color;
        self.repo.update_tag(tag.clone());
        Ok(tag)
    }

    pub async fn delete_tag(&mut self, tag_id: Uuid) -> Result<()> {
        self.require_tag(tag_id)?;
        let store = self.store.clone();
        store
            .delete(Collection::Tags, vec![Filter::eq("id", tag_id)])
            .await
            .map_err(SyncError::RemoteWrite)?;

        self.repo.remove_tag(tag_id);
        self.selection.forget_tag(tag_id);
        Ok(())
    }

    // ========================================================================
    // Links
    // ========================================================================

    pub async fn link_tag(&mut self, todo_id: Uuid, tag_id: Uuid) -> Result<()> {
        let list_id = self.require_scope()?;
        let todo_list = self.require_todo(todo_id)?.list_id;
        let tag_list = self.require_tag(tag_id)?.list_id;
        if todo_list != list_id || tag_list != list_id {
            return Err(SyncError::CrossListLink);
        }
        if self.repo.has_link(todo_id, tag_id) {
            return Ok(());
        }

        let link = TodoTagLink { todo_id, tag_id };
        let store = self.store.clone();
        store
            .insert(Collection::TodoTags, json!(link))
            .await
            .map_err(SyncError::RemoteWrite)?;

        self.repo.add_links(&[link]);
        Ok(())
    }

    pub async fn unlink_tag(&mut self, todo_id: Uuid, tag_id: Uuid) -> Result<()> {
        self.require_todo(todo_id)?;
        let store = self.store.clone();
        store
            .delete(
                Collection::TodoTags,
                vec![Filter::eq("todo_id", todo_id), Filter::eq("tag_id", tag_id)],
            )
            .await
            .map_err(SyncError::RemoteWrite)?;

        self.repo.remove_link(TodoTagLink { todo_id, tag_id });
        Ok(())
    }

    // ========================================================================
    // Filter and pending tags
    // ========================================================================

    /// Returns whether the tag is part of the filter afterwards
    pub fn toggle_filter_tag(&mut self, tag_id: Uuid) -> Result<bool> {
        self.require_tag(tag_id)?;
        Ok(self.selection.toggle_filter(tag_id))
    }

    pub fn clear_filter(&mut self) {
        self.selection.clear_filter();
    }

    /// Returns whether the tag is pending afterwards
    pub fn toggle_pending_tag(&mut self, tag_id: Uuid) -> Result<bool> {
        self.require_tag(tag_id)?;
        Ok(self.selection.toggle_pending(tag_id))
    }
}

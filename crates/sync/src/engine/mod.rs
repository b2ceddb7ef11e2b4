//! Synchronization engine.
//!
//! One [`SyncEngine`] owns every cache and is driven by a single task. Local
//! operations write to the store first and touch the caches only after the
//! write succeeded. Remote changes and background fetch results are pulled
//! in by [`SyncEngine::step`].
//!
//! Each scope load and each lists re-fetch carries a generation number taken
//! when it was issued; results whose generation is no longer current are
//! dropped.

mod scope;
mod sharing;

use serde::de::DeserializeOwned;
use serde_json::json;
use shared::{Change, Collection, List, ListShare, NewList, Tag, Theme, Todo, TodoTagLink};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{Result, SyncError};
use crate::prefs::Preferences;
use crate::repository::{Repository, TodoItem};
use crate::selection::{choose_list, Selection};
use crate::store::{fetch, insert_row, ChangeFeed, Direction, Filter, Query, RemoteStore, StoreError};

/// Lifecycle of the selected-list scope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No list selected
    Detached,
    /// Snapshot of the selected list is being fetched
    Loading,
    Ready,
}

/// What a call to [`SyncEngine::step`] changed
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    /// The lists cache changed
    Lists,
    /// The selected list changed (a load is in flight when `Some`)
    Selected(Option<Uuid>),
    /// Snapshot of the list is installed
    Loaded(Uuid),
    /// Snapshot fetch failed; the list shows empty
    LoadFailed(Uuid),
    Todos,
    Tags,
    /// A background fetch was started
    Fetching,
    /// A superseded fetch result was dropped
    Stale,
    /// The event did not change anything
    Ignored,
    /// The store closed a feed
    FeedClosed(Collection),
}

struct ScopeFeeds {
    list_id: Uuid,
    todos: Option<ChangeFeed<Todo>>,
    tags: Option<ChangeFeed<Tag>>,
    links: Option<ChangeFeed<TodoTagLink>>,
}

struct ScopeSnapshot {
    todos: Vec<Todo>,
    tags: Vec<Tag>,
    links: Vec<TodoTagLink>,
}

/// Result of a spawned fetch, delivered back to the engine task
enum Completion {
    ScopeLoaded {
        generation: u64,
        list_id: Uuid,
        result: std::result::Result<(ScopeFeeds, ScopeSnapshot), StoreError>,
    },
    LinksFetched {
        generation: u64,
        seq: u64,
        todo_id: Uuid,
        result: std::result::Result<Vec<TodoTagLink>, StoreError>,
    },
    ListsFetched {
        generation: u64,
        result: std::result::Result<Vec<List>, StoreError>,
    },
}

enum Incoming {
    List(Option<Change<List>>),
    Share(Option<Change<ListShare>>),
    Todo(Option<Change<Todo>>),
    Tag(Option<Change<Tag>>),
    Link(Option<Change<TodoTagLink>>),
    Done(Completion),
}

/// Next change of an optional feed; pends forever when there is no feed
async fn next_change<T: DeserializeOwned>(feed: Option<&mut ChangeFeed<T>>) -> Option<Change<T>> {
    match feed {
        Some(feed) => feed.next().await,
        None => std::future::pending().await,
    }
}

fn lists_query() -> Query {
    Query::new().order_by("created_at", Direction::Asc)
}

pub struct SyncEngine {
    store: Arc<dyn RemoteStore>,
    prefs: Box<dyn Preferences>,
    user_id: Option<Uuid>,
    repo: Repository,
    selection: Selection,
    phase: Phase,

    lists_feed: Option<ChangeFeed<List>>,
    shares_feed: Option<ChangeFeed<ListShare>>,
    lists_generation: u64,

    scope: Option<ScopeFeeds>,
    scope_generation: u64,
    link_fetches: HashMap<Uuid, u64>,
    link_seq: u64,

    done_tx: mpsc::UnboundedSender<Completion>,
    done_rx: mpsc::UnboundedReceiver<Completion>,
}

impl SyncEngine {
    pub fn new(store: Arc<dyn RemoteStore>, prefs: Box<dyn Preferences>) -> Self {
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        Self {
            store,
            prefs,
            user_id: None,
            repo: Repository::new(),
            selection: Selection::new(),
            phase: Phase::Detached,
            lists_feed: None,
            shares_feed: None,
            lists_generation: 0,
            scope: None,
            scope_generation: 0,
            link_fetches: HashMap::new(),
            link_seq: 0,
            done_tx,
            done_rx,
        }
    }

    /// Resolve the signed-in user, subscribe to lists and shares, load the
    /// lists and select one.
    pub async fn start(&mut self) -> Result<Update> {
        let store = self.store.clone();
        let user_id = store.current_user_id().await.ok_or(SyncError::NotSignedIn)?;

        let lists_feed = store
            .subscribe(Collection::Lists, None)
            .await
            .map_err(SyncError::RemoteFetch)?
            .typed();
        let shares_feed = store
            .subscribe(Collection::ListShares, Some(Filter::eq("user_id", user_id)))
            .await
            .map_err(SyncError::RemoteFetch)?
            .typed();
        let lists: Vec<List> = fetch(store.as_ref(), Collection::Lists, lists_query())
            .await
            .map_err(SyncError::RemoteFetch)?;

        tracing::info!("Signed in as {} with {} lists", user_id, lists.len());
        self.user_id = Some(user_id);
        self.lists_feed = Some(lists_feed);
        self.shares_feed = Some(shares_feed);
        self.lists_generation += 1;
        Ok(self.install_lists(lists))
    }

    /// Wait for the next feed event or fetch result and apply it.
    ///
    /// Cancel-safe: every await point is a channel receive, so this can be
    /// raced against other input in `tokio::select!`.
    pub async fn step(&mut self) -> Update {
        let incoming = {
            let (todos, tags, links) = match self.scope.as_mut() {
                Some(scope) => (scope.todos.as_mut(), scope.tags.as_mut(), scope.links.as_mut()),
                None => (None, None, None),
            };
            tokio::select! {
                Some(done) = self.done_rx.recv() => Incoming::Done(done),
                change = next_change(self.lists_feed.as_mut()) => Incoming::List(change),
                change = next_change(self.shares_feed.as_mut()) => Incoming::Share(change),
                change = next_change(todos) => Incoming::Todo(change),
                change = next_change(tags) => Incoming::Tag(change),
                change = next_change(links) => Incoming::Link(change),
            }
        };
        self.apply(incoming)
    }

    fn apply(&mut self, incoming: Incoming) -> Update {
        match incoming {
            Incoming::Done(done) => self.complete(done),
            Incoming::List(Some(change)) => self.apply_list_change(change),
            Incoming::Share(Some(change)) => {
                tracing::debug!("Share {:?} event, re-fetching lists", change.kind());
                self.refresh_lists()
            }
            Incoming::Todo(Some(change)) => self.apply_todo_change(change),
            Incoming::Tag(Some(change)) => self.apply_tag_change(change),
            Incoming::Link(Some(change)) => self.apply_link_change(change),
            Incoming::List(None) => {
                self.lists_feed = None;
                feed_closed(Collection::Lists)
            }
            Incoming::Share(None) => {
                self.shares_feed = None;
                feed_closed(Collection::ListShares)
            }
            Incoming::Todo(None) => {
                if let Some(scope) = self.scope.as_mut() {
                    scope.todos = None;
                }
                feed_closed(Collection::Todos)
            }
            Incoming::Tag(None) => {
                if let Some(scope) = self.scope.as_mut() {
                    scope.tags = None;
                }
                feed_closed(Collection::Tags)
            }
            Incoming::Link(None) => {
                if let Some(scope) = self.scope.as_mut() {
                    scope.links = None;
                }
                feed_closed(Collection::TodoTags)
            }
        }
    }

    fn complete(&mut self, done: Completion) -> Update {
        match done {
            Completion::ScopeLoaded {
                generation,
                list_id,
                result,
            } => self.finish_scope_load(generation, list_id, result),
            Completion::LinksFetched {
                generation,
                seq,
                todo_id,
                result,
            } => self.finish_links_fetch(generation, seq, todo_id, result),
            Completion::ListsFetched { generation, result } => {
                if generation != self.lists_generation {
                    tracing::debug!("Discarding stale lists fetch (generation {})", generation);
                    return Update::Stale;
                }
                match result {
                    Ok(lists) => self.install_lists(lists),
                    Err(e) => {
                        tracing::warn!("Failed to re-fetch lists: {}", e);
                        Update::Ignored
                    }
                }
            }
        }
    }

    // ========================================================================
    // Lists
    // ========================================================================

    /// Replace the lists cache and fix up the selection
    fn install_lists(&mut self, lists: Vec<List>) -> Update {
        self.repo.load_lists(lists);
        let current = self.selection.list_id();
        let target = choose_list(current, self.prefs.selected_list(), self.repo.lists().as_slice());
        if target != current {
            self.enter_scope(target);
            return Update::Selected(target);
        }
        Update::Lists
    }

    fn refresh_lists(&mut self) -> Update {
        self.lists_generation += 1;
        let generation = self.lists_generation;
        let store = self.store.clone();
        let done_tx = self.done_tx.clone();
        tokio::spawn(async move {
            let result = fetch(store.as_ref(), Collection::Lists, lists_query()).await;
            let _ = done_tx.send(Completion::ListsFetched { generation, result });
        });
        Update::Fetching
    }

    fn apply_list_change(&mut self, change: Change<List>) -> Update {
        match change {
            Change::Insert(list) => {
                let list_id = list.id;
                if !self.repo.insert_list(list) {
                    return Update::Ignored;
                }
                if self.selection.list_id().is_none() {
                    self.enter_scope(Some(list_id));
                    return Update::Selected(Some(list_id));
                }
                Update::Lists
            }
            Change::Update(list) => {
                if self.repo.update_list(list) {
                    Update::Lists
                } else {
                    Update::Ignored
                }
            }
            Change::Delete(row) => {
                let Some(list_id) = row.id() else {
                    tracing::debug!("List delete without id: {}", row.0);
                    return Update::Ignored;
                };
                if self.repo.remove_list(list_id).is_none() {
                    return Update::Ignored;
                }
                if self.selection.list_id() == Some(list_id) {
                    tracing::info!("Selected list {} was deleted", list_id);
                    return self.fall_back();
                }
                Update::Lists
            }
        }
    }

    /// Select the first remaining list, or nothing
    fn fall_back(&mut self) -> Update {
        let target = self.repo.lists().first().map(|l| l.id);
        self.enter_scope(target);
        Update::Selected(target)
    }

    fn require_user(&self) -> Result<Uuid> {
        self.user_id.ok_or(SyncError::NotSignedIn)
    }

    fn list(&self, list_id: Uuid) -> Result<&List> {
        self.repo.lists().get(list_id).ok_or(SyncError::UnknownList(list_id))
    }

    /// The list, if the current user owns it
    fn owned_list(&self, list_id: Uuid) -> Result<&List> {
        let user_id = self.require_user()?;
        let list = self.list(list_id)?;
        if list.owner_id != user_id {
            return Err(SyncError::NotOwner);
        }
        Ok(list)
    }

    pub async fn create_list(&mut self, name: &str) -> Result<List> {
        let name = name.trim();
        if name.is_empty() {
            return Err(SyncError::InvalidInput("List name cannot be empty".to_string()));
        }
        let user_id = self.require_user()?;
        let store = self.store.clone();
        let list: List = insert_row(
            store.as_ref(),
            Collection::Lists,
            NewList {
                name: name.to_string(),
                user_id,
            },
        )
        .await
        .map_err(SyncError::RemoteWrite)?;

        tracing::info!("Created list {} ({})", list.name, list.id);
        self.repo.insert_list(list.clone());
        self.enter_scope(Some(list.id));
        Ok(list)
    }

    /// Rename an owned list. A blank name leaves the list as it is.
    pub async fn rename_list(&mut self, list_id: Uuid, name: &str) -> Result<()> {
        let name = name.trim();
        if name.is_empty() {
            return Ok(());
        }
        let mut renamed = self.owned_list(list_id)?.clone();
        let store = self.store.clone();
        store
            .update(
                Collection::Lists,
                vec![Filter::eq("id", list_id)],
                json!({ "name": name }),
            )
            .await
            .map_err(SyncError::RemoteWrite)?;

        renamed.name = name.to_string();
        self.repo.update_list(renamed);
        Ok(())
    }

    pub async fn delete_list(&mut self, list_id: Uuid) -> Result<()> {
        self.owned_list(list_id)?;
        let store = self.store.clone();
        store
            .delete(Collection::Lists, vec![Filter::eq("id", list_id)])
            .await
            .map_err(SyncError::RemoteWrite)?;

        tracing::info!("Deleted list {}", list_id);
        self.repo.remove_list(list_id);
        if self.selection.list_id() == Some(list_id) {
            self.fall_back();
        }
        Ok(())
    }

    /// Drop the current user's share of a list owned by someone else
    pub async fn leave_list(&mut self, list_id: Uuid) -> Result<()> {
        let user_id = self.require_user()?;
        if self.list(list_id)?.owner_id == user_id {
            return Err(SyncError::InvalidInput(
                "Owners cannot leave their own list".to_string(),
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

        tracing::info!("Left list {}", list_id);
        self.repo.remove_list(list_id);
        if self.selection.list_id() == Some(list_id) {
            self.fall_back();
        }
        Ok(())
    }

    // ========================================================================
    // Preferences
    // ========================================================================

    pub fn theme(&self) -> Theme {
        self.prefs.theme()
    }

    pub fn set_theme(&mut self, theme: Theme) {
        self.prefs.set_theme(theme);
    }

    // ========================================================================
    // Views
    // ========================================================================

    pub fn user_id(&self) -> Option<Uuid> {
        self.user_id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn lists(&self) -> &[List] {
        self.repo.lists().as_slice()
    }

    pub fn selected_list(&self) -> Option<&List> {
        self.selection
            .list_id()
            .and_then(|id| self.repo.lists().get(id))
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    pub fn is_owner(&self, list_id: Uuid) -> bool {
        match (self.user_id, self.repo.lists().get(list_id)) {
            (Some(user_id), Some(list)) => list.owner_id == user_id,
            _ => false,
        }
    }

    /// Todos of the selected list, newest first
    pub fn todos(&self) -> &[TodoItem] {
        self.repo.todos().as_slice()
    }

    /// Todos that pass the tag filter
    pub fn visible_todos(&self) -> Vec<&TodoItem> {
        self.repo
            .todos()
            .iter()
            .filter(|item| self.selection.shows(&item.tags))
            .collect()
    }

    pub fn todo(&self, todo_id: Uuid) -> Option<&TodoItem> {
        self.repo.todo(todo_id)
    }

    /// Tags of the selected list, oldest first
    pub fn tags(&self) -> &[Tag] {
        self.repo.tags().as_slice()
    }

    pub fn tag(&self, tag_id: Uuid) -> Option<&Tag> {
        self.repo.tag(tag_id)
    }

    /// Tags that will be attached to the next new todo, in toggle order
    pub fn pending_tags(&self) -> Vec<&Tag> {
        self.selection
            .pending()
            .iter()
            .filter_map(|id| self.repo.tag(*id))
            .collect()
    }

    pub fn completed_count(&self) -> usize {
        self.repo.todos().iter().filter(|t| t.todo.completed).count()
    }

    pub fn total_count(&self) -> usize {
        self.repo.todos().len()
    }
}

fn feed_closed(collection: Collection) -> Update {
    tracing::warn!("Store closed the {} feed", collection);
    Update::FeedClosed(collection)
}

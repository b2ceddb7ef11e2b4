//! Entity caches plus the raw link table.
//!
//! Cached todos carry a resolved copy of their tags. Every path that changes
//! links or tags goes through this type, which re-derives the affected
//! todos with the resolver, so the copies never drift from the tag cache.

use chrono::{DateTime, Utc};
use shared::{List, Tag, Todo, TodoTagLink};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::cache::{EntityCache, Record, SortOrder};
use crate::resolver;

/// A todo with its resolved tags
#[derive(Debug, Clone, PartialEq)]
pub struct TodoItem {
    pub todo: Todo,
    pub tags: Vec<Tag>,
}

impl TodoItem {
    pub fn has_tag(&self, tag_id: Uuid) -> bool {
        self.tags.iter().any(|t| t.id == tag_id)
    }
}

impl Record for TodoItem {
    const ORDER: SortOrder = SortOrder::NewestFirst;

    fn id(&self) -> Uuid {
        self.todo.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.todo.created_at
    }
}

#[derive(Debug, Default)]
pub struct Repository {
    lists: EntityCache<List>,
    todos: EntityCache<TodoItem>,
    tags: EntityCache<Tag>,
    links: Vec<TodoTagLink>,
}

impl Repository {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Lists
    // ========================================================================

    pub fn lists(&self) -> &EntityCache<List> {
        &self.lists
    }

    pub fn load_lists(&mut self, lists: Vec<List>) {
        self.lists.load(lists);
    }

    pub fn insert_list(&mut self, list: List) -> bool {
        self.lists.insert(list)
    }

    pub fn update_list(&mut self, list: List) -> bool {
        self.lists.update(list)
    }

    pub fn remove_list(&mut self, list_id: Uuid) -> Option<List> {
        self.lists.remove(list_id)
    }

    // ========================================================================
    // Scope (todos, tags, links of the selected list)
    // ========================================================================

    /// Install a freshly fetched snapshot of the selected list
    pub fn install_scope(&mut self, todos: Vec<Todo>, tags: Vec<Tag>, links: Vec<TodoTagLink>) {
        let todo_ids: Vec<Uuid> = todos.iter().map(|t| t.id).collect();
        let known: HashSet<Uuid> = todo_ids.iter().copied().collect();
        self.links = links
            .into_iter()
            .filter(|l| known.contains(&l.todo_id))
            .collect();
        self.tags.load(tags);

        let mut resolved = resolver::resolve_many(&todo_ids, &self.links, &self.tags_by_id());
        let items = todos
            .into_iter()
            .map(|todo| {
                let tags = resolved.remove(&todo.id).unwrap_or_default();
                TodoItem { todo, tags }
            })
            .collect();
        self.todos.load(items);
    }

    pub fn clear_scope(&mut self) {
        self.todos.clear();
        self.tags.clear();
        self.links.clear();
    }

    pub fn todos(&self) -> &EntityCache<TodoItem> {
        &self.todos
    }

    pub fn todo(&self, todo_id: Uuid) -> Option<&TodoItem> {
        self.todos.get(todo_id)
    }

    pub fn tags(&self) -> &EntityCache<Tag> {
        &self.tags
    }

    pub fn tag(&self, tag_id: Uuid) -> Option<&Tag> {
        self.tags.get(tag_id)
    }

    pub fn tags_by_id(&self) -> HashMap<Uuid, Tag> {
        self.tags.iter().map(|t| (t.id, t.clone())).collect()
    }

    pub fn links(&self) -> &[TodoTagLink] {
        &self.links
    }

    pub fn has_link(&self, todo_id: Uuid, tag_id: Uuid) -> bool {
        self.links
            .iter()
            .any(|l| l.todo_id == todo_id && l.tag_id == tag_id)
    }

    // ========================================================================
    // Todos
    // ========================================================================

    /// Add a todo unless cached; tags come from any links already known
    pub fn insert_todo(&mut self, todo: Todo) -> bool {
        if self.todos.contains(todo.id) {
            return false;
        }
        let tags = resolver::resolve_one(todo.id, &self.links, &self.tags_by_id());
        self.todos.insert(TodoItem { todo, tags })
    }

    /// Replace the row of a cached todo, keeping its resolved tags
    pub fn update_todo(&mut self, todo: Todo) -> bool {
        let Some(tags) = self.todos.get(todo.id).map(|item| item.tags.clone()) else {
            return false;
        };
        self.todos.update(TodoItem { todo, tags })
    }

    pub fn remove_todo(&mut self, todo_id: Uuid) -> Option<TodoItem> {
        let removed = self.todos.remove(todo_id)?;
        self.links.retain(|l| l.todo_id != todo_id);
        Some(removed)
    }

    // ========================================================================
    // Tags
    // ========================================================================

    /// Add a tag and re-resolve todos whose links were waiting for it
    pub fn insert_tag(&mut self, tag: Tag) -> bool {
        let tag_id = tag.id;
        if !self.tags.insert(tag) {
            return false;
        }
        self.reresolve_tag(tag_id);
        true
    }

    /// Replace a tag and propagate it into every todo that carries it
    pub fn update_tag(&mut self, tag: Tag) -> bool {
        let tag_id = tag.id;
        if !self.tags.update(tag) {
            return false;
        }
        self.reresolve_tag(tag_id);
        true
    }

    /// Remove a tag, its links and its copies inside todos
    pub fn remove_tag(&mut self, tag_id: Uuid) -> Option<Tag> {
        let removed = self.tags.remove(tag_id)?;
        let affected = self.todos_linked_to(tag_id);
        self.links.retain(|l| l.tag_id != tag_id);
        self.reresolve(&affected);
        Some(removed)
    }

    // ========================================================================
    // Links
    // ========================================================================

    /// Replace every link of a cached todo with `links` (store order)
    pub fn set_links(&mut self, todo_id: Uuid, links: Vec<TodoTagLink>) -> bool {
        if !self.todos.contains(todo_id) {
            return false;
        }
        self.links.retain(|l| l.todo_id != todo_id);
        self.links
            .extend(links.into_iter().filter(|l| l.todo_id == todo_id));
        self.reresolve(&[todo_id]);
        true
    }

    /// Append links of cached todos, skipping ones already present
    pub fn add_links(&mut self, links: &[TodoTagLink]) {
        let mut affected = Vec::new();
        for link in links {
            if !self.todos.contains(link.todo_id) || self.links.contains(link) {
                continue;
            }
            self.links.push(*link);
            if !affected.contains(&link.todo_id) {
                affected.push(link.todo_id);
            }
        }
        self.reresolve(&affected);
    }

    pub fn remove_link(&mut self, link: TodoTagLink) -> bool {
        let before = self.links.len();
        self.links.retain(|l| *l != link);
        if self.links.len() == before {
            return false;
        }
        self.reresolve(&[link.todo_id]);
        true
    }

    fn todos_linked_to(&self, tag_id: Uuid) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = Vec::new();
        for link in self.links.iter().filter(|l| l.tag_id == tag_id) {
            if !ids.contains(&link.todo_id) {
                ids.push(link.todo_id);
            }
        }
        ids
    }

    fn reresolve_tag(&mut self, tag_id: Uuid) {
        let affected = self.todos_linked_to(tag_id);
        self.reresolve(&affected);
    }

    fn reresolve(&mut self, todo_ids: &[Uuid]) {
        if todo_ids.is_empty() {
            return;
        }
        let mut resolved = resolver::resolve_many(todo_ids, &self.links, &self.tags_by_id());
        for todo_id in todo_ids {
            let tags = resolved.remove(todo_id).unwrap_or_default();
            self.todos.modify(*todo_id, |item| item.tags = tags);
        }
    }
}

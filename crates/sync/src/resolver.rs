//! Todo to tag resolution over raw link rows.
//!
//! Both functions are pure: the same links and tags always give the same
//! result, so re-running them after any change is safe.

use shared::{Tag, TodoTagLink};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Tags of every todo in `todo_ids`, in link order.
///
/// Every requested todo gets an entry, empty when it has no usable links.
pub fn resolve_many(
    todo_ids: &[Uuid],
    links: &[TodoTagLink],
    tags_by_id: &HashMap<Uuid, Tag>,
) -> HashMap<Uuid, Vec<Tag>> {
    let mut resolved: HashMap<Uuid, Vec<Tag>> =
        todo_ids.iter().map(|id| (*id, Vec::new())).collect();
    let mut seen: HashSet<TodoTagLink> = HashSet::new();

    for link in links {
        let Some(tags) = resolved.get_mut(&link.todo_id) else {
            continue;
        };
        let Some(tag) = tags_by_id.get(&link.tag_id) else {
            continue;
        };
        if seen.insert(*link) {
            tags.push(tag.clone());
        }
    }
    resolved
}

/// Tags of one todo. Links to tags missing from `tags_by_id` are skipped.
pub fn resolve_one(
    todo_id: Uuid,
    links: &[TodoTagLink],
    tags_by_id: &HashMap<Uuid, Tag>,
) -> Vec<Tag> {
    resolve_many(&[todo_id], links, tags_by_id)
        .remove(&todo_id)
        .unwrap_or_default()
}

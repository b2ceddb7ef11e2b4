use shared::{List, Tag};
use std::collections::HashSet;
use uuid::Uuid;

/// Selected list, tag filter and the tags queued for the next new todo
#[derive(Debug, Clone, Default)]
pub struct Selection {
    list_id: Option<Uuid>,
    filter: HashSet<Uuid>,
    pending: Vec<Uuid>,
}

impl Selection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn list_id(&self) -> Option<Uuid> {
        self.list_id
    }

    /// Change the selected list. Returns false when it was already selected.
    ///
    /// Filter and pending tags belong to the previous list and are cleared.
    pub fn set_list(&mut self, list_id: Option<Uuid>) -> bool {
        if self.list_id == list_id {
            return false;
        }
        self.list_id = list_id;
        self.filter.clear();
        self.pending.clear();
        true
    }

    pub fn filter(&self) -> &HashSet<Uuid> {
        &self.filter
    }

    /// Returns whether the tag is in the filter afterwards
    pub fn toggle_filter(&mut self, tag_id: Uuid) -> bool {
        if self.filter.remove(&tag_id) {
            false
        } else {
            self.filter.insert(tag_id);
            true
        }
    }

    pub fn clear_filter(&mut self) {
        self.filter.clear();
    }

    pub fn pending(&self) -> &[Uuid] {
        &self.pending
    }

    /// Returns whether the tag is pending afterwards
    pub fn toggle_pending(&mut self, tag_id: Uuid) -> bool {
        if let Some(pos) = self.pending.iter().position(|id| *id == tag_id) {
            self.pending.remove(pos);
            false
        } else {
            self.pending.push(tag_id);
            true
        }
    }

    pub fn clear_pending(&mut self) {
        self.pending.clear();
    }

    /// Drop a deleted tag from filter and pending sets
    pub fn forget_tag(&mut self, tag_id: Uuid) {
        self.filter.remove(&tag_id);
        self.pending.retain(|id| *id != tag_id);
    }

    /// OR semantics: an empty filter shows everything, otherwise any match
    pub fn shows(&self, tags: &[Tag]) -> bool {
        self.filter.is_empty() || tags.iter().any(|t| self.filter.contains(&t.id))
    }
}

/// Which list should be selected given the loaded lists.
///
/// Keeps `current` while it exists, then tries `preferred` (the persisted
/// choice), then falls back to the first list.
pub fn choose_list(current: Option<Uuid>, preferred: Option<Uuid>, lists: &[List]) -> Option<Uuid> {
    let present = |id: Uuid| lists.iter().any(|l| l.id == id);
    current
        .filter(|id| present(*id))
        .or_else(|| preferred.filter(|id| present(*id)))
        .or_else(|| lists.first().map(|l| l.id))
}

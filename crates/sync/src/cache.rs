//! Ordered in-memory collections keyed by id.

use chrono::{DateTime, Utc};
use shared::{List, Tag, Todo};
use std::cmp::Ordering;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    OldestFirst,
    NewestFirst,
}

/// A row that can live in an [`EntityCache`]
pub trait Record: Clone {
    const ORDER: SortOrder;

    fn id(&self) -> Uuid;
    fn created_at(&self) -> DateTime<Utc>;
}

impl Record for List {
    const ORDER: SortOrder = SortOrder::OldestFirst;

    fn id(&self) -> Uuid {
        self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

impl Record for Tag {
    const ORDER: SortOrder = SortOrder::OldestFirst;

    fn id(&self) -> Uuid {
        self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

impl Record for Todo {
    const ORDER: SortOrder = SortOrder::NewestFirst;

    fn id(&self) -> Uuid {
        self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

fn sort_key<T: Record>(a: &T, b: &T) -> Ordering {
    let key = (a.created_at(), a.id()).cmp(&(b.created_at(), b.id()));
    match T::ORDER {
        SortOrder::OldestFirst => key,
        SortOrder::NewestFirst => key.reverse(),
    }
}

/// Records of one kind, unique by id and always in sort order
#[derive(Debug, Clone)]
pub struct EntityCache<T> {
    items: Vec<T>,
}

impl<T> Default for EntityCache<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<T: Record> EntityCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the contents wholesale
    pub fn load(&mut self, records: Vec<T>) {
        let mut items: Vec<T> = Vec::with_capacity(records.len());
        for record in records {
            if !items.iter().any(|r| r.id() == record.id()) {
                items.push(record);
            }
        }
        items.sort_by(sort_key);
        self.items = items;
    }

    /// Add a record unless one with the same id is already cached
    pub fn insert(&mut self, record: T) -> bool {
        if self.contains(record.id()) {
            return false;
        }
        let at = self
            .items
            .partition_point(|r| sort_key(r, &record) == Ordering::Less);
        self.items.insert(at, record);
        true
    }

    /// Replace the record with the same id. Absent records are ignored.
    pub fn update(&mut self, record: T) -> bool {
        if self.remove(record.id()).is_none() {
            return false;
        }
        self.insert(record)
    }

    /// Mutate the record in place. `f` must not change id or created_at.
    pub fn modify(&mut self, id: Uuid, f: impl FnOnce(&mut T)) -> bool {
        match self.items.iter_mut().find(|r| r.id() == id) {
            Some(record) => {
                f(record);
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: Uuid) -> Option<T> {
        let pos = self.items.iter().position(|r| r.id() == id)?;
        Some(self.items.remove(pos))
    }

    pub fn retain(&mut self, f: impl FnMut(&T) -> bool) {
        self.items.retain(f);
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn get(&self, id: Uuid) -> Option<&T> {
        self.items.iter().find(|r| r.id() == id)
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.get(id).is_some()
    }

    pub fn first(&self) -> Option<&T> {
        self.items.first()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.items.iter().map(Record::id).collect()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<'a, T> IntoIterator for &'a EntityCache<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

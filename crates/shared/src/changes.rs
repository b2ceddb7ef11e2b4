use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Kind of row change delivered by the realtime feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Untyped change event as delivered by a subscription.
///
/// `record` is the new row for inserts and updates and the old row for
/// deletes. Old rows may carry only the primary key columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChange {
    pub kind: ChangeKind,
    pub record: Value,
}

impl RawChange {
    pub fn insert(record: Value) -> Self {
        Self {
            kind: ChangeKind::Insert,
            record,
        }
    }

    pub fn update(record: Value) -> Self {
        Self {
            kind: ChangeKind::Update,
            record,
        }
    }

    pub fn delete(record: Value) -> Self {
        Self {
            kind: ChangeKind::Delete,
            record,
        }
    }

    /// Decode into a typed change. Deletes keep the raw old row.
    pub fn decode<T: DeserializeOwned>(self) -> Result<Change<T>, serde_json::Error> {
        Ok(match self.kind {
            ChangeKind::Insert => Change::Insert(serde_json::from_value(self.record)?),
            ChangeKind::Update => Change::Update(serde_json::from_value(self.record)?),
            ChangeKind::Delete => Change::Delete(DeletedRow(self.record)),
        })
    }
}

/// Typed change event
#[derive(Debug, Clone, PartialEq)]
pub enum Change<T> {
    Insert(T),
    Update(T),
    Delete(DeletedRow),
}

impl<T> Change<T> {
    pub fn kind(&self) -> ChangeKind {
        match self {
            Change::Insert(_) => ChangeKind::Insert,
            Change::Update(_) => ChangeKind::Update,
            Change::Delete(_) => ChangeKind::Delete,
        }
    }
}

/// Old row of a delete event
#[derive(Debug, Clone, PartialEq)]
pub struct DeletedRow(pub Value);

impl DeletedRow {
    /// The `id` column, when present
    pub fn id(&self) -> Option<Uuid> {
        self.uuid_field("id")
    }

    pub fn uuid_field(&self, field: &str) -> Option<Uuid> {
        self.0
            .get(field)
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
    }

    pub fn decode<K: DeserializeOwned>(&self) -> Result<K, serde_json::Error> {
        K::deserialize(&self.0)
    }
}

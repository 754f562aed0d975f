//! Persisted entity records and the change-sets that move between contexts

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Stable identifier of a stored entity (dungeon, boss, ability, ...)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for EntityId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// One stored entity: a kind tag plus named JSON properties
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: EntityId,
    pub kind: String,
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
}

impl EntityRecord {
    pub fn new(id: impl Into<EntityId>, kind: impl Into<String>) -> Self {
        Self { id: id.into(), kind: kind.into(), properties: BTreeMap::new() }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    /// Rough in-memory footprint, used as a cache cost
    pub fn estimated_size(&self) -> usize {
        let properties: usize = self
            .properties
            .iter()
            .map(|(key, value)| key.len() + value_size(value))
            .sum();
        std::mem::size_of::<Self>() + self.id.as_str().len() + self.kind.len() + properties
    }
}

fn value_size(value: &Value) -> usize {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) => 8,
        Value::String(s) => s.len(),
        Value::Array(items) => items.iter().map(value_size).sum::<usize>() + 8,
        Value::Object(map) => map.iter().map(|(k, v)| k.len() + value_size(v)).sum::<usize>() + 8,
    }
}

/// Uncommitted change to one entity, held by a context until save
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PendingChange {
    /// Create (when `kind` is set) or update the listed properties
    Upsert { kind: Option<String>, properties: BTreeMap<String, Value> },
    Delete,
}

impl PendingChange {
    pub fn apply_to(&self, record: &mut EntityRecord) {
        if let PendingChange::Upsert { kind, properties } = self {
            if let Some(kind) = kind {
                record.kind = kind.clone();
            }
            for (key, value) in properties {
                record.properties.insert(key.clone(), value.clone());
            }
        }
    }
}

/// What a committed save changed in the store
///
/// Carries the committed values of every touched property so other contexts
/// can refresh their copies.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    /// Committed state of each entity the save created or updated
    pub updated: BTreeMap<EntityId, EntityRecord>,

    /// Properties the save wrote, per entity
    pub touched: BTreeMap<EntityId, BTreeSet<String>>,

    /// Entities the save deleted
    pub deleted: BTreeSet<EntityId>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.updated.is_empty() && self.deleted.is_empty()
    }

    pub fn entity_count(&self) -> usize {
        self.updated.len() + self.deleted.len()
    }

    pub fn property_count(&self) -> usize {
        self.touched.values().map(BTreeSet::len).sum()
    }
}

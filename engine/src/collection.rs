//! Collection - the ordered, identifier-keyed record container.
//!
//! The collection keeps its members sorted by an externally supplied
//! [`Comparator`]. Every mutation returns the [`CollectionEvent`] observers
//! should see; emitting it is left to the owner.

use crate::{error::Result, DocId, Error, Record};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// Local notification produced by a collection mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CollectionEvent {
    /// A record joined the collection
    Added { id: DocId },
    /// A member's fields or revision changed
    Updated { id: DocId },
    /// A member left the collection
    Removed { id: DocId },
    /// The whole collection was replaced by a bulk load
    Reset { count: usize },
    /// The change feed feeding this collection died
    SyncError { message: String },
}

impl CollectionEvent {
    /// The record this event is about, if it concerns a single record.
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Added { id } | Self::Updated { id } | Self::Removed { id } => Some(id),
            Self::Reset { .. } | Self::SyncError { .. } => None,
        }
    }
}

type CompareFn = dyn Fn(&Record, &Record) -> Ordering + Send + Sync;

/// Ordering used to position records inside a collection.
#[derive(Clone)]
pub struct Comparator(Arc<CompareFn>);

impl Comparator {
    /// Wrap an arbitrary ordering function.
    pub fn new(compare: impl Fn(&Record, &Record) -> Ordering + Send + Sync + 'static) -> Self {
        Self(Arc::new(compare))
    }

    /// Keep records in the order they arrive.
    pub fn insertion() -> Self {
        Self::new(|_, _| Ordering::Equal)
    }

    /// Order by one field, ties broken by identifier.
    ///
    /// Records missing the field sort first. Numbers compare numerically,
    /// strings lexically, mixed kinds by kind.
    pub fn by_field(field: impl Into<String>) -> Self {
        let field = field.into();
        Self::new(move |a, b| {
            compare_values(a.get(&field), b.get(&field)).then_with(|| a.id().cmp(&b.id()))
        })
    }

    /// Compare two records.
    pub fn compare(&self, a: &Record, b: &Record) -> Ordering {
        (self.0)(a, b)
    }
}

impl Default for Comparator {
    fn default() -> Self {
        Self::insertion()
    }
}

impl fmt::Debug for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Comparator(..)")
    }
}

fn kind_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => match (a, b) {
            (Value::Number(x), Value::Number(y)) => {
                let x = x.as_f64().unwrap_or(f64::NAN);
                let y = y.as_f64().unwrap_or(f64::NAN);
                x.partial_cmp(&y).unwrap_or(Ordering::Equal)
            }
            (Value::String(x), Value::String(y)) => x.cmp(y),
            (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
            _ => kind_rank(a).cmp(&kind_rank(b)),
        },
    }
}

/// Ordered set of records with unique identifiers.
#[derive(Debug, Clone, Default)]
pub struct Collection {
    records: Vec<Record>,
    comparator: Comparator,
}

impl Collection {
    /// Create an empty collection ordered by `comparator`.
    pub fn new(comparator: Comparator) -> Self {
        Self {
            records: Vec::new(),
            comparator,
        }
    }

    /// Get a record by ID.
    pub fn get(&self, id: &str) -> Option<&Record> {
        self.records.iter().find(|r| r.id() == Some(id))
    }

    /// Check if a record is a member.
    pub fn contains(&self, id: &str) -> bool {
        self.position(id).is_some()
    }

    /// Insert a record or replace the member with the same identifier.
    pub fn upsert(&mut self, record: Record) -> Result<CollectionEvent> {
        let id = member_id(&record)?;

        let event = match self.position(&id) {
            Some(index) => {
                self.records.remove(index);
                CollectionEvent::Updated { id }
            }
            None => CollectionEvent::Added { id },
        };
        self.insert_sorted(record);

        Ok(event)
    }

    /// Merge fields into an existing member and re-position it.
    ///
    /// Returns `None` when the record is absent or nothing changed.
    pub fn merge_fields(&mut self, id: &str, fields: Map<String, Value>) -> Option<CollectionEvent> {
        let index = self.position(id)?;
        let mut record = self.records.remove(index);
        let changed = record.set_fields(fields);
        self.insert_sorted(record);

        if changed.is_empty() {
            None
        } else {
            Some(CollectionEvent::Updated { id: id.to_string() })
        }
    }

    /// Remove a member.
    pub fn remove(&mut self, id: &str) -> Option<(Record, CollectionEvent)> {
        let index = self.position(id)?;
        let record = self.records.remove(index);
        Some((record, CollectionEvent::Removed { id: id.to_string() }))
    }

    /// Replace the whole membership with a bulk-loaded set.
    ///
    /// When the same identifier appears more than once, the last one wins.
    pub fn reset(&mut self, records: Vec<Record>) -> Result<CollectionEvent> {
        for record in &records {
            member_id(record)?;
        }

        self.records.clear();
        for record in records {
            if let Some(index) = record.id().and_then(|id| self.position(id)) {
                self.records.remove(index);
            }
            self.insert_sorted(record);
        }

        Ok(CollectionEvent::Reset {
            count: self.records.len(),
        })
    }

    /// Iterate members in comparator order.
    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.records.iter()
    }

    /// Member identifiers in comparator order.
    pub fn ids(&self) -> Vec<DocId> {
        self.records
            .iter()
            .filter_map(|r| r.id().map(str::to_owned))
            .collect()
    }

    /// Members whose fields satisfy `predicate`.
    pub fn filter<F>(&self, predicate: F) -> Vec<&Record>
    where
        F: Fn(&Record) -> bool,
    {
        self.records.iter().filter(|r| predicate(r)).collect()
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if the collection has no members.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.records.iter().position(|r| r.id() == Some(id))
    }

    fn insert_sorted(&mut self, record: Record) {
        let index = self
            .records
            .partition_point(|existing| self.comparator.compare(existing, &record) != Ordering::Greater);
        self.records.insert(index, record);
    }
}

fn member_id(record: &Record) -> Result<DocId> {
    record.id().map(str::to_owned).ok_or_else(|| {
        Error::InvalidDocument(format!(
            "collection members need an identifier ({} fields, no {})",
            record.fields().len(),
            crate::record::ID_FIELD
        ))
    })
}

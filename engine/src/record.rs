//! Record types for storing documents.

use crate::{error::Result, DocId, Error, Revision};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// Reserved field carrying the document identifier.
pub const ID_FIELD: &str = "_id";
/// Reserved field carrying the revision token.
pub const REV_FIELD: &str = "_rev";
/// Store marker for deleted documents. Never kept as a record field.
pub const DELETED_FIELD: &str = "_deleted";

/// A structured document with an identifier and an opaque revision token.
///
/// A record created locally has neither. The store assigns both on the first
/// successful write and replaces the revision on every later one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    id: Option<DocId>,
    rev: Option<Revision>,
    fields: Map<String, Value>,
}

impl Record {
    /// Create a new, unsaved record.
    ///
    /// Reserved fields inside `fields` are lifted into the record identity.
    pub fn new(fields: Map<String, Value>) -> Self {
        let mut record = Self::default();
        record.set_fields(fields);
        record
    }

    /// Create a record that already carries an identity.
    pub fn with_identity(
        id: impl Into<DocId>,
        rev: Option<Revision>,
        fields: Map<String, Value>,
    ) -> Self {
        let mut record = Self::new(fields);
        record.id = Some(id.into());
        record.rev = rev;
        record
    }

    /// Build a record from a store document body.
    pub fn from_body(body: Value) -> Result<Self> {
        match body {
            Value::Object(map) => Ok(Self::new(map)),
            other => Err(Error::InvalidDocument(format!(
                "expected object, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Identifier, if the store has assigned one.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Revision of the most recent successful read or write.
    pub fn rev(&self) -> Option<&str> {
        self.rev.as_deref()
    }

    /// True until the record has been written to the store.
    pub fn is_new(&self) -> bool {
        self.id.is_none()
    }

    /// Get a non-reserved field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// All non-reserved fields.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Merge `data` into the record.
    ///
    /// Returns the names of the fields whose value actually changed, including
    /// `_id`/`_rev` when the identity moved.
    pub fn set_fields(&mut self, data: Map<String, Value>) -> Vec<String> {
        let mut changed = Vec::new();

        for (key, value) in data {
            match key.as_str() {
                ID_FIELD => {
                    let id = value.as_str().map(str::to_owned);
                    if id.is_some() && id != self.id {
                        self.id = id;
                        changed.push(key);
                    }
                }
                REV_FIELD => {
                    let rev = value.as_str().map(str::to_owned);
                    if rev != self.rev {
                        self.rev = rev;
                        changed.push(key);
                    }
                }
                DELETED_FIELD => {}
                _ => {
                    if self.fields.get(&key) != Some(&value) {
                        self.fields.insert(key.clone(), value);
                        changed.push(key);
                    }
                }
            }
        }

        changed
    }

    /// Record the identity returned by a successful write.
    pub fn assign_identity(&mut self, id: impl Into<DocId>, rev: impl Into<Revision>) {
        self.id = Some(id.into());
        self.rev = Some(rev.into());
    }

    /// Forget the identity after the document was removed from the store.
    pub fn clear_identity(&mut self) {
        self.id = None;
        self.rev = None;
    }

    /// The document body sent to the store: fields plus `_id`/`_rev` when set.
    pub fn to_body(&self) -> Value {
        let mut body = Map::with_capacity(self.fields.len() + 2);
        if let Some(id) = &self.id {
            body.insert(ID_FIELD.to_string(), Value::String(id.clone()));
        }
        if let Some(rev) = &self.rev {
            body.insert(REV_FIELD.to_string(), Value::String(rev.clone()));
        }
        for (key, value) in &self.fields {
            body.insert(key.clone(), value.clone());
        }
        Value::Object(body)
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_body().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Record {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let body = Value::deserialize(deserializer)?;
        Record::from_body(body).map_err(serde::de::Error::custom)
    }
}

pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

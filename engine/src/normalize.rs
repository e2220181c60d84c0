//! Normalization of store-native responses into canonical records.
//!
//! # Rules
//!
//! - Writes answer `{ok, id, rev}`; only the identity survives.
//! - Removals collapse to an empty success marker.
//! - A single document has generic `id`/`rev` fields renamed to `_id`/`_rev`
//!   and the `ok` marker stripped.
//! - Listings and views answer `{rows: [...]}`. Each row contributes its `doc`
//!   when present, otherwise its projected `value` with the row `id` injected.
//!
//! Anything else is an [`Error::Normalization`].

use crate::operation::ResponseShape;
use crate::record::{json_kind, ID_FIELD, REV_FIELD};
use crate::{error::Result, DocId, Error, Record, Revision};
use serde_json::{Map, Value};

/// A response in the shape the collection layer consumes.
#[derive(Debug, Clone, PartialEq)]
pub enum Canonical {
    /// Identity assigned by a successful write
    Identity { id: DocId, rev: Revision },
    /// Successful removal
    Removed,
    /// One document
    Document(Record),
    /// A list of documents from a listing or view
    Documents(Vec<Record>),
}

impl Canonical {
    /// The records carried by a read response.
    pub fn into_records(self) -> Vec<Record> {
        match self {
            Canonical::Document(record) => vec![record],
            Canonical::Documents(records) => records,
            Canonical::Identity { .. } | Canonical::Removed => Vec::new(),
        }
    }
}

/// Reshape a raw store response.
pub fn normalize(shape: ResponseShape, raw: Value) -> Result<Canonical> {
    match shape {
        ResponseShape::Write => normalize_write(raw),
        ResponseShape::Removal => Ok(Canonical::Removed),
        ResponseShape::Document => normalize_document(raw).map(Canonical::Document),
        ResponseShape::Rows => normalize_rows(raw).map(Canonical::Documents),
    }
}

fn normalize_write(raw: Value) -> Result<Canonical> {
    let object = expect_object(raw, "write response")?;
    let id = string_field(&object, "id")?;
    let rev = string_field(&object, "rev")?;
    Ok(Canonical::Identity { id, rev })
}

fn normalize_document(raw: Value) -> Result<Record> {
    let mut object = expect_object(raw, "document")?;

    rename_if_absent(&mut object, "id", ID_FIELD);
    rename_if_absent(&mut object, "rev", REV_FIELD);
    object.remove("ok");
    check_identity(&object, "document")?;

    Ok(Record::new(object))
}

fn normalize_rows(raw: Value) -> Result<Vec<Record>> {
    let mut object = expect_object(raw, "listing")?;
    let rows = match object.remove("rows") {
        Some(Value::Array(rows)) => rows,
        Some(other) => {
            return Err(Error::Normalization(format!(
                "rows must be an array, got {}",
                json_kind(&other)
            )))
        }
        None => return Err(Error::Normalization("listing has no rows".into())),
    };

    rows.into_iter()
        .enumerate()
        .map(|(index, row)| normalize_row(index, row))
        .collect()
}

fn normalize_row(index: usize, row: Value) -> Result<Record> {
    let mut row = expect_object(row, "row")?;

    match row.remove("doc") {
        Some(Value::Object(doc)) => {
            check_identity(&doc, &format!("row {index} doc"))?;
            return Ok(Record::new(doc));
        }
        Some(Value::Null) | None => {}
        Some(other) => {
            return Err(Error::Normalization(format!(
                "row {index} doc must be an object, got {}",
                json_kind(&other)
            )))
        }
    }

    let id = match row.remove("id") {
        Some(Value::String(id)) => id,
        _ => {
            return Err(Error::Normalization(format!(
                "row {index} has neither a document nor an id"
            )))
        }
    };

    let mut value = match row.remove("value") {
        Some(Value::Object(value)) => value,
        Some(Value::Null) | None => Map::new(),
        Some(other) => {
            return Err(Error::Normalization(format!(
                "row {index} value must be an object, got {}",
                json_kind(&other)
            )))
        }
    };
    value.insert(ID_FIELD.to_string(), Value::String(id));
    check_identity(&value, &format!("row {index} value"))?;

    Ok(Record::new(value))
}

fn expect_object(value: Value, what: &str) -> Result<Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(Error::Normalization(format!(
            "{what} must be an object, got {}",
            json_kind(&other)
        ))),
    }
}

fn string_field(object: &Map<String, Value>, field: &str) -> Result<String> {
    object
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| Error::Normalization(format!("write response has no '{field}'")))
}

/// `_id` and `_rev`, when present, must be strings.
fn check_identity(object: &Map<String, Value>, what: &str) -> Result<()> {
    for field in [ID_FIELD, REV_FIELD] {
        match object.get(field) {
            None | Some(Value::String(_)) => {}
            Some(other) => {
                return Err(Error::Normalization(format!(
                    "{what} '{field}' must be a string, got {}",
                    json_kind(other)
                )))
            }
        }
    }
    Ok(())
}

fn rename_if_absent(object: &mut Map<String, Value>, from: &str, to: &str) {
    if object.contains_key(to) {
        return;
    }
    if let Some(value) = object.remove(from) {
        object.insert(to.to_string(), value);
    }
}

//! Intents and their mapping onto document-store calls.
//!
//! A caller expresses what it wants done to a record or collection as an
//! [`Intent`]. [`plan`] picks the store call, the request payload and the
//! response shape the normalizer should expect.

use crate::config::{EffectiveConfig, StoreCall};
use crate::{error::Result, DocId, Error, Record};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Abstract CRUD intent on a record or collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Create,
    Update,
    Patch,
    Delete,
    Read,
}

impl Intent {
    /// Whether the intent writes to the store.
    pub fn is_write(&self) -> bool {
        !matches!(self, Intent::Read)
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Intent::Create => "create",
            Intent::Update => "update",
            Intent::Patch => "patch",
            Intent::Delete => "delete",
            Intent::Read => "read",
        };
        f.write_str(name)
    }
}

/// What an intent is aimed at.
#[derive(Debug, Clone, Copy)]
pub enum Target<'a> {
    /// A single record
    Record(&'a Record),
    /// A whole collection
    Collection,
}

/// Payload handed to the store call.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreRequest {
    /// A full document body
    Document(Value),
    /// A document identifier
    Id(DocId),
    /// A view name
    View(String),
    /// Every document
    All,
}

/// The response layout a store call produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseShape {
    /// `{ok, id, rev}` after post/put
    Write,
    /// Acknowledgement of a removal
    Removal,
    /// One document body
    Document,
    /// `{rows: [...]}` from a listing or view
    Rows,
}

/// A planned store call.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub call: StoreCall,
    pub request: StoreRequest,
    pub response: ResponseShape,
}

/// Map an intent on a target onto a store call.
pub fn plan(intent: Intent, target: Target<'_>, config: &EffectiveConfig) -> Result<Plan> {
    match (intent, target) {
        (Intent::Create, Target::Record(record)) => Ok(Plan {
            call: StoreCall::Post,
            request: StoreRequest::Document(record.to_body()),
            response: ResponseShape::Write,
        }),
        (Intent::Update | Intent::Patch, Target::Record(record)) => {
            require_id(intent, record)?;
            Ok(Plan {
                call: StoreCall::Put,
                request: StoreRequest::Document(record.to_body()),
                response: ResponseShape::Write,
            })
        }
        (Intent::Delete, Target::Record(record)) => {
            require_id(intent, record)?;
            Ok(Plan {
                call: StoreCall::Remove,
                request: StoreRequest::Document(record.to_body()),
                response: ResponseShape::Removal,
            })
        }
        (Intent::Read, Target::Record(record)) => Ok(Plan {
            call: StoreCall::Get,
            request: StoreRequest::Id(require_id(intent, record)?),
            response: ResponseShape::Document,
        }),
        (Intent::Read, Target::Collection) => Ok(match config.view() {
            Some(view) => Plan {
                call: StoreCall::Query,
                request: StoreRequest::View(view.to_string()),
                response: ResponseShape::Rows,
            },
            None => Plan {
                call: StoreCall::AllDocs,
                request: StoreRequest::All,
                response: ResponseShape::Rows,
            },
        }),
        (_, Target::Collection) => Err(Error::InvalidTarget(format!(
            "{intent} needs a record, not a collection"
        ))),
    }
}

fn require_id(intent: Intent, record: &Record) -> Result<DocId> {
    record
        .id()
        .map(str::to_owned)
        .ok_or(Error::MissingIdentifier(intent))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use serde_json::json;

    fn saved() -> Record {
        Record::from_body(json!({"_id": "t1", "_rev": "1-a", "title": "milk"})).unwrap()
    }

    fn unsaved() -> Record {
        Record::from_body(json!({"title": "milk"})).unwrap()
    }

    #[test]
    fn create_posts_body() {
        let plan = plan(Intent::Create, Target::Record(&unsaved()), &EffectiveConfig::default()).unwrap();

        assert_eq!(plan.call, StoreCall::Post);
        assert_eq!(plan.request, StoreRequest::Document(json!({"title": "milk"})));
        assert_eq!(plan.response, ResponseShape::Write);
    }

    #[test]
    fn update_and_patch_put_with_revision() {
        let record = saved();
        for intent in [Intent::Update, Intent::Patch] {
            let plan = plan(intent, Target::Record(&record), &EffectiveConfig::default()).unwrap();
            assert_eq!(plan.call, StoreCall::Put);
            assert_eq!(
                plan.request,
                StoreRequest::Document(json!({"_id": "t1", "_rev": "1-a", "title": "milk"}))
            );
        }
    }

    #[test]
    fn delete_removes() {
        let plan = plan(Intent::Delete, Target::Record(&saved()), &EffectiveConfig::default()).unwrap();
        assert_eq!(plan.call, StoreCall::Remove);
        assert_eq!(plan.response, ResponseShape::Removal);
    }

    #[test]
    fn writes_need_identifier() {
        let record = unsaved();
        for intent in [Intent::Update, Intent::Patch, Intent::Delete, Intent::Read] {
            let result = plan(intent, Target::Record(&record), &EffectiveConfig::default());
            assert_eq!(result, Err(Error::MissingIdentifier(intent)));
        }
    }

    #[test]
    fn read_strategies() {
        let record = saved();
        let point = plan(Intent::Read, Target::Record(&record), &EffectiveConfig::default()).unwrap();
        assert_eq!(point.call, StoreCall::Get);
        assert_eq!(point.request, StoreRequest::Id("t1".into()));

        let bulk = plan(Intent::Read, Target::Collection, &EffectiveConfig::default()).unwrap();
        assert_eq!(bulk.call, StoreCall::AllDocs);
        assert_eq!(bulk.request, StoreRequest::All);

        let with_view = EffectiveConfig::resolve(
            &SyncConfig::library_defaults(),
            &SyncConfig::new().with_view("todos/by_order"),
            &SyncConfig::new(),
        );
        let query = plan(Intent::Read, Target::Collection, &with_view).unwrap();
        assert_eq!(query.call, StoreCall::Query);
        assert_eq!(query.request, StoreRequest::View("todos/by_order".into()));
        assert_eq!(query.response, ResponseShape::Rows);
    }

    #[test]
    fn collection_writes_rejected() {
        let result = plan(Intent::Create, Target::Collection, &EffectiveConfig::default());
        assert!(matches!(result, Err(Error::InvalidTarget(_))));
    }
}

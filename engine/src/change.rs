//! Change-feed types.

use crate::config::{DocFilter, EffectiveConfig, StoreCall};
use crate::DocId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Opaque position in a store's update sequence.
///
/// A cursor holding `Sequence(n)` means every change up to and including `n`
/// is already reflected in memory.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Sequence(pub u64);

impl Sequence {
    /// The sequence before any change.
    pub const ZERO: Sequence = Sequence(0);

    /// The next sequence number.
    pub fn next(self) -> Sequence {
        Sequence(self.0 + 1)
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One entry of a change feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    /// Position of this change in the store's update sequence
    pub seq: Sequence,
    /// Document the change touched
    pub id: DocId,
    /// Whether the document was deleted
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
    /// Document body, when requested inline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<Value>,
}

impl Change {
    /// A change carrying a new document body.
    pub fn updated(seq: Sequence, id: impl Into<DocId>, doc: Value) -> Self {
        Self {
            seq,
            id: id.into(),
            deleted: false,
            doc: Some(doc),
        }
    }

    /// A deletion.
    pub fn deleted(seq: Sequence, id: impl Into<DocId>) -> Self {
        Self {
            seq,
            id: id.into(),
            deleted: true,
            doc: None,
        }
    }
}

/// Parameters of a change subscription.
#[derive(Debug, Clone)]
pub struct ChangesRequest {
    /// Only changes strictly after this sequence are delivered
    pub since: Sequence,
    /// Keep the feed open for future changes
    pub live: bool,
    /// Deliver document bodies inline
    pub include_docs: bool,
    /// Only deliver deletions and documents matching this predicate
    pub filter: Option<DocFilter>,
}

impl ChangesRequest {
    /// Build a subscription request from the effective configuration.
    pub fn from_config(since: Sequence, config: &EffectiveConfig) -> Self {
        Self {
            since,
            live: config.flag(StoreCall::Changes, "live"),
            include_docs: config.flag(StoreCall::Changes, "include_docs"),
            filter: config.filter().cloned(),
        }
    }

    /// Whether a change passes the request filter.
    ///
    /// Deletions always pass; the deleted body no longer carries the fields the
    /// filter looks at.
    pub fn admits(&self, change: &Change) -> bool {
        if change.deleted {
            return true;
        }
        match (&self.filter, &change.doc) {
            (None, _) => true,
            (Some(filter), Some(doc)) => filter.matches(doc),
            (Some(_), None) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DocFilter, SyncConfig};
    use serde_json::json;

    #[test]
    fn change_from_store_shape() {
        let raw = json!({
            "seq": 7,
            "id": "t1",
            "changes": [{"rev": "2-b"}],
            "doc": {"_id": "t1", "_rev": "2-b", "title": "milk"}
        });

        let change: Change = serde_json::from_value(raw).unwrap();
        assert_eq!(change.seq, Sequence(7));
        assert!(!change.deleted);
        assert_eq!(change.doc.unwrap()["title"], "milk");
    }

    #[test]
    fn deletion_from_store_shape() {
        let change: Change =
            serde_json::from_value(json!({"seq": 8, "id": "t1", "deleted": true})).unwrap();

        assert_eq!(change, Change::deleted(Sequence(8), "t1"));
    }

    #[test]
    fn request_from_config() {
        let connection = SyncConfig::new().with_filter(DocFilter::field_equals("type", "todo"));
        let config = EffectiveConfig::resolve(
            &SyncConfig::library_defaults(),
            &connection,
            &SyncConfig::new(),
        );

        let request = ChangesRequest::from_config(Sequence(3), &config);
        assert!(request.live);
        assert!(request.include_docs);
        assert!(request.admits(&Change::updated(Sequence(4), "a", json!({"type": "todo"}))));
        assert!(!request.admits(&Change::updated(Sequence(5), "b", json!({"type": "note"}))));
        assert!(request.admits(&Change::deleted(Sequence(6), "b")));
    }

    #[test]
    fn sequence_ordering() {
        assert!(Sequence::ZERO < Sequence(1));
        assert_eq!(Sequence(4).next(), Sequence(5));
    }
}

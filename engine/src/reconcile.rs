//! Reconciliation of remote changes into an in-memory collection.
//!
//! # Lifecycle
//!
//! ```text
//! Idle --begin_load--> Loading --subscribed(cursor)--> Subscribed --fail--> Failed
//!   ^                                                      |
//!   +------------------ begin_load (tear down) ------------+
//! ```
//!
//! The cursor is captured only after the bulk read has been applied. A change
//! committed after the snapshot was taken but at or before the captured cursor
//! is not replayed; the next fetch picks it up.
//!
//! # Applying a change
//!
//! 1. Drop it unless its sequence is strictly after the cursor
//! 2. Deletion: remove the record if present, otherwise nothing
//! 3. Present record: merge the document body (revision included)
//! 4. Absent record: insert it if it passes the domain filter
//! 5. Advance the cursor once the change is applied

use crate::change::{Change, Sequence};
use crate::collection::{Collection, CollectionEvent};
use crate::config::DocFilter;
use crate::record::ID_FIELD;
use crate::{error::Result, Error, Record};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Where a reconciler is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "camelCase")]
pub enum ReconcilerState {
    /// No read has happened yet
    Idle,
    /// A bulk read is in flight
    Loading,
    /// Applying changes after the cursor
    Subscribed,
    /// The change feed died; terminal for this subscription
    Failed(String),
}

/// Outcome of offering one change to the reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// Not applied: at or before the cursor, or the reconciler is not subscribed
    Skipped,
    /// Applied without a visible effect
    NoOp,
    /// Applied, observers should see this event
    Event(CollectionEvent),
}

/// The per-collection change reconciler.
#[derive(Debug, Clone)]
pub struct ChangeReconciler {
    state: ReconcilerState,
    cursor: Option<Sequence>,
    filter: Option<DocFilter>,
}

impl ChangeReconciler {
    /// Create an idle reconciler; `filter` limits which remote inserts are accepted.
    pub fn new(filter: Option<DocFilter>) -> Self {
        Self {
            state: ReconcilerState::Idle,
            cursor: None,
            filter,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> &ReconcilerState {
        &self.state
    }

    /// Last sequence reflected in memory.
    pub fn cursor(&self) -> Option<Sequence> {
        self.cursor
    }

    /// Replace the domain filter (takes effect for the next subscription).
    pub fn set_filter(&mut self, filter: Option<DocFilter>) {
        self.filter = filter;
    }

    /// Enter `Loading` for a new bulk read.
    ///
    /// Returns true when a live subscription existed and must be torn down
    /// before the new one starts.
    pub fn begin_load(&mut self) -> bool {
        let had_subscription = self.state == ReconcilerState::Subscribed;
        self.state = ReconcilerState::Loading;
        self.cursor = None;
        had_subscription
    }

    /// Enter `Subscribed` at the cursor captured after the bulk read.
    pub fn subscribed(&mut self, cursor: Sequence) {
        self.state = ReconcilerState::Subscribed;
        self.cursor = Some(cursor);
    }

    /// Return to `Idle` (collection closed or subscription not wanted).
    pub fn stop(&mut self) {
        self.state = ReconcilerState::Idle;
    }

    /// Record a feed failure. The returned event should be emitted to observers.
    pub fn fail(&mut self, reason: impl Into<String>) -> CollectionEvent {
        let message = reason.into();
        self.state = ReconcilerState::Failed(message.clone());
        CollectionEvent::SyncError { message }
    }

    /// Apply one change to `collection`.
    pub fn apply(&mut self, collection: &mut Collection, change: &Change) -> Result<Applied> {
        if self.state != ReconcilerState::Subscribed {
            return Ok(Applied::Skipped);
        }
        if let Some(cursor) = self.cursor {
            if change.seq <= cursor {
                return Ok(Applied::Skipped);
            }
        }

        let applied = self.apply_after_cursor(collection, change)?;
        self.cursor = Some(change.seq);
        Ok(applied)
    }

    fn apply_after_cursor(&self, collection: &mut Collection, change: &Change) -> Result<Applied> {
        if change.deleted {
            return Ok(match collection.remove(&change.id) {
                Some((_, event)) => Applied::Event(event),
                None => Applied::NoOp,
            });
        }

        let doc = match &change.doc {
            Some(Value::Object(doc)) => doc.clone(),
            Some(_) => {
                return Err(Error::Normalization(format!(
                    "change {} carries a non-object document",
                    change.seq
                )))
            }
            None => {
                return Err(Error::Normalization(format!(
                    "change {} for '{}' has no inline document",
                    change.seq, change.id
                )))
            }
        };

        if collection.contains(&change.id) {
            return Ok(match collection.merge_fields(&change.id, doc) {
                Some(event) => Applied::Event(event),
                None => Applied::NoOp,
            });
        }

        if let Some(filter) = &self.filter {
            if !filter.matches(&Value::Object(doc.clone())) {
                return Ok(Applied::NoOp);
            }
        }

        let mut doc = doc;
        doc.entry(ID_FIELD)
            .or_insert_with(|| Value::String(change.id.clone()));
        Ok(Applied::Event(collection.upsert(Record::new(doc))?))
    }
}

impl Default for ChangeReconciler {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::Comparator;
    use serde_json::json;

    fn todo(id: &str, order: f64) -> Value {
        json!({"_id": id, "_rev": "1-a", "type": "todo", "order": order})
    }

    fn loaded(records: &[Value]) -> (ChangeReconciler, Collection) {
        let mut collection = Collection::new(Comparator::by_field("order"));
        let mut reconciler = ChangeReconciler::new(Some(DocFilter::field_equals("type", "todo")));

        assert!(!reconciler.begin_load());
        collection
            .reset(
                records
                    .iter()
                    .map(|r| Record::from_body(r.clone()).unwrap())
                    .collect(),
            )
            .unwrap();
        reconciler.subscribed(Sequence(10));

        (reconciler, collection)
    }

    #[test]
    fn insert_is_positioned_by_comparator() {
        let (mut reconciler, mut collection) = loaded(&[todo("a", 1.0), todo("b", 2.0)]);

        let applied = reconciler
            .apply(&mut collection, &Change::updated(Sequence(11), "c", todo("c", 1.5)))
            .unwrap();

        assert_eq!(applied, Applied::Event(CollectionEvent::Added { id: "c".into() }));
        assert_eq!(collection.ids(), vec!["a", "c", "b"]);
        assert_eq!(reconciler.cursor(), Some(Sequence(11)));
    }

    #[test]
    fn update_overwrites_fields_and_revision() {
        let (mut reconciler, mut collection) = loaded(&[todo("a", 1.0)]);

        let change = Change::updated(
            Sequence(11),
            "a",
            json!({"_id": "a", "_rev": "2-b", "type": "todo", "order": 1.0, "done": true}),
        );
        let applied = reconciler.apply(&mut collection, &change).unwrap();

        assert_eq!(applied, Applied::Event(CollectionEvent::Updated { id: "a".into() }));
        let record = collection.get("a").unwrap();
        assert_eq!(record.rev(), Some("2-b"));
        assert_eq!(record.get("done"), Some(&json!(true)));
        assert_eq!(collection.len(), 1);
    }

    #[test]
    fn deletion_twice_is_idempotent() {
        let (mut reconciler, mut collection) = loaded(&[todo("a", 1.0), todo("b", 2.0)]);

        let first = reconciler
            .apply(&mut collection, &Change::deleted(Sequence(11), "a"))
            .unwrap();
        assert_eq!(first, Applied::Event(CollectionEvent::Removed { id: "a".into() }));
        let after_once = collection.ids();

        // Redelivered with the same sequence
        let again = reconciler
            .apply(&mut collection, &Change::deleted(Sequence(11), "a"))
            .unwrap();
        assert_eq!(again, Applied::Skipped);

        // A later deletion of an absent record
        let later = reconciler
            .apply(&mut collection, &Change::deleted(Sequence(12), "a"))
            .unwrap();
        assert_eq!(later, Applied::NoOp);

        assert_eq!(collection.ids(), after_once);
        assert_eq!(reconciler.cursor(), Some(Sequence(12)));
    }

    #[test]
    fn changes_at_or_before_cursor_are_skipped() {
        let (mut reconciler, mut collection) = loaded(&[]);

        for seq in [5, 10] {
            let applied = reconciler
                .apply(&mut collection, &Change::updated(Sequence(seq), "x", todo("x", 1.0)))
                .unwrap();
            assert_eq!(applied, Applied::Skipped);
        }
        assert!(collection.is_empty());
        assert_eq!(reconciler.cursor(), Some(Sequence(10)));
    }

    #[test]
    fn filtered_inserts_are_ignored() {
        let (mut reconciler, mut collection) = loaded(&[]);

        let applied = reconciler
            .apply(
                &mut collection,
                &Change::updated(Sequence(11), "n", json!({"_id": "n", "type": "note"})),
            )
            .unwrap();

        assert_eq!(applied, Applied::NoOp);
        assert!(collection.is_empty());
        assert_eq!(reconciler.cursor(), Some(Sequence(11)));
    }

    #[test]
    fn missing_inline_document_is_an_error() {
        let (mut reconciler, mut collection) = loaded(&[]);
        let change = Change {
            seq: Sequence(11),
            id: "a".into(),
            deleted: false,
            doc: None,
        };

        let result = reconciler.apply(&mut collection, &change);
        assert!(matches!(result, Err(Error::Normalization(_))));
        assert_eq!(reconciler.cursor(), Some(Sequence(10)));
    }

    #[test]
    fn failure_is_terminal() {
        let (mut reconciler, mut collection) = loaded(&[todo("a", 1.0)]);

        let event = reconciler.fail("connection reset");
        assert_eq!(
            event,
            CollectionEvent::SyncError {
                message: "connection reset".into()
            }
        );
        assert_eq!(reconciler.state(), &ReconcilerState::Failed("connection reset".into()));

        let applied = reconciler
            .apply(&mut collection, &Change::deleted(Sequence(11), "a"))
            .unwrap();
        assert_eq!(applied, Applied::Skipped);
        assert_eq!(collection.len(), 1);
    }

    #[test]
    fn reload_tears_down_subscription() {
        let (mut reconciler, _) = loaded(&[]);

        assert!(reconciler.begin_load());
        assert_eq!(reconciler.state(), &ReconcilerState::Loading);
        assert_eq!(reconciler.cursor(), None);
    }
}

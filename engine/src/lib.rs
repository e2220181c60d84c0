//! # Docsync Engine
//!
//! The IO-free core of a sync adapter between an in-memory collection of
//! records and a document store with a change feed.
//!
//! ## Design Principles
//!
//! - **No IO**: the engine never talks to a store; the adapter crate does
//! - **Deterministic**: the same responses and changes give the same collection
//! - **Testable**: every decision is a plain function over values
//!
//! ## Core Concepts
//!
//! ### Records and collections
//!
//! A [`Record`] is a JSON object with two reserved fields: `_id` and `_rev`.
//! A [`Collection`] is an identifier-unique set of records kept in the order
//! of a [`Comparator`].
//!
//! ### Configuration
//!
//! [`EffectiveConfig::resolve`] merges library defaults, connection options
//! and call options. Option groups for each [`StoreCall`] merge key by key.
//!
//! ### Intents
//!
//! [`plan`] maps an [`Intent`] (create, update, patch, delete, read) on a
//! record or collection to a store call. [`normalize`] turns the store's
//! answer into a [`Canonical`] response.
//!
//! ### Reconciliation
//!
//! [`ChangeReconciler`] applies change-feed entries strictly after the cursor
//! captured at load time, idempotently.
//!
//! ## Quick Start
//!
//! ```rust
//! use docsync_engine::{
//!     normalize, Change, ChangeReconciler, Collection, Comparator, Record, ResponseShape,
//!     Sequence,
//! };
//! use serde_json::json;
//!
//! // 1. Normalize a bulk read
//! let raw = json!({"rows": [
//!     {"doc": {"_id": "a", "_rev": "1-x", "order": 1}},
//!     {"doc": {"_id": "b", "_rev": "1-y", "order": 2}},
//! ]});
//! let records = normalize(ResponseShape::Rows, raw).unwrap().into_records();
//!
//! // 2. Load the collection, then capture the cursor
//! let mut collection = Collection::new(Comparator::by_field("order"));
//! collection.reset(records).unwrap();
//! let mut reconciler = ChangeReconciler::new(None);
//! reconciler.begin_load();
//! reconciler.subscribed(Sequence(2));
//!
//! // 3. Apply a remote insert
//! let change = Change::updated(Sequence(3), "c", json!({"_id": "c", "_rev": "1-z", "order": 1.5}));
//! reconciler.apply(&mut collection, &change).unwrap();
//! assert_eq!(collection.ids(), vec!["a", "c", "b"]);
//! ```

pub mod change;
pub mod collection;
pub mod config;
pub mod error;
pub mod normalize;
pub mod operation;
pub mod reconcile;
pub mod record;

// Re-export main types at crate root
pub use change::{Change, ChangesRequest, Sequence};
pub use collection::{Collection, CollectionEvent, Comparator};
pub use config::{DocFilter, EffectiveConfig, OptionGroup, StoreCall, SyncConfig};
pub use error::{Error, Result};
pub use normalize::{normalize, Canonical};
pub use operation::{plan, Intent, Plan, ResponseShape, StoreRequest, Target};
pub use reconcile::{Applied, ChangeReconciler, ReconcilerState};
pub use record::Record;

/// Type aliases for clarity
pub type DocId = String;
pub type Revision = String;
pub type StoreName = String;

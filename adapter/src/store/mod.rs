//! Document-store client interface.
//!
//! The adapter talks to a store only through [`DocumentStore`]. Responses are
//! store-native JSON; the engine's normalizer reshapes them.

pub mod memory;

use std::sync::Arc;

use docsync_engine::{Change, ChangesRequest, OptionGroup, Result, Sequence};
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde_json::Value;

pub use memory::{MemoryOpener, MemoryStore, ViewFn};

/// Continuous change feed. An `Err` item reports the feed's death and is the
/// last item delivered.
pub type ChangeStream = BoxStream<'static, Result<Change>>;

/// Shared handle to an opened store.
pub type StoreHandle = Arc<dyn DocumentStore>;

/// One opened store session.
pub trait DocumentStore: Send + Sync {
    /// Read one document by identifier.
    fn get<'a>(&'a self, id: &'a str, options: &'a OptionGroup) -> BoxFuture<'a, Result<Value>>;

    /// Create or replace a document with explicit identifier and revision.
    fn put<'a>(&'a self, doc: Value, options: &'a OptionGroup) -> BoxFuture<'a, Result<Value>>;

    /// Create a document, letting the store assign the identifier.
    fn post<'a>(&'a self, doc: Value, options: &'a OptionGroup) -> BoxFuture<'a, Result<Value>>;

    /// Delete a document; the body must carry the current revision.
    fn remove<'a>(&'a self, doc: Value, options: &'a OptionGroup)
        -> BoxFuture<'a, Result<Value>>;

    /// Query a named view.
    fn query<'a>(&'a self, view: &'a str, options: &'a OptionGroup)
        -> BoxFuture<'a, Result<Value>>;

    /// List every document.
    fn all_docs<'a>(&'a self, options: &'a OptionGroup) -> BoxFuture<'a, Result<Value>>;

    /// The store's current update sequence.
    fn current_sequence(&self) -> BoxFuture<'_, Result<Sequence>>;

    /// Subscribe to changes strictly after `request.since`.
    fn changes(&self, request: ChangesRequest) -> BoxFuture<'_, Result<ChangeStream>>;
}

/// Opens named stores.
pub trait StoreOpener: Send + Sync {
    /// Open the store called `name`.
    fn open<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<StoreHandle>>;
}

//! # Docsync Adapter
//!
//! Async half of docsync: opens stores through a [`ConnectionBroker`], runs
//! record and collection intents through a [`Dispatcher`], and keeps
//! [`LiveCollection`]s in step with the store's change feed.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use docsync_adapter::{ConnectionBroker, MemoryOpener, SyncAdapter};
//! use docsync_engine::{Comparator, SyncConfig};
//!
//! # async fn run() -> docsync_engine::Result<()> {
//! let broker = ConnectionBroker::new_shared(Arc::new(MemoryOpener::new()));
//! let adapter = SyncAdapter::new(broker);
//!
//! let todos = adapter.connection("todos", SyncConfig::new());
//! let collection = adapter.collection(todos, Comparator::by_field("order"));
//! collection.fetch(&SyncConfig::new()).await?;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod config;
pub mod dispatch;
pub mod live;
pub mod store;
pub mod sync;

pub use broker::{Connection, ConnectionBroker};
pub use config::{ConfigError, Settings};
pub use dispatch::{Dispatcher, RequestIssued, RequestReceiver};
pub use live::{ChangeHook, LiveCollection};
pub use store::{
    ChangeStream, DocumentStore, MemoryOpener, MemoryStore, StoreHandle, StoreOpener, ViewFn,
};
pub use sync::SyncAdapter;

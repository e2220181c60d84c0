//! Connection broker.
//!
//! Opens each named store at most once per broker and hands the outcome to
//! every caller. Callers arriving while the store is still opening are queued
//! and released in arrival order once the attempt resolves. A failed open is
//! cached like a successful one and never retried.

use std::fmt;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use docsync_engine::{Error, Result, StoreName, SyncConfig};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::store::{StoreHandle, StoreOpener};

type Outcome = Result<StoreHandle>;

enum Slot {
    /// Open attempt in flight; waiters in arrival order
    Opening(Vec<oneshot::Sender<Outcome>>),
    /// Terminal outcome
    Ready(Outcome),
}

/// Process-wide cache of opened stores, keyed by store name.
///
/// Construct one per process and share it via `Arc`.
pub struct ConnectionBroker {
    opener: Arc<dyn StoreOpener>,
    slots: DashMap<StoreName, Arc<Mutex<Slot>>>,
}

impl ConnectionBroker {
    /// Create a broker that opens stores through `opener`.
    pub fn new(opener: Arc<dyn StoreOpener>) -> Self {
        Self {
            opener,
            slots: DashMap::new(),
        }
    }

    /// Create a broker wrapped in Arc for sharing.
    pub fn new_shared(opener: Arc<dyn StoreOpener>) -> Arc<Self> {
        Arc::new(Self::new(opener))
    }

    /// Open the store called `name`, or return the cached outcome.
    pub async fn open(&self, name: &str) -> Result<StoreHandle> {
        let (slot, first) = match self.slots.entry(name.to_string()) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let slot = Arc::new(Mutex::new(Slot::Opening(Vec::new())));
                entry.insert(slot.clone());
                (slot, true)
            }
        };

        let receiver = {
            let mut guard = slot.lock();
            match &mut *guard {
                Slot::Ready(outcome) => return outcome.clone(),
                Slot::Opening(waiters) => {
                    let (sender, receiver) = oneshot::channel();
                    waiters.push(sender);
                    receiver
                }
            }
        };

        if first {
            self.spawn_attempt(name.to_string(), slot);
        } else {
            tracing::debug!(store = %name, "waiting for store to open");
        }

        receiver.await.unwrap_or_else(|_| {
            Err(Error::ConnectionFailure {
                store: name.to_string(),
                reason: "open attempt was abandoned".into(),
            })
        })
    }

    /// Whether the open attempt for `name` has resolved.
    pub fn is_ready(&self, name: &str) -> bool {
        self.slots
            .get(name)
            .map(|slot| matches!(&*slot.lock(), Slot::Ready(_)))
            .unwrap_or(false)
    }

    /// Number of store names the broker has seen.
    pub fn store_count(&self) -> usize {
        self.slots.len()
    }

    /// A lazy opener for `name` carrying connection-level options.
    pub fn connection(
        self: &Arc<Self>,
        name: impl Into<StoreName>,
        options: SyncConfig,
    ) -> Connection {
        Connection {
            broker: Arc::clone(self),
            name: name.into(),
            options,
        }
    }

    /// Run the single open attempt detached, so an abandoned first caller
    /// cannot strand the queue.
    fn spawn_attempt(&self, name: StoreName, slot: Arc<Mutex<Slot>>) {
        let opener = Arc::clone(&self.opener);
        tracing::info!(store = %name, "opening store");

        tokio::spawn(async move {
            let outcome = opener
                .open(&name)
                .await
                .map_err(|e| as_connection_failure(&name, e));
            match &outcome {
                Ok(_) => tracing::info!(store = %name, "store ready"),
                Err(e) => tracing::warn!(store = %name, error = %e, "store failed to open"),
            }

            let waiters = {
                let mut guard = slot.lock();
                match std::mem::replace(&mut *guard, Slot::Ready(outcome.clone())) {
                    Slot::Opening(waiters) => waiters,
                    Slot::Ready(_) => Vec::new(),
                }
            };

            tracing::debug!(store = %name, waiters = waiters.len(), "releasing queued callers");
            for waiter in waiters {
                let _ = waiter.send(outcome.clone());
            }
        });
    }
}

/// Every open failure surfaces as `ConnectionFailure`, whatever the opener reported.
fn as_connection_failure(name: &str, error: Error) -> Error {
    match error {
        Error::ConnectionFailure { .. } => error,
        other => Error::ConnectionFailure {
            store: name.to_string(),
            reason: other.to_string(),
        },
    }
}

impl fmt::Debug for ConnectionBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionBroker")
            .field("stores", &self.slots.len())
            .finish()
    }
}

/// A named store reference shared by records and collections.
///
/// Opening is lazy and goes through the broker, so every holder of the same
/// name shares one store session.
#[derive(Clone)]
pub struct Connection {
    broker: Arc<ConnectionBroker>,
    name: StoreName,
    options: SyncConfig,
}

impl Connection {
    /// Store name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Connection-level configuration layer.
    pub fn options(&self) -> &SyncConfig {
        &self.options
    }

    /// Open (or reuse) the store session.
    pub async fn open(&self) -> Result<StoreHandle> {
        self.broker.open(&self.name).await
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryOpener;
    use futures::future::BoxFuture;
    use std::time::Duration;

    struct BrokenOpener;

    impl StoreOpener for BrokenOpener {
        fn open<'a>(&'a self, _name: &'a str) -> BoxFuture<'a, Result<StoreHandle>> {
            Box::pin(async { Err(Error::Store("bad credentials".into())) })
        }
    }

    #[tokio::test]
    async fn open_is_cached() {
        let opener = Arc::new(MemoryOpener::new());
        let broker = ConnectionBroker::new(opener.clone());

        let first = broker.open("todos").await.unwrap();
        let second = broker.open("todos").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(opener.attempts(), 1);
        assert!(broker.is_ready("todos"));
        assert!(!broker.is_ready("notes"));
    }

    #[tokio::test]
    async fn failure_is_cached() {
        let opener = Arc::new(MemoryOpener::new());
        opener.fail("todos", "disk full");
        let broker = ConnectionBroker::new(opener.clone());

        let expected = Error::ConnectionFailure {
            store: "todos".into(),
            reason: "disk full".into(),
        };
        assert_eq!(broker.open("todos").await.err(), Some(expected.clone()));
        assert_eq!(broker.open("todos").await.err(), Some(expected));
        assert_eq!(opener.attempts(), 1);
    }

    #[tokio::test]
    async fn opener_errors_become_connection_failures() {
        let broker = ConnectionBroker::new(Arc::new(BrokenOpener));

        let expected = Error::ConnectionFailure {
            store: "todos".into(),
            reason: Error::Store("bad credentials".into()).to_string(),
        };
        assert_eq!(broker.open("todos").await.err(), Some(expected.clone()));
        assert_eq!(broker.open("todos").await.err(), Some(expected));
    }

    #[tokio::test]
    async fn names_are_independent() {
        let opener = Arc::new(MemoryOpener::new());
        opener.fail("broken", "nope");
        let broker = ConnectionBroker::new(opener.clone());

        assert!(broker.open("broken").await.is_err());
        assert!(broker.open("todos").await.is_ok());
        assert_eq!(broker.store_count(), 2);
    }

    #[tokio::test]
    async fn abandoned_first_caller_does_not_strand_waiters() {
        let opener = Arc::new(MemoryOpener::new().with_delay(Duration::from_millis(20)));
        let broker = ConnectionBroker::new_shared(opener.clone());

        let first = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.open("todos").await })
        };
        tokio::task::yield_now().await;
        first.abort();

        assert!(broker.open("todos").await.is_ok());
        assert_eq!(opener.attempts(), 1);
    }

    #[tokio::test]
    async fn connection_opens_through_broker() {
        let opener = Arc::new(MemoryOpener::new());
        let broker = ConnectionBroker::new_shared(opener.clone());

        let connection = broker.connection("todos", SyncConfig::new().with_listen(false));
        assert_eq!(connection.name(), "todos");
        assert_eq!(connection.options().listen, Some(false));

        connection.open().await.unwrap();
        connection.clone().open().await.unwrap();
        assert_eq!(opener.attempts(), 1);
    }
}
